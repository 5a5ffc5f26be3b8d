//! Process-wide initialization.
//!
//! Components come up in a fixed order, leaves first:
//!
//! 1. descriptor diagnostic disabler (runtime hook only; the binary exports
//!    the environment flag itself through
//!    [`export_diagnostic_env`](crate::diagnostic::export_diagnostic_env))
//! 2. environment prober
//! 3. primitive substitution registry
//! 4. resource tracker neutralizer
//! 5. I/O provider selection
//! 6. standard-input neutralizer
//!
//! The result is a [`CompatContext`] that downstream code receives by
//! reference. [`initialize`] runs the sequence at most once per process.

use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::config::CompatConfig;
use crate::diagnostic::{self, DiagnosticOutcome};
use crate::io::{self, FetchError, IoProvider};
use crate::probe::{CapabilityProbe, Category, HostPrimitives, LibcHost};
use crate::registry::{Backing, CapabilityRegistry, PatchRecord, RegistryBuilder};
use crate::stdin::{InputStream, StdinPolicy};

/// Start-up failures. Missing primitives are never one of them.
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// The resolved configuration is out of range.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// What was wrong.
        message: String,
    },

    /// The fetch client behind the I/O provider could not be built.
    #[error("failed to build the I/O provider: {source}")]
    IoProvider {
        #[source]
        source: FetchError,
    },
}

/// Runs the initialization sequence once.
#[derive(Debug)]
pub struct Bootstrap {
    config: CompatConfig,
    host: Arc<dyn HostPrimitives>,
}

impl Bootstrap {
    #[must_use]
    pub fn new(config: CompatConfig) -> Self {
        Self {
            config,
            host: Arc::new(LibcHost),
        }
    }

    /// Probes and backs native primitives with `host` instead of the C library.
    #[must_use]
    pub fn with_host(mut self, host: Arc<dyn HostPrimitives>) -> Self {
        self.host = host;
        self
    }

    /// Brings every component up in order.
    ///
    /// # Errors
    ///
    /// [`BootstrapError::InvalidConfig`] for out-of-range settings and
    /// [`BootstrapError::IoProvider`] when the HTTP client cannot be built.
    #[instrument(skip(self), fields(forced = ?self.config.force_emulate))]
    pub fn run(self) -> Result<CompatContext, BootstrapError> {
        self.config
            .validate()
            .map_err(|error| BootstrapError::InvalidConfig {
                message: format!("{error:#}"),
            })?;

        let diagnostic = if self.config.disable_descriptor_diagnostic {
            diagnostic::disable_descriptor_diagnostic()
        } else {
            DiagnosticOutcome::LeftEnabled
        };
        debug!(%diagnostic, "descriptor diagnostic handled");

        let probe = CapabilityProbe::detect_except(self.host.as_ref(), &self.config.force_emulate);

        let mut builder = RegistryBuilder::with_host(probe, self.host);
        let substituted = builder.substitute_missing();
        if substituted > 0 {
            builder.neutralize_tracker();
        }
        let registry = builder.build();

        let io = io::provider(
            self.config.resilient_io,
            self.config.fetch_connect_timeout_secs,
            self.config.fetch_read_timeout_secs,
        )
        .map_err(|source| BootstrapError::IoProvider { source })?;

        let stdin = if self.config.neutralize_stdin {
            StdinPolicy::Neutralized
        } else {
            StdinPolicy::Native
        };

        info!(
            substituted,
            io = io.name(),
            ?stdin,
            "compatibility layer initialized"
        );
        Ok(CompatContext {
            registry,
            io,
            stdin,
            diagnostic,
        })
    }
}

static CONTEXT: OnceLock<CompatContext> = OnceLock::new();
static INIT: Mutex<()> = Mutex::new(());

/// Initializes the process-wide context, or returns the existing one.
///
/// Only the first successful call's `config` takes effect.
///
/// # Errors
///
/// See [`Bootstrap::run`]. A failed attempt leaves nothing installed.
pub fn initialize(config: CompatConfig) -> Result<&'static CompatContext, BootstrapError> {
    let _guard = INIT.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(context) = CONTEXT.get() {
        debug!("compatibility layer already initialized");
        return Ok(context);
    }
    let context = Bootstrap::new(config).run()?;
    Ok(CONTEXT.get_or_init(|| context))
}

/// The context installed by [`initialize`], if any.
#[must_use]
pub fn context() -> Option<&'static CompatContext> {
    CONTEXT.get()
}

/// Everything downstream code needs: the frozen registry, the selected I/O
/// provider and the input policy.
#[derive(Debug, Clone)]
pub struct CompatContext {
    registry: Arc<CapabilityRegistry>,
    io: Arc<dyn IoProvider>,
    stdin: StdinPolicy,
    diagnostic: DiagnosticOutcome,
}

impl CompatContext {
    #[must_use]
    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn io(&self) -> &Arc<dyn IoProvider> {
        &self.io
    }

    #[must_use]
    pub fn stdin_policy(&self) -> StdinPolicy {
        self.stdin
    }

    /// Standard input under the configured policy.
    #[must_use]
    pub fn stdin(&self) -> InputStream {
        InputStream::for_policy(self.stdin)
    }

    #[must_use]
    pub fn diagnostic(&self) -> DiagnosticOutcome {
        self.diagnostic
    }

    /// Snapshot of what was probed and what was substituted.
    #[must_use]
    pub fn report(&self) -> CapabilityReport {
        let probe = self.registry.probe();
        CapabilityReport {
            diagnostic: self.diagnostic,
            categories: Category::ALL
                .into_iter()
                .map(|category| CategoryReport {
                    category,
                    available: probe.is_available(category),
                    backing: self.registry.backing(category),
                })
                .collect(),
            tracker_neutralized: self.registry.tracker().is_neutralized(),
            io_provider: self.io.name(),
            stdin: self.stdin,
            cpu_count: self.registry.cpu_count(),
            patches: self.registry.patches().to_vec(),
        }
    }
}

/// Serializable start-up summary.
#[derive(Debug, Clone, Serialize)]
pub struct CapabilityReport {
    pub diagnostic: DiagnosticOutcome,
    pub categories: Vec<CategoryReport>,
    pub tracker_neutralized: bool,
    pub io_provider: &'static str,
    pub stdin: StdinPolicy,
    pub cpu_count: usize,
    pub patches: Vec<PatchRecord>,
}

/// One row of [`CapabilityReport::categories`].
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CategoryReport {
    pub category: Category,
    /// Whether the native implementation passed its trial.
    pub available: bool,
    pub backing: Backing,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn quiet_config() -> CompatConfig {
        CompatConfig {
            disable_descriptor_diagnostic: false,
            force_emulate: Category::ALL.to_vec(),
            ..CompatConfig::default()
        }
    }

    #[test]
    fn test_forced_categories_are_all_emulated() {
        let context = Bootstrap::new(quiet_config()).run().unwrap();
        let report = context.report();

        assert_eq!(report.diagnostic, DiagnosticOutcome::LeftEnabled);
        assert!(report.tracker_neutralized);
        assert_eq!(report.cpu_count, 1);
        assert_eq!(report.io_provider, "resilient");
        assert_eq!(report.stdin, StdinPolicy::Neutralized);
        for row in &report.categories {
            assert!(!row.available);
            assert_eq!(row.backing, Backing::Emulated);
        }
    }

    #[test]
    fn test_default_diagnostic_setting_never_writes_environment() {
        let before = std::env::var_os(crate::diagnostic::FDSAN_ENV);
        let config = CompatConfig {
            force_emulate: Category::ALL.to_vec(),
            ..CompatConfig::default()
        };
        let context = Bootstrap::new(config).run().unwrap();

        assert_eq!(std::env::var_os(crate::diagnostic::FDSAN_ENV), before);
        assert_ne!(context.diagnostic(), DiagnosticOutcome::LeftEnabled);
    }

    #[test]
    fn test_report_lists_tracker_patches() {
        let context = Bootstrap::new(quiet_config()).run().unwrap();
        let report = context.report();
        let tracker_patches = report
            .patches
            .iter()
            .filter(|patch| patch.category.is_none())
            .count();
        assert_eq!(tracker_patches, 4);
    }

    #[test]
    fn test_native_io_and_stdin_when_disabled() {
        let config = CompatConfig {
            resilient_io: false,
            neutralize_stdin: false,
            ..quiet_config()
        };
        let context = Bootstrap::new(config).run().unwrap();
        assert_eq!(context.io().name(), "native");
        assert_eq!(context.stdin_policy(), StdinPolicy::Native);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = CompatConfig {
            fetch_connect_timeout_secs: 0,
            ..quiet_config()
        };
        let err = Bootstrap::new(config).run().unwrap_err();
        assert!(matches!(err, BootstrapError::InvalidConfig { .. }));
        assert!(err.to_string().contains("fetch_connect_timeout_secs"));
    }

    #[test]
    fn test_report_serializes() {
        let context = Bootstrap::new(quiet_config()).run().unwrap();
        let json = serde_json::to_value(context.report()).unwrap();
        assert_eq!(json["categories"][0]["category"], "shared_memory");
        assert_eq!(json["categories"][0]["backing"], "emulated");
        assert_eq!(json["stdin"], "neutralized");
    }

    #[test]
    fn test_initialize_returns_the_same_context() {
        let first = initialize(quiet_config()).unwrap();
        let second = initialize(CompatConfig {
            resilient_io: false,
            ..quiet_config()
        })
        .unwrap();
        assert!(std::ptr::eq(first, second));
        assert_eq!(second.io().name(), "resilient");
        assert!(context().is_some());
    }
}
