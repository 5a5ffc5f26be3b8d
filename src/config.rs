//! Configuration loading for the compatibility layer.
//!
//! Values come from three places, later ones winning: built-in defaults,
//! the config file, then the `ANDROID_FDSAN_DISABLED` environment toggle.
//! Command-line flags are applied by the binary on top of the result.

use std::env;
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

use crate::diagnostic::FDSAN_ENV;
use crate::io::{DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_READ_TIMEOUT_SECS};
use crate::probe::Category;

/// Directory name under the user's config home.
const CONFIG_DIR: &str = "downloader-compat";

/// Values read from the config file. Every key is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileConfig {
    /// Turn off the host's descriptor-misuse diagnostic at start-up.
    pub disable_descriptor_diagnostic: Option<bool>,
    /// Categories emulated without probing.
    pub force_emulate: Option<Vec<Category>>,
    /// Replace standard input with an always-empty stream.
    pub neutralize_stdin: Option<bool>,
    /// Select the fault-absorbing I/O provider.
    pub resilient_io: Option<bool>,
    pub fetch_connect_timeout_secs: Option<u64>,
    pub fetch_read_timeout_secs: Option<u64>,
    pub verbosity: Option<VerbositySetting>,
}

impl FileConfig {
    /// Validates values that have a range.
    pub fn validate(&self) -> Result<()> {
        validate_timeout_secs("fetch_connect_timeout_secs", self.fetch_connect_timeout_secs)?;
        validate_timeout_secs("fetch_read_timeout_secs", self.fetch_read_timeout_secs)?;
        Ok(())
    }
}

fn validate_timeout_secs(field: &str, value: Option<u64>) -> Result<()> {
    let Some(value) = value else {
        return Ok(());
    };
    if !(1..=3600).contains(&value) {
        bail!("Invalid config value for `{field}`: {value}. Expected range: 1..=3600");
    }
    Ok(())
}

/// Supported config verbosity labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VerbositySetting {
    #[default]
    Default,
    Verbose,
    Quiet,
    Debug,
}

impl VerbositySetting {
    /// Returns the stable string label for display output.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Verbose => "verbose",
            Self::Quiet => "quiet",
            Self::Debug => "debug",
        }
    }
}

/// Fully resolved settings consumed by [`crate::bootstrap`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompatConfig {
    pub disable_descriptor_diagnostic: bool,
    pub force_emulate: Vec<Category>,
    pub neutralize_stdin: bool,
    pub resilient_io: bool,
    pub fetch_connect_timeout_secs: u64,
    pub fetch_read_timeout_secs: u64,
    pub verbosity: VerbositySetting,
}

impl Default for CompatConfig {
    fn default() -> Self {
        Self {
            disable_descriptor_diagnostic: true,
            force_emulate: Vec::new(),
            neutralize_stdin: true,
            resilient_io: true,
            fetch_connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            fetch_read_timeout_secs: DEFAULT_READ_TIMEOUT_SECS,
            verbosity: VerbositySetting::Default,
        }
    }
}

impl CompatConfig {
    /// Layers `file` over the defaults, then applies the value of the
    /// descriptor-diagnostic environment toggle if one is set.
    #[must_use]
    pub fn resolve(file: Option<&FileConfig>, fdsan_env: Option<&OsStr>) -> Self {
        let mut config = Self::default();
        if let Some(file) = file {
            if let Some(value) = file.disable_descriptor_diagnostic {
                config.disable_descriptor_diagnostic = value;
            }
            if let Some(categories) = &file.force_emulate {
                config.force_emulate.clone_from(categories);
            }
            if let Some(value) = file.neutralize_stdin {
                config.neutralize_stdin = value;
            }
            if let Some(value) = file.resilient_io {
                config.resilient_io = value;
            }
            if let Some(value) = file.fetch_connect_timeout_secs {
                config.fetch_connect_timeout_secs = value;
            }
            if let Some(value) = file.fetch_read_timeout_secs {
                config.fetch_read_timeout_secs = value;
            }
            if let Some(value) = file.verbosity {
                config.verbosity = value;
            }
        }
        if let Some(value) = fdsan_env.filter(|value| !value.is_empty()) {
            config.disable_descriptor_diagnostic = value != "0";
        }
        config
    }

    /// [`resolve`](Self::resolve) against the live environment.
    #[must_use]
    pub fn from_env(file: Option<&FileConfig>) -> Self {
        Self::resolve(file, env::var_os(FDSAN_ENV).as_deref())
    }

    /// Validates the resolved values, including CLI overrides.
    pub fn validate(&self) -> Result<()> {
        validate_timeout_secs(
            "fetch_connect_timeout_secs",
            Some(self.fetch_connect_timeout_secs),
        )?;
        validate_timeout_secs("fetch_read_timeout_secs", Some(self.fetch_read_timeout_secs))?;
        Ok(())
    }

    /// Whether `category` skips probing.
    #[must_use]
    pub fn forces(&self, category: Category) -> bool {
        self.force_emulate.contains(&category)
    }
}

/// Loaded config metadata.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    /// Resolved config path if a base directory is known.
    pub path: Option<PathBuf>,
    /// Parsed file config when a config file exists and was valid.
    pub config: Option<FileConfig>,
    /// Indicates whether configuration was loaded from disk.
    pub loaded_from_file: bool,
}

/// Resolves default config path.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/downloader-compat/config.toml`
/// 2. `$HOME/.config/downloader-compat/config.toml`
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    if let Some(xdg_config_home) = env_var_non_empty_os("XDG_CONFIG_HOME") {
        return Some(
            PathBuf::from(xdg_config_home)
                .join(CONFIG_DIR)
                .join("config.toml"),
        );
    }

    let home = env_var_non_empty_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join(CONFIG_DIR)
            .join("config.toml"),
    )
}

fn env_var_non_empty_os(name: &str) -> Option<std::ffi::OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}

/// Loads config from default path if present.
pub fn load_default_file_config() -> Result<LoadedConfig> {
    let path = resolve_default_config_path();
    let Some(path_ref) = path.as_deref() else {
        return Ok(LoadedConfig {
            path,
            config: None,
            loaded_from_file: false,
        });
    };

    if !path_ref.exists() {
        return Ok(LoadedConfig {
            path,
            config: None,
            loaded_from_file: false,
        });
    }

    let config = load_file_config(path_ref)?;
    Ok(LoadedConfig {
        path,
        config: Some(config),
        loaded_from_file: true,
    })
}

/// Loads an explicitly named config file. A missing file is an error.
pub fn load_file_config(path: &Path) -> Result<FileConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
    parse_config_str(&raw)
        .with_context(|| format!("Failed to parse config file '{}'", path.display()))
}

fn parse_config_str(raw: &str) -> Result<FileConfig> {
    let mut cfg = FileConfig::default();
    for (line_index, raw_line) in raw.lines().enumerate() {
        let line = strip_inline_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }

        let Some((raw_key, raw_value)) = line.split_once('=') else {
            bail!(
                "Invalid config syntax on line {}: expected key = value",
                line_index + 1
            );
        };

        let key = raw_key.trim();
        let value = raw_value.trim();
        let invalid = || format!("Invalid `{key}` value on line {}", line_index + 1);

        match key {
            "disable_descriptor_diagnostic" => {
                cfg.disable_descriptor_diagnostic =
                    Some(parse_boolean(value).with_context(invalid)?);
            }
            "force_emulate" => {
                let parsed = parse_string_literal(value)
                    .and_then(|list| parse_category_list(&list))
                    .with_context(invalid)?;
                cfg.force_emulate = Some(parsed);
            }
            "neutralize_stdin" => {
                cfg.neutralize_stdin = Some(parse_boolean(value).with_context(invalid)?);
            }
            "resilient_io" => {
                cfg.resilient_io = Some(parse_boolean(value).with_context(invalid)?);
            }
            "fetch_connect_timeout_secs" => {
                cfg.fetch_connect_timeout_secs =
                    Some(parse_integer_u64(value).with_context(invalid)?);
            }
            "fetch_read_timeout_secs" => {
                cfg.fetch_read_timeout_secs =
                    Some(parse_integer_u64(value).with_context(invalid)?);
            }
            "verbosity" => {
                let parsed = parse_string_literal(value)
                    .and_then(|label| parse_verbosity(&label))
                    .with_context(invalid)?;
                cfg.verbosity = Some(parsed);
            }
            unknown => {
                bail!(
                    "Unknown configuration key: '{}' on line {}",
                    unknown,
                    line_index + 1
                );
            }
        }
    }
    cfg.validate()?;
    Ok(cfg)
}

fn strip_inline_comment(line: &str) -> &str {
    let mut in_string = false;
    for (index, ch) in line.char_indices() {
        match ch {
            '"' => in_string = !in_string,
            '#' if !in_string => return &line[..index],
            _ => {}
        }
    }
    line
}

fn parse_string_literal(raw_value: &str) -> Result<String> {
    if raw_value.len() < 2 || !raw_value.starts_with('"') || !raw_value.ends_with('"') {
        bail!("Expected double-quoted string");
    }
    Ok(raw_value[1..raw_value.len() - 1].to_string())
}

fn parse_integer_u64(raw_value: &str) -> Result<u64> {
    let token = raw_value.trim();
    if token.is_empty() {
        bail!("Expected integer value");
    }
    let value = token.parse::<i128>()?;
    if value < 0 {
        bail!("Expected non-negative integer");
    }
    u64::try_from(value).map_err(|_| anyhow::anyhow!("Integer value out of range for u64"))
}

fn parse_boolean(raw_value: &str) -> Result<bool> {
    match raw_value.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => bail!("Expected 'true' or 'false'"),
    }
}

fn parse_verbosity(value: &str) -> Result<VerbositySetting> {
    match value {
        "default" => Ok(VerbositySetting::Default),
        "verbose" => Ok(VerbositySetting::Verbose),
        "quiet" => Ok(VerbositySetting::Quiet),
        "debug" => Ok(VerbositySetting::Debug),
        _ => bail!("Expected one of: default, verbose, quiet, debug"),
    }
}

/// Parses `"shared_memory, process_fork"`; an empty string means none.
fn parse_category_list(value: &str) -> Result<Vec<Category>> {
    let mut categories = Vec::new();
    for token in value.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        let category: Category = token.parse()?;
        if !categories.contains(&category) {
            categories.push(category);
        }
    }
    Ok(categories)
}
