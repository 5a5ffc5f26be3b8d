//! Environment prober.
//!
//! Decides, per primitive [`Category`], whether the host's native
//! implementation exists *and works*. Shared memory and POSIX semaphores
//! are exercised with a full create-use-destroy cycle because on some
//! hosts the symbols resolve but every call fails (`ENOSYS`). Process
//! forking is exercised by forking a child that exits immediately.
//!
//! Probing never fails: every fault, panics included, is folded into
//! `false` and logged. A trial that fails half-way may leak the object it
//! created; cleanup is attempted but not guaranteed.

pub mod host;

use std::fmt;
use std::io;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument, warn};

pub use host::{HostPrimitives, LibcHost, MappedRegion, OpenFlags, SemHandle, ShmHandle};

/// Size of the shared memory object created by the trial cycle.
const SHM_TRIAL_LEN: usize = 64;

/// Byte pattern written to and read back from the trial mapping.
const SHM_TRIAL_PATTERN: u8 = 0xA5;

/// Primitive categories the host may lack.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// POSIX shared memory objects (`shm_open`).
    SharedMemory,
    /// POSIX named semaphores (`sem_open`), which back every cross-process lock.
    PosixSemaphore,
    /// Child process creation (`fork`).
    ProcessFork,
}

impl Category {
    /// All categories, in probing order.
    pub const ALL: [Category; 3] = [
        Category::SharedMemory,
        Category::PosixSemaphore,
        Category::ProcessFork,
    ];

    /// Stable snake_case label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SharedMemory => "shared_memory",
            Self::PosixSemaphore => "posix_semaphore",
            Self::ProcessFork => "process_fork",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a category label is not recognised.
#[derive(Debug, Clone, Error)]
#[error("unknown capability category {value:?} (expected one of: shared_memory, posix_semaphore, process_fork)")]
pub struct CategoryParseError {
    value: String,
}

impl FromStr for Category {
    type Err = CategoryParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "shared_memory" | "shm" => Ok(Self::SharedMemory),
            "posix_semaphore" | "semaphore" | "sem" => Ok(Self::PosixSemaphore),
            "process_fork" | "fork" => Ok(Self::ProcessFork),
            other => Err(CategoryParseError {
                value: other.to_string(),
            }),
        }
    }
}

/// Why a trial cycle failed. Logged, never surfaced to callers.
#[derive(Debug, Error)]
pub enum ProbeFailure {
    /// One step of the create-use-destroy cycle failed.
    #[error("{step} failed while probing {category}: {source}")]
    Step {
        /// Category under trial.
        category: Category,
        /// The failing call.
        step: &'static str,
        /// The OS error.
        #[source]
        source: io::Error,
    },

    /// The trial read back different bytes than it wrote.
    #[error("shared memory trial read back corrupted data")]
    Corrupted,

    /// The trial panicked.
    #[error("probing {category} panicked")]
    Panicked {
        /// Category under trial.
        category: Category,
    },
}

impl ProbeFailure {
    fn step(category: Category, step: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |source| Self::Step {
            category,
            step,
            source,
        }
    }
}

/// Outcome of probing every category. Computed once, immutable afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CapabilityProbe {
    shared_memory: bool,
    posix_semaphore: bool,
    process_fork: bool,
}

impl CapabilityProbe {
    /// Builds a probe result from known flags.
    #[must_use]
    pub const fn from_flags(shared_memory: bool, posix_semaphore: bool, process_fork: bool) -> Self {
        Self {
            shared_memory,
            posix_semaphore,
            process_fork,
        }
    }

    /// Probes every category against `host`.
    #[must_use]
    pub fn detect(host: &dyn HostPrimitives) -> Self {
        Self::detect_except(host, &[])
    }

    /// Probes every category not listed in `forced`; forced categories are
    /// reported unavailable without running a trial.
    #[must_use]
    pub fn detect_except(host: &dyn HostPrimitives, forced: &[Category]) -> Self {
        let check = |category: Category| {
            if forced.contains(&category) {
                debug!(%category, "emulation forced by configuration; skipping trial");
                false
            } else {
                probe_with(host, category)
            }
        };
        Self {
            shared_memory: check(Category::SharedMemory),
            posix_semaphore: check(Category::PosixSemaphore),
            process_fork: check(Category::ProcessFork),
        }
    }

    /// Whether the native implementation of `category` is functional.
    #[must_use]
    pub fn is_available(&self, category: Category) -> bool {
        match category {
            Category::SharedMemory => self.shared_memory,
            Category::PosixSemaphore => self.posix_semaphore,
            Category::ProcessFork => self.process_fork,
        }
    }

    /// Categories whose native implementation is missing or broken.
    pub fn missing(&self) -> impl Iterator<Item = Category> + '_ {
        Category::ALL
            .into_iter()
            .filter(|category| !self.is_available(*category))
    }
}

/// Probes `category` against the C library.
#[must_use]
pub fn probe(category: Category) -> bool {
    probe_with(&LibcHost, category)
}

/// Probes `category` against `host`. Never panics, never errors.
#[instrument(skip(host))]
pub fn probe_with(host: &dyn HostPrimitives, category: Category) -> bool {
    let outcome = catch_unwind(AssertUnwindSafe(|| match category {
        Category::SharedMemory => shared_memory_trial(host),
        Category::PosixSemaphore => semaphore_trial(host),
        Category::ProcessFork => fork_trial(host),
    }))
    .unwrap_or(Err(ProbeFailure::Panicked { category }));

    match outcome {
        Ok(()) => {
            debug!(%category, "native primitive functional");
            true
        }
        Err(failure) => {
            warn!(%category, error = %failure, "native primitive unavailable");
            false
        }
    }
}

fn trial_name(kind: &str) -> String {
    let salt: u32 = rand::thread_rng().gen_range(0..u32::MAX);
    format!("/dlc-{kind}-{}-{salt:08x}", std::process::id())
}

fn semaphore_trial(host: &dyn HostPrimitives) -> Result<(), ProbeFailure> {
    let category = Category::PosixSemaphore;
    let name = trial_name("sem");
    let sem = host
        .sem_open(&name, OpenFlags::CREATE_EXCLUSIVE, 0o600, 1)
        .map_err(ProbeFailure::step(category, "sem_open"))?;

    let used = host
        .sem_trywait(&sem)
        .map_err(ProbeFailure::step(category, "sem_trywait"))
        .and_then(|()| {
            host.sem_post(&sem)
                .map_err(ProbeFailure::step(category, "sem_post"))
        });
    let closed = host
        .sem_close(sem)
        .map_err(ProbeFailure::step(category, "sem_close"));
    let unlinked = host
        .sem_unlink(&name)
        .map_err(ProbeFailure::step(category, "sem_unlink"));

    used.and(closed).and(unlinked)
}

fn shared_memory_trial(host: &dyn HostPrimitives) -> Result<(), ProbeFailure> {
    let category = Category::SharedMemory;
    let name = trial_name("shm");
    let shm = host
        .shm_open(&name, OpenFlags::CREATE_EXCLUSIVE, 0o600)
        .map_err(ProbeFailure::step(category, "shm_open"))?;

    let used = host
        .shm_resize(&shm, SHM_TRIAL_LEN)
        .map_err(ProbeFailure::step(category, "ftruncate"))
        .and_then(|()| {
            host.shm_map(&shm, SHM_TRIAL_LEN)
                .map_err(ProbeFailure::step(category, "mmap"))
        })
        .and_then(|mut region| {
            region.as_mut_slice().fill(SHM_TRIAL_PATTERN);
            if region.as_slice().iter().all(|byte| *byte == SHM_TRIAL_PATTERN) {
                Ok(())
            } else {
                Err(ProbeFailure::Corrupted)
            }
        });
    let closed = host
        .shm_close(shm)
        .map_err(ProbeFailure::step(category, "close"));
    let unlinked = host
        .shm_unlink(&name)
        .map_err(ProbeFailure::step(category, "shm_unlink"));

    used.and(closed).and(unlinked)
}

fn fork_trial(host: &dyn HostPrimitives) -> Result<(), ProbeFailure> {
    host.fork_and_reap()
        .map_err(ProbeFailure::step(Category::ProcessFork, "fork"))
}
