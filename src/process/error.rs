//! Error types for processes, pools and the command runner.

use std::any::Any;
use std::io;

use thiserror::Error;

/// Boxed error a process target may return.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Why a process target or pool task did not complete.
///
/// Recorded on the [`Process`](super::Process) instead of being raised from
/// `start`, and queryable through [`Process::failure`](super::Process::failure).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TargetError {
    /// The target returned an error.
    #[error("target failed: {message}")]
    Failed {
        /// Rendered error chain.
        message: String,
    },

    /// The target panicked.
    #[error("target panicked: {message}")]
    Panicked {
        /// Panic payload, when it was a string.
        message: String,
    },
}

impl TargetError {
    pub(crate) fn failed(error: &BoxError) -> Self {
        Self::Failed {
            message: error.to_string(),
        }
    }

    pub(crate) fn panicked(payload: &(dyn Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(ToString::to_string)
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        Self::Panicked { message }
    }
}

/// Misuse of a [`Process`](super::Process) handle.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// `start` was called more than once.
    #[error("process {name} already started")]
    AlreadyStarted {
        /// Process name.
        name: String,
    },

    /// The native worker thread could not be spawned.
    #[error("could not spawn worker for process {name}: {source}")]
    Spawn {
        /// Process name.
        name: String,
        /// The OS error.
        #[source]
        source: io::Error,
    },
}

/// Failure to run an external command natively.
#[derive(Debug, Error)]
#[error("could not run {program}: {source}")]
pub struct CommandError {
    /// Program that failed to launch.
    pub program: String,
    /// The OS error.
    #[source]
    pub source: io::Error,
}
