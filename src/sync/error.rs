//! Error types for the sync primitives.

use std::io;

use thiserror::Error;

/// Errors raised by native lock and semaphore releases.
///
/// Emulated primitives never return these: their `release` always succeeds.
#[derive(Debug, Error)]
pub enum SyncError {
    /// `release` on a lock nobody holds.
    #[error("release of an unlocked lock")]
    NotHeld,

    /// `release` on a re-entrant lock from a thread that does not own it.
    #[error("cannot release a re-entrant lock owned by another thread")]
    NotOwner,

    /// A bounded semaphore was released more times than it was acquired.
    #[error("bounded semaphore released too many times (bound {bound})")]
    ReleasedTooManyTimes {
        /// The initial value the semaphore may not exceed.
        bound: usize,
    },

    /// A named semaphore call failed at the OS level.
    #[error("{op} failed on named semaphore: {source}")]
    Os {
        /// The failing call.
        op: &'static str,
        /// The OS error.
        #[source]
        source: io::Error,
    },
}

/// Errors raised by native queues.
///
/// The emulated queue never returns these: `put` always succeeds and `get`
/// on an empty queue yields `Ok(None)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    /// The queue stayed full for the whole wait.
    #[error("queue is full (maxsize {maxsize})")]
    Full {
        /// Declared capacity.
        maxsize: usize,
    },

    /// The queue stayed empty for the whole wait.
    #[error("queue is empty")]
    Empty,
}

/// Errors raised by `sem_open`/`sem_close`/`sem_unlink`.
#[derive(Debug, Error)]
pub enum NamedSemaphoreError {
    /// The underlying call failed.
    #[error("{op} failed for semaphore {name}: {source}")]
    Os {
        /// The failing call.
        op: &'static str,
        /// Semaphore name.
        name: String,
        /// The OS error.
        #[source]
        source: io::Error,
    },
}

impl NamedSemaphoreError {
    pub(crate) fn os(op: &'static str, name: impl Into<String>, source: io::Error) -> Self {
        Self::Os {
            op,
            name: name.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_error_display() {
        assert_eq!(SyncError::NotHeld.to_string(), "release of an unlocked lock");
        let msg = SyncError::ReleasedTooManyTimes { bound: 2 }.to_string();
        assert!(msg.contains("bound 2"), "Expected bound in: {msg}");
    }

    #[test]
    fn test_named_semaphore_error_display() {
        let err = NamedSemaphoreError::os(
            "sem_open",
            "/x",
            io::Error::new(io::ErrorKind::Unsupported, "function not implemented"),
        );
        let msg = err.to_string();
        assert!(msg.contains("sem_open"), "Expected op in: {msg}");
        assert!(msg.contains("/x"), "Expected name in: {msg}");
    }
}
