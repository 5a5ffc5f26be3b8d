//! Synchronization primitives with a native or an emulated backing.
//!
//! Every primitive here is a concrete type whose backing is fixed when the
//! registry hands it out. Native backings are real thread primitives; the
//! emulated ones never block and never fail, which is the contract callers
//! rely on when the host lacks POSIX semaphores:
//!
//! - `acquire` always reports success and `release` is a no-op
//! - `Event::wait` returns the current flag immediately
//! - `Queue::get` on an empty queue returns `Ok(None)` instead of blocking

mod counter;
mod error;
mod event;
mod lock;
pub mod named;
mod queue;
mod semaphore;

use std::time::Duration;

use tracing::debug;

pub use error::{NamedSemaphoreError, QueueError, SyncError};
pub use event::Event;
pub use lock::{Lock, RLock};
pub use named::{NamedSemaphore, NamedSemaphores};
pub use queue::Queue;
pub use semaphore::{BoundedSemaphore, Semaphore};

/// Common acquire/release surface for locks and semaphores.
pub trait Acquire {
    /// Acquires the primitive.
    ///
    /// With `blocking == false` the call never waits. With a `timeout` it
    /// waits at most that long. Returns whether the primitive was acquired.
    fn acquire(&self, blocking: bool, timeout: Option<Duration>) -> bool;

    /// Releases one acquisition.
    ///
    /// # Errors
    ///
    /// Native backings return [`SyncError`] for unbalanced releases.
    fn release(&self) -> Result<(), SyncError>;

    /// Blocks until acquired and returns a guard that releases on drop.
    fn hold(&self) -> Held<'_, Self>
    where
        Self: Sized,
    {
        self.acquire(true, None);
        Held { primitive: self }
    }
}

/// Scope guard returned by [`Acquire::hold`].
#[must_use = "the primitive is released as soon as the guard is dropped"]
#[derive(Debug)]
pub struct Held<'a, A: Acquire> {
    primitive: &'a A,
}

impl<A: Acquire> Drop for Held<'_, A> {
    fn drop(&mut self) {
        if let Err(error) = self.primitive.release() {
            debug!(error = %error, "release on guard drop failed");
        }
    }
}
