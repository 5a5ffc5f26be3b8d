//! Named semaphores (`sem_open`/`sem_close`/`sem_unlink`).
//!
//! The native backing goes through [`HostPrimitives`]; the emulated backing
//! keeps an in-process [`Semaphore`] per handle, so opening the same name
//! twice yields two independent semaphores. Nothing is visible across
//! processes in that mode.

use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use super::semaphore::Semaphore;
use super::{Acquire, NamedSemaphoreError, SyncError};
use crate::probe::{HostPrimitives, OpenFlags, SemHandle};
use crate::registry::Backing;
use crate::tracker::{ResourceKind, ResourceTracker};

const TIMED_WAIT_POLL: Duration = Duration::from_millis(1);

/// Entry point for the `sem_*` functions, bound to one backing.
#[derive(Clone)]
pub struct NamedSemaphores {
    backing: Backing,
    host: Arc<dyn HostPrimitives>,
    tracker: Arc<ResourceTracker>,
}

impl fmt::Debug for NamedSemaphores {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedSemaphores")
            .field("backing", &self.backing)
            .finish_non_exhaustive()
    }
}

impl NamedSemaphores {
    pub(crate) fn new(
        backing: Backing,
        host: Arc<dyn HostPrimitives>,
        tracker: Arc<ResourceTracker>,
    ) -> Self {
        Self {
            backing,
            host,
            tracker,
        }
    }

    #[must_use]
    pub fn backing(&self) -> Backing {
        self.backing
    }

    /// Opens (and with `flags.create`, creates) the semaphore `name`.
    ///
    /// # Errors
    ///
    /// Native backing only: returns [`NamedSemaphoreError::Os`] when the
    /// host call fails.
    pub fn sem_open(
        &self,
        name: &str,
        flags: OpenFlags,
        mode: u32,
        value: u32,
    ) -> Result<NamedSemaphore, NamedSemaphoreError> {
        let inner = match self.backing {
            Backing::Emulated => {
                NamedInner::Emulated(Semaphore::new(Backing::Emulated, value as usize))
            }
            Backing::Native => {
                let handle = self
                    .host
                    .sem_open(name, flags, mode, value)
                    .map_err(|source| NamedSemaphoreError::os("sem_open", name, source))?;
                if flags.create {
                    self.tracker.register(name, ResourceKind::Semaphore);
                }
                NamedInner::Native {
                    host: Arc::clone(&self.host),
                    handle: Some(handle),
                }
            }
        };
        debug!(name, backing = %self.backing, "named semaphore opened");
        Ok(NamedSemaphore {
            name: name.to_string(),
            inner,
        })
    }

    /// Closes a handle returned by [`sem_open`](Self::sem_open).
    ///
    /// # Errors
    ///
    /// Native backing only: the host's `sem_close` failed.
    pub fn sem_close(&self, sem: NamedSemaphore) -> Result<(), NamedSemaphoreError> {
        sem.close()
    }

    /// Removes the name. Existing handles stay usable until closed.
    ///
    /// # Errors
    ///
    /// Native backing only: the host's `sem_unlink` failed.
    pub fn sem_unlink(&self, name: &str) -> Result<(), NamedSemaphoreError> {
        if self.backing == Backing::Emulated {
            return Ok(());
        }
        self.host
            .sem_unlink(name)
            .map_err(|source| NamedSemaphoreError::os("sem_unlink", name, source))?;
        self.tracker.unregister(name, ResourceKind::Semaphore);
        Ok(())
    }
}

/// Handle returned by [`NamedSemaphores::sem_open`].
pub struct NamedSemaphore {
    name: String,
    inner: NamedInner,
}

enum NamedInner {
    Native {
        host: Arc<dyn HostPrimitives>,
        handle: Option<SemHandle>,
    },
    Emulated(Semaphore),
}

impl fmt::Debug for NamedSemaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedSemaphore")
            .field("name", &self.name)
            .field("backing", &self.backing())
            .finish()
    }
}

impl NamedSemaphore {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn backing(&self) -> Backing {
        match self.inner {
            NamedInner::Native { .. } => Backing::Native,
            NamedInner::Emulated(_) => Backing::Emulated,
        }
    }

    /// Closes the handle.
    ///
    /// # Errors
    ///
    /// Native backing only: the host's `sem_close` failed.
    pub fn close(mut self) -> Result<(), NamedSemaphoreError> {
        match &mut self.inner {
            NamedInner::Native { host, handle } => match handle.take() {
                Some(handle) => host
                    .sem_close(handle)
                    .map_err(|source| NamedSemaphoreError::os("sem_close", &self.name, source)),
                None => Ok(()),
            },
            NamedInner::Emulated(_) => Ok(()),
        }
    }
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        if let NamedInner::Native { host, handle } = &mut self.inner
            && let Some(handle) = handle.take()
            && let Err(error) = host.sem_close(handle)
        {
            debug!(name = %self.name, error = %error, "sem_close on drop failed");
        }
    }
}

impl Acquire for NamedSemaphore {
    fn acquire(&self, blocking: bool, timeout: Option<Duration>) -> bool {
        let (host, handle) = match &self.inner {
            NamedInner::Emulated(sem) => return sem.acquire(blocking, timeout),
            NamedInner::Native { host, handle } => match handle {
                Some(handle) => (host, handle),
                None => return false,
            },
        };

        if blocking && timeout.is_none() {
            return host.sem_wait(handle).is_ok();
        }
        let deadline = timeout
            .filter(|_| blocking)
            .map(|timeout| Instant::now() + timeout);
        loop {
            if host.sem_trywait(handle).is_ok() {
                return true;
            }
            match deadline {
                Some(deadline) if Instant::now() < deadline => thread::sleep(TIMED_WAIT_POLL),
                _ => return false,
            }
        }
    }

    fn release(&self) -> Result<(), SyncError> {
        match &self.inner {
            NamedInner::Emulated(sem) => sem.release(),
            NamedInner::Native { host, handle } => match handle {
                Some(handle) => host
                    .sem_post(handle)
                    .map_err(|source| SyncError::Os { op: "sem_post", source }),
                None => Err(SyncError::NotHeld),
            },
        }
    }
}
