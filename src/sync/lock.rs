use std::sync::{Condvar, Mutex, PoisonError};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use super::counter::Counter;
use super::{Acquire, SyncError};
use crate::registry::Backing;

/// Mutual-exclusion lock.
#[derive(Debug)]
pub struct Lock {
    inner: Option<Counter>,
}

impl Lock {
    pub(crate) fn new(backing: Backing) -> Self {
        let inner = match backing {
            Backing::Native => Some(Counter::new(1, Some(1))),
            Backing::Emulated => None,
        };
        Self { inner }
    }

    /// Which implementation backs this lock.
    #[must_use]
    pub fn backing(&self) -> Backing {
        if self.inner.is_some() {
            Backing::Native
        } else {
            Backing::Emulated
        }
    }
}

impl Acquire for Lock {
    fn acquire(&self, blocking: bool, timeout: Option<Duration>) -> bool {
        self.inner
            .as_ref()
            .is_none_or(|counter| counter.acquire(blocking, timeout))
    }

    fn release(&self) -> Result<(), SyncError> {
        match &self.inner {
            Some(counter) => counter.release().map_err(|_| SyncError::NotHeld),
            None => Ok(()),
        }
    }
}

/// Re-entrant lock: the owning thread may acquire it repeatedly and must
/// release it the same number of times.
#[derive(Debug)]
pub struct RLock {
    inner: Option<Reentrant>,
}

#[derive(Debug, Default)]
struct Reentrant {
    owner: Mutex<Option<(ThreadId, usize)>>,
    released: Condvar,
}

impl RLock {
    pub(crate) fn new(backing: Backing) -> Self {
        let inner = match backing {
            Backing::Native => Some(Reentrant::default()),
            Backing::Emulated => None,
        };
        Self { inner }
    }

    /// Which implementation backs this lock.
    #[must_use]
    pub fn backing(&self) -> Backing {
        if self.inner.is_some() {
            Backing::Native
        } else {
            Backing::Emulated
        }
    }
}

impl Acquire for RLock {
    fn acquire(&self, blocking: bool, timeout: Option<Duration>) -> bool {
        self.inner
            .as_ref()
            .is_none_or(|lock| lock.acquire(blocking, timeout))
    }

    fn release(&self) -> Result<(), SyncError> {
        self.inner.as_ref().map_or(Ok(()), Reentrant::release)
    }
}

impl Reentrant {
    fn acquire(&self, blocking: bool, timeout: Option<Duration>) -> bool {
        let me = thread::current().id();
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut state = self.owner.lock().unwrap_or_else(PoisonError::into_inner);

        loop {
            let held_by_other = (*state).is_some_and(|(owner, _)| owner != me);
            if !held_by_other {
                let depth = (*state).map_or(0, |(_, depth)| depth);
                *state = Some((me, depth + 1));
                return true;
            }
            if !blocking {
                return false;
            }
            state = match deadline {
                None => self
                    .released
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    self.released
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    fn release(&self) -> Result<(), SyncError> {
        let me = thread::current().id();
        let mut state = self.owner.lock().unwrap_or_else(PoisonError::into_inner);
        match *state {
            Some((owner, depth)) if owner == me => {
                if depth == 1 {
                    *state = None;
                    self.released.notify_one();
                } else {
                    *state = Some((owner, depth - 1));
                }
                Ok(())
            }
            Some(_) => Err(SyncError::NotOwner),
            None => Err(SyncError::NotHeld),
        }
    }
}
