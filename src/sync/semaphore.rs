use std::time::Duration;

use super::counter::Counter;
use super::{Acquire, SyncError};
use crate::registry::Backing;

/// Counting semaphore.
#[derive(Debug)]
pub struct Semaphore {
    initial: usize,
    inner: Option<Counter>,
}

impl Semaphore {
    pub(crate) fn new(backing: Backing, value: usize) -> Self {
        Self::with_bound(backing, value, None)
    }

    fn with_bound(backing: Backing, value: usize, bound: Option<usize>) -> Self {
        let inner = match backing {
            Backing::Native => Some(Counter::new(value, bound)),
            Backing::Emulated => None,
        };
        Self {
            initial: value,
            inner,
        }
    }

    /// Which implementation backs this semaphore.
    #[must_use]
    pub fn backing(&self) -> Backing {
        if self.inner.is_some() {
            Backing::Native
        } else {
            Backing::Emulated
        }
    }

    /// Current count. The emulated semaphore always reports its initial value.
    #[must_use]
    pub fn value(&self) -> usize {
        self.inner.as_ref().map_or(self.initial, Counter::value)
    }
}

impl Acquire for Semaphore {
    fn acquire(&self, blocking: bool, timeout: Option<Duration>) -> bool {
        self.inner
            .as_ref()
            .is_none_or(|counter| counter.acquire(blocking, timeout))
    }

    fn release(&self) -> Result<(), SyncError> {
        self.inner.as_ref().map_or(Ok(()), Counter::release)
    }
}

/// Semaphore whose count may never exceed its initial value.
#[derive(Debug)]
pub struct BoundedSemaphore(Semaphore);

impl BoundedSemaphore {
    pub(crate) fn new(backing: Backing, value: usize) -> Self {
        Self(Semaphore::with_bound(backing, value, Some(value)))
    }

    /// Which implementation backs this semaphore.
    #[must_use]
    pub fn backing(&self) -> Backing {
        self.0.backing()
    }

    /// Current count.
    #[must_use]
    pub fn value(&self) -> usize {
        self.0.value()
    }
}

impl Acquire for BoundedSemaphore {
    fn acquire(&self, blocking: bool, timeout: Option<Duration>) -> bool {
        self.0.acquire(blocking, timeout)
    }

    fn release(&self) -> Result<(), SyncError> {
        self.0.release()
    }
}
