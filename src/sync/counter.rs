//! Native counting semaphore shared by `Lock`, `Semaphore` and `BoundedSemaphore`.

use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

use super::SyncError;

#[derive(Debug)]
pub(crate) struct Counter {
    count: Mutex<usize>,
    available: Condvar,
    bound: Option<usize>,
}

impl Counter {
    pub(crate) fn new(initial: usize, bound: Option<usize>) -> Self {
        Self {
            count: Mutex::new(initial),
            available: Condvar::new(),
            bound,
        }
    }

    pub(crate) fn acquire(&self, blocking: bool, timeout: Option<Duration>) -> bool {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        if !blocking {
            if *count == 0 {
                return false;
            }
            *count -= 1;
            return true;
        }

        match timeout {
            None => {
                while *count == 0 {
                    count = self
                        .available
                        .wait(count)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
            Some(timeout) => {
                let (guard, _) = self
                    .available
                    .wait_timeout_while(count, timeout, |count| *count == 0)
                    .unwrap_or_else(PoisonError::into_inner);
                count = guard;
                if *count == 0 {
                    return false;
                }
            }
        }
        *count -= 1;
        true
    }

    pub(crate) fn release(&self) -> Result<(), SyncError> {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(bound) = self.bound
            && *count >= bound
        {
            return Err(SyncError::ReleasedTooManyTimes { bound });
        }
        *count += 1;
        self.available.notify_one();
        Ok(())
    }

    pub(crate) fn value(&self) -> usize {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
