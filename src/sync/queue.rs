use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::QueueError;
use crate::registry::Backing;

/// FIFO queue shared between workers.
///
/// `maxsize == 0` means unbounded. The emulated queue ignores `maxsize`,
/// never blocks, and returns `Ok(None)` from `get` when empty.
#[derive(Debug)]
pub struct Queue<T> {
    maxsize: usize,
    items: Mutex<VecDeque<T>>,
    signals: Option<Signals>,
}

#[derive(Debug, Default)]
struct Signals {
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> Queue<T> {
    pub(crate) fn new(backing: Backing, maxsize: usize) -> Self {
        let signals = match backing {
            Backing::Native => Some(Signals::default()),
            Backing::Emulated => None,
        };
        Self {
            maxsize,
            items: Mutex::new(VecDeque::new()),
            signals,
        }
    }

    /// Which implementation backs this queue.
    #[must_use]
    pub fn backing(&self) -> Backing {
        if self.signals.is_some() {
            Backing::Native
        } else {
            Backing::Emulated
        }
    }

    #[must_use]
    pub fn maxsize(&self) -> usize {
        self.maxsize
    }

    #[must_use]
    pub fn qsize(&self) -> usize {
        self.lock_items().len()
    }

    #[must_use]
    pub fn empty(&self) -> bool {
        self.lock_items().is_empty()
    }

    /// Appends an item, waiting for room on a full native queue.
    ///
    /// # Errors
    ///
    /// Never fails for an unbounded or emulated queue.
    pub fn put(&self, item: T) -> Result<(), QueueError> {
        self.put_with(item, true, None)
    }

    /// Appends an item with explicit blocking behaviour.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Full`] if a native bounded queue has no room
    /// and `block` is false or `timeout` elapses.
    pub fn put_with(&self, item: T, block: bool, timeout: Option<Duration>) -> Result<(), QueueError> {
        let mut items = self.lock_items();
        if let Some(signals) = &self.signals
            && self.maxsize > 0
        {
            let full = |items: &mut VecDeque<T>| items.len() >= self.maxsize;
            if items.len() >= self.maxsize {
                if !block {
                    return Err(self.full_error());
                }
                items = match timeout {
                    None => signals
                        .not_full
                        .wait_while(items, full)
                        .unwrap_or_else(PoisonError::into_inner),
                    Some(timeout) => {
                        signals
                            .not_full
                            .wait_timeout_while(items, timeout, full)
                            .unwrap_or_else(PoisonError::into_inner)
                            .0
                    }
                };
                if items.len() >= self.maxsize {
                    return Err(self.full_error());
                }
            }
        }

        items.push_back(item);
        if let Some(signals) = &self.signals {
            signals.not_empty.notify_one();
        }
        Ok(())
    }

    /// Removes the oldest item, waiting on an empty native queue.
    ///
    /// # Errors
    ///
    /// Never fails when blocking without a timeout.
    pub fn get(&self) -> Result<Option<T>, QueueError> {
        self.get_with(true, None)
    }

    /// Removes the oldest item without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Empty`] on an empty native queue.
    pub fn get_nowait(&self) -> Result<Option<T>, QueueError> {
        self.get_with(false, None)
    }

    /// Removes the oldest item with explicit blocking behaviour.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Empty`] if a native queue stays empty and
    /// `block` is false or `timeout` elapses. The emulated queue returns
    /// `Ok(None)` instead.
    pub fn get_with(&self, block: bool, timeout: Option<Duration>) -> Result<Option<T>, QueueError> {
        let mut items = self.lock_items();
        let Some(signals) = &self.signals else {
            return Ok(items.pop_front());
        };

        if items.is_empty() {
            if !block {
                return Err(QueueError::Empty);
            }
            let empty = |items: &mut VecDeque<T>| items.is_empty();
            items = match timeout {
                None => signals
                    .not_empty
                    .wait_while(items, empty)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(timeout) => {
                    signals
                        .not_empty
                        .wait_timeout_while(items, timeout, empty)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }

        let item = items.pop_front().ok_or(QueueError::Empty)?;
        signals.not_full.notify_one();
        Ok(Some(item))
    }

    fn lock_items(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn full_error(&self) -> QueueError {
        QueueError::Full {
            maxsize: self.maxsize,
        }
    }
}
