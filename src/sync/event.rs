use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

use crate::registry::Backing;

/// Boolean flag threads can wait on.
#[derive(Debug)]
pub struct Event {
    inner: EventInner,
}

#[derive(Debug)]
enum EventInner {
    Native { flag: Mutex<bool>, changed: Condvar },
    Emulated(AtomicBool),
}

impl Event {
    pub(crate) fn new(backing: Backing) -> Self {
        let inner = match backing {
            Backing::Native => EventInner::Native {
                flag: Mutex::new(false),
                changed: Condvar::new(),
            },
            Backing::Emulated => EventInner::Emulated(AtomicBool::new(false)),
        };
        Self { inner }
    }

    /// Which implementation backs this event.
    #[must_use]
    pub fn backing(&self) -> Backing {
        match self.inner {
            EventInner::Native { .. } => Backing::Native,
            EventInner::Emulated(_) => Backing::Emulated,
        }
    }

    pub fn set(&self) {
        match &self.inner {
            EventInner::Native { flag, changed } => {
                *flag.lock().unwrap_or_else(PoisonError::into_inner) = true;
                changed.notify_all();
            }
            EventInner::Emulated(flag) => flag.store(true, Ordering::SeqCst),
        }
    }

    pub fn clear(&self) {
        match &self.inner {
            EventInner::Native { flag, .. } => {
                *flag.lock().unwrap_or_else(PoisonError::into_inner) = false;
            }
            EventInner::Emulated(flag) => flag.store(false, Ordering::SeqCst),
        }
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        match &self.inner {
            EventInner::Native { flag, .. } => *flag.lock().unwrap_or_else(PoisonError::into_inner),
            EventInner::Emulated(flag) => flag.load(Ordering::SeqCst),
        }
    }

    /// Waits until the flag is set, or until `timeout` elapses.
    ///
    /// Returns the flag's state on return. The emulated event does not wait.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        match &self.inner {
            EventInner::Native { flag, changed } => {
                let guard = flag.lock().unwrap_or_else(PoisonError::into_inner);
                let guard = match timeout {
                    None => changed
                        .wait_while(guard, |set| !*set)
                        .unwrap_or_else(PoisonError::into_inner),
                    Some(timeout) => {
                        changed
                            .wait_timeout_while(guard, timeout, |set| !*set)
                            .unwrap_or_else(PoisonError::into_inner)
                            .0
                    }
                };
                *guard
            }
            EventInner::Emulated(flag) => flag.load(Ordering::SeqCst),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn test_native_event_wakes_waiter() {
        let event = Arc::new(Event::new(Backing::Native));
        let waiter = {
            let event = Arc::clone(&event);
            thread::spawn(move || event.wait(None))
        };
        thread::sleep(Duration::from_millis(10));
        event.set();
        assert!(waiter.join().unwrap());
        assert!(event.is_set());
    }

    #[test]
    fn test_native_event_wait_times_out_unset() {
        let event = Event::new(Backing::Native);
        assert!(!event.wait(Some(Duration::from_millis(10))));
    }

    #[test]
    fn test_emulated_event_wait_returns_immediately() {
        let event = Event::new(Backing::Emulated);
        assert!(!event.wait(None));
        event.set();
        assert!(event.wait(None));
        event.clear();
        assert!(!event.is_set());
    }
}
