//! Shared-resource tracker.
//!
//! The native tracker runs a helper thread that remembers every named
//! semaphore and shared-memory segment created through the registry and
//! unlinks whatever is still registered when it shuts down. On a host
//! missing any of the cross-process primitives the tracker is neutralized:
//! `register`, `unregister`, `ensure_running` and the helper loop are
//! no-ops and no helper is ever started.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use serde::Serialize;
use tracing::{debug, warn};

use crate::probe::HostPrimitives;

/// Kind of OS resource a tracker entry refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Semaphore,
    SharedMemory,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Semaphore => write!(f, "semaphore"),
            Self::SharedMemory => write!(f, "shared_memory"),
        }
    }
}

enum Message {
    Register(ResourceKind, String),
    Unregister(ResourceKind, String),
    Shutdown,
}

struct Helper {
    sender: Sender<Message>,
    handle: JoinHandle<Vec<(ResourceKind, String)>>,
}

enum TrackerInner {
    Neutralized,
    Native {
        host: Arc<dyn HostPrimitives>,
        helper: Mutex<Option<Helper>>,
    },
}

/// Process-wide resource tracker handed out by the registry.
pub struct ResourceTracker {
    inner: TrackerInner,
}

impl fmt::Debug for ResourceTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceTracker")
            .field("neutralized", &self.is_neutralized())
            .field("running", &self.is_running())
            .finish()
    }
}

impl ResourceTracker {
    pub(crate) fn native(host: Arc<dyn HostPrimitives>) -> Self {
        Self {
            inner: TrackerInner::Native {
                host,
                helper: Mutex::new(None),
            },
        }
    }

    pub(crate) fn neutralized() -> Self {
        Self {
            inner: TrackerInner::Neutralized,
        }
    }

    #[must_use]
    pub fn is_neutralized(&self) -> bool {
        matches!(self.inner, TrackerInner::Neutralized)
    }

    /// Whether the helper thread has been started and not yet shut down.
    #[must_use]
    pub fn is_running(&self) -> bool {
        match &self.inner {
            TrackerInner::Neutralized => false,
            TrackerInner::Native { helper, .. } => helper
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .is_some(),
        }
    }

    /// Starts the helper if it is not running yet.
    pub fn ensure_running(&self) {
        let TrackerInner::Native { host, helper } = &self.inner else {
            return;
        };
        let mut helper = helper.lock().unwrap_or_else(PoisonError::into_inner);
        if helper.is_some() {
            return;
        }

        let (sender, receiver) = mpsc::channel();
        let host = Arc::clone(host);
        let spawned = thread::Builder::new()
            .name("resource-tracker".to_string())
            .spawn(move || tracker_main(&*host, &receiver));
        match spawned {
            Ok(handle) => *helper = Some(Helper { sender, handle }),
            Err(error) => warn!(error = %error, "could not start resource tracker"),
        }
    }

    pub fn register(&self, name: &str, kind: ResourceKind) {
        self.send(|| Message::Register(kind, name.to_string()));
    }

    pub fn unregister(&self, name: &str, kind: ResourceKind) {
        self.send(|| Message::Unregister(kind, name.to_string()));
    }

    /// Stops the helper and returns the resources it had to clean up.
    pub fn shutdown(&self) -> Vec<(ResourceKind, String)> {
        let TrackerInner::Native { helper, .. } = &self.inner else {
            return Vec::new();
        };
        let Some(helper) = helper.lock().unwrap_or_else(PoisonError::into_inner).take() else {
            return Vec::new();
        };
        let _ = helper.sender.send(Message::Shutdown);
        helper.handle.join().unwrap_or_else(|_| {
            warn!("resource tracker thread panicked");
            Vec::new()
        })
    }

    fn send(&self, message: impl FnOnce() -> Message) {
        if self.is_neutralized() {
            return;
        }
        self.ensure_running();
        let TrackerInner::Native { helper, .. } = &self.inner else {
            return;
        };
        if let Some(helper) = helper.lock().unwrap_or_else(PoisonError::into_inner).as_ref()
            && helper.sender.send(message()).is_err()
        {
            debug!("resource tracker already stopped");
        }
    }
}

impl Drop for ResourceTracker {
    fn drop(&mut self) {
        let leaked = self.shutdown();
        if !leaked.is_empty() {
            debug!(count = leaked.len(), "resource tracker cleaned up leaked resources");
        }
    }
}

/// Helper loop. Ends on `Shutdown` or when every sender is gone, then
/// unlinks whatever is still registered.
fn tracker_main(host: &dyn HostPrimitives, receiver: &Receiver<Message>) -> Vec<(ResourceKind, String)> {
    let mut live = BTreeSet::new();
    while let Ok(message) = receiver.recv() {
        match message {
            Message::Register(kind, name) => {
                live.insert((kind, name));
            }
            Message::Unregister(kind, name) => {
                live.remove(&(kind, name));
            }
            Message::Shutdown => break,
        }
    }

    let leaked: Vec<_> = live.into_iter().collect();
    for (kind, name) in &leaked {
        warn!(%kind, name = %name, "resource leaked at shutdown, unlinking");
        let result = match kind {
            ResourceKind::Semaphore => host.sem_unlink(name),
            ResourceKind::SharedMemory => host.shm_unlink(name),
        };
        if let Err(error) = result {
            debug!(%kind, name = %name, error = %error, "cleanup unlink failed");
        }
    }
    leaked
}
