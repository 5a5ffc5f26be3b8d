//! Named shared memory and shareable lists.
//!
//! Native segments are POSIX shared memory objects mapped into this
//! process. Emulated segments are private heap buffers: the name is kept
//! for callers that log or pass it around, but no other process can attach
//! to it.

use std::fmt;
use std::ops::{Index, IndexMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use thiserror::Error;
use tracing::{debug, warn};

use crate::probe::{HostPrimitives, MappedRegion, OpenFlags, ShmHandle};
use crate::registry::Backing;
use crate::tracker::{ResourceKind, ResourceTracker};

static SEGMENT_COUNTER: AtomicUsize = AtomicUsize::new(0);

const SEGMENT_MODE: u32 = 0o600;

/// Errors raised by native shared memory.
#[derive(Debug, Error)]
pub enum SharedMemoryError {
    /// A host call failed.
    #[error("{op} failed for shared memory {name}: {source}")]
    Os {
        /// The failing call.
        op: &'static str,
        /// Segment name.
        name: String,
        /// The OS error.
        #[source]
        source: std::io::Error,
    },

    /// `create` was requested with a zero size.
    #[error("shared memory {name} must be created with a positive size")]
    ZeroSize {
        /// Segment name.
        name: String,
    },

    /// Attaching requires a name.
    #[error("a name is required to attach to existing shared memory")]
    NameRequired,
}

impl SharedMemoryError {
    fn os<'a>(op: &'static str, name: &'a str) -> impl FnOnce(std::io::Error) -> Self + 'a {
        move |source| Self::Os {
            op,
            name: name.to_string(),
            source,
        }
    }
}

fn generated_name() -> String {
    let n = SEGMENT_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("psm_{:x}_{n}", std::process::id())
}

fn map_segment(
    host: &dyn HostPrimitives,
    handle: &ShmHandle,
    name: &str,
    create: bool,
    size: usize,
) -> Result<(usize, MappedRegion), SharedMemoryError> {
    let size = if create {
        host.shm_resize(handle, size)
            .map_err(SharedMemoryError::os("ftruncate", name))?;
        size
    } else {
        host.shm_len(handle)
            .map_err(SharedMemoryError::os("fstat", name))?
    };
    let region = host
        .shm_map(handle, size)
        .map_err(SharedMemoryError::os("mmap", name))?;
    Ok((size, region))
}

/// Handle to a named shared-memory segment.
pub struct SharedMemory {
    name: String,
    size: usize,
    inner: Segment,
}

enum Segment {
    Native {
        host: Arc<dyn HostPrimitives>,
        tracker: Arc<ResourceTracker>,
        handle: Option<ShmHandle>,
        region: Option<MappedRegion>,
        owner: bool,
    },
    Emulated(Vec<u8>),
}

impl fmt::Debug for SharedMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedMemory")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("backing", &self.backing())
            .finish()
    }
}

impl SharedMemory {
    pub(crate) fn emulated(name: Option<&str>, size: usize) -> Self {
        let name = name.map_or_else(generated_name, ToString::to_string);
        debug!(name = %name, size, "emulated shared memory allocated");
        Self {
            name,
            size,
            inner: Segment::Emulated(vec![0; size]),
        }
    }

    pub(crate) fn native(
        host: Arc<dyn HostPrimitives>,
        tracker: Arc<ResourceTracker>,
        name: Option<&str>,
        create: bool,
        size: usize,
    ) -> Result<Self, SharedMemoryError> {
        let name = match (name, create) {
            (Some(name), _) => name.to_string(),
            (None, true) => format!("/{}", generated_name()),
            (None, false) => return Err(SharedMemoryError::NameRequired),
        };
        if create && size == 0 {
            return Err(SharedMemoryError::ZeroSize { name });
        }

        let flags = if create {
            OpenFlags::CREATE_EXCLUSIVE
        } else {
            OpenFlags::EXISTING
        };
        let handle = host
            .shm_open(&name, flags, SEGMENT_MODE)
            .map_err(SharedMemoryError::os("shm_open", &name))?;

        let mapped = map_segment(host.as_ref(), &handle, &name, create, size);

        let (size, region) = match mapped {
            Ok(mapped) => mapped,
            Err(error) => {
                let _ = host.shm_close(handle);
                if create {
                    let _ = host.shm_unlink(&name);
                }
                return Err(error);
            }
        };

        if create {
            tracker.register(&name, ResourceKind::SharedMemory);
        }
        Ok(Self {
            name,
            size,
            inner: Segment::Native {
                host,
                tracker,
                handle: Some(handle),
                region: Some(region),
                owner: create,
            },
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn backing(&self) -> Backing {
        match self.inner {
            Segment::Native { .. } => Backing::Native,
            Segment::Emulated(_) => Backing::Emulated,
        }
    }

    /// Whether this handle created the segment.
    #[must_use]
    pub fn is_owner(&self) -> bool {
        match self.inner {
            Segment::Native { owner, .. } => owner,
            Segment::Emulated(_) => true,
        }
    }

    /// The segment's bytes. Empty after a native `close`.
    #[must_use]
    pub fn buf(&self) -> &[u8] {
        match &self.inner {
            Segment::Native {
                region: Some(region),
                ..
            } => region.as_slice(),
            Segment::Native { region: None, .. } => &[],
            Segment::Emulated(bytes) => bytes,
        }
    }

    pub fn buf_mut(&mut self) -> &mut [u8] {
        match &mut self.inner {
            Segment::Native {
                region: Some(region),
                ..
            } => region.as_mut_slice(),
            Segment::Native { region: None, .. } => &mut [],
            Segment::Emulated(bytes) => bytes,
        }
    }

    /// Unmaps and closes this handle. The emulated buffer stays readable.
    ///
    /// # Errors
    ///
    /// Native backing only: the host's `close` failed.
    pub fn close(&mut self) -> Result<(), SharedMemoryError> {
        let Segment::Native {
            host,
            handle,
            region,
            ..
        } = &mut self.inner
        else {
            return Ok(());
        };
        region.take();
        match handle.take() {
            Some(handle) => host
                .shm_close(handle)
                .map_err(SharedMemoryError::os("close", &self.name)),
            None => Ok(()),
        }
    }

    /// Removes the name.
    ///
    /// # Errors
    ///
    /// Native backing only: the host's `shm_unlink` failed.
    pub fn unlink(&self) -> Result<(), SharedMemoryError> {
        let Segment::Native { host, tracker, .. } = &self.inner else {
            return Ok(());
        };
        host.shm_unlink(&self.name)
            .map_err(SharedMemoryError::os("shm_unlink", &self.name))?;
        tracker.unregister(&self.name, ResourceKind::SharedMemory);
        Ok(())
    }
}

impl Drop for SharedMemory {
    fn drop(&mut self) {
        if let Err(error) = self.close() {
            warn!(name = %self.name, error = %error, "closing shared memory on drop failed");
        }
    }
}

/// Fixed-length list backed by private memory in both backings.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ShareableList<T> {
    name: String,
    items: Vec<T>,
}

impl<T> ShareableList<T> {
    pub(crate) fn new(items: impl IntoIterator<Item = T>) -> Self {
        Self {
            name: generated_name(),
            items: items.into_iter().collect(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&T> {
        self.items.get(index)
    }

    /// Replaces the item at `index`; returns the previous value, or gives
    /// `value` back when `index` is out of range.
    ///
    /// # Errors
    ///
    /// Returns `Err(value)` when `index` is out of range.
    pub fn set(&mut self, index: usize, value: T) -> Result<T, T> {
        match self.items.get_mut(index) {
            Some(slot) => Ok(std::mem::replace(slot, value)),
            None => Err(value),
        }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }
}

impl<T> Index<usize> for ShareableList<T> {
    type Output = T;

    fn index(&self, index: usize) -> &T {
        &self.items[index]
    }
}

impl<T> IndexMut<usize> for ShareableList<T> {
    fn index_mut(&mut self, index: usize) -> &mut T {
        &mut self.items[index]
    }
}

impl<'a, T> IntoIterator for &'a ShareableList<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}
