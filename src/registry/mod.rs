//! Capability registry.
//!
//! [`RegistryBuilder`] starts from a [`CapabilityProbe`] and records one
//! substitution per missing category. [`RegistryBuilder::build`] freezes the
//! result into a [`CapabilityRegistry`]; from then on every primitive is
//! created through the registry and inherits the backing of its category,
//! so a category is never observed partly native and partly emulated.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::probe::{CapabilityProbe, Category, HostPrimitives, LibcHost};
use crate::process::{self, BoxError, CommandError, CommandOutcome, Pool, Process};
use crate::shm::{ShareableList, SharedMemory, SharedMemoryError};
use crate::sync::{BoundedSemaphore, Event, Lock, NamedSemaphores, Queue, RLock, Semaphore};
use crate::tracker::ResourceTracker;

/// Which implementation serves a category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Backing {
    Native,
    Emulated,
}

impl fmt::Display for Backing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Native => write!(f, "native"),
            Self::Emulated => write!(f, "emulated"),
        }
    }
}

/// Symbols served by each category.
#[must_use]
pub fn symbols(category: Category) -> &'static [&'static str] {
    match category {
        Category::PosixSemaphore => &[
            "Lock",
            "RLock",
            "Semaphore",
            "BoundedSemaphore",
            "Event",
            "Queue",
            "sem_open",
            "sem_close",
            "sem_unlink",
        ],
        Category::ProcessFork => &["Process", "Pool", "cpu_count", "run_command"],
        Category::SharedMemory => &["SharedMemory", "ShareableList", "shm_open", "shm_unlink"],
    }
}

/// Symbols replaced when the resource tracker is neutralized.
pub const TRACKER_SYMBOLS: &[&str] = &["register", "unregister", "ensure_running", "main"];

/// One replaced symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatchRecord {
    /// Category the symbol belongs to; `None` for the resource tracker.
    pub category: Option<Category>,
    pub symbol: &'static str,
    /// Backing now serving the symbol.
    pub backing: Backing,
}

/// Mutable phase of registry construction.
#[derive(Debug)]
pub struct RegistryBuilder {
    probe: CapabilityProbe,
    host: Arc<dyn HostPrimitives>,
    substituted: BTreeSet<Category>,
    tracker_neutralized: bool,
    patches: Vec<PatchRecord>,
}

impl RegistryBuilder {
    /// Starts from `probe` with the C library as host.
    #[must_use]
    pub fn new(probe: CapabilityProbe) -> Self {
        Self::with_host(probe, Arc::new(LibcHost))
    }

    #[must_use]
    pub fn with_host(probe: CapabilityProbe, host: Arc<dyn HostPrimitives>) -> Self {
        Self {
            probe,
            host,
            substituted: BTreeSet::new(),
            tracker_neutralized: false,
            patches: Vec::new(),
        }
    }

    /// Installs the emulation for every symbol of `category`.
    ///
    /// Returns `false`, recording nothing, if the category was already
    /// substituted.
    pub fn substitute(&mut self, category: Category) -> bool {
        if !self.substituted.insert(category) {
            return false;
        }
        for &symbol in symbols(category) {
            self.patches.push(PatchRecord {
                category: Some(category),
                symbol,
                backing: Backing::Emulated,
            });
        }
        warn!(
            %category,
            symbols = symbols(category).len(),
            "native primitives unavailable, substituting emulation"
        );
        true
    }

    /// Substitutes every category the probe found missing. Returns how many
    /// were newly substituted.
    pub fn substitute_missing(&mut self) -> usize {
        let missing: Vec<Category> = self.probe.missing().collect();
        missing
            .into_iter()
            .filter(|category| self.substitute(*category))
            .count()
    }

    /// Replaces the resource tracker with the no-op one. Idempotent.
    pub fn neutralize_tracker(&mut self) -> bool {
        if self.tracker_neutralized {
            return false;
        }
        self.tracker_neutralized = true;
        for &symbol in TRACKER_SYMBOLS {
            self.patches.push(PatchRecord {
                category: None,
                symbol,
                backing: Backing::Emulated,
            });
        }
        warn!("resource tracker neutralized");
        true
    }

    #[must_use]
    pub fn is_substituted(&self, category: Category) -> bool {
        self.substituted.contains(&category)
    }

    /// Freezes the registry.
    #[must_use]
    pub fn build(self) -> Arc<CapabilityRegistry> {
        let tracker = if self.tracker_neutralized {
            ResourceTracker::neutralized()
        } else {
            ResourceTracker::native(Arc::clone(&self.host))
        };
        let backing_of = |category| {
            if self.substituted.contains(&category) {
                Backing::Emulated
            } else {
                Backing::Native
            }
        };
        let registry = CapabilityRegistry {
            probe: self.probe,
            semaphore: backing_of(Category::PosixSemaphore),
            fork: backing_of(Category::ProcessFork),
            shared_memory: backing_of(Category::SharedMemory),
            tracker: Arc::new(tracker),
            host: self.host,
            patches: self.patches,
        };
        info!(
            posix_semaphore = %registry.semaphore,
            process_fork = %registry.fork,
            shared_memory = %registry.shared_memory,
            "capability registry ready"
        );
        Arc::new(registry)
    }
}

/// Frozen set of primitive providers.
///
/// A category the probe reported missing but that was never substituted
/// stays native; callers get whatever the host does.
pub struct CapabilityRegistry {
    probe: CapabilityProbe,
    semaphore: Backing,
    fork: Backing,
    shared_memory: Backing,
    tracker: Arc<ResourceTracker>,
    host: Arc<dyn HostPrimitives>,
    patches: Vec<PatchRecord>,
}

impl fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("probe", &self.probe)
            .field("posix_semaphore", &self.semaphore)
            .field("process_fork", &self.fork)
            .field("shared_memory", &self.shared_memory)
            .field("tracker", &self.tracker)
            .finish_non_exhaustive()
    }
}

impl CapabilityRegistry {
    #[must_use]
    pub fn probe(&self) -> &CapabilityProbe {
        &self.probe
    }

    #[must_use]
    pub fn backing(&self, category: Category) -> Backing {
        match category {
            Category::PosixSemaphore => self.semaphore,
            Category::ProcessFork => self.fork,
            Category::SharedMemory => self.shared_memory,
        }
    }

    #[must_use]
    pub fn patches(&self) -> &[PatchRecord] {
        &self.patches
    }

    #[must_use]
    pub fn tracker(&self) -> &Arc<ResourceTracker> {
        &self.tracker
    }

    // posix_semaphore

    #[must_use]
    pub fn lock(&self) -> Lock {
        Lock::new(self.semaphore)
    }

    #[must_use]
    pub fn rlock(&self) -> RLock {
        RLock::new(self.semaphore)
    }

    #[must_use]
    pub fn semaphore(&self, value: usize) -> Semaphore {
        Semaphore::new(self.semaphore, value)
    }

    #[must_use]
    pub fn bounded_semaphore(&self, value: usize) -> BoundedSemaphore {
        BoundedSemaphore::new(self.semaphore, value)
    }

    #[must_use]
    pub fn event(&self) -> Event {
        Event::new(self.semaphore)
    }

    /// A queue holding at most `maxsize` items; 0 means unbounded.
    #[must_use]
    pub fn queue<T>(&self, maxsize: usize) -> Queue<T> {
        Queue::new(self.semaphore, maxsize)
    }

    /// `sem_open`/`sem_close`/`sem_unlink`.
    #[must_use]
    pub fn named_semaphores(&self) -> NamedSemaphores {
        NamedSemaphores::new(
            self.semaphore,
            Arc::clone(&self.host),
            Arc::clone(&self.tracker),
        )
    }

    // process_fork

    /// A process that will run `target` when started.
    #[must_use]
    pub fn process<F>(&self, target: F) -> Process
    where
        F: FnOnce() -> Result<(), BoxError> + Send + 'static,
    {
        Process::new(self.fork, target)
    }

    /// A pool with `processes` workers, defaulting to [`cpu_count`](Self::cpu_count).
    #[must_use]
    pub fn pool(&self, processes: Option<usize>) -> Pool {
        Pool::new(self.fork, processes.unwrap_or_else(|| self.cpu_count()))
    }

    #[must_use]
    pub fn cpu_count(&self) -> usize {
        process::cpu_count(self.fork)
    }

    /// Runs an external command.
    ///
    /// # Errors
    ///
    /// Native backing only: see [`process::run_command`].
    pub fn run_command(&self, program: &str, args: &[&str]) -> Result<CommandOutcome, CommandError> {
        process::run_command(self.fork, program, args)
    }

    // shared_memory

    /// Creates (`create == true`) or attaches to a shared-memory segment.
    ///
    /// # Errors
    ///
    /// Native backing only: see [`SharedMemoryError`].
    pub fn shared_memory(
        &self,
        name: Option<&str>,
        create: bool,
        size: usize,
    ) -> Result<SharedMemory, SharedMemoryError> {
        match self.shared_memory {
            Backing::Emulated => Ok(SharedMemory::emulated(name, size)),
            Backing::Native => SharedMemory::native(
                Arc::clone(&self.host),
                Arc::clone(&self.tracker),
                name,
                create,
                size,
            ),
        }
    }

    #[must_use]
    pub fn shareable_list<T>(&self, items: impl IntoIterator<Item = T>) -> ShareableList<T> {
        ShareableList::new(items)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::sync::Acquire;

    fn probe_missing(category: Category) -> CapabilityProbe {
        let mut flags = [true; 3];
        flags[Category::ALL.iter().position(|c| *c == category).unwrap()] = false;
        CapabilityProbe::from_flags(flags[0], flags[1], flags[2])
    }

    #[test]
    fn test_substitute_records_every_symbol_once() {
        let mut builder = RegistryBuilder::new(CapabilityProbe::from_flags(true, true, true));
        assert!(builder.substitute(Category::PosixSemaphore));
        assert!(!builder.substitute(Category::PosixSemaphore));
        let registry = builder.build();

        let symbols: Vec<_> = registry.patches().iter().map(|p| p.symbol).collect();
        assert_eq!(symbols, super::symbols(Category::PosixSemaphore));
        assert!(
            registry
                .patches()
                .iter()
                .all(|p| p.category == Some(Category::PosixSemaphore) && p.backing == Backing::Emulated)
        );
    }

    #[test]
    fn test_substitute_missing_only_touches_failed_probes() {
        let mut builder = RegistryBuilder::new(probe_missing(Category::ProcessFork));
        assert_eq!(builder.substitute_missing(), 1);
        assert_eq!(builder.substitute_missing(), 0);
        assert!(builder.is_substituted(Category::ProcessFork));
        assert!(!builder.is_substituted(Category::SharedMemory));

        let registry = builder.build();
        assert_eq!(registry.backing(Category::ProcessFork), Backing::Emulated);
        assert_eq!(registry.backing(Category::PosixSemaphore), Backing::Native);
        assert_eq!(registry.cpu_count(), 1);
        assert_eq!(registry.pool(None).processes(), 1);
    }

    #[test]
    fn test_primitives_inherit_category_backing() {
        let mut builder = RegistryBuilder::new(probe_missing(Category::PosixSemaphore));
        builder.substitute_missing();
        let registry = builder.build();

        assert_eq!(registry.lock().backing(), Backing::Emulated);
        assert_eq!(registry.rlock().backing(), Backing::Emulated);
        assert_eq!(registry.semaphore(1).backing(), Backing::Emulated);
        assert_eq!(registry.bounded_semaphore(1).backing(), Backing::Emulated);
        assert_eq!(registry.event().backing(), Backing::Emulated);
        assert_eq!(registry.queue::<u8>(0).backing(), Backing::Emulated);
        assert_eq!(registry.named_semaphores().backing(), Backing::Emulated);
        assert_eq!(registry.process(|| Ok(())).backing(), Backing::Native);
    }

    #[test]
    fn test_emulated_lock_sequence_never_fails() {
        let mut builder = RegistryBuilder::new(probe_missing(Category::PosixSemaphore));
        builder.substitute_missing();
        let registry = builder.build();
        let lock = registry.lock();
        let sem = registry.bounded_semaphore(1);
        for _ in 0..3 {
            lock.release().unwrap();
            sem.release().unwrap();
            assert!(lock.acquire(false, None));
            assert!(sem.acquire(false, None));
        }
    }

    #[test]
    fn test_neutralize_tracker_is_idempotent() {
        let mut builder = RegistryBuilder::new(CapabilityProbe::from_flags(true, true, true));
        assert!(builder.neutralize_tracker());
        assert!(!builder.neutralize_tracker());
        let registry = builder.build();
        assert!(registry.tracker().is_neutralized());
        assert_eq!(registry.patches().len(), TRACKER_SYMBOLS.len());
        assert!(registry.patches().iter().all(|p| p.category.is_none()));
    }

    #[test]
    fn test_emulated_shared_memory_through_registry() {
        let mut builder = RegistryBuilder::new(probe_missing(Category::SharedMemory));
        builder.substitute_missing();
        let registry = builder.build();
        let shm = registry.shared_memory(None, true, 8).unwrap();
        assert_eq!(shm.backing(), Backing::Emulated);
        assert_eq!(shm.buf().len(), 8);
        let list = registry.shareable_list([1, 2, 3]);
        assert_eq!(list.len(), 3);
    }
}
