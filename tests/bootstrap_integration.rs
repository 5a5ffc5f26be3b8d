//! Integration tests for start-up on a host that lacks native primitives.

mod support;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use downloader_compat::probe::{self, CapabilityProbe, OpenFlags};
use downloader_compat::process::TargetError;
use downloader_compat::tracker::ResourceKind;
use downloader_compat::{Acquire, Backing, Bootstrap, Category, RegistryBuilder};

use support::fake_host::FakeHost;
use support::{broken_host_context, emulated_context, test_config};

#[test]
fn test_broken_sem_open_is_reported_unavailable() {
    let host = FakeHost::broken();
    assert!(!probe::probe_with(&host, Category::PosixSemaphore));
    assert_eq!(host.calls(), vec!["sem_open"]);
}

#[test]
fn test_named_semaphore_sequence_after_substitution() {
    let (context, host) = broken_host_context();
    let registry = context.registry();
    assert!(!registry.probe().is_available(Category::PosixSemaphore));
    assert_eq!(registry.backing(Category::PosixSemaphore), Backing::Emulated);

    host.clear_calls();
    let semaphores = registry.named_semaphores();
    let sem = semaphores
        .sem_open("/x", OpenFlags::CREATE, 0o600, 1)
        .expect("emulated sem_open");
    assert!(sem.acquire(true, None));
    sem.release().expect("emulated release");
    semaphores.sem_close(sem).expect("emulated sem_close");
    semaphores.sem_unlink("/x").expect("emulated sem_unlink");

    assert!(host.calls().is_empty(), "emulation must not reach the host");
}

#[test]
fn test_every_category_emulated_on_broken_host() {
    let (context, _host) = broken_host_context();
    let report = context.report();
    for row in &report.categories {
        assert!(!row.available, "{} should be unavailable", row.category);
        assert_eq!(row.backing, Backing::Emulated);
    }
    assert!(report.tracker_neutralized);
    assert_eq!(report.cpu_count, 1);
}

#[test]
fn test_substitution_is_idempotent() {
    let probe = CapabilityProbe::from_flags(true, false, true);
    let mut builder = RegistryBuilder::with_host(probe, Arc::new(FakeHost::broken()));
    assert_eq!(builder.substitute_missing(), 1);
    let recorded = builder.build().patches().len();

    let mut builder = RegistryBuilder::with_host(probe, Arc::new(FakeHost::broken()));
    assert_eq!(builder.substitute_missing(), 1);
    assert!(!builder.substitute(Category::PosixSemaphore));
    assert_eq!(builder.substitute_missing(), 0);
    assert_eq!(builder.build().patches().len(), recorded);
}

#[test]
fn test_emulated_locks_never_block_or_fail() {
    let context = emulated_context();
    let registry = context.registry();

    let lock = registry.lock();
    for _ in 0..3 {
        assert!(lock.acquire(true, Some(Duration::from_secs(60))));
    }
    for _ in 0..5 {
        lock.release().expect("emulated release never fails");
    }

    let bounded = registry.bounded_semaphore(1);
    bounded.release().expect("release before acquire");
    assert!(bounded.acquire(false, None));
    assert!(bounded.acquire(false, None));
}

#[test]
fn test_emulated_event_wait_returns_immediately() {
    let context = emulated_context();
    let event = context.registry().event();
    assert!(!event.wait(None));
    event.set();
    assert!(event.wait(None));
}

#[test]
fn test_emulated_queue_is_fifo() {
    let context = emulated_context();
    let queue = context.registry().queue(1);
    queue.put("a").unwrap();
    queue.put("b").unwrap();
    assert_eq!(queue.get().unwrap(), Some("a"));
    assert_eq!(queue.get().unwrap(), Some("b"));
    assert_eq!(queue.get().unwrap(), None);
}

#[test]
fn test_emulated_process_captures_target_fault() {
    let context = emulated_context();
    let ran = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&ran);
    let mut process = context.registry().process(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Err("disk full".into())
    });

    process.start().expect("start never propagates target faults");
    assert_eq!(ran.load(Ordering::SeqCst), 1, "target runs before start returns");
    assert!(!process.is_alive());
    assert_eq!(process.exitcode(), Some(1));
    assert_eq!(
        process.failure(),
        Some(&TargetError::Failed {
            message: "disk full".to_string()
        })
    );
}

#[test]
fn test_emulated_process_captures_panic() {
    let context = emulated_context();
    let mut process = context.registry().process(|| panic!("boom"));
    process.start().unwrap();
    assert!(!process.is_alive());
    assert!(matches!(process.failure(), Some(TargetError::Panicked { .. })));
}

#[test]
fn test_emulated_pool_map_preserves_order() {
    let context = emulated_context();
    let pool = context.registry().pool(None);
    assert_eq!(pool.processes(), 1);
    assert_eq!(pool.map(|n: i32| n * 10, [1, 2, 3]), vec![10, 20, 30]);

    let seen = Arc::new(AtomicUsize::new(0));
    let observed = Arc::clone(&seen);
    let result = pool.apply_async_with(|| 42_usize, move |value| {
        observed.store(*value, Ordering::SeqCst);
    });
    assert_eq!(seen.load(Ordering::SeqCst), 42, "callback runs before return");
    assert!(result.ready());
    assert_eq!(result.get().unwrap(), 42);
}

#[test]
fn test_emulated_shared_memory_is_private() {
    let context = emulated_context();
    let registry = context.registry();
    let mut first = registry.shared_memory(None, true, 8).unwrap();
    let second = registry.shared_memory(None, true, 8).unwrap();
    assert_ne!(first.name(), second.name());

    first.buf_mut()[0] = 9;
    assert_eq!(first.buf()[0], 9);
    assert_eq!(second.buf()[0], 0);
    first.close().unwrap();
    first.unlink().unwrap();
}

#[test]
fn test_neutralized_tracker_ignores_registrations() {
    let context = emulated_context();
    let tracker = context.registry().tracker();
    assert!(tracker.is_neutralized());
    tracker.ensure_running();
    tracker.register("/leak", ResourceKind::Semaphore);
    assert!(!tracker.is_running());
    assert!(tracker.shutdown().is_empty());
}

#[test]
fn test_emulated_command_runner_spawns_nothing() {
    let context = emulated_context();
    let outcome = context
        .registry()
        .run_command("definitely-not-a-real-program", &["--flag"])
        .unwrap();
    assert!(outcome.success());
    assert!(outcome.stdout.is_empty());
}

#[test]
fn test_forced_category_skips_the_host() {
    let host = Arc::new(FakeHost::broken());
    let config = downloader_compat::CompatConfig {
        force_emulate: Category::ALL.to_vec(),
        ..test_config()
    };
    let context = Bootstrap::new(config)
        .with_host(host.clone())
        .run()
        .unwrap();
    assert!(host.calls().is_empty());
    assert_eq!(context.registry().cpu_count(), 1);
}
