//! Self-test that exercises every primitive through an initialized context.
//!
//! Each check uses the contract of the backing it runs on, so the same list
//! passes on an unconstrained host and on one where everything is emulated.

use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use crate::bootstrap::CompatContext;
use crate::io::{FaultClass, FileMode};
use crate::probe::{Category, OpenFlags};
use crate::registry::Backing;
use crate::stdin::StdinPolicy;
use crate::sync::Acquire;

/// Result of one primitive check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckOutcome {
    pub primitive: &'static str,
    /// Backing the primitive ran on; `None` for checks outside the registry.
    pub backing: Option<Backing>,
    pub passed: bool,
    /// Failure reason, empty on success.
    pub detail: String,
}

type CheckResult = Result<(), String>;

/// Runs every check in a fixed order.
#[must_use]
pub fn run_checks(context: &CompatContext) -> Vec<CheckOutcome> {
    let registry = context.registry();
    let sem = Some(registry.backing(Category::PosixSemaphore));
    let fork = Some(registry.backing(Category::ProcessFork));
    let shm = Some(registry.backing(Category::SharedMemory));

    let checks: [(&'static str, Option<Backing>, fn(&CompatContext) -> CheckResult); 15] = [
        ("Lock", sem, check_lock),
        ("RLock", sem, check_rlock),
        ("Semaphore", sem, check_semaphore),
        ("BoundedSemaphore", sem, check_bounded_semaphore),
        ("Event", sem, check_event),
        ("Queue", sem, check_queue),
        ("sem_open", sem, check_named_semaphore),
        ("Process", fork, check_process),
        ("Pool", fork, check_pool),
        ("cpu_count", fork, check_cpu_count),
        ("run_command", fork, check_run_command),
        ("SharedMemory", shm, check_shared_memory),
        ("ShareableList", shm, check_shareable_list),
        ("open", None, check_open),
        ("stdin", None, check_stdin),
    ];

    checks
        .into_iter()
        .map(|(primitive, backing, check)| {
            let result = check(context);
            match &result {
                Ok(()) => debug!(primitive, "check passed"),
                Err(detail) => warn!(primitive, detail = %detail, "check failed"),
            }
            CheckOutcome {
                primitive,
                backing,
                passed: result.is_ok(),
                detail: result.err().unwrap_or_default(),
            }
        })
        .collect()
}

fn ensure(condition: bool, message: &str) -> CheckResult {
    if condition {
        Ok(())
    } else {
        Err(message.to_string())
    }
}

fn unique_name(kind: &str) -> String {
    format!(
        "/downloader-compat-check-{kind}-{}-{}",
        std::process::id(),
        rand::random::<u32>()
    )
}

fn check_lock(context: &CompatContext) -> CheckResult {
    let lock = context.registry().lock();
    ensure(lock.acquire(true, None), "acquire failed")?;
    lock.release().map_err(|e| e.to_string())
}

fn check_rlock(context: &CompatContext) -> CheckResult {
    let lock = context.registry().rlock();
    ensure(lock.acquire(true, None), "first acquire failed")?;
    ensure(lock.acquire(true, None), "re-entrant acquire failed")?;
    lock.release().map_err(|e| e.to_string())?;
    lock.release().map_err(|e| e.to_string())
}

fn check_semaphore(context: &CompatContext) -> CheckResult {
    let semaphore = context.registry().semaphore(2);
    ensure(semaphore.acquire(true, None), "first acquire failed")?;
    ensure(
        semaphore.acquire(false, None),
        "second non-blocking acquire failed",
    )?;
    semaphore.release().map_err(|e| e.to_string())?;
    semaphore.release().map_err(|e| e.to_string())
}

fn check_bounded_semaphore(context: &CompatContext) -> CheckResult {
    let semaphore = context.registry().bounded_semaphore(1);
    let _held = semaphore.hold();
    Ok(())
}

fn check_event(context: &CompatContext) -> CheckResult {
    let event = context.registry().event();
    ensure(!event.wait(Some(Duration::ZERO)), "fresh event reported set")?;
    event.set();
    ensure(event.wait(Some(Duration::ZERO)), "set event did not wake")?;
    event.clear();
    ensure(!event.is_set(), "cleared event still set")
}

fn check_queue(context: &CompatContext) -> CheckResult {
    let queue = context.registry().queue(0);
    queue.put("first").map_err(|e| e.to_string())?;
    queue.put("second").map_err(|e| e.to_string())?;
    ensure(queue.qsize() == 2, "qsize mismatch")?;
    let first = queue.get().map_err(|e| e.to_string())?;
    let second = queue.get().map_err(|e| e.to_string())?;
    ensure(
        first == Some("first") && second == Some("second"),
        "items out of order",
    )?;
    ensure(queue.empty(), "queue not drained")
}

fn check_named_semaphore(context: &CompatContext) -> CheckResult {
    let semaphores = context.registry().named_semaphores();
    let name = unique_name("sem");
    let sem = semaphores
        .sem_open(&name, OpenFlags::CREATE_EXCLUSIVE, 0o600, 1)
        .map_err(|e| e.to_string())?;
    let acquired = sem.acquire(false, None);
    let released = if acquired { sem.release() } else { Ok(()) };
    let closed = semaphores.sem_close(sem);
    let unlinked = semaphores.sem_unlink(&name);
    ensure(acquired, "acquire failed")?;
    released.map_err(|e| e.to_string())?;
    closed.map_err(|e| e.to_string())?;
    unlinked.map_err(|e| e.to_string())
}

fn check_process(context: &CompatContext) -> CheckResult {
    let mut ok = context.registry().process(|| Ok(()));
    ok.start().map_err(|e| e.to_string())?;
    ok.join(None);
    ensure(!ok.is_alive(), "joined process still alive")?;
    ensure(ok.exitcode() == Some(0), "successful target did not exit 0")?;

    let mut failing = context
        .registry()
        .process(|| Err("check target failure".into()));
    failing.start().map_err(|e| e.to_string())?;
    failing.join(None);
    ensure(failing.exitcode() == Some(1), "failing target did not exit 1")?;
    ensure(failing.failure().is_some(), "target failure was not recorded")
}

fn check_pool(context: &CompatContext) -> CheckResult {
    let pool = context.registry().pool(None);
    let squares = pool.map(|n: u32| n * n, [1, 2, 3, 4]);
    ensure(squares == [1, 4, 9, 16], "results out of order")?;
    let result = pool.apply_async(|| 7);
    ensure(result.get().map_err(|e| e.to_string())? == 7, "apply_async value")
}

fn check_cpu_count(context: &CompatContext) -> CheckResult {
    let count = context.registry().cpu_count();
    match context.registry().backing(Category::ProcessFork) {
        Backing::Emulated => ensure(count == 1, "emulated cpu_count is not 1"),
        Backing::Native => ensure(count >= 1, "cpu_count is 0"),
    }
}

fn check_run_command(context: &CompatContext) -> CheckResult {
    let outcome = context
        .registry()
        .run_command("sh", &["-c", "exit 0"])
        .map_err(|e| e.to_string())?;
    ensure(outcome.success(), "command reported failure")
}

fn check_shared_memory(context: &CompatContext) -> CheckResult {
    let name = unique_name("shm");
    let mut segment = context
        .registry()
        .shared_memory(Some(&name), true, 16)
        .map_err(|e| e.to_string())?;
    let written = match segment.buf_mut().first_mut() {
        Some(byte) => {
            *byte = 0x5A;
            true
        }
        None => false,
    };
    let read_back = segment.buf().first() == Some(&0x5A);
    let size = segment.size();
    let closed = segment.close();
    let unlinked = segment.unlink();
    ensure(written && read_back, "buffer did not hold the written byte")?;
    ensure(size >= 16, "segment smaller than requested")?;
    closed.map_err(|e| e.to_string())?;
    unlinked.map_err(|e| e.to_string())
}

fn check_shareable_list(context: &CompatContext) -> CheckResult {
    let mut list = context.registry().shareable_list([1, 2, 3]);
    list.set(1, 20).map_err(|_| "index 1 out of range".to_string())?;
    ensure(
        list.iter().copied().collect::<Vec<_>>() == [1, 20, 3],
        "list contents mismatch",
    )
}

fn check_open(context: &CompatContext) -> CheckResult {
    let missing: PathBuf = std::env::temp_dir().join(unique_name("open").trim_start_matches('/'));
    match context.io().open(&missing, FileMode::READ) {
        Ok(mut file) => {
            let mut text = String::new();
            let read = file.read_to_string(&mut text).map_err(|e| e.to_string())?;
            ensure(
                file.is_substitute() && read == 0,
                "missing file opened with data",
            )
        }
        Err(fault) if fault.class != FaultClass::Unexpected => {
            ensure(context.io().name() == "native", "resilient provider raised")
        }
        Err(fault) => Err(fault.to_string()),
    }
}

fn check_stdin(context: &CompatContext) -> CheckResult {
    if context.stdin_policy() == StdinPolicy::Native {
        return Ok(());
    }
    let mut input = context.stdin();
    let mut line = String::new();
    let read = input.read_line(&mut line).map_err(|e| e.to_string())?;
    ensure(read == 0 && !input.is_terminal(), "neutralized stdin produced input")
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::bootstrap::Bootstrap;
    use crate::config::CompatConfig;

    #[test]
    fn test_every_check_passes_fully_emulated() {
        let config = CompatConfig {
            disable_descriptor_diagnostic: false,
            force_emulate: Category::ALL.to_vec(),
            ..CompatConfig::default()
        };
        let context = Bootstrap::new(config).run().unwrap();
        let outcomes = run_checks(&context);

        assert_eq!(outcomes.len(), 15);
        for outcome in &outcomes {
            assert!(outcome.passed, "{} failed: {}", outcome.primitive, outcome.detail);
        }
        let queue = outcomes.iter().find(|o| o.primitive == "Queue").unwrap();
        assert_eq!(queue.backing, Some(Backing::Emulated));
    }
}
