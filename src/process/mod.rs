//! Process, Pool, `cpu_count` and the command runner.
//!
//! Native processes run their target on an OS thread. Emulated processes run
//! it to completion inside `start`, in the caller's thread, so `is_alive` is
//! false as soon as `start` returns. Either way a failing target never makes
//! `start` fail: the fault is recorded and exposed through
//! [`Process::failure`] and [`Process::exitcode`].

mod error;
mod pool;

use std::fmt;
use std::num::NonZeroUsize;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, warn};

pub use error::{BoxError, CommandError, ProcessError, TargetError};
pub use pool::{AsyncResult, Pool};

use crate::registry::Backing;

const JOIN_POLL: Duration = Duration::from_millis(2);

static PROCESS_COUNTER: AtomicUsize = AtomicUsize::new(1);

type Target = Box<dyn FnOnce() -> Result<(), BoxError> + Send + 'static>;

enum Run {
    Pending(Target),
    Running(JoinHandle<Result<(), TargetError>>),
    Finished(Result<(), TargetError>),
}

/// A unit of work started with [`start`](Self::start).
pub struct Process {
    name: String,
    backing: Backing,
    run: Run,
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("name", &self.name)
            .field("backing", &self.backing)
            .field("started", &self.started())
            .finish()
    }
}

fn run_target(target: Target) -> Result<(), TargetError> {
    match catch_unwind(AssertUnwindSafe(target)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(error)) => Err(TargetError::failed(&error)),
        Err(payload) => Err(TargetError::panicked(payload.as_ref())),
    }
}

impl Process {
    pub(crate) fn new<F>(backing: Backing, target: F) -> Self
    where
        F: FnOnce() -> Result<(), BoxError> + Send + 'static,
    {
        let id = PROCESS_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self {
            name: format!("Process-{id}"),
            backing,
            run: Run::Pending(Box::new(target)),
        }
    }

    /// Replaces the generated name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn backing(&self) -> Backing {
        self.backing
    }

    #[must_use]
    pub fn started(&self) -> bool {
        !matches!(self.run, Run::Pending(_))
    }

    /// Starts the target.
    ///
    /// The emulated backing runs the target to completion before returning.
    /// A failing target is recorded, never returned.
    ///
    /// # Errors
    ///
    /// [`ProcessError::AlreadyStarted`] on a second call;
    /// [`ProcessError::Spawn`] when the native worker cannot be spawned.
    pub fn start(&mut self) -> Result<(), ProcessError> {
        let placeholder = Run::Finished(Ok(()));
        let target = match std::mem::replace(&mut self.run, placeholder) {
            Run::Pending(target) => target,
            other => {
                self.run = other;
                return Err(ProcessError::AlreadyStarted {
                    name: self.name.clone(),
                });
            }
        };

        match self.backing {
            Backing::Emulated => {
                let outcome = run_target(target);
                self.record(outcome);
            }
            Backing::Native => {
                let spawned = thread::Builder::new()
                    .name(self.name.clone())
                    .spawn(move || run_target(target));
                match spawned {
                    Ok(handle) => self.run = Run::Running(handle),
                    Err(source) => return Err(self.spawn_failed(source)),
                }
            }
        }
        Ok(())
    }

    /// The target is gone with the failed spawn, so it is recorded as failed.
    fn spawn_failed(&mut self, source: std::io::Error) -> ProcessError {
        self.record(Err(TargetError::Failed {
            message: format!("worker was never spawned: {source}"),
        }));
        ProcessError::Spawn {
            name: self.name.clone(),
            source,
        }
    }

    /// Waits for the target to finish, at most `timeout` if given.
    pub fn join(&mut self, timeout: Option<Duration>) {
        let Run::Running(handle) = &self.run else {
            return;
        };
        if let Some(timeout) = timeout {
            let deadline = Instant::now() + timeout;
            while !handle.is_finished() {
                if Instant::now() >= deadline {
                    return;
                }
                thread::sleep(JOIN_POLL);
            }
        }
        self.reap();
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        matches!(&self.run, Run::Running(handle) if !handle.is_finished())
    }

    /// Threads cannot be killed; both backings treat this as a no-op.
    pub fn terminate(&mut self) {
        debug!(name = %self.name, "terminate ignored");
    }

    pub fn kill(&mut self) {
        self.terminate();
    }

    /// `Some(0)` after success, `Some(1)` after failure, `None` while
    /// pending or running.
    pub fn exitcode(&mut self) -> Option<i32> {
        self.poll();
        match &self.run {
            Run::Finished(Ok(())) => Some(0),
            Run::Finished(Err(_)) => Some(1),
            _ => None,
        }
    }

    /// The fault the target raised, if it has finished and failed.
    pub fn failure(&mut self) -> Option<&TargetError> {
        self.poll();
        match &self.run {
            Run::Finished(Err(error)) => Some(error),
            _ => None,
        }
    }

    fn poll(&mut self) {
        if matches!(&self.run, Run::Running(handle) if handle.is_finished()) {
            self.reap();
        }
    }

    fn reap(&mut self) {
        let placeholder = Run::Finished(Ok(()));
        if let Run::Running(handle) = std::mem::replace(&mut self.run, placeholder) {
            let outcome = handle
                .join()
                .unwrap_or_else(|payload| Err(TargetError::panicked(payload.as_ref())));
            self.record(outcome);
        }
    }

    fn record(&mut self, outcome: Result<(), TargetError>) {
        if let Err(error) = &outcome {
            warn!(name = %self.name, backing = %self.backing, error = %error, "process target failed");
        }
        self.run = Run::Finished(outcome);
    }
}

/// Number of CPUs the scheduler should assume. Always 1 when emulated.
#[must_use]
pub fn cpu_count(backing: Backing) -> usize {
    match backing {
        Backing::Emulated => 1,
        Backing::Native => thread::available_parallelism().map_or(1, NonZeroUsize::get),
    }
}

/// Result of [`run_command`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandOutcome {
    /// Exit status; -1 when the child was killed by a signal.
    pub status: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutcome {
    #[must_use]
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Runs `program` with `args` and collects its output.
///
/// The emulated backing spawns nothing and reports an empty, successful run.
///
/// # Errors
///
/// Native backing only: returns [`CommandError`] if the program cannot be launched.
pub fn run_command(backing: Backing, program: &str, args: &[&str]) -> Result<CommandOutcome, CommandError> {
    match backing {
        Backing::Emulated => {
            warn!(program, "subprocess spawning unavailable, returning empty result");
            Ok(CommandOutcome {
                status: 0,
                stdout: Vec::new(),
                stderr: Vec::new(),
            })
        }
        Backing::Native => {
            let output = std::process::Command::new(program)
                .args(args)
                .output()
                .map_err(|source| CommandError {
                    program: program.to_string(),
                    source,
                })?;
            Ok(CommandOutcome {
                status: output.status.code().unwrap_or(-1),
                stdout: output.stdout,
                stderr: output.stderr,
            })
        }
    }
}
