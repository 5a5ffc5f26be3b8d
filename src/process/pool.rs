use std::panic::{self, AssertUnwindSafe, catch_unwind};
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use super::TargetError;
use crate::registry::Backing;

/// Worker pool.
///
/// The native pool spreads `map` over scoped worker threads, one chunk per
/// worker, and keeps input order. The emulated pool does all work inline.
/// Neither keeps workers alive between calls, so `close`, `join` and
/// `terminate` have nothing to stop.
#[derive(Debug, Clone, Copy)]
pub struct Pool {
    backing: Backing,
    processes: usize,
}

impl Pool {
    pub(crate) fn new(backing: Backing, processes: usize) -> Self {
        Self {
            backing,
            processes: processes.max(1),
        }
    }

    #[must_use]
    pub fn backing(&self) -> Backing {
        self.backing
    }

    /// Number of workers.
    #[must_use]
    pub fn processes(&self) -> usize {
        self.processes
    }

    /// Applies `f` to every item and returns the results in input order.
    ///
    /// # Panics
    ///
    /// Re-raises a panic from `f`.
    pub fn map<T, R, F>(&self, f: F, items: impl IntoIterator<Item = T>) -> Vec<R>
    where
        T: Send,
        R: Send,
        F: Fn(T) -> R + Sync,
    {
        let items: Vec<T> = items.into_iter().collect();
        if self.backing == Backing::Emulated || self.processes == 1 || items.len() < 2 {
            return items.into_iter().map(f).collect();
        }

        let chunk_len = items.len().div_ceil(self.processes);
        let mut chunks: Vec<Vec<T>> = Vec::new();
        let mut items = items.into_iter().peekable();
        while items.peek().is_some() {
            chunks.push(items.by_ref().take(chunk_len).collect());
        }

        let f = &f;
        thread::scope(|scope| {
            let workers: Vec<_> = chunks
                .into_iter()
                .map(|chunk| scope.spawn(move || chunk.into_iter().map(f).collect::<Vec<R>>()))
                .collect();
            workers
                .into_iter()
                .flat_map(|worker| worker.join().unwrap_or_else(|payload| panic::resume_unwind(payload)))
                .collect()
        })
    }

    /// Runs `f` and returns its result.
    ///
    /// # Panics
    ///
    /// Re-raises a panic from `f`.
    pub fn apply<R, F>(&self, f: F) -> R
    where
        R: Send,
        F: FnOnce() -> R + Send,
    {
        match self.backing {
            Backing::Emulated => f(),
            Backing::Native => thread::scope(|scope| {
                scope
                    .spawn(f)
                    .join()
                    .unwrap_or_else(|payload| panic::resume_unwind(payload))
            }),
        }
    }

    /// Starts `f` and returns a handle to its result.
    pub fn apply_async<R, F>(&self, f: F) -> AsyncResult<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        self.apply_async_with(f, |_: &R| {})
    }

    /// Like [`apply_async`](Self::apply_async), calling `callback` with the
    /// result once it is computed. The emulated pool calls it before
    /// returning. A panicking callback fails the result like a panicking task.
    pub fn apply_async_with<R, F, C>(&self, f: F, callback: C) -> AsyncResult<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
        C: FnOnce(&R) + Send + 'static,
    {
        let task = move || -> Result<R, TargetError> {
            let value = catch_unwind(AssertUnwindSafe(f))
                .map_err(|payload| TargetError::panicked(payload.as_ref()))?;
            catch_unwind(AssertUnwindSafe(|| callback(&value))).map_err(|payload| {
                let error = TargetError::panicked(payload.as_ref());
                warn!(error = %error, "apply_async callback panicked");
                error
            })?;
            Ok(value)
        };

        match self.backing {
            Backing::Emulated => AsyncResult {
                state: AsyncState::Ready(task()),
            },
            Backing::Native => match thread::Builder::new().name("pool-worker".to_string()).spawn(task) {
                Ok(handle) => AsyncResult {
                    state: AsyncState::Pending(handle),
                },
                Err(error) => {
                    warn!(error = %error, "could not spawn pool worker");
                    AsyncResult {
                        state: AsyncState::Ready(Err(TargetError::Failed {
                            message: error.to_string(),
                        })),
                    }
                }
            },
        }
    }

    pub fn close(&self) {
        debug!("pool close");
    }

    pub fn join(&self) {
        debug!("pool join");
    }

    pub fn terminate(&self) {
        debug!("pool terminate");
    }
}

#[derive(Debug)]
enum AsyncState<R> {
    Pending(JoinHandle<Result<R, TargetError>>),
    Ready(Result<R, TargetError>),
}

/// Handle returned by [`Pool::apply_async`].
#[derive(Debug)]
pub struct AsyncResult<R> {
    state: AsyncState<R>,
}

impl<R> AsyncResult<R> {
    /// Waits for and returns the task's value.
    ///
    /// # Errors
    ///
    /// [`TargetError::Panicked`] if the task panicked.
    pub fn get(self) -> Result<R, TargetError> {
        match self.state {
            AsyncState::Ready(result) => result,
            AsyncState::Pending(handle) => join_task(handle),
        }
    }

    /// Whether the task has finished. Always true for the emulated pool.
    #[must_use]
    pub fn ready(&self) -> bool {
        match &self.state {
            AsyncState::Ready(_) => true,
            AsyncState::Pending(handle) => handle.is_finished(),
        }
    }

    /// Whether the task finished without panicking; `None` while running.
    pub fn successful(&mut self) -> Option<bool> {
        if matches!(&self.state, AsyncState::Pending(handle) if handle.is_finished()) {
            let placeholder = AsyncState::Ready(Err(TargetError::Failed {
                message: String::new(),
            }));
            if let AsyncState::Pending(handle) = std::mem::replace(&mut self.state, placeholder) {
                self.state = AsyncState::Ready(join_task(handle));
            }
        }
        match &self.state {
            AsyncState::Ready(result) => Some(result.is_ok()),
            AsyncState::Pending(_) => None,
        }
    }
}

fn join_task<R>(handle: JoinHandle<Result<R, TargetError>>) -> Result<R, TargetError> {
    handle
        .join()
        .unwrap_or_else(|payload| Err(TargetError::panicked(payload.as_ref())))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_emulated_map_preserves_order() {
        let pool = Pool::new(Backing::Emulated, 4);
        assert_eq!(pool.map(|x: i32| x * 10, [1, 2, 3]), vec![10, 20, 30]);
    }

    #[test]
    fn test_native_map_preserves_order_across_workers() {
        let pool = Pool::new(Backing::Native, 3);
        let input: Vec<u64> = (0..20).collect();
        let expected: Vec<u64> = input.iter().map(|x| x * x).collect();
        assert_eq!(pool.map(|x| x * x, input), expected);
    }

    #[test]
    fn test_map_on_empty_input() {
        let pool = Pool::new(Backing::Native, 2);
        let out: Vec<u8> = pool.map(|x: u8| x, Vec::new());
        assert!(out.is_empty());
    }

    #[test]
    fn test_processes_is_at_least_one() {
        assert_eq!(Pool::new(Backing::Native, 0).processes(), 1);
    }

    #[test]
    fn test_apply_returns_value_in_both_backings() {
        for backing in [Backing::Emulated, Backing::Native] {
            let pool = Pool::new(backing, 2);
            assert_eq!(pool.apply(|| 6 * 7), 42);
        }
    }

    #[test]
    fn test_emulated_apply_async_runs_callback_before_returning() {
        let pool = Pool::new(Backing::Emulated, 1);
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        let mut result = pool.apply_async_with(|| "done", move |value: &&str| {
            *sink.lock().unwrap() = Some(*value);
        });

        assert_eq!(*seen.lock().unwrap(), Some("done"));
        assert!(result.ready());
        assert_eq!(result.successful(), Some(true));
        assert_eq!(result.get().unwrap(), "done");
    }

    #[test]
    fn test_native_apply_async_eventually_ready() {
        let pool = Pool::new(Backing::Native, 1);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let result = pool.apply_async_with(
            || {
                thread::sleep(Duration::from_millis(5));
                7
            },
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        );
        assert_eq!(result.get().unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_apply_async_captures_panic() {
        for backing in [Backing::Emulated, Backing::Native] {
            let pool = Pool::new(backing, 1);
            let result = pool.apply_async(|| -> u8 { panic!("task blew up") });
            assert!(matches!(
                result.get(),
                Err(TargetError::Panicked { message }) if message == "task blew up"
            ));
        }
    }

    #[test]
    fn test_apply_async_captures_callback_panic() {
        for backing in [Backing::Emulated, Backing::Native] {
            let pool = Pool::new(backing, 1);
            let mut result = pool.apply_async_with(|| 3, |_: &i32| panic!("callback blew up"));
            if backing == Backing::Emulated {
                assert_eq!(result.successful(), Some(false));
            }
            assert!(matches!(
                result.get(),
                Err(TargetError::Panicked { message }) if message == "callback blew up"
            ));
        }
    }
}
