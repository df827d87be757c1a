// Runtime handle management for the plan execution engine.
//
// Grounded on `task_executor::Executor` (pantsbuild-pants): the borrowed vs.
// owned lifecycle distinction lets the engine either run inside a runtime the
// caller already owns (tests, embedding in another async program) or start
// and later tear down its own. `WaitingWork` is grounded on the same crate's
// `TailTasks`, repurposed to track the engine's in-flight `Promise` pool work
// so that `quit`/`force_quit` (spec section 4.5) can drain it subject to a
// timeout instead of leaking tasks.
#![deny(warnings)]
#![deny(clippy::all)]
#![allow(clippy::too_many_arguments, clippy::new_without_default)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::{Id, JoinError, JoinHandle, JoinSet};

/// A handle to the tokio runtime that drives the engine thread and the
/// `Promise` pool.
///
/// "Borrowed" executors (`Executor::new`) run on a `Runtime` owned by the
/// caller (e.g. a `#[tokio::test]` function) and have no shutdown effect of
/// their own. "Owned" executors (`Executor::new_owned`) start their own
/// multi-threaded `Runtime` and tear it down on `shutdown`.
#[derive(Debug, Clone)]
pub struct Executor {
    runtime: Arc<Mutex<Option<Runtime>>>,
    handle: Handle,
}

impl Executor {
    /// Wraps the currently-entered tokio runtime. Dropping all clones of the
    /// returned `Executor` has no effect on that runtime's lifecycle.
    pub fn new() -> Executor {
        Executor {
            runtime: Arc::new(Mutex::new(None)),
            handle: Handle::current(),
        }
    }

    /// Starts and owns a new multi-threaded runtime with the given thread
    /// configuration.
    pub fn new_owned(num_worker_threads: usize, max_threads: usize) -> Result<Executor, String> {
        let mut builder = Builder::new_multi_thread();
        builder
            .worker_threads(num_worker_threads)
            .max_blocking_threads(max_threads.saturating_sub(num_worker_threads).max(1))
            .enable_all();

        let runtime = builder
            .build()
            .map_err(|e| format!("failed to start the engine runtime: {e}"))?;
        let handle = runtime.handle().clone();
        Ok(Executor {
            runtime: Arc::new(Mutex::new(Some(runtime))),
            handle,
        })
    }

    /// A clone of this `Executor` that does not participate in shutdown.
    pub fn to_borrowed(&self) -> Executor {
        Executor {
            runtime: Arc::new(Mutex::new(None)),
            handle: self.handle.clone(),
        }
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Spawns `future` as a new task, recovering from a panicked task via
    /// `rescue_join_error` rather than propagating the `JoinError`.
    pub fn spawn<O, F>(
        &self,
        future: F,
        rescue_join_error: impl FnOnce(JoinError) -> O,
    ) -> impl Future<Output = O>
    where
        O: Send + 'static,
        F: Future<Output = O> + Send + 'static,
    {
        self.native_spawn(future).map(|res| match res {
            Ok(o) => o,
            Err(e) => rescue_join_error(e),
        })
    }

    pub fn native_spawn<O, F>(&self, future: F) -> JoinHandle<O>
    where
        O: Send + 'static,
        F: Future<Output = O> + Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// Runs `future` to completion, blocking the calling thread. Only to be
    /// called from outside of any async context.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.handle.block_on(future)
    }

    /// Spawns a blocking closure on the runtime's blocking thread pool: the
    /// execution location used for `Promise` steps run `:on_pool`.
    pub fn spawn_blocking<F, R>(
        &self,
        f: F,
        rescue_join_error: impl FnOnce(JoinError) -> R,
    ) -> impl Future<Output = R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.native_spawn_blocking(f).map(|res| match res {
            Ok(o) => o,
            Err(e) => rescue_join_error(e),
        })
    }

    pub fn native_spawn_blocking<F, R>(&self, f: F) -> JoinHandle<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.handle.spawn_blocking(f)
    }

    /// Shuts down an owned `Executor`'s runtime, leaking any tasks that do
    /// not complete within `timeout`. A no-op for borrowed executors.
    pub fn shutdown(&self, timeout: Duration) {
        let Some(runtime) = self.runtime.lock().take() else {
            return;
        };
        let start = Instant::now();
        runtime.shutdown_timeout(timeout + Duration::from_millis(250));
        if start.elapsed() > timeout {
            log::warn!("engine runtime shutdown took unexpectedly long: tasks were likely leaked");
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.runtime.lock().is_none()
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

struct WaitingWorkInner {
    id_to_label: HashMap<Id, String>,
    task_set: JoinSet<()>,
}

/// Tracks `Promise` pool work spawned while the engine is running, so that
/// `quit`/`force_quit` can wait for it to drain (subject to a timeout) instead
/// of abandoning it mid-flight.
#[derive(Clone)]
pub struct WaitingWork {
    inner: Arc<Mutex<Option<WaitingWorkInner>>>,
}

impl WaitingWork {
    pub fn new() -> Self {
        WaitingWork {
            inner: Arc::new(Mutex::new(Some(WaitingWorkInner {
                id_to_label: HashMap::new(),
                task_set: JoinSet::new(),
            }))),
        }
    }

    /// Registers a pending promise step under `label` so that `join_all` can
    /// report on it if it never completes.
    pub fn spawn_on<F>(&self, label: &str, handle: &Handle, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut guard = self.inner.lock();
        let Some(inner) = guard.as_mut() else {
            log::warn!("waiting work `{label}` submitted after engine shutdown");
            return;
        };
        let h = inner.task_set.spawn_on(task, handle);
        inner.id_to_label.insert(h.id(), label.to_string());
    }

    /// Waits for all tracked work to finish, subject to `timeout`. Matches
    /// `join_all_waiting_work`: any work still outstanding past the timeout is
    /// logged and abandoned rather than awaited further.
    pub async fn join_all(self, timeout: Duration) {
        let mut inner = match self.inner.lock().take() {
            Some(inner) => inner,
            None => {
                log::debug!("waiting work joined more than once");
                return;
            }
        };

        if inner.task_set.is_empty() {
            return;
        }

        let mut timeout = tokio::time::sleep(timeout).boxed();
        loop {
            tokio::select! {
                biased;

                _ = &mut timeout => break,

                next = inner.task_set.join_next_with_id() => {
                    match next {
                        Some(Ok((id, _))) => {
                            inner.id_to_label.remove(&id);
                        }
                        Some(Err(err)) => {
                            let label = inner.id_to_label.get(&err.id());
                            log::error!("waiting work `{label:?}` panicked: {err:?}");
                        }
                        None => break,
                    }
                }
            }
        }

        if !inner.task_set.is_empty() {
            log::warn!(
                "{} promise task(s) did not complete before quit timeout: {}",
                inner.task_set.len(),
                inner.id_to_label.values().cloned().collect::<Vec<_>>().join(", "),
            );
            inner.task_set.abort_all();
        }
    }
}

impl Default for WaitingWork {
    fn default() -> Self {
        Self::new()
    }
}
