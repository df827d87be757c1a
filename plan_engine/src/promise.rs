// Promises: spec section 4.6. A `Promise` chains a body plus zero or more
// success/error steps, each tagged with where it should run: `in_engine`
// steps run inline in the task that drives the chain (so they may safely
// touch engine-owned state the caller closes over), while pool steps are
// marshalled onto the executor's dedicated blocking-thread pool.
//
// Grounded on `task_executor::Executor::spawn_blocking`/`native_spawn_blocking`
// for the pool/inline split, and on `task_executor::WaitingWork` for tracking
// the in-flight chain until it completes.
//
// Simplification: the design notes describe engine-side continuations as
// being marshalled back onto the engine thread via a condvar and a result
// slot it waits on. This crate has no second thread of its own driving
// `Engine` independently of `run_cycle`, so `in_engine` steps here just run
// inline on whatever task is driving the chain rather than being handed off
// to a dedicated engine thread.

use std::sync::Arc;

use parking_lot::Mutex;
use plan::Context;
use plan_errors::{CodeError, ExceptionKind};
use task_executor::{Executor, WaitingWork};

use crate::FrameworkError;

type SuccessFn = Box<dyn FnOnce(Context) -> Result<Context, ExceptionKind> + Send>;
type ErrorFn = Box<dyn FnOnce(ExceptionKind) -> Result<Context, ExceptionKind> + Send>;

enum Step {
    Success { in_engine: bool, f: SuccessFn },
    Error { in_engine: bool, f: ErrorFn },
}

#[derive(Clone, Debug)]
enum PromiseState {
    Pending,
    Fulfilled(Context),
    Rejected(ExceptionKind),
}

/// A chain of work: a body (always run on the pool, since it's the one step
/// guaranteed not to need inline access to caller-local state) followed by
/// `on_success`/`on_error` steps threaded through a single `Context`.
pub struct Promise {
    body: SuccessFn,
    steps: Vec<Step>,
}

impl Promise {
    pub fn new(body: impl FnOnce(Context) -> Result<Context, ExceptionKind> + Send + 'static) -> Self {
        Promise { body: Box::new(body), steps: Vec::new() }
    }

    /// Appends a success step. `in_engine` steps run inline on the task
    /// driving the chain; others are spawned onto the executor's blocking pool.
    pub fn on_success(
        mut self,
        in_engine: bool,
        f: impl FnOnce(Context) -> Result<Context, ExceptionKind> + Send + 'static,
    ) -> Self {
        self.steps.push(Step::Success { in_engine, f: Box::new(f) });
        self
    }

    pub fn on_error(
        mut self,
        in_engine: bool,
        f: impl FnOnce(ExceptionKind) -> Result<Context, ExceptionKind> + Send + 'static,
    ) -> Self {
        self.steps.push(Step::Error { in_engine, f: Box::new(f) });
        self
    }

    /// Schedules the body and its chained steps on `executor`, tracking
    /// progress in `waiting_work` under `label` until the chain resolves. A
    /// rejection that reaches the end of the chain with no `on_error` step
    /// having run to catch it is recorded into `framework_errors` instead of
    /// simply vanishing into the handle (section 4.5.1 phase 7).
    pub fn execute(
        self,
        executor: &Executor,
        waiting_work: &WaitingWork,
        label: impl Into<String>,
        framework_errors: Arc<Mutex<Vec<FrameworkError>>>,
    ) -> PromiseHandle {
        let state = Arc::new(Mutex::new(PromiseState::Pending));
        let state_for_task = state.clone();
        let body = self.body;
        let steps = self.steps;
        let has_error_step = steps.iter().any(|s| matches!(s, Step::Error { .. }));
        let executor = executor.clone();
        let label = label.into();
        let label_for_error = label.clone();

        let executor_for_task = executor.clone();
        let task = async move {
            let mut value = run_on_pool(&executor_for_task, move || body(Context::None)).await;
            for step in steps {
                value = run_step(&executor_for_task, step, value).await;
            }
            if let Err(e) = &value {
                if !has_error_step {
                    framework_errors
                        .lock()
                        .push(FrameworkError { kind: e.clone(), label: label_for_error });
                }
            }
            *state_for_task.lock() = match value {
                Ok(v) => PromiseState::Fulfilled(v),
                Err(e) => PromiseState::Rejected(e),
            };
        };
        waiting_work.spawn_on(&label, executor.handle(), task);
        PromiseHandle { state }
    }
}

async fn run_step(
    executor: &Executor,
    step: Step,
    value: Result<Context, ExceptionKind>,
) -> Result<Context, ExceptionKind> {
    match (step, value) {
        (Step::Success { in_engine, f }, Ok(v)) => {
            if in_engine {
                f(v)
            } else {
                run_on_pool(executor, move || f(v)).await
            }
        }
        (Step::Error { in_engine, f }, Err(e)) => {
            if in_engine {
                f(e)
            } else {
                run_on_pool(executor, move || f(e)).await
            }
        }
        (_, passthrough) => passthrough,
    }
}

async fn run_on_pool<F>(executor: &Executor, f: F) -> Result<Context, ExceptionKind>
where
    F: FnOnce() -> Result<Context, ExceptionKind> + Send + 'static,
{
    executor
        .spawn_blocking(f, |join_err| {
            Err(ExceptionKind::Code(CodeError::new(format!(
                "promise step panicked: {join_err}"
            ))))
        })
        .await
}

/// A handle to a promise's outcome, readable from any thread; the chain
/// itself runs on the executor regardless of who holds this.
pub struct PromiseHandle {
    state: Arc<Mutex<PromiseState>>,
}

impl PromiseHandle {
    pub fn complete(&self) -> bool {
        !matches!(*self.state.lock(), PromiseState::Pending)
    }

    pub fn fulfilled(&self) -> bool {
        matches!(*self.state.lock(), PromiseState::Fulfilled(_))
    }

    pub fn rejected(&self) -> bool {
        matches!(*self.state.lock(), PromiseState::Rejected(_))
    }

    pub fn value(&self) -> Option<Context> {
        match &*self.state.lock() {
            PromiseState::Fulfilled(v) => Some(v.clone()),
            _ => None,
        }
    }

    pub fn value_or_raise(&self) -> Result<Context, ExceptionKind> {
        match &*self.state.lock() {
            PromiseState::Fulfilled(v) => Ok(v.clone()),
            PromiseState::Rejected(e) => Err(e.clone()),
            PromiseState::Pending => Err(ExceptionKind::Code(CodeError::new("promise has not completed"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn chained_success_steps_thread_the_context_through() {
        let executor = Executor::new();
        let waiting_work = WaitingWork::new();
        let handle = Promise::new(|_| Ok(Context::Int(1)))
            .on_success(false, |ctx| match ctx {
                Context::Int(n) => Ok(Context::Int(n + 1)),
                other => Ok(other),
            })
            .on_success(true, |ctx| match ctx {
                Context::Int(n) => Ok(Context::Int(n * 10)),
                other => Ok(other),
            })
            .execute(&executor, &waiting_work, "chained-success", Arc::new(Mutex::new(Vec::new())));

        waiting_work.join_all(Duration::from_secs(5)).await;
        assert!(handle.fulfilled());
        assert_eq!(handle.value(), Some(Context::Int(20)));
    }

    #[tokio::test]
    async fn error_step_runs_in_place_of_skipped_success_steps() {
        let executor = Executor::new();
        let waiting_work = WaitingWork::new();
        let handle = Promise::new(|_| Err(ExceptionKind::Code(CodeError::new("body failed"))))
            .on_success(true, |_| Ok(Context::Text("unreachable".to_string())))
            .on_error(true, |_| Ok(Context::Text("recovered".to_string())))
            .execute(&executor, &waiting_work, "error-recovery", Arc::new(Mutex::new(Vec::new())));

        waiting_work.join_all(Duration::from_secs(5)).await;
        assert!(handle.fulfilled());
        assert_eq!(handle.value(), Some(Context::Text("recovered".to_string())));
    }

    #[tokio::test]
    async fn unhandled_rejection_surfaces_via_value_or_raise() {
        let executor = Executor::new();
        let waiting_work = WaitingWork::new();
        let handle = Promise::new(|_| Err(ExceptionKind::Code(CodeError::new("body failed"))))
            .execute(&executor, &waiting_work, "unhandled-rejection", Arc::new(Mutex::new(Vec::new())));

        waiting_work.join_all(Duration::from_secs(5)).await;
        assert!(handle.rejected());
        assert!(handle.value_or_raise().is_err());
    }

    #[tokio::test]
    async fn unhandled_rejection_with_no_error_step_is_recorded_as_a_framework_error() {
        let executor = Executor::new();
        let waiting_work = WaitingWork::new();
        let framework_errors = Arc::new(Mutex::new(Vec::new()));
        let handle = Promise::new(|_| Err(ExceptionKind::Code(CodeError::new("body failed"))))
            .execute(&executor, &waiting_work, "unhandled-rejection", framework_errors.clone());

        waiting_work.join_all(Duration::from_secs(5)).await;
        assert!(handle.rejected());
        assert_eq!(framework_errors.lock().len(), 1);
        assert_eq!(framework_errors.lock()[0].label, "unhandled-rejection");
    }

    #[tokio::test]
    async fn a_rejection_caught_by_an_error_step_is_not_recorded_as_a_framework_error() {
        let executor = Executor::new();
        let waiting_work = WaitingWork::new();
        let framework_errors = Arc::new(Mutex::new(Vec::new()));
        let handle = Promise::new(|_| Err(ExceptionKind::Code(CodeError::new("body failed"))))
            .on_error(true, |_| Ok(Context::Text("recovered".to_string())))
            .execute(&executor, &waiting_work, "caught", framework_errors.clone());

        waiting_work.join_all(Duration::from_secs(5)).await;
        assert!(handle.fulfilled());
        assert!(framework_errors.lock().is_empty());
    }
}
