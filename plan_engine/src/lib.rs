// Execution engine: spec section 4.5. Drives a `Plan` through the
// once-blocks -> external events -> propagation -> structure checks ->
// exception handling -> garbage collection cycle, plus `Promise`-based pool
// work (section 4.6) and the quit protocol (section 4.5.6).
//
// Grounded on `graph::Graph`/`graph::InnerGraph` (pantsbuild-pants): a single
// mutable owner driving a synchronous fixpoint over relation-graph state, one
// cycle at a time, rather than each generator reacting independently. The
// engine's own clock is virtual (an `elapsed: Duration` advanced explicitly,
// rather than read from `Instant::now()`) so that delayed signals/blocks and
// periodic work are deterministically testable (see `advance_time`).
#![deny(warnings)]
#![deny(clippy::all)]
#![allow(clippy::too_many_arguments, clippy::new_without_default)]

mod cycle;
mod exception;
mod gc;
mod promise;
mod quit;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use fnv::FnvHashMap;
use parking_lot::Mutex;
use plan::{Context, Plan, PropagationSink};
use plan_errors::{CodeError, EventId, ExceptionKind, LocalizedError, Origin, TaskId};
use task_executor::{Executor, WaitingWork};

pub use exception::ExecutionException;
pub use promise::{Promise, PromiseHandle};
pub use quit::QuitState;

/// A promise rejection whose chain had no `on_error` step to catch it (spec
/// section 4.6): rather than panicking the executor thread that ran it, it
/// accumulates here and surfaces as a fatal exception on the next
/// `run_cycle` (phase 7).
#[derive(Clone, Debug)]
pub struct FrameworkError {
    pub kind: ExceptionKind,
    pub label: String,
}

/// Policy for what happens when a `:propagation`-type external handler
/// itself panics while trying to handle an exception.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HandlerErrorPolicy {
    /// Re-raise the panic as a framework error on the next cycle.
    Raise,
    /// Remove the handler so it is never invoked again.
    Disable,
    /// Swallow the panic and keep the handler registered.
    Ignore,
}

type PropagationPredicate = Box<dyn Fn(&ExceptionKind) -> bool>;
type PropagationCallback = Box<dyn FnMut(&ExceptionKind, &mut Plan, &mut dyn PropagationSink)>;

struct PropagationEntry {
    predicate: PropagationPredicate,
    callback: PropagationCallback,
    policy: HandlerErrorPolicy,
    disabled: bool,
}

/// A `wait_until` predicate registered against the plan, checked at the end
/// of every cycle (phase 8) until it holds.
struct WaitCondition {
    predicate: Box<dyn Fn(&Plan) -> bool>,
    satisfied: Arc<Mutex<bool>>,
}

/// A handle to a `wait_until` registration. Pollable rather than blocking,
/// since this crate drives `Engine` from a single synchronous loop instead
/// of a dedicated engine thread a real wait could block on (the same
/// simplification `promise.rs` documents for `in_engine` steps).
#[derive(Clone)]
pub struct WaitUntilHandle {
    satisfied: Arc<Mutex<bool>>,
}

impl WaitUntilHandle {
    pub fn complete(&self) -> bool {
        *self.satisfied.lock()
    }
}

use cycle::{DispatchSink, PendingVisit};

/// Logs at trace level, but only in `cfg(test)` — for per-dispatch detail
/// that's noise outside a test run but useful when one fails.
#[macro_export]
macro_rules! engine_trace_log {
    ($($arg:tt)+) => {
        #[cfg(test)]
        {
            log::trace!($($arg)+)
        }
    };
}

/// Engine-wide tuning knobs. `cycle_period` is advisory (section 4.5.1's
/// "sleep to keep a roughly constant period"): this crate runs one cycle per
/// `run_cycle` call and leaves actual pacing to the caller, which is free to
/// ignore `cycle_period` entirely in tests.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub cycle_period: Duration,
    pub quit_dead_zone: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            cycle_period: Duration::from_millis(100),
            quit_dead_zone: Duration::from_secs(10),
        }
    }
}

type PlanBlock = Box<dyn FnOnce(&mut Plan, &mut dyn PropagationSink)>;
type ExternalHandler = Box<dyn FnMut(&mut Plan, &mut dyn PropagationSink)>;
type PeriodicHandler = Box<dyn FnMut(&mut Plan, &mut dyn PropagationSink)>;

struct ExternalEntry {
    late: bool,
    handler: ExternalHandler,
}

struct Periodic {
    period: Duration,
    next_tick: Duration,
    handler: PeriodicHandler,
}

/// Drives a `Plan` one cycle at a time. Owns the plan, the pending-dispatch
/// queue, and the registries of once-blocks/external handlers/periodic and
/// delayed work that feed each cycle's propagation phase.
pub struct Engine {
    pub plan: Plan,
    executor: Executor,
    waiting_work: WaitingWork,
    config: EngineConfig,
    cycle_count: u64,
    step_counter: u64,
    pending: FnvHashMap<EventId, PendingVisit>,
    once_blocks: Vec<PlanBlock>,
    external_handlers: Vec<ExternalEntry>,
    periodic: Vec<Periodic>,
    delayed_blocks: Vec<(Duration, PlanBlock)>,
    delayed_signals: Vec<(EventId, Context, Duration)>,
    cycle_begin_handlers: Vec<ExternalHandler>,
    cycle_end_handlers: Vec<ExternalHandler>,
    propagation_handlers: Vec<PropagationEntry>,
    wait_conditions: Vec<WaitCondition>,
    framework_errors: Arc<Mutex<Vec<FrameworkError>>>,
    elapsed: Duration,
    quit_state: QuitState,
    in_cycle: bool,
}

impl Engine {
    pub fn new(plan: Plan, executor: Executor, config: EngineConfig) -> Self {
        Engine {
            plan,
            executor,
            waiting_work: WaitingWork::new(),
            config,
            cycle_count: 0,
            step_counter: 0,
            pending: FnvHashMap::default(),
            once_blocks: Vec::new(),
            external_handlers: Vec::new(),
            periodic: Vec::new(),
            delayed_blocks: Vec::new(),
            delayed_signals: Vec::new(),
            cycle_begin_handlers: Vec::new(),
            cycle_end_handlers: Vec::new(),
            propagation_handlers: Vec::new(),
            wait_conditions: Vec::new(),
            framework_errors: Arc::new(Mutex::new(Vec::new())),
            elapsed: Duration::ZERO,
            quit_state: QuitState::Running,
            in_cycle: false,
        }
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn waiting_work(&self) -> &WaitingWork {
        &self.waiting_work
    }

    pub fn cycle_count(&self) -> u64 {
        self.cycle_count
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Queues a block to run once, at the start of the next cycle.
    pub fn once(&mut self, block: impl FnOnce(&mut Plan, &mut dyn PropagationSink) + 'static) {
        self.once_blocks.push(Box::new(block));
    }

    /// Registers a handler invoked every cycle's external-event phase.
    /// `late` handlers run after every non-late one, per section 4.5.1's
    /// ordering between ordinary and "late" external event processing.
    pub fn on_external_event(
        &mut self,
        late: bool,
        handler: impl FnMut(&mut Plan, &mut dyn PropagationSink) + 'static,
    ) {
        self.external_handlers.push(ExternalEntry { late, handler: Box::new(handler) });
    }

    /// Registers a handler invoked once every `period` of virtual time.
    pub fn every(&mut self, period: Duration, handler: impl FnMut(&mut Plan, &mut dyn PropagationSink) + 'static) {
        self.periodic.push(Periodic { period, next_tick: self.elapsed + period, handler: Box::new(handler) });
    }

    /// Queues a block to run once virtual time reaches `self.elapsed + after`.
    pub fn delayed(&mut self, after: Duration, block: impl FnOnce(&mut Plan, &mut dyn PropagationSink) + 'static) {
        self.delayed_blocks.push((self.elapsed + after, Box::new(block)));
    }

    /// Advances the engine's virtual clock without running a cycle. Used by
    /// tests to make delayed signals, delayed blocks, and periodic work
    /// deterministic instead of depending on wall-clock sleeps.
    pub fn advance_time(&mut self, dt: Duration) {
        self.elapsed += dt;
    }

    /// Enqueues a command invocation for the next propagation drain.
    pub fn call(&mut self, event: EventId, context: Context) {
        let mut sink = DispatchSink::new(&mut self.pending, &mut self.step_counter);
        sink.enqueue_call(event, context);
    }

    /// Enqueues an emission for the next propagation drain.
    pub fn emit(&mut self, event: EventId, context: Context) {
        let mut sink = DispatchSink::new(&mut self.pending, &mut self.step_counter);
        sink.enqueue_emit(event, context, Vec::new());
    }

    /// Requests a quit. The first call starts the dead-zone timer and asks
    /// every mission to stop; a second call inside that window (or letting
    /// the window elapse without every mission stopping) escalates to a
    /// forced shutdown.
    pub fn quit(&mut self) {
        quit::request_quit(self);
    }

    pub fn force_quit(&mut self) {
        self.quit_state = QuitState::Forced;
    }

    pub fn is_quitting(&self) -> bool {
        !matches!(self.quit_state, QuitState::Running)
    }

    pub fn is_forced_quit(&self) -> bool {
        matches!(self.quit_state, QuitState::Forced)
    }

    /// True while `run_cycle` is driving this engine's phases. Section
    /// 4.5.6's "inside control"/"outside control" distinction is, in the
    /// source system, which thread is calling; here there is only one
    /// thread, so it collapses to "is a cycle currently on the stack".
    pub fn inside_control(&self) -> bool {
        self.in_cycle
    }

    pub fn outside_control(&self) -> bool {
        !self.in_cycle
    }

    /// Runs `block` immediately if called from inside the engine's own cycle
    /// (`inside_control`), or queues it as a one-shot for the start of the
    /// next cycle otherwise — the synchronous stand-in for the source
    /// system's cross-thread marshalling onto the engine thread.
    pub fn execute(&mut self, block: impl FnOnce(&mut Plan, &mut dyn PropagationSink) + 'static) {
        if self.inside_control() {
            let mut sink = DispatchSink::new(&mut self.pending, &mut self.step_counter);
            block(&mut self.plan, &mut sink);
        } else {
            self.once(block);
        }
    }

    /// Registers a predicate checked at the end of every cycle (phase 8)
    /// until it holds. Returns a handle the caller polls; see
    /// [`WaitUntilHandle`] for why this doesn't block the caller's thread.
    pub fn wait_until(&mut self, predicate: impl Fn(&Plan) -> bool + 'static) -> WaitUntilHandle {
        let already = predicate(&self.plan);
        let satisfied = Arc::new(Mutex::new(already));
        if !already {
            self.wait_conditions.push(WaitCondition { predicate: Box::new(predicate), satisfied: satisfied.clone() });
        }
        WaitUntilHandle { satisfied }
    }

    /// Registers a handler invoked once at the very start of every cycle,
    /// before once-blocks and external events (phase 0).
    pub fn at_cycle_begin(&mut self, handler: impl FnMut(&mut Plan, &mut dyn PropagationSink) + 'static) {
        self.cycle_begin_handlers.push(Box::new(handler));
    }

    /// Registers a handler invoked once at the very end of every cycle,
    /// after garbage collection and framework-error accumulation (phase 8).
    pub fn at_cycle_end(&mut self, handler: impl FnMut(&mut Plan, &mut dyn PropagationSink) + 'static) {
        self.cycle_end_handlers.push(Box::new(handler));
    }

    /// Registers a `:propagation`-type external handler (phase 5): a
    /// plan-wide catch for exceptions matching `predicate`, run after
    /// per-task/per-plan handling but before `ChildFailed`/`MissionFailed`/
    /// `PermanentTaskError` synthesis. `policy` governs what happens if the
    /// handler itself panics.
    pub fn add_propagation_handler(
        &mut self,
        predicate: impl Fn(&ExceptionKind) -> bool + 'static,
        callback: impl FnMut(&ExceptionKind, &mut Plan, &mut dyn PropagationSink) + 'static,
        policy: HandlerErrorPolicy,
    ) {
        self.propagation_handlers.push(PropagationEntry {
            predicate: Box::new(predicate),
            callback: Box::new(callback),
            policy,
            disabled: false,
        });
    }

    /// Records a framework error directly, bypassing a `Promise` chain.
    /// Promise rejections with no `on_error` step reach this through
    /// `promise::run_on_pool`'s caller in `Promise::execute`.
    pub fn add_framework_error(&self, err: FrameworkError) {
        self.framework_errors.lock().push(err);
    }

    /// Schedules `promise` on this engine's executor, routing any rejection
    /// whose chain had no `on_error` step into this engine's framework-error
    /// collection.
    pub fn promise(&self, promise: Promise, label: impl Into<String>) -> PromiseHandle {
        promise.execute(&self.executor, &self.waiting_work, label, self.framework_errors.clone())
    }

    /// Resets the engine to a fresh-plan state (section 4.5.6): clears
    /// pending dispatch, once/delayed/periodic/propagation/wait-until work,
    /// quit state, and accumulated framework errors. The executor and
    /// waiting-work pool, which may have in-flight promises, are left alone.
    pub fn reset(&mut self) {
        self.plan = Plan::new();
        self.cycle_count = 0;
        self.step_counter = 0;
        self.pending.clear();
        self.once_blocks.clear();
        self.external_handlers.clear();
        self.periodic.clear();
        self.delayed_blocks.clear();
        self.delayed_signals.clear();
        self.cycle_begin_handlers.clear();
        self.cycle_end_handlers.clear();
        self.propagation_handlers.clear();
        self.wait_conditions.clear();
        self.framework_errors.lock().clear();
        self.elapsed = Duration::ZERO;
        self.quit_state = QuitState::Running;
        self.in_cycle = false;
    }

    /// Runs one full cycle (spec section 4.5.1's phases, minus the final
    /// wall-clock sleep to a cycle boundary, which callers drive themselves
    /// since the engine's own clock is virtual).
    pub fn run_cycle(&mut self) -> Vec<ExecutionException> {
        self.in_cycle = true;
        self.cycle_count += 1;

        quit::drive(self);

        // phase 0: cycle-begin hooks, before anything else this cycle runs.
        self.run_cycle_begin_handlers();

        // phase 1: once-blocks, delayed blocks, periodic blocks, and delayed
        // signals becoming due.
        let once_blocks = std::mem::take(&mut self.once_blocks);
        for block in once_blocks {
            let mut sink = DispatchSink::new(&mut self.pending, &mut self.step_counter);
            block(&mut self.plan, &mut sink);
        }
        self.run_due_delayed_blocks();
        self.run_due_periodic();
        self.activate_due_delayed_signals();

        // phase 2: external events, ordinary then late.
        self.run_external_handlers(false);
        self.run_external_handlers(true);

        // phase 3: propagation fixpoint.
        let mut raised = cycle::drain(self);

        // phase 4: structure checks.
        for (kind, tasks) in self.plan.check_structure() {
            let origin = tasks.first().copied().map(Origin::Task).unwrap_or(Origin::Task(TaskId(u32::MAX)));
            raised.push(LocalizedError::new(origin, kind));
        }

        // phase 5: exception propagation, then the :propagation-type
        // external handlers get a last chance at whatever is still fatal.
        let fatal = exception::propagate(self, raised);
        let mut fatal = self.run_propagation_handlers(fatal);
        for exc in &fatal {
            log::error!("unhandled exception at {}: {}", exc.origin, exc.exception);
        }

        // phase 6: garbage collection.
        gc::collect(self);

        // phase 7: framework-error accumulation. Promise rejections with no
        // `on_error` step in their chain landed in `framework_errors` from
        // whatever thread ran them (see `Promise::execute`); fold them into
        // this cycle's fatal exceptions here rather than losing them.
        fatal.extend(self.drain_framework_errors());

        // phase 8: wait_until checks, then cycle-end hooks.
        self.run_wait_conditions();
        self.run_cycle_end_handlers();

        // Anything this cycle's propagation or gc phases enqueued (a gc'd
        // task's stop call, a repair's error handler) gets its own drain on
        // the next `run_cycle` rather than looping here, keeping one cycle
        // bounded to one pass through the phases.

        self.in_cycle = false;
        fatal
    }

    /// Awaits every `Promise` spawned through [`Engine::waiting_work`],
    /// subject to `timeout`. Typically called after a final `quit` cycle.
    pub fn join_all_waiting_work(&self, timeout: Duration) -> impl Future<Output = ()> + 'static {
        self.waiting_work.clone().join_all(timeout)
    }

    fn run_external_handlers(&mut self, late: bool) {
        for idx in 0..self.external_handlers.len() {
            if self.external_handlers[idx].late != late {
                continue;
            }
            let mut sink = DispatchSink::new(&mut self.pending, &mut self.step_counter);
            (self.external_handlers[idx].handler)(&mut self.plan, &mut sink);
        }
    }

    fn run_cycle_begin_handlers(&mut self) {
        for idx in 0..self.cycle_begin_handlers.len() {
            let mut sink = DispatchSink::new(&mut self.pending, &mut self.step_counter);
            (self.cycle_begin_handlers[idx])(&mut self.plan, &mut sink);
        }
    }

    fn run_cycle_end_handlers(&mut self) {
        for idx in 0..self.cycle_end_handlers.len() {
            let mut sink = DispatchSink::new(&mut self.pending, &mut self.step_counter);
            (self.cycle_end_handlers[idx])(&mut self.plan, &mut sink);
        }
    }

    fn run_wait_conditions(&mut self) {
        for cond in &self.wait_conditions {
            if (cond.predicate)(&self.plan) {
                *cond.satisfied.lock() = true;
            }
        }
        self.wait_conditions.retain(|c| !*c.satisfied.lock());
    }

    /// Gives every registered `:propagation`-type handler whose predicate
    /// matches a chance to consume each still-fatal exception, closest
    /// registration last (so later registrations take precedence, mirroring
    /// `Task::handle_exception`'s reverse-declaration-order rule). An
    /// exception consumed by any matching handler is dropped from the
    /// returned list; one that panics is handled per that handler's
    /// `HandlerErrorPolicy`.
    fn run_propagation_handlers(&mut self, fatal: Vec<ExecutionException>) -> Vec<ExecutionException> {
        if self.propagation_handlers.is_empty() {
            return fatal;
        }
        let mut remaining = Vec::with_capacity(fatal.len());
        'exceptions: for exc in fatal {
            for idx in (0..self.propagation_handlers.len()).rev() {
                if self.propagation_handlers[idx].disabled {
                    continue;
                }
                if !(self.propagation_handlers[idx].predicate)(&exc.exception) {
                    continue;
                }
                let outcome = {
                    let mut sink = DispatchSink::new(&mut self.pending, &mut self.step_counter);
                    std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        (self.propagation_handlers[idx].callback)(&exc.exception, &mut self.plan, &mut sink)
                    }))
                };
                match outcome {
                    Ok(()) => continue 'exceptions,
                    Err(_) => match self.propagation_handlers[idx].policy {
                        HandlerErrorPolicy::Raise => self.add_framework_error(FrameworkError {
                            kind: ExceptionKind::EventHandlerError(CodeError::new("propagation handler panicked")),
                            label: "propagation".to_string(),
                        }),
                        HandlerErrorPolicy::Disable => self.propagation_handlers[idx].disabled = true,
                        HandlerErrorPolicy::Ignore => {}
                    },
                }
            }
            remaining.push(exc);
        }
        remaining
    }

    fn drain_framework_errors(&self) -> Vec<ExecutionException> {
        self.framework_errors
            .lock()
            .drain(..)
            .map(|fe| ExecutionException {
                exception: fe.kind,
                origin: Origin::Task(TaskId(u32::MAX)),
                trace: Vec::new(),
                affected_tasks: Vec::new(),
            })
            .collect()
    }

    fn run_due_delayed_blocks(&mut self) {
        let elapsed = self.elapsed;
        let mut due = Vec::new();
        let mut i = 0;
        while i < self.delayed_blocks.len() {
            if self.delayed_blocks[i].0 <= elapsed {
                due.push(self.delayed_blocks.remove(i));
            } else {
                i += 1;
            }
        }
        for (_, block) in due {
            let mut sink = DispatchSink::new(&mut self.pending, &mut self.step_counter);
            block(&mut self.plan, &mut sink);
        }
    }

    fn run_due_periodic(&mut self) {
        let elapsed = self.elapsed;
        for p in &mut self.periodic {
            if p.next_tick <= elapsed {
                p.next_tick += p.period;
                let mut sink = DispatchSink::new(&mut self.pending, &mut self.step_counter);
                (p.handler)(&mut self.plan, &mut sink);
            }
        }
    }

    fn activate_due_delayed_signals(&mut self) {
        let elapsed = self.elapsed;
        let mut due = Vec::new();
        let mut i = 0;
        while i < self.delayed_signals.len() {
            if self.delayed_signals[i].2 <= elapsed {
                due.push(self.delayed_signals.remove(i));
            } else {
                i += 1;
            }
        }
        for (event, context, _) in due {
            let unreachable = self.plan.events.get(event.0).map(|g| g.is_unreachable()).unwrap_or(true);
            if unreachable {
                continue;
            }
            let mut sink = DispatchSink::new(&mut self.pending, &mut self.step_counter);
            sink.enqueue_call(event, context);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plan::TaskModel;
    use std::time::Duration;

    fn task_model() -> std::rc::Rc<TaskModel> {
        let mut model = TaskModel::new("Job");
        model.declare_event("start", true, false);
        model.declare_event("success", false, true);
        model.declare_event("stop", true, true);
        std::rc::Rc::new(model)
    }

    fn test_engine() -> Engine {
        Engine::new(Plan::new(), Executor::new_owned(1, 2).unwrap(), EngineConfig::default())
    }

    #[test]
    fn run_cycle_drains_a_queued_call_and_reports_no_exceptions() {
        let mut engine = test_engine();
        let t = engine.plan.add_task(task_model());
        let start = engine.plan.tasks.get(t.0).unwrap().event_id("start").unwrap();
        engine.call(start, Context::None);
        let fatal = engine.run_cycle();
        assert!(fatal.is_empty());
        assert!(engine.plan.events.get(start.0).unwrap().emitted());
    }

    #[test]
    fn delayed_signal_only_fires_once_virtual_time_reaches_it() {
        let mut engine = test_engine();
        let a = engine.plan.add_free_event("a", false);
        let b = engine.plan.add_free_event("b", false);
        engine
            .plan
            .signal
            .link(a, b, plan::SignalInfo { delay: Some(Duration::from_millis(200)) })
            .unwrap();

        engine.emit(a, Context::None);
        engine.run_cycle();
        assert!(!engine.plan.events.get(b.0).unwrap().emitted());

        engine.advance_time(Duration::from_millis(200));
        engine.run_cycle();
        assert!(engine.plan.events.get(b.0).unwrap().emitted());
    }

    #[test]
    fn once_block_runs_exactly_once_across_multiple_cycles() {
        let mut engine = test_engine();
        let count = std::rc::Rc::new(std::cell::RefCell::new(0));
        let count2 = count.clone();
        engine.once(move |_, _| {
            *count2.borrow_mut() += 1;
        });
        engine.run_cycle();
        engine.run_cycle();
        assert_eq!(*count.borrow(), 1);
    }

    #[test]
    fn periodic_block_fires_once_per_elapsed_period() {
        let mut engine = test_engine();
        let count = std::rc::Rc::new(std::cell::RefCell::new(0));
        let count2 = count.clone();
        engine.every(Duration::from_millis(100), move |_, _| {
            *count2.borrow_mut() += 1;
        });
        engine.run_cycle();
        assert_eq!(*count.borrow(), 0);
        engine.advance_time(Duration::from_millis(100));
        engine.run_cycle();
        assert_eq!(*count.borrow(), 1);
        engine.run_cycle();
        assert_eq!(*count.borrow(), 1);
    }

    #[test]
    fn mission_failure_surfaces_as_a_fatal_exception_from_run_cycle() {
        let mut engine = test_engine();
        let m = engine.plan.add_mission_task(task_model());
        let stop = engine.plan.tasks.get(m.0).unwrap().event_id("stop").unwrap();
        engine.plan.set_command(
            stop,
            Box::new(|_ctx, _sink| Err(plan_errors::ExceptionKind::Code(plan_errors::CodeError::new("stop failed")))),
        );
        engine.call(stop, Context::None);
        let fatal = engine.run_cycle();
        assert!(fatal.iter().any(|e| matches!(e.exception, plan_errors::ExceptionKind::MissionFailed)));
    }

    #[test]
    fn unmarking_a_mission_lets_gc_stop_and_finalize_its_dependency() {
        let mut engine = test_engine();
        let m = engine.plan.add_mission_task(task_model());
        let c = engine.plan.add_task(task_model());
        engine.plan.dependency.link(m, c, Default::default()).unwrap();
        engine.plan.tasks.get_mut(m.0).unwrap().lifecycle = plan::Lifecycle::Running;
        engine.plan.tasks.get_mut(c.0).unwrap().lifecycle = plan::Lifecycle::Running;

        for &id in &[m, c] {
            let stop = engine.plan.tasks.get(id.0).unwrap().event_id("stop").unwrap();
            engine.plan.set_command(
                stop,
                Box::new(move |_ctx, sink| {
                    sink.enqueue_emit(stop, Context::None, Vec::new());
                    Ok(())
                }),
            );
        }

        engine.plan.unmark_mission(m);
        engine.run_cycle();
        assert!(!engine.plan.tasks.get(m.0).unwrap().lifecycle.terminated());
        assert!(!engine.plan.tasks.get(c.0).unwrap().lifecycle.terminated());

        engine.run_cycle();
        assert!(engine.plan.tasks.is_empty());
    }

    #[test]
    fn cycle_begin_and_cycle_end_hooks_run_once_per_cycle_in_order() {
        let mut engine = test_engine();
        let order = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let o1 = order.clone();
        let o2 = order.clone();
        engine.at_cycle_begin(move |_, _| o1.borrow_mut().push("begin"));
        engine.at_cycle_end(move |_, _| o2.borrow_mut().push("end"));
        engine.run_cycle();
        assert_eq!(*order.borrow(), vec!["begin", "end"]);
        engine.run_cycle();
        assert_eq!(*order.borrow(), vec!["begin", "end", "begin", "end"]);
    }

    #[test]
    fn execute_runs_immediately_inside_a_cycle_and_is_deferred_outside_one() {
        let mut engine = test_engine();
        assert!(engine.outside_control());
        let count = std::rc::Rc::new(std::cell::RefCell::new(0));
        let count2 = count.clone();
        engine.execute(move |_, _| {
            *count2.borrow_mut() += 1;
        });
        assert_eq!(*count.borrow(), 0);
        engine.run_cycle();
        assert_eq!(*count.borrow(), 1);
        assert!(engine.outside_control());
    }

    #[test]
    fn wait_until_completes_once_the_predicate_holds() {
        let mut engine = test_engine();
        let t = engine.plan.add_task(task_model());
        let handle = engine.wait_until(move |plan| {
            plan.tasks.get(t.0).map(|task| task.lifecycle == plan::Lifecycle::Running).unwrap_or(false)
        });
        assert!(!handle.complete());
        let start = engine.plan.tasks.get(t.0).unwrap().event_id("start").unwrap();
        engine.call(start, Context::None);
        engine.run_cycle();
        assert!(handle.complete());
    }

    #[test]
    fn propagation_handler_consumes_a_matching_synthesized_exception() {
        let mut engine = test_engine();
        let m = engine.plan.add_mission_task(task_model());
        let stop = engine.plan.tasks.get(m.0).unwrap().event_id("stop").unwrap();
        engine.plan.set_command(
            stop,
            Box::new(|_ctx, _sink| Err(plan_errors::ExceptionKind::Code(plan_errors::CodeError::new("stop failed")))),
        );
        engine.add_propagation_handler(
            |exc| matches!(exc, plan_errors::ExceptionKind::MissionFailed),
            |_exc, _plan, _sink| {},
            HandlerErrorPolicy::Ignore,
        );
        engine.call(stop, Context::None);
        let fatal = engine.run_cycle();
        assert!(!fatal.iter().any(|e| matches!(e.exception, plan_errors::ExceptionKind::MissionFailed)));
    }

    #[test]
    fn framework_error_from_an_unhandled_promise_rejection_surfaces_next_cycle() {
        let mut engine = test_engine();
        let promise =
            Promise::new(|_| Err(plan_errors::ExceptionKind::Code(plan_errors::CodeError::new("boom"))));
        let handle = engine.promise(promise, "unhandled");
        engine.executor().block_on(engine.join_all_waiting_work(Duration::from_secs(5)));
        assert!(handle.rejected());

        let fatal = engine.run_cycle();
        assert!(fatal.iter().any(|e| matches!(e.exception, plan_errors::ExceptionKind::Code(_))));
    }

    #[test]
    fn reset_clears_plan_pending_work_and_quit_state() {
        let mut engine = test_engine();
        engine.plan.add_task(task_model());
        engine.quit();
        assert!(engine.is_quitting());
        engine.reset();
        assert!(engine.plan.tasks.is_empty());
        assert!(!engine.is_quitting());
        assert_eq!(engine.cycle_count(), 0);
    }
}
