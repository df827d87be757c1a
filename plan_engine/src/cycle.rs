// Propagation fixpoint drain: spec section 4.5.1 phase 3, and the
// signal/forward ordering and duplicate-merge rules of section 4.5.2.
//
// Grounded on `async_value::AsyncValue`'s "already queued, merge" visit
// bookkeeping for the pending-set merge behavior, and on `graph::Walk`'s
// frontier-driven traversal for the drain loop's pick-and-remove shape.

use fnv::FnvHashMap;
use plan::{CompositeKind, Context, GeneratorKind, Lifecycle, Occurrence, PropagationSink, SignalInfo, Terminal};
use plan_errors::{EventId, ExceptionKind, LocalizedError, Origin};

use crate::Engine;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum DispatchKind {
    Call,
    Emit,
}

pub(crate) struct PendingVisit {
    kind: DispatchKind,
    contexts: Vec<Context>,
    sources: Vec<EventId>,
    step_id: u64,
    signalled: bool,
}

/// Borrows only the pending-visit queue and step counter, not the rest of
/// `Engine`, so a generator's command/handler closures can enqueue follow-up
/// dispatch work while the drain loop still holds `Plan` mutably.
pub(crate) struct DispatchSink<'a> {
    pending: &'a mut FnvHashMap<EventId, PendingVisit>,
    step_counter: &'a mut u64,
}

impl<'a> DispatchSink<'a> {
    pub(crate) fn new(pending: &'a mut FnvHashMap<EventId, PendingVisit>, step_counter: &'a mut u64) -> Self {
        DispatchSink { pending, step_counter }
    }

    fn push(&mut self, event: EventId, kind: DispatchKind, context: Context, sources: Vec<EventId>, signalled: bool) {
        *self.step_counter += 1;
        let step_id = *self.step_counter;
        let entry = self.pending.entry(event).or_insert_with(|| PendingVisit {
            kind,
            contexts: Vec::new(),
            sources: Vec::new(),
            step_id,
            signalled: false,
        });
        entry.contexts.push(context);
        entry.sources.extend(sources);
        entry.step_id = step_id;
        entry.signalled |= signalled;
        if kind == DispatchKind::Call {
            entry.kind = DispatchKind::Call;
        }
    }
}

impl<'a> PropagationSink for DispatchSink<'a> {
    fn enqueue_call(&mut self, event: EventId, context: Context) {
        self.push(event, DispatchKind::Call, context, Vec::new(), true);
    }

    fn enqueue_emit(&mut self, event: EventId, context: Context, sources: Vec<EventId>) {
        self.push(event, DispatchKind::Emit, context, sources, false);
    }
}

/// Drains the pending set to a fixpoint. Each iteration picks one generator
/// (respecting precedence and the signalled-over-forwarded, most-recent-step
/// tie-break), runs it, and lets whatever it enqueues feed the next pick.
pub(crate) fn drain(engine: &mut Engine) -> Vec<LocalizedError> {
    let mut raised = Vec::new();
    while let Some(next) = pick_next(engine) {
        let visit = engine.pending.remove(&next).expect("picked id came out of the pending set");
        let merged = Context::merge(visit.contexts);

        if !is_executable(engine, next) {
            raised.push(LocalizedError::new(Origin::Event(next), ExceptionKind::EventNotExecutable(next)));
            continue;
        }

        crate::engine_trace_log!("dispatching {:?} ({:?}) at step {}", next, visit.kind, visit.step_id);
        if visit.kind == DispatchKind::Call {
            if let Some(err) = check_start_preconditions(engine, next) {
                raised.push(LocalizedError::new(Origin::Event(next), err));
                continue;
            }
        }
        match visit.kind {
            DispatchKind::Call => {
                let mut sink = DispatchSink::new(&mut engine.pending, &mut engine.step_counter);
                let outcome = engine
                    .plan
                    .events
                    .get_mut(next.0)
                    .map(|gen| gen.run_command(&merged, &mut sink));
                if let Some(Err(e)) = outcome {
                    raised.push(LocalizedError::new(Origin::Event(next), substitute_id(e, next)));
                }
            }
            DispatchKind::Emit => dispatch_emit(engine, next, merged, visit.sources),
        }
    }
    raised
}

/// A generator can no longer execute once it's unreachable or, for a
/// task-owned event, once its owning task has already terminated — open
/// question (section 9): rejected with `EventNotExecutable` rather than
/// silently dropped, so a stray signal/forward into a finished task's event
/// surfaces instead of vanishing.
fn is_executable(engine: &Engine, id: EventId) -> bool {
    let Some(gen) = engine.plan.events.get(id.0) else {
        return false;
    };
    if gen.is_unreachable() {
        return false;
    }
    match gen.kind {
        GeneratorKind::Free => true,
        GeneratorKind::TaskOwned(owner) => engine
            .plan
            .tasks
            .get(owner.0)
            .map(|task| !task.lifecycle.terminated())
            .unwrap_or(false),
    }
}

/// `start!(context)` (section 4.3): requires the owning task to be
/// `pending?` and `executable?`, and every declared `needs` event to have
/// already emitted. Only applies to a task's actual `start` generator; any
/// other call passes through untouched.
fn check_start_preconditions(engine: &Engine, id: EventId) -> Option<ExceptionKind> {
    let gen = engine.plan.events.get(id.0)?;
    if gen.name != "start" {
        return None;
    }
    let GeneratorKind::TaskOwned(owner) = gen.kind else {
        return None;
    };
    let task = engine.plan.tasks.get(owner.0)?;
    if !task.pending() || !task.executable() {
        return Some(ExceptionKind::TaskNotExecutable(owner));
    }
    for need in &task.needs {
        let emitted = task
            .event_id(need)
            .and_then(|eid| engine.plan.events.get(eid.0))
            .map(|g| g.emitted())
            .unwrap_or(false);
        if !emitted {
            let missing_event = task.event_id(need).unwrap_or(id);
            return Some(ExceptionKind::EventPreconditionFailed {
                task: owner,
                missing_event,
            });
        }
    }
    None
}

/// `EventGenerator::run_command` can't know its own id, so it stamps
/// `EventNotControllable` with a placeholder; patch in the real one here.
fn substitute_id(e: ExceptionKind, id: EventId) -> ExceptionKind {
    match e {
        ExceptionKind::EventNotControllable(_) => ExceptionKind::EventNotControllable(id),
        other => other,
    }
}

fn pick_next(engine: &Engine) -> Option<EventId> {
    let pending_ids: Vec<EventId> = engine.pending.keys().copied().collect();
    if pending_ids.is_empty() {
        return None;
    }
    let precedence_edges: Vec<(EventId, EventId)> =
        engine.plan.precedence.edges().map(|(s, d, _)| (s, d)).collect();
    let eligible: Vec<EventId> = pending_ids
        .iter()
        .copied()
        .filter(|&id| {
            !precedence_edges
                .iter()
                .any(|&(s, d)| d == id && s != id && engine.pending.contains_key(&s))
        })
        .collect();
    // If precedence alone would stall the drain (a cycle, or every pending
    // id waiting on another pending id), fall back to the full set rather
    // than deadlocking; this only triggers on malformed precedence graphs.
    let candidates = if eligible.is_empty() { pending_ids } else { eligible };
    candidates
        .into_iter()
        .max_by_key(|id| {
            let v = &engine.pending[id];
            (v.signalled, v.step_id)
        })
}

fn dispatch_emit(engine: &mut Engine, id: EventId, context: Context, sources: Vec<EventId>) {
    engine.step_counter += 1;
    let step_id = engine.step_counter;
    let occurrence = match engine.plan.events.get_mut(id.0) {
        Some(gen) => {
            gen.record_emission(step_id, context.clone(), sources.clone());
            Occurrence { step_id, context: context.clone(), sources: sources.clone() }
        }
        None => return,
    };

    let signal_targets: Vec<(EventId, SignalInfo)> = engine
        .plan
        .signal
        .edges()
        .filter(|(s, _, _)| *s == id)
        .map(|(_, d, info)| (d, *info))
        .collect();
    for (target, info) in signal_targets {
        match info.delay {
            Some(delay) => engine
                .delayed_signals
                .push((target, context.clone(), engine.elapsed + delay)),
            None => {
                let mut sink = DispatchSink::new(&mut engine.pending, &mut engine.step_counter);
                sink.enqueue_call(target, context.clone());
            }
        }
    }

    let forward_targets: Vec<EventId> = engine
        .plan
        .forward
        .edges()
        .filter(|(s, _, _)| *s == id)
        .map(|(_, d, _)| d)
        .collect();
    for target in forward_targets {
        let mut sink = DispatchSink::new(&mut engine.pending, &mut engine.step_counter);
        sink.enqueue_emit(target, context.clone(), vec![id]);
    }

    {
        let mut sink = DispatchSink::new(&mut engine.pending, &mut engine.step_counter);
        if let Some(gen) = engine.plan.events.get_mut(id.0) {
            gen.run_handlers(&occurrence, &mut sink);
        }
    }

    drive_composites(engine, id, &occurrence.context);
    update_task_lifecycle(engine, id);
}

/// And/Or composite generators (section 4.2, testable property 5): whenever
/// a source emits, find every composite generator listing it as a source
/// and update its tracking state, enqueueing the composite's own emission
/// once it becomes satisfied.
fn drive_composites(engine: &mut Engine, source: EventId, context: &Context) {
    let composite_ids: Vec<EventId> = engine
        .plan
        .events
        .iter()
        .filter(|(_, gen)| match &gen.composite {
            Some(CompositeKind::And { sources, .. }) => sources.contains(&source),
            Some(CompositeKind::Or { sources, .. }) => sources.contains(&source),
            None => false,
        })
        .map(|(idx, _)| EventId(idx))
        .collect();

    let mut to_fire: Vec<(EventId, Vec<EventId>)> = Vec::new();
    for cid in composite_ids {
        let Some(gen) = engine.plan.events.get_mut(cid.0) else {
            continue;
        };
        match &mut gen.composite {
            Some(CompositeKind::And { sources, satisfied }) => {
                // Only a newly-recorded member can complete the set; a
                // repeat emission of an already-satisfied source is a
                // no-op, so the And doesn't re-fire without an explicit
                // reset.
                if satisfied.insert(source) && sources.iter().all(|s| satisfied.contains(s)) {
                    to_fire.push((cid, sources.clone()));
                }
            }
            Some(CompositeKind::Or { sources, fired, .. }) => {
                if !*fired {
                    *fired = true;
                    to_fire.push((cid, sources.clone()));
                }
            }
            None => {}
        }
    }

    for (cid, sources) in to_fire {
        let mut sink = DispatchSink::new(&mut engine.pending, &mut engine.step_counter);
        sink.enqueue_emit(cid, context.clone(), sources);
    }
}

/// Section 4.3's lifecycle transitions are driven by which of a task's own
/// events just emitted: `start` always means "running"; any event whose
/// `EventModel`/`EventGenerator` is `terminal` means "finishing", and always
/// drives the task's real `stop` generator too, so `stop`'s own history and
/// handlers fire exactly as if it had emitted on its own (section 3's
/// "terminal events of a task always emit the stop event on emission").
fn update_task_lifecycle(engine: &mut Engine, id: EventId) {
    let Some((owner, name, terminal)) = engine.plan.events.get(id.0).and_then(|gen| match gen.kind {
        GeneratorKind::TaskOwned(owner) => Some((owner, gen.name.clone(), gen.terminal)),
        GeneratorKind::Free => None,
    }) else {
        return;
    };

    if name == "start" {
        if let Some(task) = engine.plan.tasks.get_mut(owner.0) {
            task.transition_start_emitted();
        }
        return;
    }

    if !terminal {
        return;
    }

    let stop_id = engine.plan.tasks.get(owner.0).and_then(|t| t.event_id("stop"));

    if stop_id == Some(id) {
        if let Some(task) = engine.plan.tasks.get_mut(owner.0) {
            if task.lifecycle == Lifecycle::Running {
                task.transition_finishing(Terminal::Stop);
            }
            task.transition_terminated();
        }
        return;
    }

    let terminal_kind = match name.as_str() {
        "success" => Terminal::Success,
        "failed" => Terminal::Failed,
        _ => Terminal::Stop,
    };
    if let Some(task) = engine.plan.tasks.get_mut(owner.0) {
        if task.lifecycle == Lifecycle::Running {
            task.transition_finishing(terminal_kind);
        }
    }

    if let Some(stop_id) = stop_id {
        let context = engine
            .plan
            .events
            .get(id.0)
            .and_then(|g| g.last_occurrence())
            .map(|occ| occ.context.clone())
            .unwrap_or(Context::None);
        let mut sink = DispatchSink::new(&mut engine.pending, &mut engine.step_counter);
        sink.enqueue_emit(stop_id, context, vec![id]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plan::{Plan, TaskModel};
    use task_executor::Executor;

    fn task_model() -> std::rc::Rc<TaskModel> {
        let mut model = TaskModel::new("Job");
        model.declare_event("start", true, false);
        model.declare_event("success", false, true);
        model.declare_event("stop", true, true);
        std::rc::Rc::new(model)
    }

    fn test_engine() -> Engine {
        Engine::new(Plan::new(), Executor::new_owned(1, 2).unwrap(), crate::EngineConfig::default())
    }

    #[test]
    fn signal_then_forward_merges_duplicate_emissions_in_one_drain() {
        let _logger = env_logger::try_init();
        let mut engine = test_engine();
        let a = engine.plan.add_free_event("a", false);
        let b = engine.plan.add_free_event("b", false);
        engine.plan.forward.link(a, b, ()).unwrap();
        engine.emit(a, Context::Int(1));
        let raised = drain(&mut engine);
        assert!(raised.is_empty());
        let b_gen = engine.plan.events.get(b.0).unwrap();
        assert!(b_gen.emitted());
    }

    #[test]
    fn command_call_transitions_task_into_running() {
        let mut engine = test_engine();
        let t = engine.plan.add_task(task_model());
        let start = engine.plan.tasks.get(t.0).unwrap().event_id("start").unwrap();
        engine.call(start, Context::None);
        drain(&mut engine);
        assert_eq!(engine.plan.tasks.get(t.0).unwrap().lifecycle, plan::Lifecycle::Running);
    }

    #[test]
    fn call_into_a_terminated_tasks_event_is_rejected() {
        let mut engine = test_engine();
        let t = engine.plan.add_task(task_model());
        engine.plan.tasks.get_mut(t.0).unwrap().lifecycle = plan::Lifecycle::Succeeded;
        let success = engine.plan.tasks.get(t.0).unwrap().event_id("success").unwrap();
        engine.emit(success, Context::None);
        let raised = drain(&mut engine);
        assert!(raised
            .iter()
            .any(|e| matches!(e.kind, ExceptionKind::EventNotExecutable(id) if id == success)));
        assert!(!engine.plan.events.get(success.0).unwrap().emitted());
    }

    #[test]
    fn precedence_blocks_start_until_updated_data_resolves() {
        let mut engine = test_engine();
        let t = engine.plan.add_task(task_model());
        let task = engine.plan.tasks.get(t.0).unwrap();
        let start = task.event_id("start").unwrap();
        let updated_data = task.event_id("updated_data").unwrap();
        // start is enqueued first, but precedence(updated_data -> start)
        // means updated_data must be picked before start regardless of
        // enqueue order or step_id.
        engine.call(start, Context::None);
        engine.emit(updated_data, Context::None);
        assert_eq!(pick_next(&engine), Some(updated_data));
        drain(&mut engine);
        assert!(engine.plan.events.get(updated_data.0).unwrap().emitted());
        assert_eq!(engine.plan.tasks.get(t.0).unwrap().lifecycle, plan::Lifecycle::Running);
    }

    /// Scenario S1: two `start` handlers each emit `success` with the
    /// start occurrence's own context; the duplicate emissions merge into
    /// one `success` dispatch, and `success` being terminal drives `stop`
    /// with that same merged context.
    #[test]
    fn terminal_event_other_than_stop_drives_the_real_stop_generator() {
        let _logger = env_logger::try_init();
        let mut engine = test_engine();
        let t = engine.plan.add_task(task_model());
        let task = engine.plan.tasks.get(t.0).unwrap();
        let start = task.event_id("start").unwrap();
        let success = task.event_id("success").unwrap();
        let stop = task.event_id("stop").unwrap();

        let success_calls = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let stop_calls = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let success_calls2 = success_calls.clone();
        let stop_calls2 = stop_calls.clone();

        engine.plan.events.get_mut(start.0).unwrap().handlers.push(Box::new(move |occ, sink| {
            sink.enqueue_emit(success, occ.context.clone(), Vec::new());
        }));
        engine.plan.events.get_mut(start.0).unwrap().handlers.push(Box::new(move |occ, sink| {
            sink.enqueue_emit(success, occ.context.clone(), Vec::new());
        }));
        engine.plan.events.get_mut(success.0).unwrap().handlers.push(Box::new(move |occ, _sink| {
            success_calls2.borrow_mut().push(occ.context.clone());
        }));
        engine.plan.events.get_mut(stop.0).unwrap().handlers.push(Box::new(move |occ, _sink| {
            stop_calls2.borrow_mut().push(occ.context.clone());
        }));

        engine.call(start, Context::Int(42));
        drain(&mut engine);

        let merged = Context::List(vec![Context::Int(42), Context::Int(42)]);
        assert_eq!(success_calls.borrow().as_slice(), [merged.clone()]);
        assert_eq!(stop_calls.borrow().as_slice(), [merged]);
        assert_eq!(engine.plan.tasks.get(t.0).unwrap().lifecycle, plan::Lifecycle::Succeeded);
    }

    #[test]
    fn start_fails_when_a_needed_event_has_not_emitted() {
        let mut engine = test_engine();
        let t = engine.plan.add_task(task_model());
        engine.plan.tasks.get_mut(t.0).unwrap().needs.push("success".to_string());
        let start = engine.plan.tasks.get(t.0).unwrap().event_id("start").unwrap();

        engine.call(start, Context::None);
        let raised = drain(&mut engine);

        assert!(raised.iter().any(|e| matches!(
            e.kind,
            ExceptionKind::EventPreconditionFailed { task, .. } if task == t
        )));
        assert_eq!(engine.plan.tasks.get(t.0).unwrap().lifecycle, plan::Lifecycle::Pending);
        assert!(!engine.plan.events.get(start.0).unwrap().emitted());
    }

    #[test]
    fn starting_an_already_running_task_again_is_rejected() {
        let mut engine = test_engine();
        let t = engine.plan.add_task(task_model());
        let start = engine.plan.tasks.get(t.0).unwrap().event_id("start").unwrap();

        engine.call(start, Context::None);
        drain(&mut engine);
        assert_eq!(engine.plan.tasks.get(t.0).unwrap().lifecycle, plan::Lifecycle::Running);

        engine.call(start, Context::None);
        let raised = drain(&mut engine);
        assert!(raised
            .iter()
            .any(|e| matches!(e.kind, ExceptionKind::TaskNotExecutable(id) if id == t)));
    }

    #[test]
    fn and_generator_emits_once_every_source_has_emitted_since_reset() {
        let mut engine = test_engine();
        let a = engine.plan.add_free_event("a", false);
        let b = engine.plan.add_free_event("b", false);
        let and_id = engine.plan.add_and_generator("both", vec![a, b], false);

        engine.emit(a, Context::None);
        drain(&mut engine);
        assert!(!engine.plan.events.get(and_id.0).unwrap().emitted());

        engine.emit(b, Context::None);
        drain(&mut engine);
        assert!(engine.plan.events.get(and_id.0).unwrap().emitted());

        // Re-emitting an already-satisfied source does not re-fire without
        // an explicit reset.
        let fired_once = engine.plan.events.get(and_id.0).unwrap().history.len();
        engine.emit(a, Context::None);
        drain(&mut engine);
        assert_eq!(engine.plan.events.get(and_id.0).unwrap().history.len(), fired_once);
    }

    #[test]
    fn or_generator_emits_on_first_source_and_not_again_until_reset() {
        let mut engine = test_engine();
        let a = engine.plan.add_free_event("a", false);
        let b = engine.plan.add_free_event("b", false);
        let or_id = engine.plan.add_or_generator("either", vec![a, b], false);

        engine.emit(a, Context::None);
        drain(&mut engine);
        assert_eq!(engine.plan.events.get(or_id.0).unwrap().history.len(), 1);

        engine.emit(b, Context::None);
        drain(&mut engine);
        assert_eq!(engine.plan.events.get(or_id.0).unwrap().history.len(), 1);

        engine.plan.events.get_mut(or_id.0).unwrap().reset_composite();
        engine.emit(b, Context::None);
        drain(&mut engine);
        assert_eq!(engine.plan.events.get(or_id.0).unwrap().history.len(), 2);
    }
}
