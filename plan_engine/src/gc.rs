// Garbage collection: spec section 4.5.4.
//
// Grounded on `graph::InnerGraph::invalidate_from_roots`: stage the
// GC-candidate set first (via `Plan::protected_tasks`, minus active repair
// targets), then act on each candidate in one pass instead of mutating the
// plan while computing liveness.

use fnv::FnvHashSet;
use plan::{Context, GeneratorKind, PropagationSink};
#[cfg(test)]
use plan::Lifecycle;
use plan_errors::{EventId, TaskId};

use crate::cycle::DispatchSink;
use crate::Engine;

pub(crate) fn collect(engine: &mut Engine) {
    collect_tasks(engine);
    collect_free_events(engine);
}

fn collect_tasks(engine: &mut Engine) {
    let protected = engine.plan.protected_tasks();
    let repair_targets: FnvHashSet<TaskId> = engine.plan.repairs.values().copied().collect();
    let candidates: Vec<TaskId> = engine
        .plan
        .tasks
        .iter()
        .map(|(idx, _)| TaskId(idx))
        .filter(|id| !protected.contains(id) && !repair_targets.contains(id))
        .collect();

    for id in candidates {
        let Some(task) = engine.plan.tasks.get(id.0) else {
            continue;
        };
        if task.pending() || task.lifecycle.terminated() {
            crate::engine_trace_log!("gc finalizing task {} ({:?})", id.0, task.lifecycle);
            engine.plan.remove_task(id);
            continue;
        }
        if task.quarantined {
            continue;
        }

        let stop_id = task.event_id("stop");
        let stoppable = stop_id
            .and_then(|stop| engine.plan.events.get(stop.0))
            .map(|gen| gen.controllable())
            .unwrap_or(false);
        match (stop_id, stoppable) {
            (Some(stop), true) => {
                let mut sink = DispatchSink::new(&mut engine.pending, &mut engine.step_counter);
                sink.enqueue_call(stop, Context::None);
            }
            _ => {
                if let Some(task) = engine.plan.tasks.get_mut(id.0) {
                    task.quarantine();
                    log::warn!("task {} quarantined during gc: not cleanly stoppable", id.0);
                }
            }
        }
    }
}

/// A free event survives collection if it's marked permanent, or if it can
/// still be reached (ignoring direction) from some live task-owned event
/// over the signal or forward relations.
fn collect_free_events(engine: &mut Engine) {
    let live_task_events: Vec<EventId> = engine
        .plan
        .tasks
        .iter()
        .flat_map(|(_, t)| t.events.values().copied())
        .collect();

    let reach_signal = engine.plan.signal.undirected().generated_subgraphs(&live_task_events, false);
    let reach_forward = engine.plan.forward.undirected().generated_subgraphs(&live_task_events, false);

    let free_ids: Vec<EventId> = engine
        .plan
        .events
        .iter()
        .filter(|(_, gen)| matches!(gen.kind, GeneratorKind::Free))
        .map(|(idx, _)| EventId(idx))
        .collect();

    for id in free_ids {
        let permanent = engine.plan.permanent_events.contains(&id);
        let reachable = reach_signal.contains(id) || reach_forward.contains(id);
        if !permanent && !reachable {
            engine.plan.remove_free_event(id);
        }
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
        model.declare_event("stop", true, true);
        std::rc::Rc::new(model)
    }

    fn test_engine() -> Engine {
        Engine::new(Plan::new(), Executor::new_owned(1, 2).unwrap(), crate::EngineConfig::default())
    }

    #[test]
    fn pending_unreferenced_task_is_finalized_immediately() {
        let mut engine = test_engine();
        let t = engine.plan.add_task(task_model());
        collect(&mut engine);
        assert!(engine.plan.tasks.get(t.0).is_none());
    }

    #[test]
    fn unprotected_running_task_with_a_controllable_stop_gets_stop_called() {
        let mut engine = test_engine();
        let t = engine.plan.add_task(task_model());
        engine.plan.tasks.get_mut(t.0).unwrap().lifecycle = Lifecycle::Running;
        collect(&mut engine);
        let stop = engine.plan.tasks.get(t.0).unwrap().event_id("stop").unwrap();
        assert!(engine.pending.contains_key(&stop));
        assert!(engine.plan.tasks.get(t.0).is_some());
    }

    #[test]
    fn mission_and_its_dependency_are_protected_from_collection() {
        let mut engine = test_engine();
        let m = engine.plan.add_mission_task(task_model());
        let c = engine.plan.add_task(task_model());
        engine.plan.dependency.link(m, c, Default::default()).unwrap();
        engine.plan.tasks.get_mut(m.0).unwrap().lifecycle = Lifecycle::Running;
        engine.plan.tasks.get_mut(c.0).unwrap().lifecycle = Lifecycle::Running;
        collect(&mut engine);
        assert!(engine.plan.tasks.get(m.0).is_some());
        assert!(engine.plan.tasks.get(c.0).is_some());
        assert!(engine.pending.is_empty());
    }

    #[test]
    fn unreferenced_running_task_without_controllable_stop_is_quarantined() {
        let mut engine = test_engine();
        let mut model = TaskModel::new("Uncontrollable");
        model.declare_event("start", true, false);
        model.declare_event("stop", false, true);
        let t = engine.plan.add_task(std::rc::Rc::new(model));
        engine.plan.tasks.get_mut(t.0).unwrap().lifecycle = Lifecycle::Running;
        collect(&mut engine);
        assert!(engine.plan.tasks.get(t.0).unwrap().quarantined);
    }

    #[test]
    fn free_event_signalling_a_live_task_event_survives_collection() {
        let mut engine = test_engine();
        let t = engine.plan.add_task(task_model());
        let start = engine.plan.tasks.get(t.0).unwrap().event_id("start").unwrap();
        let trigger = engine.plan.add_free_event("trigger", false);
        engine.plan.signal.link(trigger, start, Default::default()).unwrap();

        collect_free_events(&mut engine);
        assert!(engine.plan.events.get(trigger.0).is_some());
    }

    #[test]
    fn unconnected_free_event_is_collected() {
        let mut engine = test_engine();
        let orphan = engine.plan.add_free_event("orphan", false);
        collect_free_events(&mut engine);
        assert!(engine.plan.events.get(orphan.0).is_none());
    }
}
