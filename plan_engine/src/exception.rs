// Exception propagation: spec section 4.5.3.
//
// Grounded on `graph::InnerGraph::invalidate_from_roots`'s shape of staging a
// predicate-selected id set and then acting on it, generalized here from
// "invalidate everything downstream" to "walk dependency ancestors offering
// each a chance to handle, synthesizing ChildFailed/MissionFailed/
// PermanentTaskError for whatever is still fatal once the walk ends".
//
// A handler consuming the exception stops the walk only on its own branch: the
// task that handled it is left out of `affected` and its own parents are never
// enqueued, but a sibling branch already queued (a different parent of a
// shared descendant, at a diamond) keeps walking independently. `visited`
// still guards against revisiting the same task from two branches at once.

use fnv::FnvHashSet;
use plan::{GeneratorKind, HandlerOutcome};
use plan_errors::{ExceptionKind, LocalizedError, Origin, TaskId};

use crate::Engine;

/// A raised exception anchored at its origin, with the ancestor chain walked
/// while looking for a handler and the tasks a still-fatal exception affects
/// (the origin task plus every ancestor offered a chance to handle it).
#[derive(Clone, Debug)]
pub struct ExecutionException {
    pub exception: ExceptionKind,
    pub origin: Origin,
    pub trace: Vec<Origin>,
    pub affected_tasks: Vec<TaskId>,
}

pub(crate) fn propagate(engine: &mut Engine, raw: Vec<LocalizedError>) -> Vec<ExecutionException> {
    let mut fatal = Vec::new();
    for err in raw {
        if let Some(exc) = propagate_one(engine, err) {
            synthesize(engine, &exc, &mut fatal);
            fatal.push(exc);
        }
    }
    fatal
}

fn owning_task(engine: &Engine, origin: Origin) -> Option<TaskId> {
    match origin {
        Origin::Task(t) => Some(t),
        Origin::Event(e) => engine.plan.events.get(e.0).and_then(|gen| match gen.kind {
            GeneratorKind::TaskOwned(t) => Some(t),
            GeneratorKind::Free => None,
        }),
    }
}

fn direct_parents(engine: &Engine, task: TaskId) -> Vec<TaskId> {
    engine
        .plan
        .dependency
        .edges()
        .filter(|(_, d, _)| *d == task)
        .map(|(s, _, _)| s)
        .collect()
}

/// Walks from the origin task up through its dependency parents, offering
/// each a chance to handle the exception, closest first. Returns `None` once
/// any task on the walk (or the plan-level fallback) handles it.
fn propagate_one(engine: &mut Engine, err: LocalizedError) -> Option<ExecutionException> {
    let mut exc = ExecutionException {
        exception: err.kind.clone(),
        origin: err.origin,
        trace: vec![err.origin],
        affected_tasks: Vec::new(),
    };

    let Some(origin_task) = owning_task(engine, err.origin) else {
        return handled_by_plan(engine, exc.exception.clone()).then_some(exc);
    };

    let mut visited = FnvHashSet::default();
    let mut frontier = vec![origin_task];
    let mut affected = Vec::new();
    while let Some(current) = frontier.pop() {
        if !visited.insert(current) {
            continue;
        }
        let handled = engine
            .plan
            .tasks
            .get_mut(current.0)
            .map(|task| task.handle_exception(&exc.exception) == HandlerOutcome::Handled)
            .unwrap_or(false);
        if handled {
            continue;
        }
        affected.push(current);
        if current != origin_task {
            exc.trace.push(Origin::Task(current));
        }
        frontier.extend(direct_parents(engine, current));
    }

    if affected.is_empty() || handled_by_plan(engine, exc.exception.clone()) {
        return None;
    }

    exc.affected_tasks = affected;
    Some(exc)
}

fn handled_by_plan(engine: &mut Engine, exception: ExceptionKind) -> bool {
    engine.plan.handle_exception(&exception) == HandlerOutcome::Handled
}

/// Synthesizes the `ChildFailed`/`MissionFailed`/`PermanentTaskError`
/// exceptions section 4.5.3 says a still-fatal exception generates once it
/// reaches the tasks it transitively affects.
fn synthesize(engine: &Engine, exc: &ExecutionException, fatal: &mut Vec<ExecutionException>) {
    let Some(&origin_task) = exc.affected_tasks.first() else {
        return;
    };
    for &task in &exc.affected_tasks {
        if task != origin_task {
            fatal.push(ExecutionException {
                exception: ExceptionKind::ChildFailed { child: origin_task },
                origin: Origin::Task(task),
                trace: vec![Origin::Task(task)],
                affected_tasks: vec![task],
            });
        }
        if engine.plan.missions.contains(&task) {
            fatal.push(ExecutionException {
                exception: ExceptionKind::MissionFailed,
                origin: Origin::Task(task),
                trace: vec![Origin::Task(task)],
                affected_tasks: vec![task],
            });
        }
        if engine.plan.permanents.contains(&task) {
            fatal.push(ExecutionException {
                exception: ExceptionKind::PermanentTaskError,
                origin: Origin::Task(task),
                trace: vec![Origin::Task(task)],
                affected_tasks: vec![task],
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plan::{Plan, TaskModel};
    use plan_errors::CodeError;
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
    fn unhandled_exception_on_a_mission_synthesizes_mission_failed() {
        let mut engine = test_engine();
        let m = engine.plan.add_mission_task(task_model());
        let err = LocalizedError::new(Origin::Task(m), ExceptionKind::Code(CodeError::new("boom")));
        let fatal = propagate(&mut engine, vec![err]);
        assert!(fatal.iter().any(|e| matches!(e.exception, ExceptionKind::MissionFailed)));
    }

    #[test]
    fn a_handling_task_stops_propagation_before_mission_failed_fires() {
        let mut engine = test_engine();
        let m = engine.plan.add_mission_task(task_model());
        let c = engine.plan.add_task(task_model());
        engine.plan.dependency.link(m, c, Default::default()).unwrap();
        engine.plan.tasks.get_mut(c.0).unwrap().exception_handlers.push(plan::ExceptionHandler {
            matches: Box::new(|_| true),
            callback: Box::new(|_| HandlerOutcome::Handled),
        });
        let err = LocalizedError::new(Origin::Task(c), ExceptionKind::Code(CodeError::new("boom")));
        let fatal = propagate(&mut engine, vec![err]);
        assert!(fatal.is_empty());
    }

    #[test]
    fn dependency_parent_of_a_failing_child_gets_child_failed() {
        let mut engine = test_engine();
        let parent = engine.plan.add_task(task_model());
        let child = engine.plan.add_task(task_model());
        engine.plan.dependency.link(parent, child, Default::default()).unwrap();
        let err = LocalizedError::new(Origin::Task(child), ExceptionKind::Code(CodeError::new("boom")));
        let fatal = propagate(&mut engine, vec![err]);
        assert!(fatal
            .iter()
            .any(|e| e.origin == Origin::Task(parent) && matches!(e.exception, ExceptionKind::ChildFailed { child: c } if c == child)));
    }

    /// Diamond: `left` and `right` both depend on the failing `leaf`, and
    /// `root` (a mission) depends on both. `left` has a handler that
    /// consumes the exception; `right` does not. `root` is still reachable
    /// through `right`, so `MissionFailed` must still fire for it even
    /// though `left`'s branch swallowed the exception.
    #[test]
    fn a_handler_on_one_branch_does_not_suppress_a_sibling_branch_at_a_diamond() {
        let mut engine = test_engine();
        let leaf = engine.plan.add_task(task_model());
        let left = engine.plan.add_task(task_model());
        let right = engine.plan.add_task(task_model());
        let root = engine.plan.add_mission_task(task_model());
        engine.plan.dependency.link(left, leaf, Default::default()).unwrap();
        engine.plan.dependency.link(right, leaf, Default::default()).unwrap();
        engine.plan.dependency.link(root, left, Default::default()).unwrap();
        engine.plan.dependency.link(root, right, Default::default()).unwrap();
        engine.plan.tasks.get_mut(left.0).unwrap().exception_handlers.push(plan::ExceptionHandler {
            matches: Box::new(|_| true),
            callback: Box::new(|_| HandlerOutcome::Handled),
        });

        let err = LocalizedError::new(Origin::Task(leaf), ExceptionKind::Code(CodeError::new("boom")));
        let fatal = propagate(&mut engine, vec![err]);

        assert!(fatal.iter().any(|e| matches!(e.exception, ExceptionKind::MissionFailed)));
        assert!(fatal
            .iter()
            .any(|e| e.origin == Origin::Task(root) && matches!(e.exception, ExceptionKind::ChildFailed { child } if child == leaf)));
    }
}
