// Quit protocol: spec section 4.5.6. The first `quit()` asks every mission
// to stop and starts a dead-zone timer; a second request inside that window
// escalates straight to a forced shutdown, which quarantines whatever isn't
// cleanly stoppable instead of waiting on it.

use plan::{Context, PropagationSink};

use crate::cycle::DispatchSink;
use crate::Engine;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum QuitState {
    Running,
    Quitting { since: std::time::Duration },
    Forced,
}

pub(crate) fn request_quit(engine: &mut Engine) {
    engine.quit_state = match engine.quit_state {
        QuitState::Running => QuitState::Quitting { since: engine.elapsed },
        QuitState::Quitting { since } => {
            if engine.elapsed - since < engine.config.quit_dead_zone {
                QuitState::Forced
            } else {
                QuitState::Quitting { since }
            }
        }
        QuitState::Forced => QuitState::Forced,
    };
}

/// Auto-escalates a quit request whose dead zone has elapsed without every
/// mission stopping, and asks outstanding missions to stop (or quarantines
/// them once forced).
pub(crate) fn drive(engine: &mut Engine) {
    if matches!(engine.quit_state, QuitState::Running) {
        return;
    }
    if let QuitState::Quitting { since } = engine.quit_state {
        if engine.elapsed - since >= engine.config.quit_dead_zone {
            engine.quit_state = QuitState::Forced;
        }
    }
    let forced = matches!(engine.quit_state, QuitState::Forced);

    let missions: Vec<_> = engine.plan.missions.iter().copied().collect();
    for id in missions {
        let Some(task) = engine.plan.tasks.get(id.0) else {
            continue;
        };
        if task.lifecycle.terminated() {
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
            _ if forced => {
                if let Some(task) = engine.plan.tasks.get_mut(id.0) {
                    task.quarantine();
                    log::warn!("task {} quarantined during forced quit: stop is not controllable", id.0);
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plan::{Plan, TaskModel};
    use std::time::Duration;
    use task_executor::Executor;

    fn task_model() -> std::rc::Rc<TaskModel> {
        let mut model = TaskModel::new("Job");
        model.declare_event("start", true, false);
        model.declare_event("stop", true, true);
        std::rc::Rc::new(model)
    }

    #[test]
    fn second_quit_within_dead_zone_forces_shutdown() {
        let mut engine = Engine::new(Plan::new(), Executor::new_owned(1, 2).unwrap(), crate::EngineConfig::default());
        engine.quit();
        assert!(matches!(engine.quit_state, QuitState::Quitting { .. }));
        engine.advance_time(Duration::from_millis(1));
        engine.quit();
        assert!(matches!(engine.quit_state, QuitState::Forced));
    }

    #[test]
    fn dead_zone_elapsing_auto_escalates_without_a_second_call() {
        let mut engine = Engine::new(Plan::new(), Executor::new_owned(1, 2).unwrap(), crate::EngineConfig {
            quit_dead_zone: Duration::from_millis(50),
            ..Default::default()
        });
        engine.quit();
        engine.advance_time(Duration::from_millis(100));
        drive(&mut engine);
        assert!(matches!(engine.quit_state, QuitState::Forced));
    }

    #[test]
    fn forced_quit_quarantines_a_mission_with_no_controllable_stop() {
        let mut engine = Engine::new(Plan::new(), Executor::new_owned(1, 2).unwrap(), crate::EngineConfig::default());
        let mut model = TaskModel::new("Uncontrollable");
        model.declare_event("stop", false, true);
        let t = engine.plan.add_mission_task(std::rc::Rc::new(model));
        engine.plan.tasks.get_mut(t.0).unwrap().lifecycle = plan::Lifecycle::Running;
        engine.force_quit();
        drive(&mut engine);
        assert!(engine.plan.tasks.get(t.0).unwrap().quarantined);
    }

    #[test]
    fn quitting_a_stoppable_mission_enqueues_its_stop_call() {
        let mut engine = Engine::new(Plan::new(), Executor::new_owned(1, 2).unwrap(), crate::EngineConfig::default());
        let t = engine.plan.add_mission_task(task_model());
        engine.plan.tasks.get_mut(t.0).unwrap().lifecycle = plan::Lifecycle::Running;
        engine.quit();
        drive(&mut engine);
        let stop = engine.plan.tasks.get(t.0).unwrap().event_id("stop").unwrap();
        assert!(engine.pending.contains_key(&stop));
    }
}
