// Plan: section 4.4. Owns the arenas, the per-relation graphs, and the
// mission/permanent/repair indices.
//
// Grounded on `graph::Graph<N>`/`graph::InnerGraph<N>`: the `Nodes<N> =
// HashMap<N, EntryId>` side index generalizes here into the task/event
// arenas plus the mission/permanent/repair `FnvHashSet`/`FnvHashMap`
// indices, and `invalidate_from_roots`'s "stage a predicate-selected id set,
// then mutate" shape is the template for `repairs_for`'s forward-chain walk.

use fnv::{FnvHashMap, FnvHashSet};

use crate::event::{EventGenerator, GeneratorKind};
use crate::task::{HandlerOutcome, Task, TaskModel};
use crate::Arena;
use plan_errors::{EventId, ExceptionKind, TaskId};
use relation_graph::{EdgeMask, RelationGraph};

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct DependencyInfo {
    pub optional: bool,
}

pub type StructureCheck = Box<dyn Fn(&Plan) -> Vec<(ExceptionKind, Vec<TaskId>)>>;

pub struct PlanExceptionHandler {
    pub matches: Box<dyn Fn(&ExceptionKind) -> bool>,
    pub callback: Box<dyn FnMut(&ExceptionKind) -> HandlerOutcome>,
}

pub struct Plan {
    pub tasks: Arena<Task>,
    pub events: Arena<EventGenerator>,
    pub signal: RelationGraph<EventId, crate::event::SignalInfo>,
    pub forward: RelationGraph<EventId, ()>,
    pub precedence: RelationGraph<EventId, ()>,
    pub dependency: RelationGraph<TaskId, DependencyInfo>,
    pub error_handling: RelationGraph<TaskId, ()>,
    pub planned_by: RelationGraph<TaskId, ()>,
    pub missions: FnvHashSet<TaskId>,
    pub permanents: FnvHashSet<TaskId>,
    pub permanent_events: FnvHashSet<EventId>,
    pub repairs: FnvHashMap<EventId, TaskId>,
    pub structure_checks: Vec<StructureCheck>,
    pub exception_handlers: Vec<PlanExceptionHandler>,
}

impl Plan {
    pub fn new() -> Self {
        Plan {
            tasks: Arena::new(),
            events: Arena::new(),
            signal: RelationGraph::new(false),
            forward: RelationGraph::new(false),
            precedence: RelationGraph::new(false),
            dependency: RelationGraph::new(true),
            error_handling: RelationGraph::new(false),
            planned_by: RelationGraph::new(false),
            missions: FnvHashSet::default(),
            permanents: FnvHashSet::default(),
            permanent_events: FnvHashSet::default(),
            repairs: FnvHashMap::default(),
            structure_checks: Vec::new(),
            exception_handlers: Vec::new(),
        }
    }

    /// Adds a task of `model`, instantiating one `EventGenerator` per
    /// model-declared event. If the model declares both `start` and `stop`,
    /// an implicit `updated_data` pseudo-event is created with a precedence
    /// edge into `start` (section 4.3: "signalling start signals the
    /// updated_data pseudo-event via an implicit precedence").
    pub fn add_task(&mut self, model: std::rc::Rc<TaskModel>) -> TaskId {
        let events_decl = model.events.clone();
        let task = Task::new(model);
        let task_idx = self.tasks.insert(task);
        let task_id = TaskId(task_idx);

        for decl in &events_decl {
            let eid = self.add_owned_event(task_id, &decl.name, decl.controllable, decl.terminal);
            self.tasks
                .get_mut(task_id.0)
                .unwrap()
                .events
                .insert(decl.name.clone(), eid);
        }

        let has_start_and_stop = {
            let task = self.tasks.get(task_id.0).unwrap();
            task.events.contains_key("start") && task.events.contains_key("stop")
        };
        if has_start_and_stop {
            let start = *self.tasks.get(task_id.0).unwrap().events.get("start").unwrap();
            let updated_data = self.add_owned_event(task_id, "updated_data", false, false);
            self.tasks
                .get_mut(task_id.0)
                .unwrap()
                .events
                .insert("updated_data".to_string(), updated_data);
            let _ = self.precedence.link(updated_data, start, ());
        }

        task_id
    }

    /// Creates a task-owned event generator. A controllable event's default
    /// command simply emits itself with the context it was called with;
    /// callers that need a real command (e.g. a task's `start` event running
    /// user setup code) replace it via `Plan::set_command` after the task is
    /// constructed.
    fn add_owned_event(
        &mut self,
        owner: TaskId,
        name: &str,
        controllable: bool,
        terminal: bool,
    ) -> EventId {
        let gen = EventGenerator::new(name, GeneratorKind::TaskOwned(owner), terminal);
        let id = EventId(self.events.insert(gen));
        if controllable {
            self.events.get_mut(id.0).unwrap().command = Some(Box::new(move |ctx, sink| {
                sink.enqueue_emit(id, ctx.clone(), Vec::new());
                Ok(())
            }));
        }
        id
    }

    /// Replaces an event's command, e.g. to give a task's `start` event
    /// behavior beyond "emit immediately".
    pub fn set_command(&mut self, event: EventId, command: crate::event::Command) {
        if let Some(gen) = self.events.get_mut(event.0) {
            gen.command = Some(command);
        }
    }

    pub fn add_mission_task(&mut self, model: std::rc::Rc<TaskModel>) -> TaskId {
        let id = self.add_task(model);
        self.missions.insert(id);
        id
    }

    pub fn add_permanent_task(&mut self, model: std::rc::Rc<TaskModel>) -> TaskId {
        let id = self.add_task(model);
        self.permanents.insert(id);
        id
    }

    pub fn unmark_mission(&mut self, id: TaskId) {
        self.missions.remove(&id);
    }

    pub fn unmark_permanent(&mut self, id: TaskId) {
        self.permanents.remove(&id);
    }

    pub fn add_free_event(&mut self, name: impl Into<String>, terminal: bool) -> EventId {
        EventId(
            self.events
                .insert(EventGenerator::new(name, GeneratorKind::Free, terminal)),
        )
    }

    pub fn add_permanent_event(&mut self, id: EventId) {
        self.permanent_events.insert(id);
    }

    /// Adds an `AndGenerator`: a free event that emits once every one of
    /// `sources` has emitted since the last reset (section 4.2).
    pub fn add_and_generator(
        &mut self,
        name: impl Into<String>,
        sources: Vec<EventId>,
        terminal: bool,
    ) -> EventId {
        EventId(self.events.insert(EventGenerator::new_and(name, sources, terminal)))
    }

    /// Adds an `OrGenerator`: a free event that emits on the first emission
    /// of any of `sources`, and not again until reset.
    pub fn add_or_generator(
        &mut self,
        name: impl Into<String>,
        sources: Vec<EventId>,
        terminal: bool,
    ) -> EventId {
        EventId(self.events.insert(EventGenerator::new_or(name, sources, terminal)))
    }

    pub fn remove_free_event(&mut self, id: EventId) {
        self.permanent_events.remove(&id);
        self.signal.remove(id);
        self.forward.remove(id);
        self.precedence.remove(id);
        self.events.remove(id.0);
    }

    /// Removes a task and all of its owned events from the plan, clearing it
    /// from every index and relation graph. Used both by explicit API calls
    /// and by the engine's GC finalization step.
    pub fn remove_task(&mut self, id: TaskId) {
        self.missions.remove(&id);
        self.permanents.remove(&id);
        self.dependency.remove(id);
        self.error_handling.remove(id);
        self.planned_by.remove(id);
        self.repairs.retain(|_, &mut repair_task| repair_task != id);

        if let Some(task) = self.tasks.get(id.0) {
            let owned: Vec<EventId> = task.events.values().copied().collect();
            for eid in owned {
                self.signal.remove(eid);
                self.forward.remove(eid);
                self.precedence.remove(eid);
                self.permanent_events.remove(&eid);
                self.events.remove(eid.0);
            }
        }
        self.tasks.remove(id.0);
    }

    /// The set of tasks that GC must not collect: those transitively
    /// required by a mission/permanent task via the (strong) dependency
    /// relation, minus any that have been quarantined (section 4.4's
    /// invariant).
    pub fn protected_tasks(&self) -> FnvHashSet<TaskId> {
        let seeds: Vec<TaskId> = self
            .missions
            .iter()
            .chain(self.permanents.iter())
            .copied()
            .collect();
        if seeds.is_empty() {
            return FnvHashSet::default();
        }
        let reached = self.dependency.generated_subgraphs(&seeds, false);
        reached
            .vertices()
            .filter(|id| {
                !self
                    .tasks
                    .get(id.0)
                    .map(|t| t.quarantined)
                    .unwrap_or(false)
            })
            .collect()
    }

    fn forward_distance_to(&self, from: EventId, to: EventId) -> usize {
        if from == to {
            return 0;
        }
        let edges = self.forward.each_bfs(from, EdgeMask::TREE).unwrap_or_default();
        let mut parent = FnvHashMap::default();
        for (s, d, _, _) in edges {
            parent.entry(d).or_insert(s);
        }
        if !parent.contains_key(&to) {
            return usize::MAX;
        }
        let mut dist = 0;
        let mut cur = to;
        while cur != from {
            cur = *parent.get(&cur).expect("path reconstructed from BFS tree");
            dist += 1;
        }
        dist
    }

    /// Returns the repairs covering `event` or any terminal-equivalent event
    /// of its owning task (terminal equivalence: events whose forward chain
    /// reaches `stop`). When more than one repair entry could cover the
    /// query, the most general (furthest upstream in the forward chain) wins.
    pub fn repairs_for(&self, event: EventId) -> FnvHashMap<EventId, TaskId> {
        let mut out = FnvHashMap::default();
        let owner = match self.events.get(event.0).map(|g| g.kind) {
            Some(GeneratorKind::TaskOwned(t)) => t,
            _ => {
                if let Some(&repair) = self.repairs.get(&event) {
                    out.insert(event, repair);
                }
                return out;
            }
        };
        let Some(task) = self.tasks.get(owner.0) else {
            return out;
        };
        let Some(stop_id) = task.event_id("stop") else {
            if let Some(&repair) = self.repairs.get(&event) {
                out.insert(event, repair);
            }
            return out;
        };

        let mut terminal_set = vec![stop_id];
        for &eid in task.events.values() {
            if eid != stop_id && self.forward.reachable(eid, stop_id) {
                terminal_set.push(eid);
            }
        }
        if !terminal_set.contains(&event) {
            if let Some(&repair) = self.repairs.get(&event) {
                out.insert(event, repair);
            }
            return out;
        }

        let mut best: Option<(EventId, TaskId, usize)> = None;
        for &candidate in &terminal_set {
            if let Some(&repair_task) = self.repairs.get(&candidate) {
                let dist = self.forward_distance_to(candidate, stop_id);
                let better = match best {
                    Some((_, _, best_dist)) => dist > best_dist,
                    None => true,
                };
                if better {
                    best = Some((candidate, repair_task, dist));
                }
            }
        }
        if let Some((trigger, repair_task, _)) = best {
            out.insert(trigger, repair_task);
        }
        out
    }

    pub fn check_structure(&self) -> Vec<(ExceptionKind, Vec<TaskId>)> {
        self.structure_checks
            .iter()
            .flat_map(|check| check(self))
            .collect()
    }

    /// Plan-level exception fallback, used when no task on the propagation
    /// path handled an exception (section 4.5.3 step 5).
    pub fn handle_exception(&mut self, exception: &ExceptionKind) -> HandlerOutcome {
        for handler in self.exception_handlers.iter_mut() {
            if (handler.matches)(exception) {
                if (handler.callback)(exception) == HandlerOutcome::Handled {
                    return HandlerOutcome::Handled;
                }
            }
        }
        HandlerOutcome::Pass
    }
}
