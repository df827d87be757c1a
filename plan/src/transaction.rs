// Transaction: section 4.7. A transaction never touches the underlying
// `Plan` until `commit` replays its recorded diff into it — this gives
// atomicity (testable property 3) for free: `discard` is simply dropping the
// transaction, and a successful `commit` is the only path that mutates
// `plan` at all.
//
// Grounded on `graph::InnerGraph::invalidate_from_roots`'s pattern of
// staging a predicate-selected id set and only then mutating the live graph
// in one pass (there via `retain_edges`, here via replaying `signal`/
// `forward`/`dependency` edge lists): both avoid partially-applied mutation
// if something in the staged set turns out to be invalid.

use fnv::{FnvHashMap, FnvHashSet};

use crate::event::{EventGenerator, GeneratorKind, SignalInfo};
use crate::plan::DependencyInfo;
use crate::task::{Task, TaskModel};
use crate::Arena;
use plan_errors::{EventId, TaskId};

/// A reference to a task, either one that already exists in the underlying
/// plan (`Plan`, proxied) or one created fresh inside this transaction
/// (`New`, identified by its index in the transaction's own task arena).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum TaskRef {
    Plan(TaskId),
    New(u32),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum EventRef {
    Plan(EventId),
    New(u32),
}

enum RelationKind {
    Signal,
    Forward,
    Precedence,
}

enum TaskRelationKind {
    Dependency,
    ErrorHandling,
    PlannedBy,
}

/// Selects which task-level relation `Transaction::merged_generated_subgraphs`
/// walks; mirrors `TaskRelationKind` but is public since callers need to name
/// a relation without reaching into the transaction's private staging kind.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TaskRelation {
    Dependency,
    ErrorHandling,
    PlannedBy,
}

fn relation_matches(kind: &TaskRelationKind, relation: TaskRelation) -> bool {
    matches!(
        (kind, relation),
        (TaskRelationKind::Dependency, TaskRelation::Dependency)
            | (TaskRelationKind::ErrorHandling, TaskRelation::ErrorHandling)
            | (TaskRelationKind::PlannedBy, TaskRelation::PlannedBy)
    )
}

pub struct Transaction {
    new_tasks: Arena<Task>,
    new_events: Arena<EventGenerator>,
    /// For an owned event created alongside a transaction-local task: which
    /// local task index and declared name it belongs to, so commit can
    /// resolve it against the real event the plan creates for that task.
    owned_by: FnvHashMap<u32, (u32, String)>,
    proxied_tasks: FnvHashSet<TaskId>,
    proxied_events: FnvHashSet<EventId>,

    removed_tasks: FnvHashSet<TaskId>,
    removed_events: FnvHashSet<EventId>,

    event_relation_add: Vec<(RelationKind, EventRef, EventRef, SignalInfo)>,
    event_relation_remove: Vec<(RelationKind, EventRef, EventRef)>,
    task_relation_add: Vec<(TaskRelationKind, TaskRef, TaskRef, DependencyInfo)>,
    task_relation_remove: Vec<(TaskRelationKind, TaskRef, TaskRef)>,

    mission_overlay: FnvHashMap<TaskRef, bool>,
    permanent_overlay: FnvHashMap<TaskRef, bool>,
}

impl Transaction {
    pub fn new() -> Self {
        Transaction {
            new_tasks: Arena::new(),
            new_events: Arena::new(),
            owned_by: FnvHashMap::default(),
            proxied_tasks: FnvHashSet::default(),
            proxied_events: FnvHashSet::default(),
            removed_tasks: FnvHashSet::default(),
            removed_events: FnvHashSet::default(),
            event_relation_add: Vec::new(),
            event_relation_remove: Vec::new(),
            task_relation_add: Vec::new(),
            task_relation_remove: Vec::new(),
            mission_overlay: FnvHashMap::default(),
            permanent_overlay: FnvHashMap::default(),
        }
    }

    /// `trsc[task]`: returns the proxy for a plan task, recording it as
    /// referenced by this transaction. Proxies are purely structural — the
    /// `Transaction` type exposes no `call`/`start` methods, so attempting to
    /// drive a proxy the way one drives a live task simply does not compile.
    pub fn proxy_task(&mut self, plan: &crate::Plan, id: TaskId) -> Option<TaskRef> {
        plan.tasks.get(id.0)?;
        self.proxied_tasks.insert(id);
        Some(TaskRef::Plan(id))
    }

    /// `trsc[task, false]`: returns the proxy only if one has already been
    /// created for `id`.
    pub fn proxy_task_if_exists(&self, id: TaskId) -> Option<TaskRef> {
        self.proxied_tasks.contains(&id).then_some(TaskRef::Plan(id))
    }

    pub fn proxy_event(&mut self, plan: &crate::Plan, id: EventId) -> Option<EventRef> {
        plan.events.get(id.0)?;
        self.proxied_events.insert(id);
        Some(EventRef::Plan(id))
    }

    /// Looks up a declared event on a task created earlier in this same
    /// transaction, so callers can link relations to it before it has a
    /// plan-assigned id.
    pub fn new_task_event(&self, task: TaskRef, name: &str) -> Option<EventRef> {
        match task {
            TaskRef::New(idx) => self
                .new_tasks
                .get(idx)
                .and_then(|t| t.event_id(name))
                .map(|eid| EventRef::New(eid.0)),
            TaskRef::Plan(_) => None,
        }
    }

    /// Adds a task local to this transaction. It only becomes real (gets a
    /// plan-assigned `TaskId`) on commit.
    pub fn add_task(&mut self, model: std::rc::Rc<TaskModel>) -> TaskRef {
        let decls = model.events.clone();
        let task_idx = self.new_tasks.insert(Task::new(model));
        for decl in &decls {
            let event_idx = self.new_events.insert(EventGenerator::new(
                decl.name.as_str(),
                GeneratorKind::Free, // resolved against the real owner at commit
                decl.terminal,
            ));
            self.owned_by
                .insert(event_idx, (task_idx, decl.name.clone()));
            self.new_tasks
                .get_mut(task_idx)
                .unwrap()
                .events
                .insert(decl.name.clone(), EventId(event_idx));
        }
        TaskRef::New(task_idx)
    }

    pub fn remove_task(&mut self, id: TaskId) {
        self.removed_tasks.insert(id);
    }

    pub fn remove_event(&mut self, id: EventId) {
        self.removed_events.insert(id);
    }

    pub fn link_signal(&mut self, src: EventRef, dst: EventRef, info: SignalInfo) {
        self.event_relation_add
            .push((RelationKind::Signal, src, dst, info));
    }

    pub fn unlink_signal(&mut self, src: EventRef, dst: EventRef) {
        self.event_relation_remove
            .push((RelationKind::Signal, src, dst));
    }

    pub fn link_forward(&mut self, src: EventRef, dst: EventRef) {
        self.event_relation_add
            .push((RelationKind::Forward, src, dst, SignalInfo::default()));
    }

    pub fn unlink_forward(&mut self, src: EventRef, dst: EventRef) {
        self.event_relation_remove
            .push((RelationKind::Forward, src, dst));
    }

    pub fn link_precedence(&mut self, src: EventRef, dst: EventRef) {
        self.event_relation_add
            .push((RelationKind::Precedence, src, dst, SignalInfo::default()));
    }

    pub fn link_dependency(&mut self, parent: TaskRef, child: TaskRef, info: DependencyInfo) {
        self.task_relation_add
            .push((TaskRelationKind::Dependency, parent, child, info));
    }

    pub fn unlink_dependency(&mut self, parent: TaskRef, child: TaskRef) {
        self.task_relation_remove
            .push((TaskRelationKind::Dependency, parent, child));
    }

    pub fn link_error_handling(&mut self, task: TaskRef, handler: TaskRef) {
        self.task_relation_add.push((
            TaskRelationKind::ErrorHandling,
            task,
            handler,
            DependencyInfo::default(),
        ));
    }

    pub fn link_planned_by(&mut self, task: TaskRef, planner: TaskRef) {
        self.task_relation_add.push((
            TaskRelationKind::PlannedBy,
            task,
            planner,
            DependencyInfo::default(),
        ));
    }

    pub fn mark_mission(&mut self, task: TaskRef, value: bool) {
        self.mission_overlay.insert(task, value);
    }

    pub fn mark_permanent(&mut self, task: TaskRef, value: bool) {
        self.permanent_overlay.insert(task, value);
    }

    /// Returns the union view (section 4.7) of everything reachable via
    /// `relation`: `seeds_in_plan` walked over the live plan graph (which
    /// this transaction has not yet touched), and `seeds_in_transaction`
    /// walked over the relation edges staged in this transaction, which may
    /// reach both proxied plan tasks and brand-new ones.
    pub fn merged_generated_subgraphs(
        &self,
        plan: &crate::Plan,
        relation: TaskRelation,
        seeds_in_plan: &[TaskId],
        seeds_in_transaction: &[TaskRef],
    ) -> FnvHashSet<TaskRef> {
        let mut out: FnvHashSet<TaskRef> = match relation {
            TaskRelation::Dependency => plan
                .dependency
                .generated_subgraphs(seeds_in_plan, false)
                .vertices()
                .map(TaskRef::Plan)
                .collect(),
            TaskRelation::ErrorHandling => plan
                .error_handling
                .generated_subgraphs(seeds_in_plan, false)
                .vertices()
                .map(TaskRef::Plan)
                .collect(),
            TaskRelation::PlannedBy => plan
                .planned_by
                .generated_subgraphs(seeds_in_plan, false)
                .vertices()
                .map(TaskRef::Plan)
                .collect(),
        };

        let mut adjacency: FnvHashMap<TaskRef, Vec<TaskRef>> = FnvHashMap::default();
        for (kind, src, dst, _) in &self.task_relation_add {
            if relation_matches(kind, relation) {
                adjacency.entry(*src).or_default().push(*dst);
            }
        }

        let mut visited: FnvHashSet<TaskRef> = FnvHashSet::default();
        let mut frontier: Vec<TaskRef> = seeds_in_transaction.to_vec();
        while let Some(current) = frontier.pop() {
            if !visited.insert(current) {
                continue;
            }
            out.insert(current);
            if let Some(next) = adjacency.get(&current) {
                frontier.extend(next.iter().copied());
            }
        }

        out
    }

    /// Replays every staged change into `plan`. After this returns, the
    /// transaction has been consumed; no proxies of its objects remain
    /// distinguishable from ordinary plan objects.
    pub fn commit(self, plan: &mut crate::Plan) -> Result<(), String> {
        let Transaction {
            new_tasks,
            new_events,
            owned_by,
            removed_tasks,
            removed_events,
            event_relation_add,
            event_relation_remove,
            task_relation_add,
            task_relation_remove,
            mission_overlay,
            permanent_overlay,
            ..
        } = self;

        fn resolve_task(r: TaskRef, local: &FnvHashMap<u32, TaskId>) -> Option<TaskId> {
            match r {
                TaskRef::Plan(id) => Some(id),
                TaskRef::New(idx) => local.get(&idx).copied(),
            }
        }
        fn resolve_event(r: EventRef, local: &FnvHashMap<u32, EventId>) -> Option<EventId> {
            match r {
                EventRef::Plan(id) => Some(id),
                EventRef::New(idx) => local.get(&idx).copied(),
            }
        }

        let mut local_tasks: FnvHashMap<u32, TaskId> = FnvHashMap::default();
        for (idx, task) in new_tasks.iter() {
            let real_id = plan.add_task(task.model.clone());
            local_tasks.insert(idx, real_id);
        }

        let mut local_events: FnvHashMap<u32, EventId> = FnvHashMap::default();
        for (idx, _gen) in new_events.iter() {
            if let Some((task_idx, name)) = owned_by.get(&idx) {
                let real_task = *local_tasks
                    .get(task_idx)
                    .ok_or("transaction commit: task for owned event missing")?;
                let real_event = plan
                    .tasks
                    .get(real_task.0)
                    .and_then(|t| t.event_id(name))
                    .ok_or("transaction commit: declared event missing on new task")?;
                local_events.insert(idx, real_event);
            } else {
                let real_id = plan.add_free_event("transaction-event", false);
                local_events.insert(idx, real_id);
            }
        }

        for id in &removed_tasks {
            plan.remove_task(*id);
        }
        for id in &removed_events {
            plan.remove_free_event(*id);
        }

        for (kind, src, dst, info) in event_relation_add {
            let (Some(s), Some(d)) = (
                resolve_event(src, &local_events),
                resolve_event(dst, &local_events),
            ) else {
                return Err("transaction commit: dangling event reference".to_string());
            };
            match kind {
                RelationKind::Signal => plan.signal.set(s, d, info),
                RelationKind::Forward => plan.forward.set(s, d, ()),
                RelationKind::Precedence => plan.precedence.set(s, d, ()),
            }
        }
        for (kind, src, dst) in event_relation_remove {
            let (Some(s), Some(d)) = (
                resolve_event(src, &local_events),
                resolve_event(dst, &local_events),
            ) else {
                continue;
            };
            match kind {
                RelationKind::Signal => {
                    plan.signal.unlink(s, d);
                }
                RelationKind::Forward => {
                    plan.forward.unlink(s, d);
                }
                RelationKind::Precedence => {
                    plan.precedence.unlink(s, d);
                }
            }
        }

        for (kind, src, dst, info) in task_relation_add {
            let (Some(s), Some(d)) = (
                resolve_task(src, &local_tasks),
                resolve_task(dst, &local_tasks),
            ) else {
                return Err("transaction commit: dangling task reference".to_string());
            };
            match kind {
                TaskRelationKind::Dependency => plan.dependency.set(s, d, info),
                TaskRelationKind::ErrorHandling => plan.error_handling.set(s, d, ()),
                TaskRelationKind::PlannedBy => plan.planned_by.set(s, d, ()),
            }
        }
        for (kind, src, dst) in task_relation_remove {
            let (Some(s), Some(d)) = (
                resolve_task(src, &local_tasks),
                resolve_task(dst, &local_tasks),
            ) else {
                continue;
            };
            match kind {
                TaskRelationKind::Dependency => {
                    plan.dependency.unlink(s, d);
                }
                TaskRelationKind::ErrorHandling => {
                    plan.error_handling.unlink(s, d);
                }
                TaskRelationKind::PlannedBy => {
                    plan.planned_by.unlink(s, d);
                }
            }
        }

        for (task_ref, value) in mission_overlay {
            if let Some(id) = resolve_task(task_ref, &local_tasks) {
                if value {
                    plan.missions.insert(id);
                } else {
                    plan.missions.remove(&id);
                }
            }
        }
        for (task_ref, value) in permanent_overlay {
            if let Some(id) = resolve_task(task_ref, &local_tasks) {
                if value {
                    plan.permanents.insert(id);
                } else {
                    plan.permanents.remove(&id);
                }
            }
        }

        Ok(())
    }

    /// Drops the transaction without touching the plan.
    pub fn discard(self) {}
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskModel;

    fn model() -> std::rc::Rc<TaskModel> {
        let mut m = TaskModel::new("T");
        m.declare_event("start", true, false);
        m.declare_event("stop", true, true);
        std::rc::Rc::new(m)
    }

    #[test]
    fn discard_never_touches_the_plan() {
        let mut plan = crate::Plan::new();
        let t1 = plan.add_task(model());
        let mut trsc = Transaction::new();
        let t3 = trsc.add_task(model());
        trsc.mark_mission(t3, true);
        trsc.discard();
        assert_eq!(plan.tasks.len(), 1);
        assert!(plan.missions.is_empty());
        assert!(plan.tasks.get(t1.0).is_some());
    }

    /// Scenario S5: a transaction adds T3 and signals `T3.stop` to the
    /// existing `T1.start`; after commit the plan carries that signal.
    #[test]
    fn commit_preserves_new_signal_to_existing_task() {
        let mut plan = crate::Plan::new();
        let t1 = plan.add_task(model());
        let t1_start = plan.tasks.get(t1.0).unwrap().event_id("start").unwrap();

        let mut trsc = Transaction::new();
        let t1_proxy = trsc.proxy_task(&plan, t1).unwrap();
        let _ = t1_proxy;
        let t3 = trsc.add_task(model());
        let t3_stop = trsc.new_task_event(t3, "stop").unwrap();
        trsc.link_signal(t3_stop, EventRef::Plan(t1_start), SignalInfo::default());

        trsc.commit(&mut plan).unwrap();

        assert_eq!(plan.tasks.len(), 2);
        let new_task = plan
            .tasks
            .iter()
            .find(|(id, _)| *id != t1.0)
            .map(|(id, _)| TaskId(id))
            .unwrap();
        let new_stop = plan.tasks.get(new_task.0).unwrap().event_id("stop").unwrap();
        assert!(plan.signal.linked(new_stop, t1_start));
    }

    #[test]
    fn commit_applies_removal() {
        let mut plan = crate::Plan::new();
        let t1 = plan.add_task(model());
        let mut trsc = Transaction::new();
        trsc.remove_task(t1);
        trsc.commit(&mut plan).unwrap();
        assert!(plan.tasks.get(t1.0).is_none());
    }

    #[test]
    fn merged_generated_subgraphs_unions_plan_and_transaction_reachability() {
        let mut plan = crate::Plan::new();
        let t1 = plan.add_task(model());
        let t2 = plan.add_task(model());
        plan.dependency.link(t1, t2, DependencyInfo::default()).unwrap();

        let mut trsc = Transaction::new();
        let t2_proxy = trsc.proxy_task(&plan, t2).unwrap();
        let t3 = trsc.add_task(model());
        trsc.link_dependency(t2_proxy, t3, DependencyInfo::default());

        let reached =
            trsc.merged_generated_subgraphs(&plan, TaskRelation::Dependency, &[t1], &[t2_proxy]);

        assert!(reached.contains(&TaskRef::Plan(t1)));
        assert!(reached.contains(&TaskRef::Plan(t2)));
        assert!(reached.contains(&t3));
    }
}
