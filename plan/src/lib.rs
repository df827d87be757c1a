// Event generators, tasks, plans, and transactions: the data model driven by
// the execution engine (in the sibling `plan_engine` crate).
//
// Structural mutation here never yields mid-operation (section 5: "structural
// operations never yield midway") — every public method on `Plan`/`Task`/
// `EventGenerator` is a plain synchronous function. The engine is the single
// caller on the "engine thread"; this crate does not itself take locks,
// mirroring how `graph::Graph<N>` keeps its `InnerGraph` behind one
// `parking_lot::Mutex` owned by the caller rather than scattering locks
// through the node/entry types themselves.
#![deny(warnings)]
#![deny(clippy::all)]
#![allow(clippy::too_many_arguments, clippy::new_without_default)]

pub mod event;
pub mod plan;
pub mod task;
pub mod transaction;

pub use event::{
    CompositeKind, EventGenerator, EventModel, GeneratorKind, Handler, Occurrence, SignalInfo,
};
pub use plan::{DependencyInfo, Plan, PlanExceptionHandler, StructureCheck};
pub use plan_errors::{CodeError, EventId, ExceptionKind, LocalizedError, Origin, PlanResult, TaskId};
pub use task::{
    ArgValue, DelayedArg, ExceptionHandler, HandlerOutcome, Lifecycle, Task, TaskModel, Terminal,
};
pub use transaction::{EventRef, TaskRef, TaskRelation, Transaction};

/// The payload carried by an emission or a command invocation. Duplicate
/// emissions queued onto the same generator within one propagation pass are
/// merged into a single `List`, per section 4.2's "already-queued" rule.
#[derive(Clone, Debug, PartialEq, Default)]
pub enum Context {
    #[default]
    None,
    Int(i64),
    Text(String),
    List(Vec<Context>),
}

impl Context {
    pub fn merge(items: Vec<Context>) -> Context {
        let mut items: Vec<Context> = items.into_iter().filter(|c| *c != Context::None).collect();
        match items.len() {
            0 => Context::None,
            1 => items.pop().unwrap(),
            _ => Context::List(items),
        }
    }
}

impl From<i64> for Context {
    fn from(v: i64) -> Self {
        Context::Int(v)
    }
}

impl From<&str> for Context {
    fn from(v: &str) -> Self {
        Context::Text(v.to_string())
    }
}

/// Lets event generator handlers and commands enqueue follow-up work without
/// holding a reference to the engine itself — an explicit context object
/// standing in for the global "app" singleton the teacher's Python/Ruby-era
/// equivalents would have reached for (design notes section 9).
pub trait PropagationSink {
    fn enqueue_call(&mut self, event: EventId, context: Context);
    fn enqueue_emit(&mut self, event: EventId, context: Context, sources: Vec<EventId>);
}

/// A dense, append-only arena keyed by a small `Copy` index. Removed slots are
/// tombstoned rather than reclaimed, so indices handed out earlier remain
/// valid (or reliably `None`) for the arena's lifetime — the same tradeoff
/// `petgraph::stable_graph` makes for `graph::node::EntryId`.
#[derive(Debug, Default)]
pub struct Arena<T> {
    slots: Vec<Option<T>>,
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Arena { slots: Vec::new() }
    }

    pub fn insert(&mut self, value: T) -> u32 {
        let idx = self.slots.len() as u32;
        self.slots.push(Some(value));
        idx
    }

    pub fn get(&self, idx: u32) -> Option<&T> {
        self.slots.get(idx as usize).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, idx: u32) -> Option<&mut T> {
        self.slots.get_mut(idx as usize).and_then(|s| s.as_mut())
    }

    pub fn remove(&mut self, idx: u32) -> Option<T> {
        self.slots.get_mut(idx as usize).and_then(|s| s.take())
    }

    pub fn contains(&self, idx: u32) -> bool {
        self.get(idx).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|v| (i as u32, v)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (u32, &mut T)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, s)| s.as_mut().map(|v| (i as u32, v)))
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests;
