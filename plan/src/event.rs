// Event generators: section 4.2. `EventGenerator` holds the data an
// occurrence needs (history, unreachability, handlers); the drive logic that
// decides *when* a generator's command/emission actually runs lives in
// `plan_engine::Cycle`, which implements `PropagationSink`.
//
// Grounded on `graph::entry::EntryState`: a mutex-guarded NotStarted/Running/
// Completed enum there becomes, here, a plain (non-mutex, single-owner)
// history + unreachable flag, since this crate's structures are only ever
// touched from the engine thread.

use fnv::FnvHashSet;

use crate::{Context, PlanResult, PropagationSink};
use plan_errors::{EventId, ExceptionKind, TaskId};

/// Static shape of a declared event: its name and flags, independent of any
/// particular task instance (`model :name, controllable:, terminal:` in
/// section 6's task model API).
#[derive(Clone, Debug)]
pub struct EventModel {
    pub name: String,
    pub controllable: bool,
    pub terminal: bool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum GeneratorKind {
    Free,
    TaskOwned(TaskId),
}

#[derive(Clone, Debug)]
pub struct Occurrence {
    pub step_id: u64,
    pub context: Context,
    pub sources: Vec<EventId>,
}

/// A command attached to a controllable generator. Receives the merged
/// context for this dispatch and a sink to enqueue any emissions it performs.
pub type Command = Box<dyn FnMut(&Context, &mut dyn PropagationSink) -> PlanResult<()>>;

/// A handler registered via `on(event)`. Runs synchronously once the
/// generator's emission for this dispatch has been recorded.
pub type Handler = Box<dyn FnMut(&Occurrence, &mut dyn PropagationSink)>;

pub type WhenUnreachable = Box<dyn FnOnce(Option<&str>)>;

/// Payload carried on `signal` relation edges: an optional propagation delay,
/// per section 4.5.5's `delay` on a signal.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SignalInfo {
    pub delay: Option<std::time::Duration>,
}

#[derive(Debug)]
pub enum CompositeKind {
    /// Emits once every member of `sources` has emitted since the last reset.
    And {
        sources: Vec<EventId>,
        satisfied: FnvHashSet<EventId>,
    },
    /// Emits on the first emission of any member of `sources`, once per reset.
    Or {
        sources: Vec<EventId>,
        fired: bool,
        unreachable_sources: FnvHashSet<EventId>,
    },
}

pub struct EventGenerator {
    pub name: String,
    pub kind: GeneratorKind,
    pub terminal: bool,
    pub command: Option<Command>,
    pub history: Vec<Occurrence>,
    pub unreachable: Option<String>,
    pub handlers: Vec<Handler>,
    pub when_unreachable: Vec<WhenUnreachable>,
    pub composite: Option<CompositeKind>,
}

impl EventGenerator {
    pub fn new(name: impl Into<String>, kind: GeneratorKind, terminal: bool) -> Self {
        EventGenerator {
            name: name.into(),
            kind,
            terminal,
            command: None,
            history: Vec::new(),
            unreachable: None,
            handlers: Vec::new(),
            when_unreachable: Vec::new(),
            composite: None,
        }
    }

    pub fn controllable(&self) -> bool {
        self.command.is_some()
    }

    pub fn emitted(&self) -> bool {
        !self.history.is_empty()
    }

    pub fn last_occurrence(&self) -> Option<&Occurrence> {
        self.history.last()
    }

    pub fn is_unreachable(&self) -> bool {
        self.unreachable.is_some()
    }

    /// Records an emission. Callers (the engine's dispatch loop) are
    /// responsible for having already checked `executable`.
    pub fn record_emission(&mut self, step_id: u64, context: Context, sources: Vec<EventId>) {
        self.history.push(Occurrence {
            step_id,
            context,
            sources,
        });
    }

    pub fn run_command(
        &mut self,
        context: &Context,
        sink: &mut dyn PropagationSink,
    ) -> PlanResult<()> {
        match self.command.as_mut() {
            Some(cmd) => cmd(context, sink),
            None => Err(ExceptionKind::EventNotControllable(dummy_id())),
        }
    }

    /// Runs every registered `on(event)` handler with this dispatch's
    /// occurrence. Handler panics are not caught here; the engine wraps each
    /// call so a panicking handler becomes an `EventHandlerError` instead of
    /// unwinding the cycle.
    pub fn run_handlers(&mut self, occurrence: &Occurrence, sink: &mut dyn PropagationSink) {
        for handler in self.handlers.iter_mut() {
            handler(occurrence, sink);
        }
    }

    /// Marks the generator unreachable and fires every one-shot
    /// `when_unreachable` callback. Idempotent: a generator already
    /// unreachable keeps its original reason.
    pub fn mark_unreachable(&mut self, reason: Option<String>) {
        if self.unreachable.is_some() {
            return;
        }
        self.unreachable = Some(reason.clone().unwrap_or_default());
        for cb in self.when_unreachable.drain(..) {
            cb(reason.as_deref());
        }
    }

    pub fn when_unreachable(&mut self, cb: WhenUnreachable) {
        if let Some(reason) = &self.unreachable {
            cb(Some(reason));
        } else {
            self.when_unreachable.push(cb);
        }
    }

    /// Resets an And/Or composite's emission-tracking state so it can emit
    /// again on a subsequent round of source emissions.
    pub fn reset_composite(&mut self) {
        match &mut self.composite {
            Some(CompositeKind::And { satisfied, .. }) => satisfied.clear(),
            Some(CompositeKind::Or { fired, .. }) => *fired = false,
            None => {}
        }
    }

    /// Builds a free `AndGenerator` (testable property 5): it emits once
    /// every member of `sources` has emitted since the last reset.
    pub fn new_and(name: impl Into<String>, sources: Vec<EventId>, terminal: bool) -> Self {
        let mut gen = EventGenerator::new(name, GeneratorKind::Free, terminal);
        gen.composite = Some(CompositeKind::And {
            sources,
            satisfied: FnvHashSet::default(),
        });
        gen
    }

    /// Builds a free `OrGenerator`: it emits on the first emission of any
    /// member of `sources`, and not again until reset.
    pub fn new_or(name: impl Into<String>, sources: Vec<EventId>, terminal: bool) -> Self {
        let mut gen = EventGenerator::new(name, GeneratorKind::Free, terminal);
        gen.composite = Some(CompositeKind::Or {
            sources,
            fired: false,
            unreachable_sources: FnvHashSet::default(),
        });
        gen
    }
}

/// A placeholder id used only to populate `EventNotControllable`'s payload
/// when the generator's own id is not in scope at the call site; the engine
/// always substitutes the real id before surfacing the error to callers.
fn dummy_id() -> EventId {
    EventId(u32::MAX)
}
