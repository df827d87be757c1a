// Tasks: section 4.3. The lifecycle state machine follows the diagram in
// spec section 4.3 verbatim; `quarantined` is tracked as an orthogonal flag
// rather than a lifecycle state, since a quarantined task keeps running (or
// stays pending/finished) until it terminates naturally.
//
// Grounded on `graph::entry::Entry`'s state transitions (NotStarted/Running/
// Completed) generalized to the richer task lifecycle, and on
// `graph::node::Node` for the split between static model metadata and
// per-instance state.

use fnv::FnvHashMap;

use crate::event::EventModel;
use crate::Context;
use plan_errors::{EventId, ExceptionKind};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Terminal {
    Success,
    Stop,
    Failed,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Lifecycle {
    Pending,
    Starting,
    Running,
    Finishing(Terminal),
    Succeeded,
    Stopped,
    Failed,
    FailedToStart,
    Finalized,
}

impl Lifecycle {
    pub fn terminated(&self) -> bool {
        matches!(
            self,
            Lifecycle::Succeeded
                | Lifecycle::Stopped
                | Lifecycle::Failed
                | Lifecycle::FailedToStart
                | Lifecycle::Finalized
        )
    }

    pub fn running(&self) -> bool {
        matches!(self, Lifecycle::Running | Lifecycle::Finishing(_))
    }
}

/// A delayed-argument object: the Rust stand-in for the duck-typed delayed
/// argument classes of the source system (design notes section 9).
pub enum DelayedArg {
    FromObject,
    FromState,
    Custom(Box<dyn Fn(&Task) -> Option<Context>>),
}

impl std::fmt::Debug for DelayedArg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DelayedArg::FromObject => write!(f, "DelayedArg::FromObject"),
            DelayedArg::FromState => write!(f, "DelayedArg::FromState"),
            DelayedArg::Custom(_) => write!(f, "DelayedArg::Custom(..)"),
        }
    }
}

#[derive(Debug)]
pub enum ArgValue {
    Set(Context),
    Delayed(DelayedArg),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HandlerOutcome {
    Handled,
    Pass,
}

/// An exception handler declared on a task or task model (`on_exception(class)
/// { ... }`). `matches` stands in for the dynamic `exception_class` predicate
/// matching of the source system (design notes section 9).
pub struct ExceptionHandler {
    pub matches: Box<dyn Fn(&ExceptionKind) -> bool>,
    pub callback: Box<dyn FnMut(&ExceptionKind) -> HandlerOutcome>,
}

/// Static per-model shape: declared events and argument defaults, shared by
/// every instance of a task model.
#[derive(Default)]
pub struct TaskModel {
    pub name: String,
    pub events: Vec<EventModel>,
    pub argument_defaults: FnvHashMap<String, Context>,
}

impl TaskModel {
    pub fn new(name: impl Into<String>) -> Self {
        TaskModel {
            name: name.into(),
            events: Vec::new(),
            argument_defaults: FnvHashMap::default(),
        }
    }

    pub fn declare_event(&mut self, name: impl Into<String>, controllable: bool, terminal: bool) {
        self.events.push(EventModel {
            name: name.into(),
            controllable,
            terminal,
        });
    }
}

pub struct Task {
    pub model: std::rc::Rc<TaskModel>,
    pub lifecycle: Lifecycle,
    pub quarantined: bool,
    /// Event ids for this task's generators, keyed by declared name.
    pub events: FnvHashMap<String, EventId>,
    pub arguments: FnvHashMap<String, ArgValue>,
    /// Event names that must have emitted before `start!` may be invoked.
    pub needs: Vec<String>,
    pub exception_handlers: Vec<ExceptionHandler>,
}

impl Task {
    pub fn new(model: std::rc::Rc<TaskModel>) -> Self {
        let arguments = model
            .argument_defaults
            .iter()
            .map(|(k, v)| (k.clone(), ArgValue::Set(v.clone())))
            .collect();
        Task {
            model,
            lifecycle: Lifecycle::Pending,
            quarantined: false,
            events: FnvHashMap::default(),
            arguments,
            needs: Vec::new(),
            exception_handlers: Vec::new(),
        }
    }

    pub fn pending(&self) -> bool {
        self.lifecycle == Lifecycle::Pending
    }

    /// `executable?`: not terminated, and not currently quarantined with no
    /// path forward (quarantine alone does not make a pending task
    /// inexecutable; only a terminated lifecycle does).
    pub fn executable(&self) -> bool {
        !self.lifecycle.terminated()
    }

    pub fn event_id(&self, name: &str) -> Option<EventId> {
        self.events.get(name).copied()
    }

    pub fn set_argument(&mut self, name: &str, value: Context) -> Result<(), &'static str> {
        match self.arguments.get(name) {
            Some(ArgValue::Set(_)) => Err("ArgumentAlreadySet"),
            _ => {
                self.arguments.insert(name.to_string(), ArgValue::Set(value));
                Ok(())
            }
        }
    }

    pub fn argument_set(&self, name: &str) -> bool {
        matches!(self.arguments.get(name), Some(ArgValue::Set(_)))
    }

    /// `static?`: true when no argument is still a delayed object.
    pub fn is_static(&self) -> bool {
        self.arguments
            .values()
            .all(|v| matches!(v, ArgValue::Set(_)))
    }

    pub fn quarantine(&mut self) {
        self.quarantined = true;
    }

    /// Iterates exception handlers in reverse declaration order, invoking
    /// those whose predicate matches. Returns `Handled` as soon as one
    /// consumes the exception; `Pass` if every matching handler passed (or
    /// none matched at all).
    pub fn handle_exception(&mut self, exception: &ExceptionKind) -> HandlerOutcome {
        for handler in self.exception_handlers.iter_mut().rev() {
            if (handler.matches)(exception) {
                if (handler.callback)(exception) == HandlerOutcome::Handled {
                    return HandlerOutcome::Handled;
                }
            }
        }
        HandlerOutcome::Pass
    }

    pub fn transition_start_emitted(&mut self) {
        if matches!(self.lifecycle, Lifecycle::Pending | Lifecycle::Starting) {
            self.lifecycle = Lifecycle::Running;
        }
    }

    pub fn transition_finishing(&mut self, terminal: Terminal) {
        if self.lifecycle.running() {
            self.lifecycle = Lifecycle::Finishing(terminal);
        }
    }

    pub fn transition_terminated(&mut self) {
        self.lifecycle = match self.lifecycle {
            Lifecycle::Finishing(Terminal::Success) => Lifecycle::Succeeded,
            Lifecycle::Finishing(Terminal::Stop) => Lifecycle::Stopped,
            Lifecycle::Finishing(Terminal::Failed) => Lifecycle::Failed,
            other => other,
        };
    }
}
