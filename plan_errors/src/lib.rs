// Error taxonomy and core identifiers for the plan execution engine.
#![deny(warnings)]
#![deny(clippy::all)]
#![allow(clippy::too_many_arguments, clippy::new_without_default)]

use std::fmt;
use std::sync::Arc;

/// Identifies a `Task` within a `Plan`'s task arena.
///
/// Mirrors the role of `graph::node::EntryId`: a small `Copy` key that can be
/// embedded in relation-graph edges without aliasing the task itself.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct TaskId(pub u32);

/// Identifies an event generator, whether task-bound or free.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct EventId(pub u32);

/// The origin of a `LocalizedError`: the task or event generator that raised it.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Origin {
    Task(TaskId),
    Event(EventId),
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Task(id) => write!(f, "task#{}", id.0),
            Origin::Event(id) => write!(f, "event#{}", id.0),
        }
    }
}

/// A user-code error, wrapped so that it can be cloned and carried through
/// exception propagation. The teacher's `NodeError` trait plays the same role
/// for Node execution failures; here the taxonomy is fixed by the
/// specification instead of left generic.
#[derive(Clone, Debug)]
pub struct CodeError {
    pub message: String,
    pub source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl CodeError {
    pub fn new(message: impl Into<String>) -> Self {
        CodeError {
            message: message.into(),
            source: None,
        }
    }

    pub fn wrap(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        CodeError {
            message: err.to_string(),
            source: Some(Arc::new(err)),
        }
    }
}

impl fmt::Display for CodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CodeError {}

/// The kind of a raw failure raised while running commands, emissions, or
/// handlers. See spec.md section 7 (ERROR HANDLING DESIGN).
#[derive(Clone, Debug)]
pub enum ExceptionKind {
    /// A controllable event's command raised.
    CommandFailed(CodeError),
    /// `emit` raised while notifying signal/forward targets or handlers.
    EmissionFailed(CodeError),
    /// An `on(event)` handler raised.
    EventHandlerError(CodeError),
    /// A task's `needs` precondition was not satisfied when `start!` was called.
    EventPreconditionFailed { task: TaskId, missing_event: EventId },
    /// `call` was invoked on a generator that is not controllable.
    EventNotControllable(EventId),
    /// `call`/`emit` was invoked on a generator that cannot execute again
    /// (unreachable, or whose owning task has already terminated).
    EventNotExecutable(EventId),
    /// `start!` was invoked on a task that is not `pending?` and `executable?`.
    TaskNotExecutable(TaskId),
    /// A generator being waited upon (`wait_until`, a promise, a poller)
    /// became unreachable before emitting.
    UnreachableEvent {
        event: EventId,
        reason: Option<String>,
    },
    /// An arbitrary user error raised in a context with no more specific class.
    Code(CodeError),
    /// Synthesized when a dependency's failure propagates up to a task that
    /// transitively required it.
    ChildFailed { child: TaskId },
    /// Synthesized when a failure reaches a mission task.
    MissionFailed,
    /// Synthesized when a failure reaches a permanent task. Non-fatal by policy.
    PermanentTaskError,
}

impl fmt::Display for ExceptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExceptionKind::CommandFailed(e) => write!(f, "command failed: {e}"),
            ExceptionKind::EmissionFailed(e) => write!(f, "emission failed: {e}"),
            ExceptionKind::EventHandlerError(e) => write!(f, "event handler error: {e}"),
            ExceptionKind::EventPreconditionFailed {
                task,
                missing_event,
            } => write!(
                f,
                "task {} started before required event {} emitted",
                task.0, missing_event.0
            ),
            ExceptionKind::EventNotControllable(id) => {
                write!(f, "event {} is not controllable", id.0)
            }
            ExceptionKind::EventNotExecutable(id) => {
                write!(f, "event {} is not executable", id.0)
            }
            ExceptionKind::TaskNotExecutable(id) => write!(f, "task {} is not executable", id.0),
            ExceptionKind::UnreachableEvent { event, reason } => write!(
                f,
                "event {} became unreachable{}",
                event.0,
                reason
                    .as_ref()
                    .map(|r| format!(": {r}"))
                    .unwrap_or_default()
            ),
            ExceptionKind::Code(e) => write!(f, "{e}"),
            ExceptionKind::ChildFailed { child } => {
                write!(f, "dependency task {} failed", child.0)
            }
            ExceptionKind::MissionFailed => write!(f, "mission task failed"),
            ExceptionKind::PermanentTaskError => write!(f, "permanent task failed"),
        }
    }
}

impl std::error::Error for ExceptionKind {}

/// A `LocalizedError`: an `ExceptionKind` anchored at the task/event that raised it.
#[derive(Clone, Debug)]
pub struct LocalizedError {
    pub origin: Origin,
    pub kind: ExceptionKind,
}

impl LocalizedError {
    pub fn new(origin: Origin, kind: ExceptionKind) -> Self {
        LocalizedError { origin, kind }
    }
}

impl fmt::Display for LocalizedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (at {})", self.kind, self.origin)
    }
}

impl std::error::Error for LocalizedError {}

/// Convenience alias for the `Result` type used across the engine's public API.
pub type PlanResult<T> = Result<T, ExceptionKind>;
