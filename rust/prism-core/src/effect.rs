//! The effect vocabulary.
//!
//! Effects are ordinary data yielded by programs. The machine interprets a
//! small built-in set (the `Pure` shortcut, `WithHandler`, the algebraic
//! control primitives, `AsyncEscape`); everything else is looked up in the
//! visible handler stack. The scheduler's surface effects and its internal
//! store operations also live here so handlers across crates share one
//! vocabulary; user-defined effects travel as [`CustomEffect`] values.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use crate::env::Environment;
use crate::error::RuntimeError;
use crate::frame::{Continuation, Frame};
use crate::handler::{HandlerRef, HandlerSnapshot};
use crate::ids::{HandleId, TaskId};
use crate::program::Program;
use crate::store::Store;
use crate::values::{PromiseHandle, TaskHandle, Value};

// ---------------------------------------------------------------------------
// Async actions
// ---------------------------------------------------------------------------

/// A boxed future producing a runtime value.
pub type ValueFuture = Pin<Box<dyn Future<Output = Result<Value, RuntimeError>> + Send>>;

/// A deferred async action handed across the escape boundary. The driver
/// (or the sync I/O bridge) invokes it exactly once and awaits the result.
pub struct AsyncTask {
    run: Box<dyn FnOnce() -> ValueFuture + Send>,
}

impl AsyncTask {
    pub fn new(run: impl FnOnce() -> ValueFuture + Send + 'static) -> Self {
        Self { run: Box::new(run) }
    }

    /// Start the action.
    pub fn start(self) -> ValueFuture {
        (self.run)()
    }
}

impl fmt::Debug for AsyncTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncTask").finish_non_exhaustive()
    }
}

/// Build an [`AsyncTask`] from an async closure.
pub fn async_task<F, Fut>(f: F) -> AsyncTask
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<Value, RuntimeError>> + Send + 'static,
{
    AsyncTask::new(move || Box::pin(f()))
}

/// The payload of an async escape: one awaitable, or a bundle keyed by
/// task ID whose first completion resumes the machine.
#[derive(Debug)]
pub enum EscapePayload {
    Single(AsyncTask),
    Bundle(Vec<(TaskId, AsyncTask)>),
}

// ---------------------------------------------------------------------------
// Scheduler plumbing types
// ---------------------------------------------------------------------------

/// What to feed the new continuation head after a task switch.
#[derive(Debug)]
pub enum Inject {
    /// Begin a fresh program.
    Start(Program),
    /// Send a value into the head frame.
    Value(Value),
    /// Throw an error into the head frame.
    Error(RuntimeError),
}

/// The continuation of a queued task.
pub enum TaskK {
    /// A task that has not run yet: its program plus the handler scopes
    /// to install around it.
    Fresh { program: Program, handlers: HandlerSnapshot },
    /// A suspended task: the frames captured when it last gave up control.
    Saved { frames: Vec<Frame> },
}

impl fmt::Debug for TaskK {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskK::Fresh { handlers, .. } => write!(f, "Fresh(handlers={})", handlers.len()),
            TaskK::Saved { frames } => write!(f, "Saved(frames={})", frames.len()),
        }
    }
}

/// One runnable entry in the scheduler's task queue.
#[derive(Debug)]
pub struct QueuedTask {
    pub task_id: TaskId,
    pub k: TaskK,
    pub env: Environment,
    pub store: Store,
    pub inject: Option<Inject>,
}

/// A registered waiter: the suspended continuation of a task plus its
/// store snapshot, held in a take-once slot so a waiter registered on
/// several handles (gather, race) is woken exactly once.
pub struct WaiterSlot {
    pub frames: Vec<Frame>,
    pub env: Environment,
    pub store: Store,
}

#[derive(Clone)]
pub struct Waiter {
    pub task_id: TaskId,
    pub slot: std::sync::Arc<std::sync::Mutex<Option<WaiterSlot>>>,
}

impl Waiter {
    pub fn new(task_id: TaskId, slot_value: WaiterSlot) -> Self {
        Self { task_id, slot: std::sync::Arc::new(std::sync::Mutex::new(Some(slot_value))) }
    }

    /// Take the suspended continuation, if not already woken.
    pub fn take(&self) -> Option<WaiterSlot> {
        self.slot.lock().expect("waiter lock").take()
    }
}

impl fmt::Debug for Waiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Waiter({})", self.task_id)
    }
}

/// Full continuation replacement: swap in the continuation of another
/// task. Yielded only by the scheduler handler. For a `Fresh` task the
/// machine begins its program; for a `Saved` one it applies `inject`.
#[derive(Debug)]
pub struct ResumeK {
    pub task_id: TaskId,
    pub k: TaskK,
    pub env: Option<Environment>,
    pub store: Option<Store>,
    pub inject: Option<Inject>,
}

// ---------------------------------------------------------------------------
// Scheduler-internal operations
// ---------------------------------------------------------------------------

/// Store operations maintaining the task queue, task registry, waiter map
/// and current-task pointer under the store's reserved scheduler section.
/// Yielded by the scheduler handler, answered by the scheduler state
/// handler. Not user-facing.
#[derive(Debug)]
pub enum SchedOp {
    /// Add a task to the queue.
    Enqueue(QueuedTask),
    /// Pop the next runnable task. Answers `Null` or an opaque
    /// [`QueuedTask`]; drains pending external completions first.
    Dequeue,
    /// Report queue emptiness and pending-external state as
    /// `(queue_empty, externals_pending)`.
    QueueStatus,
    /// Register a waiter to wake when `handle` completes.
    RegisterWaiter { handle: HandleId, waiter: Waiter },
    /// Create a registry record for a spawned task. Answers the task
    /// handle value.
    CreateTaskHandle { task_id: TaskId },
    /// Mark a handle complete and wake its waiters.
    Complete { handle: HandleId, result: Result<Value, RuntimeError> },
    /// Completion report yielded by the spawn wrapper of a finished task.
    TaskFinished { handle: HandleId, task_id: TaskId, result: Result<Value, RuntimeError> },
    /// Answer `(complete, cancelled, outcome)` for a handle, or `Null`
    /// when unknown.
    GetResult { handle: HandleId },
    /// Cancel a task; answers whether it was newly cancelled.
    Cancel { handle: HandleId },
    /// Answer the current task ID.
    CurrentTask,
    /// Answer whether the current task has been cancelled.
    CurrentTaskCancelled,
    /// Create a promise registry record. Answers the promise value.
    CreatePromiseHandle,
    /// Apply an external completion: resolve the promise it names and
    /// wake its waiters.
    ResolveExternal(crate::external::CompletionMessage),
}

// ---------------------------------------------------------------------------
// Effect
// ---------------------------------------------------------------------------

/// A value yielded by a program to request a service.
pub enum Effect {
    // -- built-ins interpreted by the machine -----------------------------
    /// Shortcut: immediately produce a value.
    Pure(Value),
    /// Run `program` with `handler` installed around it.
    WithHandler { handler: HandlerRef, program: Program },
    /// Resume the dispatch's user continuation with a value.
    Resume(Value),
    /// Hand the effect to the strictly-outer handlers.
    Forward(Box<Effect>),
    /// Reify the user continuation delimited by the current dispatch.
    GetContinuation,
    /// Build an unstarted continuation from a program and handler scopes.
    CreateContinuation { program: Program, handlers: HandlerSnapshot },
    /// Resume a reified continuation (one-shot).
    ResumeContinuation { continuation: Continuation, value: Value },
    /// Read the current dispatch's handler snapshot.
    GetHandlers,
    /// Replace the current task's continuation (scheduler internal).
    ResumeK(Box<ResumeK>),
    /// Hand an awaitable to the outer driver loop.
    AsyncEscape(EscapePayload),

    // -- scheduler surface ------------------------------------------------
    /// Start a task running `program` concurrently; answers its handle.
    Spawn(Program),
    /// Await a task, promise, or external promise value.
    Wait(Value),
    /// Reschedule the current task behind the queue and switch.
    YieldNow,
    /// Await several items, preserving argument order.
    Gather(Vec<GatherItem>),
    /// Await the first of several tasks to complete.
    Race(Vec<TaskHandle>),
    /// Cancel a task; answers whether it was newly cancelled.
    CancelTask(TaskHandle),
    /// Answer whether a task has completed.
    TaskIsDone(TaskHandle),
    /// Create an in-machine promise.
    CreatePromise,
    /// Resolve a promise with a value, waking its waiters.
    CompletePromise { promise: PromiseHandle, value: Value },
    /// Fail a promise with an error, waking its waiters.
    FailPromise { promise: PromiseHandle, error: RuntimeError },
    /// Create a promise completable from outside the machine.
    CreateExternalPromise,
    /// Block until an external completion arrives; answers the opaque
    /// completion message.
    WaitExternal,
    /// Internal scheduler store operation.
    Sched(SchedOp),

    // -- I/O --------------------------------------------------------------
    /// Run an awaitable: the async driver escapes, the sync driver runs
    /// it on the I/O bridge.
    Await(AsyncTask),
    /// Suspend for a duration.
    Delay(Duration),

    // -- illustrative / user-defined --------------------------------------
    /// Read a key from the environment.
    Ask(String),
    /// A user-defined effect.
    Custom(CustomEffect),
}

/// A user-defined effect: a tag plus an arbitrary payload.
#[derive(Debug, Clone, PartialEq)]
pub struct CustomEffect {
    pub name: String,
    pub payload: Value,
}

impl CustomEffect {
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self { name: name.into(), payload }
    }
}

/// One argument to `Gather`: an already-waitable value or a program to
/// spawn.
pub enum GatherItem {
    Program(Program),
    Waitable(Value),
}

impl fmt::Debug for GatherItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatherItem::Program(_) => write!(f, "Program(..)"),
            GatherItem::Waitable(v) => write!(f, "Waitable({v:?})"),
        }
    }
}

impl Effect {
    /// Diagnostic name of the effect variant.
    pub fn kind(&self) -> &'static str {
        match self {
            Effect::Pure(_) => "Pure",
            Effect::WithHandler { .. } => "WithHandler",
            Effect::Resume(_) => "Resume",
            Effect::Forward(_) => "Forward",
            Effect::GetContinuation => "GetContinuation",
            Effect::CreateContinuation { .. } => "CreateContinuation",
            Effect::ResumeContinuation { .. } => "ResumeContinuation",
            Effect::GetHandlers => "GetHandlers",
            Effect::ResumeK(_) => "ResumeK",
            Effect::AsyncEscape(_) => "AsyncEscape",
            Effect::Spawn(_) => "Spawn",
            Effect::Wait(_) => "Wait",
            Effect::YieldNow => "YieldNow",
            Effect::Gather(_) => "Gather",
            Effect::Race(_) => "Race",
            Effect::CancelTask(_) => "CancelTask",
            Effect::TaskIsDone(_) => "TaskIsDone",
            Effect::CreatePromise => "CreatePromise",
            Effect::CompletePromise { .. } => "CompletePromise",
            Effect::FailPromise { .. } => "FailPromise",
            Effect::CreateExternalPromise => "CreateExternalPromise",
            Effect::WaitExternal => "WaitExternal",
            Effect::Sched(_) => "Sched",
            Effect::Await(_) => "Await",
            Effect::Delay(_) => "Delay",
            Effect::Ask(_) => "Ask",
            Effect::Custom(_) => "Custom",
        }
    }

    /// True for the control primitives the machine interprets itself
    /// rather than dispatching to handlers.
    pub fn is_machine_primitive(&self) -> bool {
        matches!(
            self,
            Effect::Pure(_)
                | Effect::WithHandler { .. }
                | Effect::Resume(_)
                | Effect::Forward(_)
                | Effect::GetContinuation
                | Effect::CreateContinuation { .. }
                | Effect::ResumeContinuation { .. }
                | Effect::GetHandlers
                | Effect::ResumeK(_)
                | Effect::AsyncEscape(_)
        )
    }

    /// Convenience constructor for user-defined effects.
    pub fn custom(name: impl Into<String>, payload: Value) -> Self {
        Effect::Custom(CustomEffect::new(name, payload))
    }
}

impl fmt::Debug for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Effect::Custom(c) => write!(f, "Custom({}, {:?})", c.name, c.payload),
            Effect::Ask(key) => write!(f, "Ask({key:?})"),
            Effect::Sched(op) => write!(f, "Sched({op:?})"),
            other => write!(f, "{}", other.kind()),
        }
    }
}
