//! Prism Core
//!
//! Shared types for the prism effect interpreter: values, identity types,
//! the program/coroutine representation, effects, handlers, continuation
//! frames, and the error taxonomy. The abstract machine itself lives in
//! `prism-machine`; handlers and drivers live in `prism-rt`.

pub mod effect;
pub mod env;
pub mod error;
pub mod external;
pub mod frame;
pub mod handler;
pub mod ids;
pub mod program;
pub mod store;
pub mod values;

pub use effect::{
    async_task, AsyncTask, CustomEffect, Effect, EscapePayload, GatherItem, Inject, QueuedTask,
    ResumeK, SchedOp, TaskK, ValueFuture, Waiter, WaiterSlot,
};
pub use env::Environment;
pub use error::{RuntimeError, SourceSite, Traceback};
pub use external::{
    completion_queue, CompletionMessage, CompletionReceiver, CompletionSender, ExternalPromise,
};
pub use frame::{
    Continuation, DispatchingFrame, Frame, FrameInfo, FrameKind, ReturnFrame, WithHandlerFrame,
};
pub use handler::{handler_fn, Handler, HandlerCtx, HandlerEntry, HandlerRef, HandlerSnapshot};
pub use ids::{ContinuationId, ExternalPromiseId, HandleId, ScopeId, TaskId};
pub use program::{Coroutine, Input, Program, ProgramKind, StepOutcome};
pub use store::Store;
pub use values::{OpaqueValue, PromiseHandle, TaskHandle, Value};
