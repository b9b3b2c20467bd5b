//! Handlers for `WaitExternal`.
//!
//! When the scheduler has no runnable task but external promises are
//! pending, it yields `WaitExternal` and one of these handlers services
//! it:
//!
//! - [`sync_external_wait_handler`] blocks the machine thread on the
//!   completion queue. Background producers (I/O bridge threads, foreign
//!   code holding an [`prism_core::ExternalPromise`]) unblock it.
//! - [`async_external_wait_handler`] escapes to the async driver with a
//!   `spawn_blocking` receive, so the surrounding event loop keeps
//!   running while the machine waits.

use prism_core::{
    async_task, handler_fn, CompletionMessage, Effect, EscapePayload, HandlerRef, OpaqueValue,
    Program, RuntimeError, Value,
};

use crate::patterns::{forward_on, resume_with};
use crate::sched_state::SchedulerCell;

fn completion_value(msg: CompletionMessage) -> Value {
    Value::Opaque(OpaqueValue::new("completion", msg))
}

/// Service `WaitExternal` with a blocking receive. For the synchronous
/// runner only.
pub fn sync_external_wait_handler() -> HandlerRef {
    handler_fn("sync-external-wait", |effect, ctx| match effect {
        Effect::WaitExternal => {
            let cell = SchedulerCell::for_store(&ctx.store);
            match cell.completions().recv() {
                Some(msg) => resume_with(completion_value(msg)),
                None => Program::fail(RuntimeError::invariant("completion queue closed")),
            }
        }
        other => forward_on(other),
    })
}

/// Service `WaitExternal` by escaping to the async driver, which awaits
/// the blocking receive on a worker thread.
pub fn async_external_wait_handler() -> HandlerRef {
    handler_fn("async-external-wait", |effect, ctx| match effect {
        Effect::WaitExternal => {
            let receiver = SchedulerCell::for_store(&ctx.store).completions();
            let escape = Effect::AsyncEscape(EscapePayload::Single(async_task(move || async move {
                let msg = tokio::task::spawn_blocking(move || receiver.recv())
                    .await
                    .map_err(|e| RuntimeError::invariant(format!("completion wait failed: {e}")))?
                    .ok_or_else(|| RuntimeError::invariant("completion queue closed"))?;
                Ok(completion_value(msg))
            })));
            Program::perform(escape).and_then(resume_with)
        }
        other => forward_on(other),
    })
}
