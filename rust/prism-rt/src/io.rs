//! Await/Delay handlers and the synchronous I/O bridge.
//!
//! The `Await` effect carries a real awaitable. Under the asynchronous
//! runner it escapes to the driver's event loop; under the synchronous
//! runner an [`IoBridge`] — a driver-owned background tokio runtime —
//! runs the awaitable while the machine thread blocks. `Delay` is the
//! timer leg of the same split (and the delay half of a
//! race-with-timeout).

use std::sync::Arc;
use std::time::Duration;

use prism_core::{
    async_task, handler_fn, AsyncTask, Effect, EscapePayload, HandlerRef, Program, RuntimeError,
    Value,
};

use crate::patterns::{forward_on, resume_with};

// ---------------------------------------------------------------------------
// IoBridge
// ---------------------------------------------------------------------------

/// A background async runtime owned by the synchronous driver.
///
/// There is deliberately no process-wide bridge: each runner builds its
/// own and hands it to [`threaded_io_handler`], so runtime lifetime
/// follows driver lifetime.
pub struct IoBridge {
    runtime: tokio::runtime::Runtime,
}

impl IoBridge {
    /// Build a bridge with `workers` I/O threads (0 picks a small default
    /// from the CPU count).
    pub fn new(workers: usize) -> std::io::Result<Self> {
        let workers = if workers == 0 { num_cpus::get().clamp(1, 4) } else { workers };
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(workers)
            .thread_name("prism-io")
            .enable_all()
            .build()?;
        Ok(Self { runtime })
    }

    /// Run an awaitable to completion, blocking the calling thread.
    pub fn run(&self, task: AsyncTask) -> Result<Value, RuntimeError> {
        self.runtime.block_on(task.start())
    }

    /// Sleep on the bridge's timer, blocking the calling thread. The
    /// scheduler does not run meanwhile — the documented trade-off of the
    /// synchronous driver.
    pub fn sleep(&self, duration: Duration) {
        self.runtime.block_on(tokio::time::sleep(duration));
    }
}

impl std::fmt::Debug for IoBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoBridge").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Service `Await`/`Delay` on the I/O bridge, blocking the machine
/// thread until the result arrives. For the synchronous runner.
pub fn threaded_io_handler(bridge: Arc<IoBridge>) -> HandlerRef {
    handler_fn("threaded-io", move |effect, _ctx| match effect {
        Effect::Await(task) => match bridge.run(task) {
            Ok(value) => resume_with(value),
            Err(error) => Program::fail(error),
        },
        Effect::Delay(duration) => {
            bridge.sleep(duration);
            resume_with(Value::Null)
        }
        other => forward_on(other),
    })
}

/// Convert `Await`/`Delay` into async escapes serviced by the async
/// driver's own event loop.
pub fn async_io_handler() -> HandlerRef {
    handler_fn("async-io", |effect, _ctx| match effect {
        Effect::Await(task) => {
            Program::perform(Effect::AsyncEscape(EscapePayload::Single(task)))
                .and_then(resume_with)
        }
        Effect::Delay(duration) => {
            let escape = Effect::AsyncEscape(EscapePayload::Single(async_task(move || async move {
                tokio::time::sleep(duration).await;
                Ok(Value::Null)
            })));
            Program::perform(escape).and_then(resume_with)
        }
        other => forward_on(other),
    })
}
