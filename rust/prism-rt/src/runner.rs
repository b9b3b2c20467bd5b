//! Drivers: the synchronous and asynchronous runners.
//!
//! Both build an initial state from `(program, handlers, env, store)` —
//! wrapping the program in nested `WithHandler` layers, first handler
//! outermost — and loop on the step function. They differ only in how
//! they treat an async escape: the synchronous runner throws
//! `EscapeUnsupported` back into the machine (handlers for awaitables
//! must be synchronous there, see [`crate::io::threaded_io_handler`]);
//! the asynchronous runner awaits the payload and resumes.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use prism_core::{
    Environment, EscapePayload, HandlerRef, Program, RuntimeError, Store, TaskId, Traceback, Value,
};
use prism_machine::{step, CeskState, StepResult};

use crate::external::{async_external_wait_handler, sync_external_wait_handler};
use crate::io::{async_io_handler, threaded_io_handler, IoBridge};
use crate::sched_state::scheduler_state_handler;
use crate::scheduler::task_scheduler_handler;

// ---------------------------------------------------------------------------
// Options and results
// ---------------------------------------------------------------------------

/// Driver configuration. Owned by the runner; there is no global runtime
/// state.
#[derive(Debug, Clone, Default)]
pub struct RunnerOptions {
    /// Abort with `StepLimitExceeded` after this many machine steps.
    pub max_steps: Option<u64>,
    /// Worker threads for the synchronous runner's I/O bridge
    /// (0 = derive from CPU count).
    pub io_workers: usize,
}

/// The outcome of a run: the final value or error, the traceback captured
/// on failure, and the final store.
#[derive(Debug)]
pub struct RuntimeResult {
    result: Result<Value, RuntimeError>,
    traceback: Option<Traceback>,
    store: Store,
}

impl RuntimeResult {
    fn ok(value: Value, store: Store) -> Self {
        Self { result: Ok(value), traceback: None, store }
    }

    fn err(error: RuntimeError, traceback: Option<Traceback>, store: Store) -> Self {
        Self { result: Err(error), traceback, store }
    }

    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    pub fn is_err(&self) -> bool {
        self.result.is_err()
    }

    pub fn value(&self) -> Option<&Value> {
        self.result.as_ref().ok()
    }

    pub fn error(&self) -> Option<&RuntimeError> {
        self.result.as_ref().err()
    }

    pub fn result(&self) -> &Result<Value, RuntimeError> {
        &self.result
    }

    pub fn into_result(self) -> Result<Value, RuntimeError> {
        self.result
    }

    /// The effect-level stack captured when the run failed.
    pub fn traceback(&self) -> Option<&Traceback> {
        self.traceback.as_ref()
    }

    /// The store at termination.
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Return the value, panicking on error (test and script
    /// convenience).
    #[track_caller]
    pub fn unwrap(self) -> Value {
        match self.result {
            Ok(value) => value,
            Err(error) => panic!("runtime result was an error: {error}"),
        }
    }

    /// Return the error, panicking on success.
    #[track_caller]
    pub fn unwrap_err(self) -> RuntimeError {
        match self.result {
            Ok(value) => panic!("runtime result was a value: {value:?}"),
            Err(error) => error,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared plumbing
// ---------------------------------------------------------------------------

/// Wrap a program in `WithHandler` layers, first handler outermost.
fn wrap_with_handlers(program: Program, handlers: Vec<HandlerRef>) -> Program {
    let mut wrapped = program;
    for handler in handlers.into_iter().rev() {
        wrapped = Program::handled(handler, wrapped);
    }
    wrapped
}

fn initial_state(
    program: Program,
    handlers: Vec<HandlerRef>,
    env: Environment,
    store: Store,
) -> CeskState {
    CeskState::initial(wrap_with_handlers(program, handlers), env, store)
}

/// The handler stack for scheduled synchronous runs, outermost first.
fn sync_scheduled_stack(bridge: Arc<IoBridge>, user: Vec<HandlerRef>) -> Vec<HandlerRef> {
    let mut stack = vec![
        scheduler_state_handler(),
        sync_external_wait_handler(),
        threaded_io_handler(bridge),
        task_scheduler_handler(),
    ];
    stack.extend(user);
    stack
}

/// The handler stack for scheduled asynchronous runs, outermost first.
fn async_scheduled_stack(user: Vec<HandlerRef>) -> Vec<HandlerRef> {
    let mut stack = vec![
        scheduler_state_handler(),
        async_external_wait_handler(),
        async_io_handler(),
        task_scheduler_handler(),
    ];
    stack.extend(user);
    stack
}

// ---------------------------------------------------------------------------
// SyncRunner
// ---------------------------------------------------------------------------

/// The synchronous driver.
#[derive(Debug, Default)]
pub struct SyncRunner {
    pub options: RunnerOptions,
}

impl SyncRunner {
    pub fn new(options: RunnerOptions) -> Self {
        Self { options }
    }

    /// Run a program under the given handler stack (first handler
    /// outermost).
    pub fn run(
        &self,
        program: Program,
        handlers: Vec<HandlerRef>,
        env: Environment,
        store: Store,
    ) -> RuntimeResult {
        debug!(handlers = handlers.len(), "sync run");
        self.drive(initial_state(program, handlers, env, store))
    }

    /// Run a program under the scheduler preset plus `user_handlers`
    /// (innermost). Builds a fresh I/O bridge owned by this call.
    pub fn run_scheduled(
        &self,
        program: Program,
        user_handlers: Vec<HandlerRef>,
        env: Environment,
        store: Store,
    ) -> RuntimeResult {
        let bridge = match IoBridge::new(self.options.io_workers) {
            Ok(bridge) => Arc::new(bridge),
            Err(e) => {
                return RuntimeResult::err(
                    RuntimeError::invariant(format!("could not build I/O bridge: {e}")),
                    None,
                    store,
                )
            }
        };
        self.run(program, sync_scheduled_stack(bridge, user_handlers), env, store)
    }

    fn drive(&self, mut state: CeskState) -> RuntimeResult {
        let mut steps: u64 = 0;
        loop {
            if let Some(limit) = self.options.max_steps {
                steps += 1;
                if steps > limit {
                    let store = state.store.clone();
                    return RuntimeResult::err(RuntimeError::StepLimitExceeded(limit), None, store);
                }
            }
            match step(state) {
                StepResult::Next(next) => state = next,
                StepResult::Done { value, store } => return RuntimeResult::ok(value, store),
                StepResult::Failed { error, store, traceback } => {
                    return RuntimeResult::err(error, traceback, store)
                }
                StepResult::Escape(req) => {
                    // Seeing an escape here means an async-only handler
                    // was installed under the synchronous driver.
                    debug!("async escape reached the sync runner");
                    state = req.resume_error(RuntimeError::EscapeUnsupported);
                }
            }
        }
    }
}

/// Run a program synchronously under the given handlers.
pub fn sync_run(
    program: Program,
    handlers: Vec<HandlerRef>,
    env: Environment,
    store: Store,
) -> RuntimeResult {
    SyncRunner::default().run(program, handlers, env, store)
}

/// Run a program synchronously under the scheduler preset.
pub fn sync_run_scheduled(
    program: Program,
    user_handlers: Vec<HandlerRef>,
    env: Environment,
    store: Store,
) -> RuntimeResult {
    SyncRunner::default().run_scheduled(program, user_handlers, env, store)
}

// ---------------------------------------------------------------------------
// AsyncRunner
// ---------------------------------------------------------------------------

/// The asynchronous driver. Awaits escape payloads on the caller's event
/// loop; cancellation of the returned future propagates out
/// uninterpreted.
#[derive(Debug, Default)]
pub struct AsyncRunner {
    pub options: RunnerOptions,
}

impl AsyncRunner {
    pub fn new(options: RunnerOptions) -> Self {
        Self { options }
    }

    /// Run a program under the given handler stack (first handler
    /// outermost).
    pub async fn run(
        &self,
        program: Program,
        handlers: Vec<HandlerRef>,
        env: Environment,
        store: Store,
    ) -> RuntimeResult {
        debug!(handlers = handlers.len(), "async run");
        self.drive(initial_state(program, handlers, env, store)).await
    }

    /// Run a program under the async scheduler preset plus
    /// `user_handlers` (innermost).
    pub async fn run_scheduled(
        &self,
        program: Program,
        user_handlers: Vec<HandlerRef>,
        env: Environment,
        store: Store,
    ) -> RuntimeResult {
        self.run(program, async_scheduled_stack(user_handlers), env, store).await
    }

    async fn drive(&self, mut state: CeskState) -> RuntimeResult {
        let mut steps: u64 = 0;
        // Bundle awaitables persist across escapes; first completion wins
        // each round.
        let mut in_flight: tokio::task::JoinSet<(u64, Result<Value, RuntimeError>)> =
            tokio::task::JoinSet::new();
        let mut submitted: HashSet<TaskId> = HashSet::new();

        loop {
            if let Some(limit) = self.options.max_steps {
                steps += 1;
                if steps > limit {
                    let store = state.store.clone();
                    return RuntimeResult::err(RuntimeError::StepLimitExceeded(limit), None, store);
                }
            }
            match step(state) {
                StepResult::Next(next) => state = next,
                StepResult::Done { value, store } => return RuntimeResult::ok(value, store),
                StepResult::Failed { error, store, traceback } => {
                    return RuntimeResult::err(error, traceback, store)
                }
                StepResult::Escape(req) => {
                    let (payload, seat) = req.split();
                    match payload {
                        EscapePayload::Single(task) => {
                            state = match task.start().await {
                                Ok(value) => seat.resume(value),
                                Err(error) => seat.resume_error(error),
                            };
                        }
                        EscapePayload::Bundle(entries) => {
                            for (task_id, task) in entries {
                                if submitted.insert(task_id) {
                                    in_flight.spawn(async move {
                                        (task_id.as_u64(), task.start().await)
                                    });
                                }
                            }
                            state = match in_flight.join_next().await {
                                Some(Ok((raw, result))) => {
                                    submitted.remove(&TaskId::from_raw(raw));
                                    let outcome = Value::Outcome(Arc::new(result));
                                    seat.resume(Value::tuple(vec![
                                        Value::Int(raw as i64),
                                        outcome,
                                    ]))
                                }
                                Some(Err(join_error)) => seat.resume_error(
                                    RuntimeError::invariant(format!(
                                        "escaped awaitable panicked: {join_error}"
                                    )),
                                ),
                                None => seat.resume_error(RuntimeError::invariant(
                                    "escape bundle with nothing to await",
                                )),
                            };
                        }
                    }
                }
            }
        }
    }
}

/// Run a program asynchronously under the given handlers.
pub async fn async_run(
    program: Program,
    handlers: Vec<HandlerRef>,
    env: Environment,
    store: Store,
) -> RuntimeResult {
    AsyncRunner::default().run(program, handlers, env, store).await
}

/// Run a program asynchronously under the scheduler preset.
pub async fn async_run_scheduled(
    program: Program,
    user_handlers: Vec<HandlerRef>,
    env: Environment,
    store: Store,
) -> RuntimeResult {
    AsyncRunner::default().run_scheduled(program, user_handlers, env, store).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_core::Effect;

    #[test]
    fn sync_run_returns_pure_value() {
        let result = sync_run(Program::pure(Value::Int(42)), vec![], Environment::new(), Store::new());
        assert_eq!(result.unwrap(), Value::Int(42));
    }

    #[test]
    fn sync_run_reports_escapes_as_errors() {
        let p = Program::perform(Effect::AsyncEscape(prism_core::EscapePayload::Bundle(vec![])));
        let result = sync_run(p, vec![], Environment::new(), Store::new());
        assert_eq!(result.unwrap_err(), RuntimeError::EscapeUnsupported);
    }

    #[test]
    fn step_limit_is_enforced() {
        let runner = SyncRunner::new(RunnerOptions { max_steps: Some(2), ..Default::default() });
        let p = Program::pure(Value::Int(1))
            .and_then(|_| Program::pure(Value::Int(2)))
            .and_then(|_| Program::pure(Value::Int(3)));
        let result = runner.run(p, vec![], Environment::new(), Store::new());
        assert_eq!(result.unwrap_err(), RuntimeError::StepLimitExceeded(2));
    }

    #[test]
    fn failed_runs_carry_a_traceback() {
        let p = Program::pure(Value::Null).and_then(|_| Program::fail(RuntimeError::user("boom")));
        let result = sync_run(p, vec![], Environment::new(), Store::new());
        assert!(result.is_err());
        assert!(result.traceback().is_some());
    }
}
