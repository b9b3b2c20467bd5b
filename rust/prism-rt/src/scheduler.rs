//! The cooperative task scheduler, built as an effect handler.
//!
//! One handler interprets the scheduling surface — `Spawn`, `Wait`,
//! `YieldNow`, `Gather`, `Race`, cancellation and promises — in terms of
//! the algebraic primitives: it captures the suspending task's
//! continuation with `GetContinuation`, parks it in the waiter map, and
//! switches to the next runnable task with `ResumeK`. All bookkeeping
//! goes through the internal `Sched` operations answered by the state
//! handler, which must be installed outside this one.
//!
//! Tasks switch only here; there is no preemption. A task that never
//! yields a scheduled effect runs to completion.

use tracing::debug;

use prism_core::{
    handler_fn, CompletionMessage, Coroutine, Effect, Environment, Frame, GatherItem, HandleId,
    HandlerCtx, HandlerRef, HandlerSnapshot, Inject, Input, Program, PromiseHandle, QueuedTask,
    ResumeK, ReturnFrame, RuntimeError, SchedOp, SourceSite, StepOutcome, Store, TaskHandle,
    TaskId, TaskK, Value, Waiter, WaiterSlot,
};

use crate::patterns::{forward_on, resume_with};
use crate::sched_state::{decode_queue_status, decode_status, HandleStatus};

/// Environment and store of the task that is about to suspend, captured
/// at dispatch time.
#[derive(Clone)]
struct SuspendSite {
    env: Environment,
    store: Store,
}

impl SuspendSite {
    fn of(ctx: &HandlerCtx) -> Self {
        Self { env: ctx.env.clone(), store: ctx.store.snapshot() }
    }
}

/// Handler scopes strictly inner to the scheduler at the effect site;
/// spawned tasks inherit copies of these (the scheduler's own scope and
/// everything outside it are shared with every task).
fn inherited_handlers(ctx: &HandlerCtx) -> HandlerSnapshot {
    ctx.handlers.suffix(ctx.handler_index + 1)
}

/// Build the cooperative task scheduler handler.
pub fn task_scheduler_handler() -> HandlerRef {
    handler_fn("scheduler", |effect, ctx| {
        let site = SuspendSite::of(ctx);
        match effect {
            Effect::Spawn(program) => {
                spawn_task(program, inherited_handlers(ctx), site).and_then(resume_with)
            }
            Effect::Sched(SchedOp::TaskFinished { handle, task_id, result }) => {
                task_finished(handle, task_id, result)
            }
            Effect::Wait(waitable) => wait(waitable, site),
            Effect::YieldNow => yield_now(site),
            Effect::Gather(items) => gather(items, inherited_handlers(ctx), site),
            Effect::Race(tasks) => race(tasks, site),
            Effect::CancelTask(task) => {
                Program::perform(Effect::Sched(SchedOp::Cancel { handle: task.handle }))
                    .and_then(resume_with)
            }
            Effect::TaskIsDone(task) => task_is_done(task),
            Effect::CreatePromise => {
                Program::perform(Effect::Sched(SchedOp::CreatePromiseHandle)).and_then(resume_with)
            }
            Effect::CompletePromise { promise, value } => settle_promise(promise, Ok(value)),
            Effect::FailPromise { promise, error } => settle_promise(promise, Err(error)),
            other => forward_on(other),
        }
    })
}

// ---------------------------------------------------------------------------
// Spawn
// ---------------------------------------------------------------------------

/// Materialize a task: registry record, completion wrapper, queue entry.
/// Produces the task value without resuming (gather spawns inline).
fn spawn_task(program: Program, inherited: HandlerSnapshot, site: SuspendSite) -> Program {
    let task_id = TaskId::next();
    let child_env = site.env;
    let child_store = site.store.snapshot();
    Program::perform(Effect::Sched(SchedOp::CreateTaskHandle { task_id })).and_then(
        move |task_value| {
            let Some(task) = task_value.as_task() else {
                return Program::fail(RuntimeError::invariant("CreateTaskHandle answered a non-task"));
            };
            debug!(task = %task_id, handle = %task.handle, "spawn");
            let wrapped = completion_wrapper(program, task_id, task.handle);
            let entry = QueuedTask {
                task_id,
                k: TaskK::Fresh { program: wrapped, handlers: inherited },
                env: child_env,
                store: child_store,
                inject: None,
            };
            Program::perform(Effect::Sched(SchedOp::Enqueue(entry)))
                .map(move |_| Value::Task(task))
        },
    )
}

/// Wrap a spawned program so it reports its completion (value or error)
/// to the scheduler instead of returning into thin air.
fn completion_wrapper(program: Program, task_id: TaskId, handle: HandleId) -> Program {
    program
        .and_then(move |value| {
            Program::perform(Effect::Sched(SchedOp::TaskFinished {
                handle,
                task_id,
                result: Ok(value),
            }))
        })
        .or_else(move |error| {
            Program::perform(Effect::Sched(SchedOp::TaskFinished {
                handle,
                task_id,
                result: Err(error),
            }))
        })
}

/// A spawned task finished: record the result (waking waiters) and
/// switch to whatever is runnable next.
fn task_finished(
    handle: HandleId,
    task_id: TaskId,
    result: Result<Value, RuntimeError>,
) -> Program {
    debug!(task = %task_id, %handle, ok = result.is_ok(), "task finished");
    Program::perform(Effect::Sched(SchedOp::Complete { handle, result })).and_then(move |_| {
        switch_to_next(Program::fail(RuntimeError::Deadlock(
            "a task completed but nothing is runnable and no waiter was woken".to_string(),
        )))
    })
}

// ---------------------------------------------------------------------------
// Task switching
// ---------------------------------------------------------------------------

/// Dequeue and switch to the next runnable task. When the queue is empty:
/// wait for an external completion if one is pending, otherwise run
/// `on_idle` (the caller knows whether idleness means completion or
/// deadlock).
fn switch_to_next(on_idle: Program) -> Program {
    Program::perform(Effect::Sched(SchedOp::Dequeue)).and_then(move |answer| match answer {
        Value::Opaque(entry) => match entry.take::<QueuedTask>() {
            Some(task) => switch_to(*task),
            None => Program::fail(RuntimeError::invariant("dequeued entry already taken")),
        },
        Value::Null => {
            Program::perform(Effect::Sched(SchedOp::QueueStatus)).and_then(move |status| {
                match decode_queue_status(&status) {
                    Err(e) => Program::fail(e),
                    // A completion landed between the dequeue and the
                    // status check; go around again.
                    Ok((false, _)) => Program::defer(move || switch_to_next(on_idle)),
                    Ok((true, true)) => wait_external_then_switch(on_idle),
                    Ok((true, false)) => on_idle,
                }
            })
        }
        _ => Program::fail(RuntimeError::invariant("malformed dequeue answer")),
    })
}

fn switch_to(task: QueuedTask) -> Program {
    let QueuedTask { task_id, k, env, store, inject } = task;
    Program::perform(Effect::ResumeK(Box::new(ResumeK {
        task_id,
        k,
        env: Some(env),
        store: Some(store),
        inject,
    })))
}

/// Nothing is runnable but external promises are pending: block on the
/// completion queue (via the installed external-wait handler), apply the
/// completion, and go back to the dequeue loop.
fn wait_external_then_switch(on_idle: Program) -> Program {
    Program::perform(Effect::WaitExternal).and_then(move |answer| {
        let Value::Opaque(opaque) = answer else {
            return Program::fail(RuntimeError::invariant("malformed external completion"));
        };
        let Some(msg) = opaque.take::<CompletionMessage>() else {
            return Program::fail(RuntimeError::invariant("external completion already taken"));
        };
        Program::perform(Effect::Sched(SchedOp::ResolveExternal(*msg)))
            .and_then(move |_| Program::defer(move || switch_to_next(on_idle)))
    })
}

/// Park the current task's continuation as a waiter on `handles` and
/// switch away. `retry` (if any) becomes the innermost frame of the
/// saved continuation, so the wake-up value lands there first.
fn suspend_on(
    handles: Vec<HandleId>,
    retry: Option<Box<dyn Coroutine>>,
    site: SuspendSite,
) -> Program {
    Program::perform(Effect::GetContinuation).and_then(move |cont_value| {
        let Value::Continuation(cont) = cont_value else {
            return Program::fail(RuntimeError::invariant("GetContinuation answered a non-continuation"));
        };
        let Some(mut frames) = cont.take_frames() else {
            return Program::fail(RuntimeError::invariant("captured continuation was empty"));
        };
        if let Some(retry) = retry {
            frames.push(Frame::Return(ReturnFrame {
                program: retry,
                env: site.env.clone(),
                site: SourceSite::here("scheduler-retry"),
            }));
        }
        Program::perform(Effect::Sched(SchedOp::CurrentTask)).and_then(move |answer| {
            let Some(raw) = answer.as_int() else {
                return Program::fail(RuntimeError::invariant("malformed current-task answer"));
            };
            let task_id = TaskId::from_raw(raw as u64);
            let waiter =
                Waiter::new(task_id, WaiterSlot { frames, env: site.env, store: site.store });
            let registrations = handles
                .into_iter()
                .map(|handle| {
                    Program::perform(Effect::Sched(SchedOp::RegisterWaiter {
                        handle,
                        waiter: waiter.clone(),
                    }))
                })
                .collect();
            Program::sequence(registrations).and_then(|_| {
                switch_to_next(Program::fail(RuntimeError::Deadlock(
                    "suspended with nothing runnable".to_string(),
                )))
            })
        })
    })
}

// ---------------------------------------------------------------------------
// Wait
// ---------------------------------------------------------------------------

fn wait(waitable: Value, site: SuspendSite) -> Program {
    let Some(handle) = waitable.waitable_handle() else {
        return Program::fail(RuntimeError::Type(format!(
            "Wait requires a task or promise, got {waitable:?}"
        )));
    };
    // Cancellation of the running task takes effect at its next wait.
    Program::perform(Effect::Sched(SchedOp::CurrentTaskCancelled)).and_then(move |cancelled| {
        if cancelled.as_bool().unwrap_or(false) {
            return Program::fail(RuntimeError::TaskCancelled);
        }
        Program::perform(Effect::Sched(SchedOp::GetResult { handle })).and_then(move |answer| {
            match decode_status(&answer) {
                Err(e) => Program::fail(e),
                Ok(None) => Program::fail(RuntimeError::UnknownHandle(handle)),
                Ok(Some(status)) if status.complete => settled(status),
                Ok(Some(_)) => pending_wait(handle, site),
            }
        })
    })
}

/// Deliver a completed handle's result to the effect site.
fn settled(status: HandleStatus) -> Program {
    if status.cancelled {
        return Program::fail(RuntimeError::TaskCancelled);
    }
    match status.result {
        Some(Ok(value)) => resume_with(value),
        Some(Err(error)) => Program::fail(error),
        None => resume_with(Value::Null),
    }
}

fn pending_wait(handle: HandleId, site: SuspendSite) -> Program {
    Program::perform(Effect::Sched(SchedOp::QueueStatus)).and_then(move |status| {
        match decode_queue_status(&status) {
            Err(e) => Program::fail(e),
            // Raised at the would-be suspender, with its continuation
            // intact, so user code can observe the deadlock.
            Ok((true, false)) => Program::fail(RuntimeError::Deadlock(format!(
                "waiting on {handle} but no other task is runnable"
            ))),
            Ok(_) => suspend_on(vec![handle], None, site),
        }
    })
}

// ---------------------------------------------------------------------------
// YieldNow
// ---------------------------------------------------------------------------

/// Requeue the current task behind everything runnable and switch.
fn yield_now(site: SuspendSite) -> Program {
    Program::perform(Effect::GetContinuation).and_then(move |cont_value| {
        let Value::Continuation(cont) = cont_value else {
            return Program::fail(RuntimeError::invariant("GetContinuation answered a non-continuation"));
        };
        let Some(frames) = cont.take_frames() else {
            return Program::fail(RuntimeError::invariant("captured continuation was empty"));
        };
        Program::perform(Effect::Sched(SchedOp::CurrentTask)).and_then(move |answer| {
            let Some(raw) = answer.as_int() else {
                return Program::fail(RuntimeError::invariant("malformed current-task answer"));
            };
            let entry = QueuedTask {
                task_id: TaskId::from_raw(raw as u64),
                k: TaskK::Saved { frames },
                env: site.env,
                store: site.store,
                inject: Some(Inject::Value(Value::Null)),
            };
            Program::perform(Effect::Sched(SchedOp::Enqueue(entry))).and_then(|_| {
                switch_to_next(Program::fail(RuntimeError::invariant(
                    "yielded task vanished from the queue",
                )))
            })
        })
    })
}

// ---------------------------------------------------------------------------
// Gather / Race
// ---------------------------------------------------------------------------

fn gather(items: Vec<GatherItem>, inherited: HandlerSnapshot, site: SuspendSite) -> Program {
    if items.is_empty() {
        return resume_with(Value::list(Vec::new()));
    }
    let spawns: Vec<Program> = items
        .into_iter()
        .map(|item| match item {
            GatherItem::Program(p) => spawn_task(p, inherited.clone(), site.clone()),
            GatherItem::Waitable(v) if v.waitable_handle().is_some() => Program::pure(v),
            GatherItem::Waitable(v) => Program::fail(RuntimeError::Type(format!(
                "Gather requires programs or waitables, got {v:?}"
            ))),
        })
        .collect();
    Program::sequence(spawns).and_then(move |waitables_list| {
        let waitables = waitables_list.as_list().map(<[Value]>::to_vec).unwrap_or_default();
        gather_check(waitables, site)
    })
}

/// Read every waitable's status; return when all are settled, otherwise
/// park a retry waiter on the pending ones.
fn gather_check(waitables: Vec<Value>, site: SuspendSite) -> Program {
    let handles: Vec<HandleId> =
        waitables.iter().filter_map(Value::waitable_handle).collect();
    let lookups = handles
        .iter()
        .map(|&handle| Program::perform(Effect::Sched(SchedOp::GetResult { handle })))
        .collect();
    Program::sequence(lookups).and_then(move |answers| {
        let Some(statuses) = answers.as_list() else {
            return Program::fail(RuntimeError::invariant("malformed status list"));
        };
        let mut results = Vec::with_capacity(handles.len());
        let mut pending: Vec<HandleId> = Vec::new();
        for (i, answer) in statuses.iter().enumerate() {
            match decode_status(answer) {
                Err(e) => return Program::fail(e),
                Ok(None) => return Program::fail(RuntimeError::UnknownHandle(handles[i])),
                Ok(Some(status)) if status.complete => {
                    if status.cancelled {
                        return Program::fail(RuntimeError::TaskCancelled);
                    }
                    match status.result {
                        Some(Ok(v)) => results.push(v),
                        Some(Err(e)) => return Program::fail(e),
                        None => results.push(Value::Null),
                    }
                }
                Ok(Some(_)) => {
                    pending.push(handles[i]);
                    results.push(Value::Null);
                }
            }
        }
        if pending.is_empty() {
            return resume_with(Value::list(results));
        }
        let retry = Box::new(GatherRetry { waitables, emitted: false });
        guard_suspend(pending, retry, site)
    })
}

fn race(tasks: Vec<TaskHandle>, site: SuspendSite) -> Program {
    if tasks.is_empty() {
        return Program::fail(RuntimeError::Type("Race requires at least one task".to_string()));
    }
    let lookups = tasks
        .iter()
        .map(|t| Program::perform(Effect::Sched(SchedOp::GetResult { handle: t.handle })))
        .collect();
    Program::sequence(lookups).and_then(move |answers| {
        let Some(statuses) = answers.as_list() else {
            return Program::fail(RuntimeError::invariant("malformed status list"));
        };
        for (i, answer) in statuses.iter().enumerate() {
            match decode_status(answer) {
                Err(e) => return Program::fail(e),
                Ok(None) => return Program::fail(RuntimeError::UnknownHandle(tasks[i].handle)),
                Ok(Some(status)) if status.complete => return race_settled(&tasks, i, status),
                Ok(Some(_)) => {}
            }
        }
        let handles = tasks.iter().map(|t| t.handle).collect();
        let retry = Box::new(RaceRetry { tasks, emitted: false });
        guard_suspend(handles, retry, site)
    })
}

/// The record a winning race produces: the winner, its value, and the
/// still-running rest in argument order.
fn race_settled(tasks: &[TaskHandle], winner: usize, status: HandleStatus) -> Program {
    if status.cancelled {
        return Program::fail(RuntimeError::TaskCancelled);
    }
    match status.result {
        Some(Err(e)) => Program::fail(e),
        Some(Ok(value)) => {
            let rest: Vec<Value> = tasks
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != winner)
                .map(|(_, t)| Value::Task(*t))
                .collect();
            resume_with(Value::map(
                [
                    ("winner".to_string(), Value::Task(tasks[winner])),
                    ("value".to_string(), value),
                    ("rest".to_string(), Value::list(rest)),
                ]
                .into_iter()
                .collect(),
            ))
        }
        None => Program::fail(RuntimeError::invariant("completed task has no result")),
    }
}

/// Deadlock pre-check shared by gather and race before suspending.
fn guard_suspend(
    handles: Vec<HandleId>,
    retry: Box<dyn Coroutine>,
    site: SuspendSite,
) -> Program {
    Program::perform(Effect::Sched(SchedOp::QueueStatus)).and_then(move |status| {
        match decode_queue_status(&status) {
            Err(e) => Program::fail(e),
            Ok((true, false)) => Program::fail(RuntimeError::Deadlock(
                "waiting on tasks but no other task is runnable".to_string(),
            )),
            Ok(_) => suspend_on(handles, Some(retry), site),
        }
    })
}

// ---------------------------------------------------------------------------
// Retry coroutines
// ---------------------------------------------------------------------------

/// Woken gather waiter: re-dispatch `Gather` over the (now partially
/// settled) waitables and hand the final list through.
struct GatherRetry {
    waitables: Vec<Value>,
    emitted: bool,
}

impl Coroutine for GatherRetry {
    fn step(&mut self, input: Input) -> StepOutcome {
        if self.emitted {
            return match input {
                Input::Value(v) => StepOutcome::Return(v),
                Input::Error(e) => StepOutcome::Raise(e),
                Input::Start => StepOutcome::Raise(RuntimeError::invariant("retry restarted")),
            };
        }
        match input {
            Input::Error(e) => StepOutcome::Raise(e),
            _ => {
                self.emitted = true;
                let items =
                    self.waitables.iter().cloned().map(GatherItem::Waitable).collect();
                StepOutcome::Effect(Effect::Gather(items))
            }
        }
    }
}

/// Woken race waiter: re-dispatch `Race` and hand the record through.
struct RaceRetry {
    tasks: Vec<TaskHandle>,
    emitted: bool,
}

impl Coroutine for RaceRetry {
    fn step(&mut self, input: Input) -> StepOutcome {
        if self.emitted {
            return match input {
                Input::Value(v) => StepOutcome::Return(v),
                Input::Error(e) => StepOutcome::Raise(e),
                Input::Start => StepOutcome::Raise(RuntimeError::invariant("retry restarted")),
            };
        }
        match input {
            Input::Error(e) => StepOutcome::Raise(e),
            _ => {
                self.emitted = true;
                StepOutcome::Effect(Effect::Race(self.tasks.clone()))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Queries and promises
// ---------------------------------------------------------------------------

fn task_is_done(task: TaskHandle) -> Program {
    Program::perform(Effect::Sched(SchedOp::GetResult { handle: task.handle })).and_then(
        |answer| match decode_status(&answer) {
            Err(e) => Program::fail(e),
            // An unknown handle is treated as done, matching waitless
            // lookups on long-gone tasks.
            Ok(None) => resume_with(Value::Bool(true)),
            Ok(Some(status)) => resume_with(Value::Bool(status.complete)),
        },
    )
}

fn settle_promise(promise: PromiseHandle, result: Result<Value, RuntimeError>) -> Program {
    let handle = promise.handle;
    Program::perform(Effect::Sched(SchedOp::GetResult { handle })).and_then(move |answer| {
        match decode_status(&answer) {
            Err(e) => Program::fail(e),
            Ok(None) => Program::fail(RuntimeError::UnknownHandle(handle)),
            Ok(Some(status)) if status.complete => {
                Program::fail(RuntimeError::PromiseAlreadyCompleted(handle))
            }
            Ok(Some(_)) => Program::perform(Effect::Sched(SchedOp::Complete { handle, result }))
                .and_then(|_| resume_with(Value::Null)),
        }
    })
}
