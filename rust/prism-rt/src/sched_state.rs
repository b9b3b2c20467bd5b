//! Scheduler state: registry, queue, waiters, and the state handler.
//!
//! The scheduler's bookkeeping — task queue, task registry, waiter map,
//! current-task pointer, external-promise registry, completion queue —
//! lives in the store's reserved scheduler slot, shared by every store
//! snapshot of a run. The outermost handler in a scheduled stack is
//! [`scheduler_state_handler`]: it answers the internal `Sched` operations
//! that the task scheduler yields, and it is the only code that mutates
//! the slot.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tracing::{debug, trace};

use prism_core::{
    completion_queue, handler_fn, CompletionMessage, CompletionReceiver, CompletionSender, Effect,
    ExternalPromise, ExternalPromiseId, HandleId, HandlerRef, Inject, OpaqueValue, Program,
    PromiseHandle, QueuedTask, RuntimeError, SchedOp, Store, TaskHandle, TaskId, TaskK, Value,
    Waiter,
};

use crate::patterns::{forward_on, resume_with};

/// Reserved-store slot name for the scheduler cell.
pub const SCHEDULER_SLOT: &str = "__scheduler__";

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Registry entry for a task or promise handle.
#[derive(Debug, Default)]
struct HandleRecord {
    /// The scheduled task behind this handle; `None` for promises.
    task_id: Option<TaskId>,
    complete: bool,
    cancelled: bool,
    result: Option<Result<Value, RuntimeError>>,
}

/// Decoded answer of `SchedOp::GetResult`.
#[derive(Debug, Clone)]
pub struct HandleStatus {
    pub complete: bool,
    pub cancelled: bool,
    pub result: Option<Result<Value, RuntimeError>>,
}

#[derive(Default)]
struct SchedState {
    queue: VecDeque<QueuedTask>,
    registry: HashMap<HandleId, HandleRecord>,
    task_index: HashMap<TaskId, HandleId>,
    waiters: HashMap<HandleId, Vec<Waiter>>,
    current: Option<TaskId>,
    externals: HashMap<ExternalPromiseId, HandleId>,
}

// ---------------------------------------------------------------------------
// SchedulerCell
// ---------------------------------------------------------------------------

/// The shared scheduler state of one run.
pub struct SchedulerCell {
    state: Mutex<SchedState>,
    completions_tx: CompletionSender,
    completions_rx: CompletionReceiver,
}

impl SchedulerCell {
    fn new() -> Self {
        let (completions_tx, completions_rx) = completion_queue();
        // The main program runs as the initial current task.
        let state = SchedState { current: Some(TaskId::next()), ..Default::default() };
        Self { state: Mutex::new(state), completions_tx, completions_rx }
    }

    /// Fetch (or initialize) the scheduler cell of this run.
    pub fn for_store(store: &Store) -> Arc<SchedulerCell> {
        store.reserved_slot(SCHEDULER_SLOT, SchedulerCell::new)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SchedState> {
        self.state.lock().expect("scheduler state lock")
    }

    /// The consuming end of the completion queue.
    pub fn completions(&self) -> CompletionReceiver {
        self.completions_rx.clone()
    }

    // -- queue ------------------------------------------------------------

    fn enqueue(&self, task: QueuedTask) {
        trace!(task = %task.task_id, "enqueue");
        self.lock().queue.push_back(task);
    }

    /// Pop the next runnable task. Drains pending external completions
    /// first and skips entries whose task has been cancelled in the
    /// meantime (a cancelled task is not rescheduled).
    fn dequeue(&self) -> Option<QueuedTask> {
        self.drain_completions();
        let mut state = self.lock();
        loop {
            let task = state.queue.pop_front()?;
            let cancelled = state
                .task_index
                .get(&task.task_id)
                .and_then(|h| state.registry.get(h))
                .is_some_and(|r| r.cancelled);
            if cancelled {
                debug!(task = %task.task_id, "dropping cancelled task from queue");
                continue;
            }
            state.current = Some(task.task_id);
            return Some(task);
        }
    }

    /// `(queue_empty, externals_pending)` after draining completions.
    fn queue_status(&self) -> (bool, bool) {
        self.drain_completions();
        let state = self.lock();
        (state.queue.is_empty(), !state.externals.is_empty())
    }

    // -- registry ---------------------------------------------------------

    fn create_task_handle(&self, task_id: TaskId) -> TaskHandle {
        let handle = HandleId::next();
        let mut state = self.lock();
        state.registry.insert(handle, HandleRecord { task_id: Some(task_id), ..Default::default() });
        state.task_index.insert(task_id, handle);
        TaskHandle { handle }
    }

    fn create_promise(&self) -> PromiseHandle {
        let handle = HandleId::next();
        self.lock().registry.insert(handle, HandleRecord::default());
        PromiseHandle { handle }
    }

    fn create_external(&self) -> ExternalPromise {
        let handle = HandleId::next();
        let id = ExternalPromiseId::new();
        let mut state = self.lock();
        state.registry.insert(handle, HandleRecord::default());
        state.externals.insert(id, handle);
        ExternalPromise::new(handle, id, self.completions_tx.clone())
    }

    fn get_status(&self, handle: HandleId) -> Option<HandleStatus> {
        let state = self.lock();
        state.registry.get(&handle).map(|r| HandleStatus {
            complete: r.complete,
            cancelled: r.cancelled,
            result: r.result.clone(),
        })
    }

    /// Mark a handle complete and wake its waiters. A handle completes at
    /// most once; later completions are ignored.
    fn complete(&self, handle: HandleId, result: Result<Value, RuntimeError>) {
        let mut state = self.lock();
        let Some(record) = state.registry.get_mut(&handle) else {
            debug!(%handle, "completion for unknown handle ignored");
            return;
        };
        if record.complete {
            return;
        }
        record.complete = true;
        record.result = Some(result.clone());
        Self::wake_waiters(&mut state, handle, &result);
    }

    fn cancel(&self, handle: HandleId) -> bool {
        let mut state = self.lock();
        let Some(record) = state.registry.get_mut(&handle) else {
            return false;
        };
        if record.complete {
            return false;
        }
        record.complete = true;
        record.cancelled = true;
        record.result = Some(Err(RuntimeError::TaskCancelled));
        debug!(%handle, "task cancelled");
        Self::wake_waiters(&mut state, handle, &Err(RuntimeError::TaskCancelled));
        true
    }

    /// Wake every waiter of `handle` with the completion result. Waiter
    /// slots are take-once, so a gather/race waiter registered on several
    /// handles is woken exactly once; entries already queued for the same
    /// task are not duplicated.
    fn wake_waiters(state: &mut SchedState, handle: HandleId, result: &Result<Value, RuntimeError>) {
        let Some(waiting) = state.waiters.remove(&handle) else {
            return;
        };
        for waiter in waiting {
            if state.queue.iter().any(|t| t.task_id == waiter.task_id) {
                continue;
            }
            let Some(slot) = waiter.take() else {
                continue;
            };
            let inject = match result {
                Ok(v) => Inject::Value(v.clone()),
                Err(e) => Inject::Error(e.clone()),
            };
            trace!(task = %waiter.task_id, %handle, "waking waiter");
            state.queue.push_back(QueuedTask {
                task_id: waiter.task_id,
                k: TaskK::Saved { frames: slot.frames },
                env: slot.env,
                store: slot.store,
                inject: Some(inject),
            });
        }
    }

    fn register_waiter(&self, handle: HandleId, waiter: Waiter) {
        self.lock().waiters.entry(handle).or_default().push(waiter);
    }

    fn current_task(&self) -> Option<TaskId> {
        self.lock().current
    }

    fn current_cancelled(&self) -> bool {
        let state = self.lock();
        state
            .current
            .and_then(|t| state.task_index.get(&t))
            .and_then(|h| state.registry.get(h))
            .is_some_and(|r| r.cancelled)
    }

    // -- external completions ---------------------------------------------

    /// Apply every completion sitting in the queue right now.
    fn drain_completions(&self) {
        while let Some(msg) = self.completions_rx.try_recv() {
            self.resolve_external(msg);
        }
    }

    /// Resolve one external completion: map the promise ID to its handle
    /// and complete it. Unknown or already-resolved IDs are ignored.
    fn resolve_external(&self, msg: CompletionMessage) {
        let handle = self.lock().externals.remove(&msg.id);
        match handle {
            Some(handle) => self.complete(handle, msg.result),
            None => debug!(id = %msg.id, "completion for unknown external promise ignored"),
        }
    }
}

// ---------------------------------------------------------------------------
// Value encoding of operation answers
// ---------------------------------------------------------------------------

fn encode_status(status: Option<HandleStatus>) -> Value {
    match status {
        None => Value::Null,
        Some(s) => Value::tuple(vec![
            Value::Bool(s.complete),
            Value::Bool(s.cancelled),
            match s.result {
                Some(r) => Value::Outcome(Arc::new(r)),
                None => Value::Null,
            },
        ]),
    }
}

/// Decode a `GetResult` answer. `Ok(None)` means the handle is unknown.
pub fn decode_status(value: &Value) -> Result<Option<HandleStatus>, RuntimeError> {
    match value {
        Value::Null => Ok(None),
        Value::Tuple(items) if items.len() == 3 => {
            let complete = items[0]
                .as_bool()
                .ok_or_else(|| RuntimeError::invariant("malformed handle status"))?;
            let cancelled = items[1]
                .as_bool()
                .ok_or_else(|| RuntimeError::invariant("malformed handle status"))?;
            let result = match &items[2] {
                Value::Null => None,
                Value::Outcome(r) => Some((**r).clone()),
                _ => return Err(RuntimeError::invariant("malformed handle status")),
            };
            Ok(Some(HandleStatus { complete, cancelled, result }))
        }
        _ => Err(RuntimeError::invariant("malformed handle status")),
    }
}

/// Decode a `QueueStatus` answer into `(queue_empty, externals_pending)`.
pub fn decode_queue_status(value: &Value) -> Result<(bool, bool), RuntimeError> {
    match value {
        Value::Tuple(items) if items.len() == 2 => {
            match (items[0].as_bool(), items[1].as_bool()) {
                (Some(a), Some(b)) => Ok((a, b)),
                _ => Err(RuntimeError::invariant("malformed queue status")),
            }
        }
        _ => Err(RuntimeError::invariant("malformed queue status")),
    }
}

// ---------------------------------------------------------------------------
// The state handler
// ---------------------------------------------------------------------------

/// The outermost handler of a scheduled stack: answers the internal
/// scheduler operations against the reserved scheduler slot and creates
/// external promises. Everything else is forwarded — and, being
/// outermost, an unmatched effect fails as unhandled.
pub fn scheduler_state_handler() -> HandlerRef {
    handler_fn("scheduler-state", |effect, ctx| {
        let cell = SchedulerCell::for_store(&ctx.store);
        match effect {
            Effect::Sched(op) => handle_op(op, &cell),
            Effect::CreateExternalPromise => {
                let promise = cell.create_external();
                resume_with(Value::External(promise))
            }
            other => forward_on(other),
        }
    })
}

fn handle_op(op: SchedOp, cell: &SchedulerCell) -> Program {
    match op {
        SchedOp::Enqueue(task) => {
            cell.enqueue(task);
            resume_with(Value::Null)
        }
        SchedOp::Dequeue => match cell.dequeue() {
            Some(task) => resume_with(Value::Opaque(OpaqueValue::new("queued-task", task))),
            None => resume_with(Value::Null),
        },
        SchedOp::QueueStatus => {
            let (empty, externals) = cell.queue_status();
            resume_with(Value::tuple(vec![Value::Bool(empty), Value::Bool(externals)]))
        }
        SchedOp::RegisterWaiter { handle, waiter } => {
            cell.register_waiter(handle, waiter);
            resume_with(Value::Null)
        }
        SchedOp::CreateTaskHandle { task_id } => {
            resume_with(Value::Task(cell.create_task_handle(task_id)))
        }
        SchedOp::Complete { handle, result } => {
            cell.complete(handle, result);
            resume_with(Value::Null)
        }
        SchedOp::GetResult { handle } => resume_with(encode_status(cell.get_status(handle))),
        SchedOp::Cancel { handle } => resume_with(Value::Bool(cell.cancel(handle))),
        SchedOp::CurrentTask => match cell.current_task() {
            Some(task_id) => resume_with(Value::Int(task_id.as_u64() as i64)),
            None => Program::fail(RuntimeError::invariant("no current task")),
        },
        SchedOp::CurrentTaskCancelled => resume_with(Value::Bool(cell.current_cancelled())),
        SchedOp::CreatePromiseHandle => resume_with(Value::Promise(cell.create_promise())),
        SchedOp::ResolveExternal(msg) => {
            cell.resolve_external(msg);
            resume_with(Value::Null)
        }
        // The spawn wrapper's completion report is the scheduler's to
        // interpret; it should never reach the state handler.
        op @ SchedOp::TaskFinished { .. } => forward_on(Effect::Sched(op)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_core::Environment;

    fn cell() -> Arc<SchedulerCell> {
        SchedulerCell::for_store(&Store::new())
    }

    #[test]
    fn cell_is_shared_across_snapshots() {
        let store = Store::new();
        let a = SchedulerCell::for_store(&store);
        let b = SchedulerCell::for_store(&store.snapshot());
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn handle_lifecycle() {
        let cell = cell();
        let task_id = TaskId::next();
        let task = cell.create_task_handle(task_id);
        let status = cell.get_status(task.handle).unwrap();
        assert!(!status.complete);

        cell.complete(task.handle, Ok(Value::Int(5)));
        let status = cell.get_status(task.handle).unwrap();
        assert!(status.complete);
        assert_eq!(status.result.unwrap().unwrap(), Value::Int(5));

        // A second completion is ignored.
        cell.complete(task.handle, Ok(Value::Int(9)));
        assert_eq!(cell.get_status(task.handle).unwrap().result.unwrap().unwrap(), Value::Int(5));
    }

    #[test]
    fn cancel_is_first_writer_wins() {
        let cell = cell();
        let task = cell.create_task_handle(TaskId::next());
        assert!(cell.cancel(task.handle));
        assert!(!cell.cancel(task.handle));
        let status = cell.get_status(task.handle).unwrap();
        assert!(status.cancelled);
        assert_eq!(status.result.unwrap().unwrap_err(), RuntimeError::TaskCancelled);
    }

    #[test]
    fn completion_wakes_waiter_with_result() {
        let cell = cell();
        let task = cell.create_task_handle(TaskId::next());
        let waiter_task = TaskId::next();
        let waiter = Waiter::new(
            waiter_task,
            prism_core::WaiterSlot { frames: Vec::new(), env: Environment::new(), store: Store::new() },
        );
        cell.register_waiter(task.handle, waiter);

        cell.complete(task.handle, Ok(Value::Int(1)));
        let queued = cell.dequeue().unwrap();
        assert_eq!(queued.task_id, waiter_task);
        assert!(matches!(queued.inject, Some(Inject::Value(Value::Int(1)))));
    }

    #[test]
    fn shared_slot_waiter_wakes_once_across_handles() {
        let cell = cell();
        let a = cell.create_task_handle(TaskId::next());
        let b = cell.create_task_handle(TaskId::next());
        let waiter_task = TaskId::next();
        let waiter = Waiter::new(
            waiter_task,
            prism_core::WaiterSlot { frames: Vec::new(), env: Environment::new(), store: Store::new() },
        );
        cell.register_waiter(a.handle, waiter.clone());
        cell.register_waiter(b.handle, waiter);

        cell.complete(a.handle, Ok(Value::Int(1)));
        cell.complete(b.handle, Ok(Value::Int(2)));
        assert!(cell.dequeue().is_some());
        assert!(cell.dequeue().is_none());
    }

    #[test]
    fn cancelled_tasks_are_not_rescheduled() {
        let cell = cell();
        let task_id = TaskId::next();
        let task = cell.create_task_handle(task_id);
        cell.enqueue(QueuedTask {
            task_id,
            k: TaskK::Saved { frames: Vec::new() },
            env: Environment::new(),
            store: Store::new(),
            inject: None,
        });
        cell.cancel(task.handle);
        assert!(cell.dequeue().is_none());
    }

    #[test]
    fn external_completion_resolves_through_queue() {
        let cell = cell();
        let promise = cell.create_external();
        promise.complete(Value::Int(3));
        let (empty, externals) = cell.queue_status();
        assert!(empty);
        // Draining resolved the promise; it is no longer pending.
        assert!(!externals);
        let status = cell.get_status(promise.handle()).unwrap();
        assert!(status.complete);
    }

    #[test]
    fn status_encoding_round_trips() {
        let status = HandleStatus {
            complete: true,
            cancelled: false,
            result: Some(Err(RuntimeError::user("x"))),
        };
        let decoded = decode_status(&encode_status(Some(status))).unwrap().unwrap();
        assert!(decoded.complete);
        assert!(!decoded.cancelled);
        assert_eq!(decoded.result.unwrap().unwrap_err(), RuntimeError::user("x"));
        assert!(decode_status(&encode_status(None)).unwrap().is_none());
    }
}
