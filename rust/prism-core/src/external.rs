//! External promises and the completion queue.
//!
//! An external promise is completed by code outside the machine — a real
//! I/O thread or an async runtime task. Producers push
//! `(promise id, result)` messages into a thread-safe queue; the scheduler
//! drains the queue when it has no runnable task. The channel API is a
//! thin wrapper over [`crossbeam_channel`].

use std::fmt;

use crossbeam_channel::{self as cb};

use crate::error::RuntimeError;
use crate::ids::{ExternalPromiseId, HandleId};
use crate::values::Value;

// ---------------------------------------------------------------------------
// Completion messages
// ---------------------------------------------------------------------------

/// A completion produced by an external producer.
#[derive(Debug, Clone)]
pub struct CompletionMessage {
    pub id: ExternalPromiseId,
    pub result: Result<Value, RuntimeError>,
}

/// The producing half of the completion queue. Cloneable; safe to hand to
/// foreign threads.
#[derive(Clone)]
pub struct CompletionSender {
    inner: cb::Sender<CompletionMessage>,
}

/// The consuming half of the completion queue, owned by the scheduler.
#[derive(Clone)]
pub struct CompletionReceiver {
    inner: cb::Receiver<CompletionMessage>,
}

/// Create an unbounded completion queue.
pub fn completion_queue() -> (CompletionSender, CompletionReceiver) {
    let (tx, rx) = cb::unbounded();
    (CompletionSender { inner: tx }, CompletionReceiver { inner: rx })
}

impl CompletionSender {
    /// Push a completion. Returns `false` if the machine side is gone.
    pub fn push(&self, message: CompletionMessage) -> bool {
        self.inner.send(message).is_ok()
    }
}

impl CompletionReceiver {
    /// Block until a completion arrives. `None` means all senders dropped.
    pub fn recv(&self) -> Option<CompletionMessage> {
        self.inner.recv().ok()
    }

    /// Non-blocking poll.
    pub fn try_recv(&self) -> Option<CompletionMessage> {
        self.inner.try_recv().ok()
    }
}

impl fmt::Debug for CompletionSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionSender").finish_non_exhaustive()
    }
}

impl fmt::Debug for CompletionReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionReceiver").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// ExternalPromise
// ---------------------------------------------------------------------------

/// A promise whose completion is produced outside the machine.
///
/// Created by the `CreateExternalPromise` effect. The holder may move the
/// value (or a clone) to any thread and call [`complete`](Self::complete)
/// or [`fail`](Self::fail) exactly once; waiting tasks are woken when the
/// scheduler drains the queue.
#[derive(Clone)]
pub struct ExternalPromise {
    handle: HandleId,
    id: ExternalPromiseId,
    sender: CompletionSender,
}

impl ExternalPromise {
    pub fn new(handle: HandleId, id: ExternalPromiseId, sender: CompletionSender) -> Self {
        Self { handle, id, sender }
    }

    /// The registry handle a `Wait` suspends on.
    pub fn handle(&self) -> HandleId {
        self.handle
    }

    /// The externally visible promise ID.
    pub fn id(&self) -> ExternalPromiseId {
        self.id
    }

    /// Complete the promise with a value.
    pub fn complete(&self, value: Value) -> bool {
        self.sender.push(CompletionMessage { id: self.id, result: Ok(value) })
    }

    /// Fail the promise with an error.
    pub fn fail(&self, error: RuntimeError) -> bool {
        self.sender.push(CompletionMessage { id: self.id, result: Err(error) })
    }
}

impl fmt::Debug for ExternalPromise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalPromise")
            .field("handle", &self.handle)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}
