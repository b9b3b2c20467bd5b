//! Error taxonomy and traceback records.
//!
//! Every machine-level failure mode has its own variant with a stable
//! `kind()` discriminant so consumers can match on it without parsing
//! messages. Errors are cheap to clone; they travel through the
//! continuation as values, so the usual boxed-error idioms do not apply.

use std::panic::Location;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::{ContinuationId, HandleId};

// ---------------------------------------------------------------------------
// RuntimeError
// ---------------------------------------------------------------------------

/// Errors produced by the interpreter core and its scheduler layer.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuntimeError {
    /// No handler matched during effect dispatch.
    #[error("no handler for effect {0}")]
    UnhandledEffect(String),

    /// The machine reached a state its invariants rule out.
    #[error("interpreter invariant violated: {0}")]
    Invariant(String),

    /// `Ask` could not find the requested key in the environment.
    #[error("environment key not found: {0}")]
    MissingEnvKey(String),

    /// A continuation was resumed more than once.
    #[error("one-shot violation: {0}")]
    OneShotViolation(String),

    /// The scheduler has no runnable task and no pending external
    /// completion.
    #[error("deadlock: {0}")]
    Deadlock(String),

    /// The awaited task was cancelled.
    #[error("task was cancelled")]
    TaskCancelled,

    /// A task or promise handle is not in the scheduler registry.
    #[error("unknown task or promise handle {0}")]
    UnknownHandle(HandleId),

    /// A promise was completed or failed twice.
    #[error("promise handle {0} already completed")]
    PromiseAlreadyCompleted(HandleId),

    /// An async escape reached the synchronous driver.
    #[error("async escape is not supported by the synchronous runner")]
    EscapeUnsupported,

    /// The driver's configured step budget ran out.
    #[error("step limit of {0} exceeded")]
    StepLimitExceeded(u64),

    /// An effect argument had the wrong shape (e.g. `Wait` on a non-task).
    #[error("type error: {0}")]
    Type(String),

    /// An error raised by a user program or handler.
    #[error("{0}")]
    User(String),
}

impl RuntimeError {
    /// Construct a user-level error.
    pub fn user(message: impl Into<String>) -> Self {
        RuntimeError::User(message.into())
    }

    /// Construct an invariant violation.
    pub fn invariant(message: impl Into<String>) -> Self {
        RuntimeError::Invariant(message.into())
    }

    /// The canonical one-shot violation for a known continuation ID.
    pub fn one_shot(id: ContinuationId) -> Self {
        RuntimeError::OneShotViolation(format!("continuation {id} already consumed"))
    }

    /// Stable machine-readable discriminant for this error.
    pub fn kind(&self) -> &'static str {
        match self {
            RuntimeError::UnhandledEffect(_) => "unhandled-effect",
            RuntimeError::Invariant(_) => "interpreter-invariant",
            RuntimeError::MissingEnvKey(_) => "missing-env-key",
            RuntimeError::OneShotViolation(_) => "one-shot-violation",
            RuntimeError::Deadlock(_) => "deadlock",
            RuntimeError::TaskCancelled => "task-cancelled",
            RuntimeError::UnknownHandle(_) => "unknown-handle",
            RuntimeError::PromiseAlreadyCompleted(_) => "promise-already-completed",
            RuntimeError::EscapeUnsupported => "escape-unsupported",
            RuntimeError::StepLimitExceeded(_) => "step-limit-exceeded",
            RuntimeError::Type(_) => "type-error",
            RuntimeError::User(_) => "user",
        }
    }
}

// ---------------------------------------------------------------------------
// Tracebacks
// ---------------------------------------------------------------------------

/// A pre-captured source position for one program frame.
///
/// Captured when the program value is constructed (`#[track_caller]` in the
/// `Program` builders), so a failing frame can report where the computation
/// was defined even after its coroutine has been consumed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSite {
    /// Human-readable label, defaulting to the builder name.
    pub label: String,
    /// Source file of the construction site.
    pub file: String,
    /// Line of the construction site.
    pub line: u32,
}

impl SourceSite {
    /// Capture the caller's location with the given label.
    #[track_caller]
    pub fn here(label: &str) -> Self {
        let loc = Location::caller();
        Self {
            label: label.to_string(),
            file: loc.file().to_string(),
            line: loc.line(),
        }
    }
}

/// The effect-level stack assembled when an error enters propagation:
/// the construction sites of every `Return` frame live at that moment,
/// innermost first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Traceback {
    pub frames: Vec<SourceSite>,
}

impl Traceback {
    pub fn new(frames: Vec<SourceSite>) -> Self {
        Self { frames }
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Render the stack in a `most recent call last` style.
    pub fn render(&self) -> String {
        let mut out = String::from("effect stack (innermost first):");
        for (i, site) in self.frames.iter().enumerate() {
            out.push_str(&format!("\n  #{}: {} ({}:{})", i, site.label, site.file, site.line));
        }
        out
    }
}
