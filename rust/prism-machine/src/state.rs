//! Machine state and step results.

use std::fmt;

use prism_core::{
    Effect, Environment, EscapePayload, Frame, Program, RuntimeError, SourceSite, Store, Traceback,
    Value,
};

// ---------------------------------------------------------------------------
// Control
// ---------------------------------------------------------------------------

/// The control component of the machine.
pub enum Control {
    /// A program about to be started.
    Program(Program),
    /// A value travelling down the continuation.
    Value(Value),
    /// An error travelling down the continuation, with the traceback
    /// captured when it first entered propagation.
    Error { error: RuntimeError, trace: Option<Traceback> },
    /// An effect awaiting interpretation.
    Effect(Effect),
}

impl Control {
    pub fn value(v: Value) -> Self {
        Control::Value(v)
    }

    pub fn error(error: RuntimeError) -> Self {
        Control::Error { error, trace: None }
    }
}

impl fmt::Debug for Control {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Control::Program(p) => write!(f, "Program({p:?})"),
            Control::Value(v) => write!(f, "Value({v:?})"),
            Control::Error { error, .. } => write!(f, "Error({error})"),
            Control::Effect(e) => write!(f, "Effect({})", e.kind()),
        }
    }
}

// ---------------------------------------------------------------------------
// CeskState
// ---------------------------------------------------------------------------

/// The machine state tuple `(C, E, S, K)`.
///
/// K is stored bottom-to-top: `k.last()` is the innermost frame.
#[derive(Debug)]
pub struct CeskState {
    pub control: Control,
    pub env: Environment,
    pub store: Store,
    pub k: Vec<Frame>,
}

impl CeskState {
    /// The initial state for a program.
    pub fn initial(program: Program, env: Environment, store: Store) -> Self {
        Self { control: Control::Program(program), env, store, k: Vec::new() }
    }

    /// True when the next step must produce a terminal.
    pub fn is_terminal(&self) -> bool {
        self.k.is_empty() && matches!(self.control, Control::Value(_) | Control::Error { .. })
    }
}

// ---------------------------------------------------------------------------
// Step results
// ---------------------------------------------------------------------------

/// The result of one machine step.
pub enum StepResult {
    /// The machine took a transition.
    Next(CeskState),
    /// Terminal: the computation completed with a value.
    Done { value: Value, store: Store },
    /// Terminal: the computation failed.
    Failed { error: RuntimeError, store: Store, traceback: Option<Traceback> },
    /// The machine suspended on an async escape; the driver must await
    /// the payload and resume.
    Escape(EscapeRequest),
}

impl fmt::Debug for StepResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepResult::Next(s) => write!(f, "Next({:?}, |K|={})", s.control, s.k.len()),
            StepResult::Done { value, .. } => write!(f, "Done({value:?})"),
            StepResult::Failed { error, .. } => write!(f, "Failed({error})"),
            StepResult::Escape(_) => write!(f, "Escape(..)"),
        }
    }
}

/// A suspended machine waiting for an async result.
///
/// Carries the awaitable payload and the `(E, S, K)` captured at escape
/// time; [`resume`](Self::resume) rebuilds the state with
/// `C = Value(result)`, [`resume_error`](Self::resume_error) with an
/// error control. [`split`](Self::split) separates the payload from the
/// resume seat so a driver can await the one and keep the other.
pub struct EscapeRequest {
    pub payload: EscapePayload,
    seat: EscapeSeat,
}

/// The `(E, S, K)` captured at escape time, waiting to be resumed.
pub struct EscapeSeat {
    env: Environment,
    store: Store,
    k: Vec<Frame>,
}

impl EscapeSeat {
    /// Resume with the awaited value.
    pub fn resume(self, value: Value) -> CeskState {
        CeskState { control: Control::Value(value), env: self.env, store: self.store, k: self.k }
    }

    /// Resume by throwing the awaited error.
    pub fn resume_error(self, error: RuntimeError) -> CeskState {
        CeskState { control: Control::error(error), env: self.env, store: self.store, k: self.k }
    }
}

impl EscapeRequest {
    pub fn new(payload: EscapePayload, env: Environment, store: Store, k: Vec<Frame>) -> Self {
        Self { payload, seat: EscapeSeat { env, store, k } }
    }

    /// Separate the awaitable payload from the resume seat.
    pub fn split(self) -> (EscapePayload, EscapeSeat) {
        (self.payload, self.seat)
    }

    /// Resume with the awaited value.
    pub fn resume(self, value: Value) -> CeskState {
        self.seat.resume(value)
    }

    /// Resume by throwing the awaited error.
    pub fn resume_error(self, error: RuntimeError) -> CeskState {
        self.seat.resume_error(error)
    }
}

impl fmt::Debug for EscapeRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EscapeRequest").field("payload", &self.payload).finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Traceback assembly
// ---------------------------------------------------------------------------

/// Assemble the effect-level stack from the live continuation, innermost
/// first, optionally led by the site of the frame that raised.
pub fn capture_trace(k: &[Frame], raising: Option<&SourceSite>) -> Traceback {
    let mut frames = Vec::new();
    if let Some(site) = raising {
        frames.push(site.clone());
    }
    for frame in k.iter().rev() {
        if let Frame::Return(rf) = frame {
            frames.push(rf.site.clone());
        }
    }
    Traceback::new(frames)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_state_is_not_terminal() {
        let state = CeskState::initial(Program::pure(Value::Int(1)), Environment::new(), Store::new());
        assert!(!state.is_terminal());
    }

    #[test]
    fn value_with_empty_k_is_terminal() {
        let state = CeskState {
            control: Control::value(Value::Int(1)),
            env: Environment::new(),
            store: Store::new(),
            k: Vec::new(),
        };
        assert!(state.is_terminal());
    }

    #[test]
    fn escape_resume_restores_captured_k() {
        let req = EscapeRequest::new(
            EscapePayload::Bundle(Vec::new()),
            Environment::new(),
            Store::new(),
            Vec::new(),
        );
        let state = req.resume(Value::Int(3));
        assert!(matches!(state.control, Control::Value(Value::Int(3))));
        assert!(state.k.is_empty());
    }

    #[test]
    fn capture_trace_leads_with_raising_site() {
        let site = SourceSite::here("boom");
        let trace = capture_trace(&[], Some(&site));
        assert_eq!(trace.frames.len(), 1);
        assert_eq!(trace.frames[0].label, "boom");
    }
}
