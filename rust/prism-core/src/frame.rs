//! Continuation frames and first-class continuations.
//!
//! The kontinuation K is a stack of exactly three frame kinds:
//!
//! - [`ReturnFrame`] — a suspended program awaiting the result of what it
//!   last yielded, with the environment of its lexical scope.
//! - [`WithHandlerFrame`] — a handler-scope boundary.
//! - [`DispatchingFrame`] — a transient record of an in-flight effect
//!   lookup: the effect, the snapshot of handlers visible when dispatch
//!   started, the index of the handler running next, and flags tracking
//!   whether a handler has started and whether it forwarded.
//!
//! K is stored bottom-to-top: the innermost frame is the **last** element.

use std::fmt;
use std::sync::{Arc, Mutex};

use crate::error::SourceSite;
use crate::handler::{HandlerEntry, HandlerRef, HandlerSnapshot};
use crate::effect::Effect;
use crate::env::Environment;
use crate::ids::{ContinuationId, ScopeId};
use crate::program::{Coroutine, Program};

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

/// One element of the kontinuation.
pub enum Frame {
    Return(ReturnFrame),
    WithHandler(WithHandlerFrame),
    Dispatching(DispatchingFrame),
}

/// A suspended program and the environment of its lexical scope.
pub struct ReturnFrame {
    pub program: Box<dyn Coroutine>,
    pub env: Environment,
    pub site: SourceSite,
}

/// A handler-scope boundary. Dispatch snapshots reference this frame by
/// its `scope` ID; `Resume` splices against it.
pub struct WithHandlerFrame {
    pub scope: ScopeId,
    pub handler: HandlerRef,
    pub env: Environment,
}

impl WithHandlerFrame {
    pub fn new(handler: HandlerRef, env: Environment) -> Self {
        Self { scope: ScopeId::next(), handler, env }
    }

    /// The snapshot entry describing this scope.
    pub fn entry(&self) -> HandlerEntry {
        HandlerEntry { scope: self.scope, handler: Arc::clone(&self.handler), env: self.env.clone() }
    }
}

/// An in-flight effect lookup.
pub struct DispatchingFrame {
    /// The effect under dispatch. Taken (moved into the handler call)
    /// when the handler starts, so an effect instance is owned by at most
    /// one dispatch.
    pub effect: Option<Effect>,
    /// Diagnostic name of the effect.
    pub effect_kind: &'static str,
    /// Handlers visible when dispatch started, outermost first.
    pub handlers: HandlerSnapshot,
    /// Index of the handler to run; starts at the innermost end.
    pub index: usize,
    /// Whether a handler has been invoked for this dispatch.
    pub started: bool,
    /// Whether that handler forwarded the effect outward. Once set,
    /// `Resume` is rejected: the outer handler owns the continuation.
    pub forwarded: bool,
    /// One-shot identity of the continuation delimited by this dispatch.
    pub cont_id: ContinuationId,
}

impl DispatchingFrame {
    pub fn new(effect: Effect, handlers: HandlerSnapshot, index: usize) -> Self {
        let effect_kind = effect.kind();
        Self {
            effect: Some(effect),
            effect_kind,
            handlers,
            index,
            started: false,
            forwarded: false,
            cont_id: ContinuationId::next(),
        }
    }

    /// The scope ID of the handler currently addressed by this dispatch.
    pub fn target_scope(&self) -> Option<ScopeId> {
        self.handlers.get(self.index).map(|e| e.scope)
    }
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Return(_) => FrameKind::Return,
            Frame::WithHandler(_) => FrameKind::WithHandler,
            Frame::Dispatching(_) => FrameKind::Dispatching,
        }
    }

    /// Lightweight descriptor used in handler contexts and diagnostics.
    pub fn info(&self) -> FrameInfo {
        match self {
            Frame::Return(rf) => FrameInfo { kind: FrameKind::Return, site: Some(rf.site.clone()) },
            Frame::WithHandler(_) => FrameInfo { kind: FrameKind::WithHandler, site: None },
            Frame::Dispatching(_) => FrameInfo { kind: FrameKind::Dispatching, site: None },
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frame::Return(rf) => write!(f, "Return({} @ {}:{})", rf.site.label, rf.site.file, rf.site.line),
            Frame::WithHandler(wh) => write!(f, "WithHandler({}, {})", wh.handler.name(), wh.scope),
            Frame::Dispatching(df) => write!(
                f,
                "Dispatching({}, index={}, started={}, forwarded={})",
                df.effect_kind, df.index, df.started, df.forwarded
            ),
        }
    }
}

/// The three frame kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Return,
    WithHandler,
    Dispatching,
}

/// A lightweight, cloneable frame descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameInfo {
    pub kind: FrameKind,
    pub site: Option<SourceSite>,
}

// ---------------------------------------------------------------------------
// First-class continuations
// ---------------------------------------------------------------------------

enum ContinuationState {
    /// Captured from a live K by `GetContinuation`; the frames were moved
    /// out of the machine.
    Started { frames: Option<Vec<Frame>> },
    /// Built by `CreateContinuation`: an initial program plus the handler
    /// scopes it should inherit.
    Unstarted { program: Option<Program>, handlers: HandlerSnapshot },
}

/// A reified continuation. One-shot: resuming consumes the frames (or the
/// initial program) and registers the ID in the consumed registry; a
/// second resume fails.
///
/// Clones share the underlying slot, so a stored copy observes the
/// consumption.
#[derive(Clone)]
pub struct Continuation {
    id: ContinuationId,
    state: Arc<Mutex<ContinuationState>>,
}

impl Continuation {
    /// Capture a started continuation from frames moved out of K.
    pub fn started(frames: Vec<Frame>) -> Self {
        Self {
            id: ContinuationId::next(),
            state: Arc::new(Mutex::new(ContinuationState::Started { frames: Some(frames) })),
        }
    }

    /// Build an unstarted continuation around an initial program and the
    /// handler scopes to inherit.
    pub fn unstarted(program: Program, handlers: HandlerSnapshot) -> Self {
        Self {
            id: ContinuationId::next(),
            state: Arc::new(Mutex::new(ContinuationState::Unstarted {
                program: Some(program),
                handlers,
            })),
        }
    }

    pub fn id(&self) -> ContinuationId {
        self.id
    }

    pub fn is_started(&self) -> bool {
        let state = self.state.lock().expect("continuation lock");
        matches!(*state, ContinuationState::Started { .. })
    }

    /// Take the captured frames of a started continuation. `None` if this
    /// is unstarted or the frames were already taken.
    pub fn take_frames(&self) -> Option<Vec<Frame>> {
        let mut state = self.state.lock().expect("continuation lock");
        match &mut *state {
            ContinuationState::Started { frames } => frames.take(),
            ContinuationState::Unstarted { .. } => None,
        }
    }

    /// Take the initial program and inherited handlers of an unstarted
    /// continuation.
    pub fn take_unstarted(&self) -> Option<(Program, HandlerSnapshot)> {
        let mut state = self.state.lock().expect("continuation lock");
        match &mut *state {
            ContinuationState::Started { .. } => None,
            ContinuationState::Unstarted { program, handlers } => {
                program.take().map(|p| (p, handlers.clone()))
            }
        }
    }
}

impl fmt::Debug for Continuation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Continuation({}, started={})", self.id, self.is_started())
    }
}
