//! Effect handlers.
//!
//! A handler turns an effect into a program. Handlers are installed with
//! `WithHandler` scopes; at dispatch time the machine snapshots the
//! visible handlers into an ordered [`HandlerSnapshot`] (outermost first,
//! dispatch starting from the innermost end) and invokes one handler with
//! the effect and a read-only [`HandlerCtx`].

use std::fmt;
use std::sync::Arc;

use crate::effect::Effect;
use crate::env::Environment;
use crate::frame::FrameInfo;
use crate::ids::ScopeId;
use crate::program::Program;
use crate::store::Store;

// ---------------------------------------------------------------------------
// Handler trait
// ---------------------------------------------------------------------------

/// A user- or runtime-defined effect handler.
pub trait Handler: Send + Sync {
    /// React to one effect. The returned program runs in the handler's
    /// scope environment and may use the control primitives (`Resume`,
    /// `Forward`, `GetContinuation`, ...).
    fn on_effect(&self, effect: Effect, ctx: &HandlerCtx) -> Program;

    /// Diagnostic name.
    fn name(&self) -> &str {
        "handler"
    }
}

/// Shared reference to a handler.
pub type HandlerRef = Arc<dyn Handler>;

/// Wrap a plain function as a handler.
pub fn handler_fn<F>(name: &'static str, f: F) -> HandlerRef
where
    F: Fn(Effect, &HandlerCtx) -> Program + Send + Sync + 'static,
{
    Arc::new(FnHandler { name, f })
}

struct FnHandler<F> {
    name: &'static str,
    f: F,
}

impl<F> Handler for FnHandler<F>
where
    F: Fn(Effect, &HandlerCtx) -> Program + Send + Sync,
{
    fn on_effect(&self, effect: Effect, ctx: &HandlerCtx) -> Program {
        (self.f)(effect, ctx)
    }

    fn name(&self) -> &str {
        self.name
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// One visible handler: the scope frame it came from, the handler itself,
/// and the environment captured at scope entry.
#[derive(Clone)]
pub struct HandlerEntry {
    pub scope: ScopeId,
    pub handler: HandlerRef,
    pub env: Environment,
}

impl fmt::Debug for HandlerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HandlerEntry({}, {})", self.handler.name(), self.scope)
    }
}

/// An immutable, ordered list of visible handlers.
///
/// Index 0 is the outermost handler; the last index is the innermost.
/// Dispatch starts at the innermost end and `Forward` re-dispatches over
/// the strict prefix of outer handlers.
#[derive(Clone, Default)]
pub struct HandlerSnapshot(Arc<[HandlerEntry]>);

impl HandlerSnapshot {
    pub fn from_entries(entries: Vec<HandlerEntry>) -> Self {
        Self(entries.into())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&HandlerEntry> {
        self.0.get(index)
    }

    /// The innermost index, if any.
    pub fn innermost(&self) -> Option<usize> {
        self.len().checked_sub(1)
    }

    /// The strictly-outer prefix `[..end]` as a new snapshot.
    pub fn prefix(&self, end: usize) -> Self {
        Self(self.0[..end.min(self.0.len())].to_vec().into())
    }

    /// The strictly-inner suffix `[start..]` as a new snapshot.
    pub fn suffix(&self, start: usize) -> Self {
        Self(self.0[start.min(self.0.len())..].to_vec().into())
    }

    pub fn entries(&self) -> impl Iterator<Item = &HandlerEntry> {
        self.0.iter()
    }

    /// Scope IDs in order; used for equality in diagnostics and tests.
    pub fn scope_ids(&self) -> Vec<ScopeId> {
        self.0.iter().map(|e| e.scope).collect()
    }
}

impl fmt::Debug for HandlerSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.0.iter()).finish()
    }
}

// ---------------------------------------------------------------------------
// HandlerCtx
// ---------------------------------------------------------------------------

/// Read-only context passed to a handler invocation.
pub struct HandlerCtx {
    /// Environment at the effect site.
    pub env: Environment,
    /// Store at dispatch time (snapshot; mutating it has no effect on the
    /// machine's store).
    pub store: Store,
    /// The full dispatch snapshot, outermost first.
    pub handlers: HandlerSnapshot,
    /// Index of the invoked handler within `handlers`.
    pub handler_index: usize,
    /// Shape of the delimited continuation between the effect site and
    /// this handler's scope, innermost first.
    pub delimited: Vec<FrameInfo>,
}

impl HandlerCtx {
    /// Entries strictly outer than the invoked handler.
    pub fn outer_handlers(&self) -> HandlerSnapshot {
        self.handlers.prefix(self.handler_index)
    }
}

impl fmt::Debug for HandlerCtx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerCtx")
            .field("env", &self.env)
            .field("handler_index", &self.handler_index)
            .field("handlers", &self.handlers)
            .field("delimited", &self.delimited.len())
            .finish()
    }
}
