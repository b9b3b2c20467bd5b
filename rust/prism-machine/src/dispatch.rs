//! Handler discovery, effect dispatch, and the control primitives.
//!
//! Handler snapshots are ordered outermost-first; dispatch starts at the
//! innermost index and `Forward` re-dispatches over the strictly-outer
//! prefix. `Resume` splices the delimited user continuation back onto the
//! top of K so the user code resumes immediately and its final value
//! chains into the handler's pending program.

use std::sync::Arc;

use tracing::{debug, trace};

use prism_core::{
    Continuation, DispatchingFrame, Effect, Environment, Frame, HandlerCtx, HandlerEntry,
    HandlerSnapshot, Inject, ResumeK, RuntimeError, ScopeId, Store, TaskK, Value,
    WithHandlerFrame,
};

use crate::state::{capture_trace, CeskState, Control};

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

/// Compute the handlers visible to an effect yielded with continuation
/// `k`, outermost first.
///
/// Walks K from the innermost frame outward, collecting `WithHandler`
/// scopes. The walk stops at the first `Dispatching` frame — the busy
/// boundary: the running handler and everything inner to it in that
/// dispatch's snapshot are not re-entrant, so the parent's strictly-outer
/// prefix is substituted for the rest of the walk.
pub fn collect_available(k: &[Frame]) -> Vec<HandlerEntry> {
    let mut inner: Vec<HandlerEntry> = Vec::new();
    for frame in k.iter().rev() {
        match frame {
            Frame::WithHandler(wh) => inner.push(wh.entry()),
            Frame::Dispatching(df) => {
                let mut out: Vec<HandlerEntry> =
                    df.handlers.prefix(df.index).entries().cloned().collect();
                out.extend(inner.into_iter().rev());
                return out;
            }
            Frame::Return(_) => {}
        }
    }
    inner.reverse();
    inner
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Index of the innermost `Dispatching` frame.
fn find_dispatching(k: &[Frame]) -> Option<usize> {
    k.iter().rposition(|f| matches!(f, Frame::Dispatching(_)))
}

/// Index of the innermost `WithHandler` frame with `scope`, searching
/// below `limit`.
fn find_scope(k: &[Frame], limit: usize, scope: ScopeId) -> Option<usize> {
    k[..limit].iter().rposition(|f| matches!(f, Frame::WithHandler(wh) if wh.scope == scope))
}

/// An error state with the traceback captured now, K left intact so the
/// error is thrown into the frame that caused it.
fn error_state(error: RuntimeError, env: Environment, store: Store, k: Vec<Frame>) -> CeskState {
    let trace = capture_trace(&k, None);
    CeskState { control: Control::Error { error, trace: Some(trace) }, env, store, k }
}

/// Drop identity-tail return frames from a spliced handler segment. Such
/// frames only copy their next input through, so eliding them preserves
/// semantics and keeps repeated leaf dispatches from growing K.
fn without_identity_tails(frames: Vec<Frame>) -> Vec<Frame> {
    frames
        .into_iter()
        .filter(|f| !matches!(f, Frame::Return(rf) if rf.program.is_identity_tail()))
        .collect()
}

/// Locate the current dispatch and its matching scope frame: returns
/// `(dispatch index, scope index)`.
fn dispatch_and_scope(k: &[Frame]) -> Result<(usize, usize), RuntimeError> {
    let d = find_dispatching(k)
        .ok_or_else(|| RuntimeError::OneShotViolation(
            "no dispatch in flight; the continuation was already consumed".to_string(),
        ))?;
    let scope = match &k[d] {
        Frame::Dispatching(df) => df
            .target_scope()
            .ok_or_else(|| RuntimeError::invariant("dispatch index outside handler snapshot"))?,
        _ => unreachable!("find_dispatching returned a non-dispatching frame"),
    };
    let w = find_scope(k, d, scope)
        .ok_or_else(|| RuntimeError::invariant("handler scope frame missing below dispatch"))?;
    Ok((d, w))
}

// ---------------------------------------------------------------------------
// Dispatch start / handler invocation
// ---------------------------------------------------------------------------

/// Begin dispatching a non-primitive effect: snapshot the visible
/// handlers and push a `Dispatching` frame addressing the innermost one.
pub fn start_dispatch(effect: Effect, env: Environment, store: Store, mut k: Vec<Frame>) -> CeskState {
    let entries = collect_available(&k);
    if entries.is_empty() {
        debug!(effect = effect.kind(), "unhandled effect");
        return error_state(RuntimeError::UnhandledEffect(effect.kind().to_string()), env, store, k);
    }
    let snapshot = HandlerSnapshot::from_entries(entries);
    let index = snapshot.innermost().expect("non-empty snapshot has an innermost entry");
    trace!(effect = effect.kind(), handlers = snapshot.len(), "dispatch start");
    k.push(Frame::Dispatching(DispatchingFrame::new(effect, snapshot, index)));
    CeskState { control: Control::value(Value::Null), env, store, k }
}

/// Invoke the handler addressed by a popped `Dispatching` frame. The
/// handler program runs in the environment its scope captured.
pub fn dispatch_handler(
    mut df: DispatchingFrame,
    env: Environment,
    store: Store,
    mut k: Vec<Frame>,
) -> CeskState {
    let entry = match df.handlers.get(df.index) {
        Some(entry) => entry.clone(),
        None => {
            return error_state(
                RuntimeError::invariant("dispatch index outside handler snapshot"),
                env,
                store,
                k,
            )
        }
    };
    let effect = match df.effect.take() {
        Some(effect) => effect,
        None => {
            return error_state(
                RuntimeError::invariant("dispatching frame has no effect to deliver"),
                env,
                store,
                k,
            )
        }
    };

    let delimited = match find_scope(&k, k.len(), entry.scope) {
        Some(w) => k[w + 1..].iter().rev().map(Frame::info).collect(),
        None => {
            return error_state(
                RuntimeError::invariant("handler scope frame missing below dispatch"),
                env,
                store,
                k,
            )
        }
    };

    let ctx = HandlerCtx {
        env: env.clone(),
        store: store.snapshot(),
        handlers: df.handlers.clone(),
        handler_index: df.index,
        delimited,
    };

    debug!(effect = effect.kind(), handler = entry.handler.name(), index = df.index, "dispatch");
    let handler_env = entry.env.clone();
    let program = entry.handler.on_effect(effect, &ctx);

    df.started = true;
    k.push(Frame::Dispatching(df));
    CeskState { control: Control::Program(program), env: handler_env, store, k }
}

/// A handler returned without resuming: abandon the user continuation.
/// The frames between the dispatch and the handler's scope are dropped
/// (dropping closes their programs), the scope frame is popped, and the
/// handler's value continues outward.
pub fn abandon(
    df: DispatchingFrame,
    value: Value,
    env: Environment,
    store: Store,
    mut k: Vec<Frame>,
) -> CeskState {
    let scope = match df.target_scope() {
        Some(scope) => scope,
        None => {
            return error_state(
                RuntimeError::invariant("dispatch index outside handler snapshot"),
                env,
                store,
                k,
            )
        }
    };
    let Some(w) = find_scope(&k, k.len(), scope) else {
        return error_state(
            RuntimeError::invariant("handler scope frame missing below dispatch"),
            env,
            store,
            k,
        );
    };
    trace!(dropped = k.len() - w, "implicit abandonment");
    k.truncate(w);
    CeskState { control: Control::value(value), env, store, k }
}

// ---------------------------------------------------------------------------
// Primitives
// ---------------------------------------------------------------------------

/// `Resume(value)`: splice the delimited user continuation back onto the
/// top of K and send `value` into it. One-shot: the dispatch's implicit
/// continuation ID is marked consumed.
pub fn apply_resume(value: Value, env: Environment, store: Store, mut k: Vec<Frame>) -> CeskState {
    let (d, w) = match dispatch_and_scope(&k) {
        Ok(found) => found,
        Err(e) => return error_state(e, env, store, k),
    };
    {
        let Frame::Dispatching(df) = &k[d] else { unreachable!() };
        if df.forwarded {
            return error_state(
                RuntimeError::invariant(
                    "Resume after Forward: the outer handler owns the continuation",
                ),
                env,
                store,
                k,
            );
        }
        if !store.mark_consumed(df.cont_id) {
            return error_state(RuntimeError::one_shot(df.cont_id), env, store, k);
        }
    }

    let hseg = k.split_off(d + 1);
    k.pop(); // the dispatching frame
    let userseg = k.split_off(w + 1);
    k.extend(without_identity_tails(hseg));
    k.extend(userseg);
    trace!(depth = k.len(), "resume splice");
    CeskState { control: Control::value(value), env, store, k }
}

/// `Forward(effect)`: hand the effect to the strictly-outer handlers.
/// The current dispatch is marked forwarded; its handler may no longer
/// resume.
pub fn apply_forward(effect: Effect, env: Environment, store: Store, mut k: Vec<Frame>) -> CeskState {
    let Some(d) = find_dispatching(&k) else {
        return error_state(
            RuntimeError::invariant("Forward outside of effect dispatch"),
            env,
            store,
            k,
        );
    };
    let outer = {
        let Frame::Dispatching(df) = &mut k[d] else { unreachable!() };
        let outer = df.handlers.prefix(df.index);
        if outer.is_empty() {
            return error_state(
                RuntimeError::UnhandledEffect(effect.kind().to_string()),
                env,
                store,
                k,
            );
        }
        df.forwarded = true;
        outer
    };
    let index = outer.innermost().expect("non-empty prefix has an innermost entry");
    trace!(effect = effect.kind(), outer = outer.len(), "forward");
    k.push(Frame::Dispatching(DispatchingFrame::new(effect, outer, index)));
    CeskState { control: Control::value(Value::Null), env, store, k }
}

/// `GetContinuation`: move the delimited user continuation out of K into
/// a reified, started continuation.
pub fn apply_get_continuation(env: Environment, store: Store, mut k: Vec<Frame>) -> CeskState {
    let (d, w) = match dispatch_and_scope(&k) {
        Ok(found) => found,
        Err(e) => return error_state(e, env, store, k),
    };
    let upper = k.split_off(d); // dispatching frame + handler segment
    let userseg = k.split_off(w + 1);
    k.extend(upper);
    let continuation = Continuation::started(userseg);
    trace!(id = %continuation.id(), "continuation captured");
    CeskState { control: Control::value(Value::Continuation(continuation)), env, store, k }
}

/// `CreateContinuation`: build an unstarted continuation around a program
/// and the handler scopes it should inherit.
pub fn apply_create_continuation(
    program: prism_core::Program,
    handlers: HandlerSnapshot,
    env: Environment,
    store: Store,
    k: Vec<Frame>,
) -> CeskState {
    let continuation = Continuation::unstarted(program, handlers);
    CeskState { control: Control::value(Value::Continuation(continuation)), env, store, k }
}

/// `ResumeContinuation(cont, value)`: one-shot resume of a reified
/// continuation, splicing its frames (started) or installing its
/// inherited scopes and starting its program (unstarted).
pub fn apply_resume_continuation(
    continuation: Continuation,
    value: Value,
    env: Environment,
    store: Store,
    mut k: Vec<Frame>,
) -> CeskState {
    if store.is_consumed(continuation.id()) {
        return error_state(RuntimeError::one_shot(continuation.id()), env, store, k);
    }
    store.mark_consumed(continuation.id());

    let (d, w) = match dispatch_and_scope(&k) {
        Ok(found) => found,
        Err(e) => return error_state(e, env, store, k),
    };
    let hseg = k.split_off(d + 1);
    k.pop(); // the dispatching frame
    // Any in-place user segment was superseded by the reified
    // continuation; drop it.
    drop(k.split_off(w + 1));
    k.extend(without_identity_tails(hseg));

    if continuation.is_started() {
        let Some(frames) = continuation.take_frames() else {
            return error_state(RuntimeError::one_shot(continuation.id()), env, store, k);
        };
        k.extend(frames);
        CeskState { control: Control::value(value), env, store, k }
    } else {
        let Some((program, handlers)) = continuation.take_unstarted() else {
            return error_state(RuntimeError::one_shot(continuation.id()), env, store, k);
        };
        for entry in handlers.entries() {
            k.push(Frame::WithHandler(WithHandlerFrame::new(
                Arc::clone(&entry.handler),
                entry.env.clone(),
            )));
        }
        CeskState { control: Control::Program(program), env, store, k }
    }
}

/// `GetHandlers`: the snapshot on the nearest dispatching frame.
pub fn apply_get_handlers(env: Environment, store: Store, k: Vec<Frame>) -> CeskState {
    match find_dispatching(&k) {
        Some(d) => {
            let Frame::Dispatching(df) = &k[d] else { unreachable!() };
            let handlers = df.handlers.clone();
            CeskState { control: Control::value(Value::Handlers(handlers)), env, store, k }
        }
        None => error_state(
            RuntimeError::invariant("GetHandlers outside of effect dispatch"),
            env,
            store,
            k,
        ),
    }
}

/// `ResumeK`: replace everything above the current dispatch's scope frame
/// with another task's continuation. The outgoing segment was either
/// saved as a waiter or belongs to a finished task; dropping it here
/// closes whatever remains.
pub fn apply_resume_k(rk: ResumeK, env: Environment, store: Store, mut k: Vec<Frame>) -> CeskState {
    let (_, w) = match dispatch_and_scope(&k) {
        Ok(found) => found,
        Err(e) => return error_state(e, env, store, k),
    };
    k.truncate(w + 1);

    let env = rk.env.unwrap_or(env);
    let store = rk.store.unwrap_or(store);
    debug!(task = %rk.task_id, "task switch");

    match rk.k {
        TaskK::Fresh { program, handlers } => {
            for entry in handlers.entries() {
                k.push(Frame::WithHandler(WithHandlerFrame::new(
                    Arc::clone(&entry.handler),
                    entry.env.clone(),
                )));
            }
            CeskState { control: Control::Program(program), env, store, k }
        }
        TaskK::Saved { frames } => {
            k.extend(frames);
            let control = match rk.inject {
                Some(Inject::Value(v)) => Control::value(v),
                Some(Inject::Error(e)) => Control::error(e),
                Some(Inject::Start(p)) => Control::Program(p),
                None => Control::value(Value::Null),
            };
            CeskState { control, env, store, k }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_core::{handler_fn, Program};

    fn scope_frame() -> (ScopeId, Frame) {
        let wh = WithHandlerFrame::new(
            handler_fn("t", |_, _| Program::pure(Value::Null)),
            Environment::new(),
        );
        (wh.scope, Frame::WithHandler(wh))
    }

    fn return_frame() -> Frame {
        let (_, kind) = Program::perform(Effect::Pure(Value::Null)).into_parts();
        match kind {
            prism_core::ProgramKind::Suspended(co) => Frame::Return(prism_core::ReturnFrame {
                program: co,
                env: Environment::new(),
                site: prism_core::SourceSite::here("test"),
            }),
            prism_core::ProgramKind::Pure(_) => unreachable!("perform is suspended"),
        }
    }

    #[test]
    fn collect_orders_outermost_first() {
        // Bottom-to-top: outer scope pushed first, inner last.
        let (outer, f_outer) = scope_frame();
        let (inner, f_inner) = scope_frame();
        let k = vec![f_outer, return_frame(), f_inner];
        let entries = collect_available(&k);
        assert_eq!(
            entries.iter().map(|e| e.scope).collect::<Vec<_>>(),
            vec![outer, inner],
        );
    }

    #[test]
    fn collect_is_deterministic() {
        let (_, a) = scope_frame();
        let (_, b) = scope_frame();
        let k = vec![a, return_frame(), b];
        let first: Vec<_> = collect_available(&k).iter().map(|e| e.scope).collect();
        let second: Vec<_> = collect_available(&k).iter().map(|e| e.scope).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn collect_stops_at_busy_boundary() {
        // During a dispatch addressing `running`, only handlers strictly
        // outer than it (plus anything installed above the dispatch) are
        // visible.
        let (outer, f_outer) = scope_frame();
        let (running, f_running) = scope_frame();
        let snapshot = {
            let entries = [&f_outer, &f_running]
                .iter()
                .map(|f| match f {
                    Frame::WithHandler(wh) => wh.entry(),
                    _ => unreachable!(),
                })
                .collect();
            HandlerSnapshot::from_entries(entries)
        };
        let df = DispatchingFrame::new(Effect::Pure(Value::Null), snapshot, 1);
        let (installed, f_installed) = scope_frame();

        let k = vec![f_outer, f_running, Frame::Dispatching(df), f_installed];
        let scopes: Vec<_> = collect_available(&k).iter().map(|e| e.scope).collect();
        assert_eq!(scopes, vec![outer, installed]);
        assert!(!scopes.contains(&running));
    }

    #[test]
    fn collect_on_empty_k_is_empty() {
        assert!(collect_available(&[]).is_empty());
    }

    #[test]
    fn start_dispatch_addresses_the_innermost_handler() {
        let (_, f_outer) = scope_frame();
        let (inner, f_inner) = scope_frame();
        let state = start_dispatch(
            Effect::custom("x", Value::Null),
            Environment::new(),
            Store::new(),
            vec![f_outer, f_inner],
        );
        let Frame::Dispatching(df) = state.k.last().expect("dispatch frame pushed") else {
            panic!("expected a dispatching frame on top");
        };
        assert_eq!(df.index, 1);
        assert_eq!(df.target_scope(), Some(inner));
        assert!(!df.started);
        assert!(matches!(state.control, Control::Value(Value::Null)));
    }

    #[test]
    fn start_dispatch_without_handlers_is_unhandled() {
        let state = start_dispatch(
            Effect::custom("x", Value::Null),
            Environment::new(),
            Store::new(),
            Vec::new(),
        );
        match state.control {
            Control::Error { error, trace } => {
                assert_eq!(error, RuntimeError::UnhandledEffect("Custom".to_string()));
                assert!(trace.is_some());
            }
            other => panic!("expected error control, got {other:?}"),
        }
    }
}
