//! The single-step transition function.
//!
//! `step` consumes a state and produces exactly one of: a successor
//! state, a terminal (`Done` / `Failed`), or an async-escape request.
//! Exactly one case applies to any reachable state; states that the
//! invariants rule out surface as `InterpreterInvariantError`.

use tracing::trace;

use prism_core::{
    Coroutine, Effect, Environment, Frame, Input, Program, ProgramKind, ReturnFrame, RuntimeError,
    SourceSite, StepOutcome, Store, WithHandlerFrame,
};

use crate::dispatch;
use crate::state::{capture_trace, CeskState, Control, EscapeRequest, StepResult};

/// Take one machine transition.
pub fn step(state: CeskState) -> StepResult {
    let CeskState { control, env, store, k } = state;
    match control {
        // -- terminals ----------------------------------------------------
        Control::Value(value) if k.is_empty() => StepResult::Done { value, store },
        Control::Error { error, trace } if k.is_empty() => {
            StepResult::Failed { error, store, traceback: trace }
        }

        // -- program start ------------------------------------------------
        Control::Program(program) => StepResult::Next(begin_program(program, env, store, k)),

        // -- effect interpretation ----------------------------------------
        Control::Effect(effect) => on_effect(effect, env, store, k),

        // -- value meets the continuation ---------------------------------
        Control::Value(value) => {
            let mut k = k;
            match k.pop().expect("non-empty continuation") {
                Frame::Return(rf) => {
                    StepResult::Next(resume_return(rf, Input::Value(value), store, k))
                }
                Frame::WithHandler(_) => {
                    // The handler scope exits successfully.
                    StepResult::Next(CeskState { control: Control::value(value), env, store, k })
                }
                Frame::Dispatching(df) => {
                    if !df.started {
                        StepResult::Next(dispatch::dispatch_handler(df, env, store, k))
                    } else if df.forwarded {
                        // Ownership of the continuation passed outward; the
                        // forwarding handler's return value flows into the
                        // user continuation below.
                        StepResult::Next(CeskState {
                            control: Control::value(value),
                            env,
                            store,
                            k,
                        })
                    } else {
                        StepResult::Next(dispatch::abandon(df, value, env, store, k))
                    }
                }
            }
        }

        // -- error meets the continuation ---------------------------------
        Control::Error { error, trace } => {
            let mut k = k;
            match k.pop().expect("non-empty continuation") {
                Frame::Return(rf) => {
                    StepResult::Next(throw_return(rf, error, trace, store, k))
                }
                Frame::WithHandler(_) => {
                    // Errors pass through handler scopes uninterpreted.
                    StepResult::Next(CeskState { control: Control::Error { error, trace }, env, store, k })
                }
                Frame::Dispatching(_) => {
                    // A handler failed (or completed a forwarded dispatch
                    // with an error): the error is thrown into the user
                    // continuation at the effect site.
                    StepResult::Next(CeskState { control: Control::Error { error, trace }, env, store, k })
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Program and frame stepping
// ---------------------------------------------------------------------------

/// Start a program: a `Pure` becomes a value immediately; a suspended
/// coroutine is stepped once and installed in a `Return` frame if it
/// yields.
fn begin_program(program: Program, env: Environment, store: Store, k: Vec<Frame>) -> CeskState {
    let (site, kind) = program.into_parts();
    match kind {
        ProgramKind::Pure(value) => CeskState { control: Control::value(value), env, store, k },
        ProgramKind::Suspended(mut coroutine) => {
            let outcome = coroutine.step(Input::Start);
            install_outcome(outcome, coroutine, site, env, store, k)
        }
    }
}

/// Send a value or error into a `Return` frame's program. The frame's
/// saved environment becomes current again.
fn resume_return(mut rf: ReturnFrame, input: Input, store: Store, k: Vec<Frame>) -> CeskState {
    let env = rf.env;
    let outcome = rf.program.step(input);
    install_outcome(outcome, rf.program, rf.site, env, store, k)
}

/// Throw an error into a `Return` frame, preserving the traceback when
/// the program re-raises the same error.
fn throw_return(
    mut rf: ReturnFrame,
    error: RuntimeError,
    trace: Option<prism_core::Traceback>,
    store: Store,
    k: Vec<Frame>,
) -> CeskState {
    let env = rf.env.clone();
    match rf.program.step(Input::Error(error.clone())) {
        StepOutcome::Raise(raised) => {
            let trace = if raised == error { trace } else { Some(capture_trace(&k, Some(&rf.site))) };
            CeskState { control: Control::Error { error: raised, trace }, env, store, k }
        }
        outcome => install_outcome(outcome, rf.program, rf.site, env, store, k),
    }
}

/// Map a coroutine step outcome onto the machine: yields re-install the
/// frame, clean returns and raises pop it.
fn install_outcome(
    outcome: StepOutcome,
    coroutine: Box<dyn Coroutine>,
    site: SourceSite,
    env: Environment,
    store: Store,
    mut k: Vec<Frame>,
) -> CeskState {
    match outcome {
        StepOutcome::Effect(effect) => {
            trace!(effect = effect.kind(), "yield effect");
            k.push(Frame::Return(ReturnFrame { program: coroutine, env: env.clone(), site }));
            CeskState { control: Control::Effect(effect), env, store, k }
        }
        StepOutcome::Child(program) => {
            k.push(Frame::Return(ReturnFrame { program: coroutine, env: env.clone(), site }));
            CeskState { control: Control::Program(program), env, store, k }
        }
        StepOutcome::Return(value) => CeskState { control: Control::value(value), env, store, k },
        StepOutcome::Raise(error) => {
            let trace = Some(capture_trace(&k, Some(&site)));
            CeskState { control: Control::Error { error, trace }, env, store, k }
        }
    }
}

// ---------------------------------------------------------------------------
// Effect interpretation
// ---------------------------------------------------------------------------

/// Interpret a yielded effect: the built-in shortcut, handler scoping,
/// the control primitives, and the async escape are handled by the
/// machine; everything else starts a handler dispatch.
fn on_effect(effect: Effect, env: Environment, store: Store, mut k: Vec<Frame>) -> StepResult {
    match effect {
        Effect::Pure(value) => {
            StepResult::Next(CeskState { control: Control::value(value), env, store, k })
        }
        Effect::WithHandler { handler, program } => {
            k.push(Frame::WithHandler(WithHandlerFrame::new(handler, env.clone())));
            StepResult::Next(CeskState { control: Control::Program(program), env, store, k })
        }
        Effect::Resume(value) => StepResult::Next(dispatch::apply_resume(value, env, store, k)),
        Effect::Forward(effect) => {
            StepResult::Next(dispatch::apply_forward(*effect, env, store, k))
        }
        Effect::GetContinuation => {
            StepResult::Next(dispatch::apply_get_continuation(env, store, k))
        }
        Effect::CreateContinuation { program, handlers } => {
            StepResult::Next(dispatch::apply_create_continuation(program, handlers, env, store, k))
        }
        Effect::ResumeContinuation { continuation, value } => StepResult::Next(
            dispatch::apply_resume_continuation(continuation, value, env, store, k),
        ),
        Effect::GetHandlers => StepResult::Next(dispatch::apply_get_handlers(env, store, k)),
        Effect::ResumeK(rk) => StepResult::Next(dispatch::apply_resume_k(*rk, env, store, k)),
        Effect::AsyncEscape(payload) => {
            StepResult::Escape(EscapeRequest::new(payload, env, store, k))
        }
        other => StepResult::Next(dispatch::start_dispatch(other, env, store, k)),
    }
}
