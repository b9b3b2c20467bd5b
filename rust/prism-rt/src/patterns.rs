//! User-space handler patterns.
//!
//! Everything here is expressible with the public primitives: a
//! forwarding handler, the `Safe` pattern (catch around a `WithHandler`
//! body, producing an `Outcome` sum), and an illustrative reader handler
//! answering `Ask` from the environment.

use prism_core::{handler_fn, Effect, HandlerRef, Program, RuntimeError, Value};

/// A handler program that resumes the effect site with `value` and passes
/// the continuation's final result through.
pub fn resume_with(value: Value) -> Program {
    Program::perform(Effect::Resume(value))
}

/// A handler program that hands `effect` to the next outer handler and
/// passes the result through.
pub fn forward_on(effect: Effect) -> Program {
    Program::perform(Effect::Forward(Box::new(effect)))
}

/// A handler that forwards every effect unchanged. Installing it around a
/// program is observationally equivalent to the program itself.
pub fn forwarding_handler() -> HandlerRef {
    handler_fn("forward-all", |effect, _ctx| forward_on(effect))
}

/// Run `program` and convert its result into an `Outcome` value:
/// `Ok(value)` on success, `Err(error)` for anything it raises.
///
/// The body runs under a forward-only handler scope, so effects still
/// reach the surrounding handlers; only the success/error channel is
/// reified.
pub fn with_safe(program: Program) -> Program {
    Program::handled(forwarding_handler(), program)
        .and_then(|v| Program::pure(Value::ok(v)))
        .or_else(|e| Program::pure(Value::err(e)))
}

/// An illustrative reader handler: answers `Ask(key)` from the
/// environment at the effect site and fails with `MissingEnvKey` when the
/// key is absent. Everything else is forwarded.
pub fn reader_handler() -> HandlerRef {
    handler_fn("reader", |effect, ctx| match effect {
        Effect::Ask(key) => match ctx.env.get(&key) {
            Some(value) => resume_with(value.clone()),
            None => Program::fail(RuntimeError::MissingEnvKey(key)),
        },
        other => forward_on(other),
    })
}
