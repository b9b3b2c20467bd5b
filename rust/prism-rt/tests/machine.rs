//! Machine-level semantics: dispatch, forwarding, continuations, and the
//! concrete single-task scenarios.

use pretty_assertions::assert_eq;

use prism_core::{
    handler_fn, Effect, Environment, HandlerRef, Program, RuntimeError, Store, Value,
};
use prism_rt::{forward_on, forwarding_handler, reader_handler, resume_with, sync_run, with_safe};

fn run(program: Program, handlers: Vec<HandlerRef>) -> Result<Value, RuntimeError> {
    sync_run(program, handlers, Environment::new(), Store::new()).into_result()
}

/// A handler that resumes `add` effects with twice their payload.
fn doubler() -> HandlerRef {
    handler_fn("doubler", |effect, _ctx| match effect {
        Effect::Custom(c) if c.name == "add" => {
            let n = c.payload.as_int().unwrap_or(0);
            resume_with(Value::Int(n * 2))
        }
        other => forward_on(other),
    })
}

/// A handler that resumes `add` effects with payload + 100.
fn add_hundred() -> HandlerRef {
    handler_fn("add-hundred", |effect, _ctx| match effect {
        Effect::Custom(c) if c.name == "add" => {
            let n = c.payload.as_int().unwrap_or(0);
            resume_with(Value::Int(n + 100))
        }
        other => forward_on(other),
    })
}

#[test]
fn pure_return() {
    // S1: `return 42` under an empty handler stack.
    assert_eq!(run(Program::pure(42i64), vec![]).unwrap(), Value::Int(42));
}

#[test]
fn single_handler_resumes_with_doubled_value() {
    // S2: x = yield Add(21); return x.
    let p = Program::perform(Effect::custom("add", Value::Int(21)));
    assert_eq!(run(p, vec![doubler()]).unwrap(), Value::Int(42));
}

#[test]
fn forward_chain_reaches_the_outer_handler() {
    // S3: [Outer, Inner]; Inner forwards everything, Outer adds 100.
    let p = Program::perform(Effect::custom("add", Value::Int(10)));
    let result = run(p, vec![add_hundred(), forwarding_handler()]).unwrap();
    assert_eq!(result, Value::Int(110));
}

#[test]
fn forward_chain_resumes_user_code_after_the_yield() {
    // The continuation after the effect still runs when the value came
    // through a forwarding handler.
    let p = Program::perform(Effect::custom("add", Value::Int(10)))
        .and_then(|v| Program::pure(Value::Int(v.as_int().unwrap() + 1)));
    let result = run(p, vec![add_hundred(), forwarding_handler()]).unwrap();
    assert_eq!(result, Value::Int(111));
}

#[test]
fn forward_with_no_outer_handler_is_unhandled() {
    // P6: Forward from the outermost handler yields UnhandledEffect.
    let p = Program::perform(Effect::custom("add", Value::Int(1)));
    let err = run(p, vec![forwarding_handler()]).unwrap_err();
    assert_eq!(err, RuntimeError::UnhandledEffect("Custom".to_string()));
}

#[test]
fn forwarding_scope_is_observationally_transparent() {
    // R2: WithHandler(forward-only, p) ≡ p.
    let direct = Program::perform(Effect::custom("add", Value::Int(5)));
    let scoped = Program::handled(
        forwarding_handler(),
        Program::perform(Effect::custom("add", Value::Int(5))),
    );
    assert_eq!(
        run(direct, vec![doubler()]).unwrap(),
        run(scoped, vec![doubler()]).unwrap(),
    );
}

#[test]
fn pure_runs_under_any_handler_stack() {
    // R1 for a representative stack.
    let stacks: Vec<Vec<HandlerRef>> = vec![
        vec![],
        vec![forwarding_handler()],
        vec![doubler(), forwarding_handler(), reader_handler()],
    ];
    for handlers in stacks {
        assert_eq!(run(Program::pure(9i64), handlers).unwrap(), Value::Int(9));
    }
}

#[test]
fn safe_converts_raise_to_err_and_value_to_ok() {
    // R3.
    let ok = run(with_safe(Program::pure(3i64)), vec![]).unwrap();
    assert_eq!(ok, Value::ok(Value::Int(3)));

    let err = run(with_safe(Program::fail(RuntimeError::user("nope"))), vec![]).unwrap();
    assert_eq!(err, Value::err(RuntimeError::user("nope")));
}

#[test]
fn one_shot_violation_on_second_resume_of_captured_continuation() {
    // S5: capture k, resume it twice; the second resume fails and the
    // failure surfaces as the run's error.
    let handler = handler_fn("double-resume", |effect, _ctx| match effect {
        Effect::Custom(_) => Program::perform(Effect::GetContinuation).and_then(|cont_value| {
            let Value::Continuation(cont) = cont_value else {
                return Program::fail(RuntimeError::invariant("expected a continuation"));
            };
            let again = cont.clone();
            Program::perform(Effect::ResumeContinuation {
                continuation: cont,
                value: Value::Int(1),
            })
            .and_then(move |_| {
                Program::perform(Effect::ResumeContinuation {
                    continuation: again,
                    value: Value::Int(2),
                })
            })
        }),
        other => forward_on(other),
    });
    let p = Program::perform(Effect::custom("go", Value::Null));
    let err = run(p, vec![handler]).unwrap_err();
    assert_eq!(err.kind(), "one-shot-violation");
}

#[test]
fn bare_double_resume_is_a_one_shot_violation() {
    let handler = handler_fn("greedy", |effect, _ctx| match effect {
        Effect::Custom(_) => Program::perform(Effect::Resume(Value::Int(1)))
            .and_then(|_| Program::perform(Effect::Resume(Value::Int(2)))),
        other => forward_on(other),
    });
    let p = Program::perform(Effect::custom("go", Value::Null));
    let err = run(p, vec![handler]).unwrap_err();
    assert_eq!(err.kind(), "one-shot-violation");
}

#[test]
fn resume_after_forward_is_rejected() {
    // The outer handler owns the continuation once the effect has been
    // forwarded.
    let inner = handler_fn("forward-then-resume", |effect, _ctx| match effect {
        Effect::Custom(c) => Program::perform(Effect::Forward(Box::new(Effect::Custom(c))))
            .and_then(|_| Program::perform(Effect::Resume(Value::Int(0)))),
        other => forward_on(other),
    });
    let p = Program::perform(Effect::custom("add", Value::Int(1)));
    let err = run(p, vec![add_hundred(), inner]).unwrap_err();
    assert_eq!(err.kind(), "interpreter-invariant");
}

#[test]
fn handler_error_is_seen_by_the_user_program() {
    let failing = handler_fn("bomb", |effect, _ctx| match effect {
        Effect::Custom(_) => Program::fail(RuntimeError::user("handler blew up")),
        other => forward_on(other),
    });
    let p = Program::perform(Effect::custom("go", Value::Null))
        .or_else(|e| Program::pure(Value::str(format!("caught: {e}"))));
    let result = run(p, vec![failing]).unwrap();
    assert_eq!(result, Value::str("caught: handler blew up"));
}

#[test]
fn abandonment_skips_the_rest_of_the_user_program() {
    let short = handler_fn("short-circuit", |effect, _ctx| match effect {
        Effect::Custom(_) => Program::pure(Value::str("early")),
        other => forward_on(other),
    });
    let p = Program::perform(Effect::custom("stop", Value::Null))
        .and_then(|_| Program::fail(RuntimeError::user("must not run")));
    assert_eq!(run(p, vec![short]).unwrap(), Value::str("early"));
}

#[test]
fn unstarted_continuation_inherits_the_handler_stack() {
    // A handler builds a fresh computation with CreateContinuation and
    // starts it with ResumeContinuation; the probe effect inside it is
    // answered by an inherited handler copy.
    let probe = handler_fn("probe", |effect, _ctx| match effect {
        Effect::Custom(c) if c.name == "probe" => {
            resume_with(Value::Int(c.payload.as_int().unwrap_or(0) * 2))
        }
        other => forward_on(other),
    });
    let trigger = handler_fn("trigger", |effect, _ctx| match effect {
        Effect::Custom(c) if c.name == "trigger" => {
            let payload = c.payload.clone();
            Program::perform(Effect::GetHandlers).and_then(move |handlers_value| {
                let Value::Handlers(handlers) = handlers_value else {
                    return Program::fail(RuntimeError::invariant("expected handlers"));
                };
                let fresh = Program::perform(Effect::custom("probe", payload));
                Program::perform(Effect::CreateContinuation { program: fresh, handlers })
                    .and_then(|cont_value| {
                        let Value::Continuation(cont) = cont_value else {
                            return Program::fail(RuntimeError::invariant("expected a continuation"));
                        };
                        assert!(!cont.is_started());
                        Program::perform(Effect::ResumeContinuation {
                            continuation: cont,
                            value: Value::Null,
                        })
                    })
            })
        }
        other => forward_on(other),
    });
    let p = Program::perform(Effect::custom("trigger", Value::Int(5)));
    assert_eq!(run(p, vec![probe, trigger]).unwrap(), Value::Int(10));
}

#[test]
fn ask_reads_the_environment_at_the_effect_site() {
    let env = Environment::from_pairs([("region".to_string(), Value::str("eu-west"))]);
    let p = Program::perform(Effect::Ask("region".into()));
    let result = sync_run(p, vec![reader_handler()], env, Store::new());
    assert_eq!(result.unwrap(), Value::str("eu-west"));
}

#[test]
fn missing_env_key_has_its_own_kind() {
    let p = Program::perform(Effect::Ask("absent".into()));
    let result = sync_run(p, vec![reader_handler()], Environment::new(), Store::new());
    assert_eq!(result.unwrap_err().kind(), "missing-env-key");
}

#[test]
fn failed_run_surfaces_labeled_traceback_frames() {
    let p = Program::pure(Value::Null)
        .with_label("outer-chain")
        .and_then(|_| Program::fail(RuntimeError::user("kaput")).with_label("inner-failure"));
    let result = sync_run(p, vec![], Environment::new(), Store::new());
    let traceback = result.traceback().expect("traceback captured").clone();
    assert!(!traceback.is_empty());
    assert!(traceback.frames.iter().any(|f| f.label == "inner-failure"));
}

#[test]
fn nested_handler_scopes_dispatch_innermost_first() {
    // Both handlers match; the innermost wins.
    let p = Program::perform(Effect::custom("add", Value::Int(1)));
    let result = run(p, vec![add_hundred(), doubler()]).unwrap();
    assert_eq!(result, Value::Int(2));
}
