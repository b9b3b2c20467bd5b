//! Property-based invariants of the machine and runner surface.

use proptest::prelude::*;

use prism_core::{Effect, Environment, HandlerRef, Program, RuntimeError, Store, Value};
use prism_machine::{step, CeskState, StepResult};
use prism_rt::{forwarding_handler, reader_handler, sync_run, with_safe};

/// Step a terminal-shaped state and return the terminal value.
fn terminal_value(v: i64) -> Value {
    let state = CeskState::initial(Program::pure(Value::Int(v)), Environment::new(), Store::new());
    let mut state = state;
    loop {
        match step(state) {
            StepResult::Next(next) => state = next,
            StepResult::Done { value, .. } => return value,
            other => panic!("unexpected {other:?}"),
        }
    }
}

proptest! {
    /// R1: pure(v) under any forward-only handler stack yields Ok(v).
    #[test]
    fn pure_survives_any_forwarding_stack(v in any::<i64>(), depth in 0usize..5) {
        let handlers: Vec<HandlerRef> = (0..depth).map(|_| forwarding_handler()).collect();
        let result = sync_run(Program::pure(Value::Int(v)), handlers, Environment::new(), Store::new());
        prop_assert_eq!(result.unwrap(), Value::Int(v));
    }

    /// P5: terminal evaluation is stable; evaluating the same pure
    /// program twice produces the same terminal.
    #[test]
    fn terminals_are_stable(v in any::<i64>()) {
        prop_assert_eq!(terminal_value(v), terminal_value(v));
    }

    /// P3: entering and leaving any number of handler scopes leaves the
    /// environment observable at the end unchanged.
    #[test]
    fn environment_survives_scope_nesting(key in "[a-z]{1,8}", v in any::<i64>(), depth in 0usize..5) {
        let env = Environment::from_pairs([(key.clone(), Value::Int(v))]);
        // Pass through `depth` nested forwarding scopes, then Ask.
        let mut body: Program = Program::pure(Value::Null);
        for _ in 0..depth {
            body = Program::handled(forwarding_handler(), body);
        }
        let p = body.and_then(move |_| Program::perform(Effect::Ask(key)));
        let result = sync_run(p, vec![reader_handler()], env, Store::new());
        prop_assert_eq!(result.unwrap(), Value::Int(v));
    }

    /// Safe is total: any program built from pure/fail chains runs to a
    /// Done terminal once wrapped in `with_safe`.
    #[test]
    fn safe_never_escapes_an_error(fail_at in 0usize..4, len in 1usize..4) {
        let mut p = Program::pure(Value::Int(0));
        for i in 0..len {
            p = if i == fail_at {
                p.and_then(|_| Program::fail(RuntimeError::user("planned")))
            } else {
                p.and_then(|v| Program::pure(v))
            };
        }
        let result = sync_run(with_safe(p), vec![], Environment::new(), Store::new());
        let value = result.unwrap();
        let outcome = value.as_outcome().expect("safe returns an outcome");
        if fail_at < len {
            prop_assert!(outcome.is_err());
        } else {
            prop_assert!(outcome.is_ok());
        }
    }

    /// Every run of a straight-line program terminates in a bounded
    /// number of steps (no hidden loops in the splice machinery).
    #[test]
    fn straight_line_programs_terminate(len in 0usize..20) {
        let mut p = Program::pure(Value::Int(0));
        for i in 0..len {
            let i = i as i64;
            p = p.and_then(move |_| Program::pure(Value::Int(i)));
        }
        let mut state = CeskState::initial(p, Environment::new(), Store::new());
        let mut budget = 10_000u32;
        loop {
            match step(state) {
                StepResult::Next(next) => {
                    state = next;
                    budget -= 1;
                    prop_assert!(budget > 0, "program did not terminate");
                }
                StepResult::Done { .. } => break,
                other => panic!("unexpected {other:?}"),
            }
        }
    }
}

/// P2 at the integration level: dispatch order is deterministic — the
/// same nested stack resolves the same way every time.
#[test]
fn dispatch_resolution_is_deterministic() {
    let build = || {
        let p = Program::perform(Effect::Ask("k".into()));
        sync_run(
            p,
            vec![reader_handler(), forwarding_handler(), forwarding_handler()],
            Environment::from_pairs([("k".to_string(), Value::Int(7))]),
            Store::new(),
        )
        .into_result()
    };
    assert_eq!(build().unwrap(), build().unwrap());
}
