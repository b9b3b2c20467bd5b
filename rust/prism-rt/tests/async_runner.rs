//! The asynchronous driver: escapes, the scheduler preset, and external
//! completions under an event loop.

mod common;

use std::time::Duration;

use pretty_assertions::assert_eq;

use prism_core::{
    async_task, Effect, Environment, EscapePayload, GatherItem, Program, RuntimeError, Store,
    TaskId, Value,
};
use prism_rt::{async_run, async_run_scheduled};

use common::{emit, emit_log, position};

fn wait_on(value: Value) -> Program {
    Program::perform(Effect::Wait(value))
}

fn spawn(program: Program) -> Program {
    Program::perform(Effect::Spawn(program))
}

#[tokio::test]
async fn pure_value_round_trips() {
    let result = async_run(Program::pure(Value::Int(42)), vec![], Environment::new(), Store::new())
        .await;
    assert_eq!(result.unwrap(), Value::Int(42));
}

#[tokio::test]
async fn single_escape_is_awaited_and_resumed() {
    let p = Program::perform(Effect::AsyncEscape(EscapePayload::Single(async_task(
        || async { Ok(Value::str("from the loop")) },
    ))));
    let result = async_run(p, vec![], Environment::new(), Store::new()).await;
    assert_eq!(result.unwrap(), Value::str("from the loop"));
}

#[tokio::test]
async fn failing_escape_raises_at_the_escape_site() {
    let p = Program::perform(Effect::AsyncEscape(EscapePayload::Single(async_task(
        || async { Err(RuntimeError::user("connect refused")) },
    ))))
    .or_else(|e| Program::pure(Value::str(e.kind())));
    let result = async_run(p, vec![], Environment::new(), Store::new()).await;
    assert_eq!(result.unwrap(), Value::str("user"));
}

#[tokio::test]
async fn bundle_escape_resumes_with_first_completion() {
    let fast_id = TaskId::next();
    let slow_id = TaskId::next();
    let bundle = EscapePayload::Bundle(vec![
        (
            slow_id,
            async_task(|| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(Value::str("slow"))
            }),
        ),
        (fast_id, async_task(|| async { Ok(Value::str("fast")) })),
    ]);
    let p = Program::perform(Effect::AsyncEscape(bundle));
    let result = async_run(p, vec![], Environment::new(), Store::new()).await.unwrap();

    let Value::Tuple(parts) = result else { panic!("expected (task id, outcome)") };
    assert_eq!(parts[0], Value::Int(fast_id.as_u64() as i64));
    assert_eq!(parts[1], Value::ok(Value::str("fast")));
}

#[tokio::test]
async fn await_effect_escapes_under_the_scheduler_preset() {
    let main = Program::perform(Effect::Await(async_task(|| async { Ok(Value::Int(5)) })))
        .map(|v| Value::Int(v.as_int().unwrap() * 3));
    let result = async_run_scheduled(main, vec![], Environment::new(), Store::new()).await;
    assert_eq!(result.unwrap(), Value::Int(15));
}

#[tokio::test]
async fn delay_uses_the_event_loop_timer() {
    let main = Program::perform(Effect::Delay(Duration::from_millis(5)))
        .and_then(|_| Program::pure(Value::str("woke")));
    let result = async_run_scheduled(main, vec![], Environment::new(), Store::new()).await;
    assert_eq!(result.unwrap(), Value::str("woke"));
}

#[tokio::test]
async fn two_tasks_interleave_under_the_async_preset() {
    let (log, emit_handler) = emit_log();
    let task = |name: &'static str| {
        emit(&format!("{name}1"))
            .and_then(move |_| Program::perform(Effect::YieldNow))
            .and_then(move |_| emit(&format!("{name}2")))
            .and_then(move |_| Program::pure(Value::str(name)))
    };
    let main = spawn(task("A")).and_then(move |a| {
        spawn(task("B")).and_then(move |b| {
            wait_on(a).and_then(move |ra| {
                wait_on(b).and_then(move |rb| Program::pure(Value::tuple(vec![ra, rb])))
            })
        })
    });
    let result = async_run_scheduled(main, vec![emit_handler], Environment::new(), Store::new())
        .await
        .unwrap();
    assert_eq!(result, Value::tuple(vec![Value::str("A"), Value::str("B")]));

    let log = log.lock().unwrap().clone();
    assert!(position(&log, "A1") < position(&log, "B2"));
    assert!(position(&log, "B1") < position(&log, "A2"));
}

#[tokio::test]
async fn external_promise_unblocks_the_machine_without_blocking_the_loop() {
    let main = Program::perform(Effect::CreateExternalPromise).and_then(|external| {
        let Value::External(promise) = external.clone() else {
            return Program::fail(RuntimeError::invariant("expected an external promise"));
        };
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            promise.complete(Value::Int(77));
        });
        wait_on(external)
    });
    let result = async_run_scheduled(main, vec![], Environment::new(), Store::new()).await;
    assert_eq!(result.unwrap(), Value::Int(77));
}

#[tokio::test]
async fn timeout_as_race_with_a_delay_task() {
    // Timeouts are not a primitive; build one from Race plus a delay leg.
    let main = Program::perform(Effect::CreatePromise).and_then(|promise| {
        spawn(wait_on(promise)).and_then(|hung| {
            let timer = Program::perform(Effect::Delay(Duration::from_millis(10)))
                .and_then(|_| Program::pure(Value::str("timeout")));
            spawn(timer).and_then(move |timer_task| {
                let (Value::Task(hung_t), Value::Task(timer_t)) = (&hung, &timer_task) else {
                    return Program::fail(RuntimeError::invariant("spawn answered a non-task"));
                };
                Program::perform(Effect::Race(vec![*hung_t, *timer_t])).and_then(|outcome| {
                    let Value::Map(fields) = outcome else {
                        return Program::fail(RuntimeError::invariant("race answered a non-record"));
                    };
                    Program::pure(fields.get("value").cloned().unwrap_or(Value::Null))
                })
            })
        })
    });
    let result = async_run_scheduled(main, vec![], Environment::new(), Store::new()).await;
    assert_eq!(result.unwrap(), Value::str("timeout"));
}

#[tokio::test]
async fn gather_works_under_the_async_preset() {
    let main = Program::perform(Effect::Gather(vec![
        GatherItem::Program(Program::pure(Value::Int(1))),
        GatherItem::Program(Program::pure(Value::Int(2))),
    ]));
    let result = async_run_scheduled(main, vec![], Environment::new(), Store::new()).await;
    assert_eq!(result.unwrap(), Value::list(vec![Value::Int(1), Value::Int(2)]));
}
