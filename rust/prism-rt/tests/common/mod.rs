//! Shared helpers for the integration suites.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use prism_core::{handler_fn, Effect, HandlerRef, Program, Value};
use prism_rt::{forward_on, resume_with};

/// Install the test log subscriber once; `RUST_LOG=trace` shows machine
/// steps.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A handler that records `emit` effects into a shared log and forwards
/// everything else.
pub fn emit_log() -> (Arc<Mutex<Vec<String>>>, HandlerRef) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    let handler = handler_fn("emit", move |effect, _ctx| match effect {
        Effect::Custom(c) if c.name == "emit" => {
            if let Some(s) = c.payload.as_str() {
                sink.lock().unwrap().push(s.to_string());
            }
            resume_with(Value::Null)
        }
        other => forward_on(other),
    });
    (log, handler)
}

/// Emit a label through the `emit` handler.
pub fn emit(label: &str) -> Program {
    Program::perform(Effect::custom("emit", Value::str(label)))
}

/// Position of `needle` in the log; panics when absent.
pub fn position(log: &[String], needle: &str) -> usize {
    log.iter()
        .position(|s| s == needle)
        .unwrap_or_else(|| panic!("{needle:?} not found in {log:?}"))
}
