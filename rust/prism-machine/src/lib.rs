//! Prism Machine
//!
//! The CESK+H abstract machine: machine state, the single-step transition
//! function, handler discovery and dispatch, and the algebraic-control
//! primitives (`Resume`, `Forward`, `GetContinuation`,
//! `ResumeContinuation`, `GetHandlers`, `ResumeK`).
//!
//! A driver owns a [`CeskState`] and repeatedly calls [`step`]. Each call
//! returns a new state, a terminal, or an async-escape request; drivers
//! loop on new states, service escapes, and return on terminals.

pub mod dispatch;
pub mod state;
pub mod step;

pub use state::{CeskState, Control, EscapeRequest, EscapeSeat, StepResult};
pub use step::step;
