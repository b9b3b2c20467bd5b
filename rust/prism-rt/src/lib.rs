//! Prism Runtime
//!
//! The handler/scheduler layer over the `prism-machine` core: the
//! cooperative task scheduler and its state handler, the external-promise
//! wait handlers, the I/O bridge for the synchronous driver, user-space
//! handler patterns, and the two runners.

pub mod external;
pub mod io;
pub mod patterns;
pub mod runner;
pub mod sched_state;
pub mod scheduler;

pub use external::{async_external_wait_handler, sync_external_wait_handler};
pub use io::{async_io_handler, threaded_io_handler, IoBridge};
pub use patterns::{forward_on, forwarding_handler, reader_handler, resume_with, with_safe};
pub use runner::{
    async_run, async_run_scheduled, sync_run, sync_run_scheduled, AsyncRunner, RunnerOptions,
    RuntimeResult, SyncRunner,
};
pub use scheduler::task_scheduler_handler;
pub use sched_state::scheduler_state_handler;
