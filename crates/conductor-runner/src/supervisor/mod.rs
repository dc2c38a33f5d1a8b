//! Restart supervision of a task's root agent.

pub mod policy;
mod restart;
mod runner;

pub use policy::{Backoff, DEFAULT_MAX_RESTARTS, DEFAULT_RESTART_DELAY, RetryPolicy};
pub use restart::{
    DEFAULT_WAIT_TIMEOUT, DONE_FILE, RestartSupervisor, SupervisorBuilder, SupervisorError,
};
pub use runner::{RootRunner, RunFuture};
