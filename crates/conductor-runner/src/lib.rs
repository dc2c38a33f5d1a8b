//! Conductor Runner Library
//!
//! Supervision of agent CLI processes:
//! - Process groups, spawning and stdio capture for agent processes
//! - Discovery of, and waiting on, child runs recorded under `runs/`
//! - The restart loop that drives a task until it writes `DONE`
//! - Admission control across concurrently supervised runs

pub mod admission;
pub mod children;
pub mod process;
pub mod supervisor;

pub use admission::{AdmissionControl, AdmissionError, AdmissionSlot};
pub use children::{
    ActiveChildren, ChildError, ChildMonitor, ChildProcess, ChildWaitError, find_active_children,
    wait_for_children,
};
pub use process::{AgentRunner, ProcessError, ProcessHandle, ProcessManager, SpawnSpec};
pub use supervisor::{
    Backoff, RestartSupervisor, RetryPolicy, RootRunner, SupervisorBuilder, SupervisorError,
};
