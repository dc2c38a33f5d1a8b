//! Agent process lifecycle: group primitives, stdio capture, spawning.

pub mod agent;
pub mod group;
pub mod manager;
pub mod stdio;

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

pub use agent::AgentRunner;
pub use group::{
    GroupError, GroupSignal, PlatformGroups, ProcessGroups, is_process_alive,
    is_process_group_alive, kill_process_group, platform, platform_groups, process_group_id,
    terminate_process_group,
};
pub use manager::{ProcessError, ProcessHandle, ProcessManager, SpawnSpec, StdinSource};
pub use stdio::{OutputSink, STDERR_FILE, STDOUT_FILE, StdioCapture};
