//! Process-group primitives.
//!
//! POSIX process groups let one signal reach a process and all of its
//! descendants. Windows has no equivalent; its backend approximates a group
//! with a Job Object registered at spawn time and falls back to the single
//! tracked process where no job exists. Both backends implement
//! [`ProcessGroups`] and the build selects one as [`PlatformGroups`].
//!
//! Every operation rejects non-positive ids before touching the OS.

use std::sync::{Arc, LazyLock};

#[cfg(unix)]
pub use super::unix::PosixGroups as PlatformGroups;
#[cfg(windows)]
pub use super::windows::JobObjectGroups as PlatformGroups;

/// Which signal to deliver to a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupSignal {
    /// Ask the group to exit (SIGTERM).
    Terminate,
    /// Force the group to exit (SIGKILL).
    Kill,
}

/// Errors from process-group operations.
#[derive(Debug, thiserror::Error)]
pub enum GroupError {
    #[error("Invalid pid: {0}")]
    InvalidPid(i32),

    #[error("Invalid pgid: {0}")]
    InvalidPgid(i32),

    #[error("Process group not found: {0}")]
    GroupNotFound(i32),

    #[error("Failed to {op} {id}: {source}")]
    Os {
        op: &'static str,
        id: i32,
        #[source]
        source: std::io::Error,
    },
}

/// Capability set for resolving, signalling and probing process groups.
pub trait ProcessGroups: Send + Sync {
    /// Resolve the group id of `pid`.
    fn group_id(&self, pid: i32) -> Result<i32, GroupError>;

    /// Deliver `signal` to every process in group `pgid`.
    fn signal_group(&self, pgid: i32, signal: GroupSignal) -> Result<(), GroupError>;

    /// Zero-effect liveness probe for a single process.
    ///
    /// A process that exists but may not be signalled by this user counts as
    /// alive. On a multi-user host a different process that reused the pid is
    /// indistinguishable from the tracked one; no start-time reconciliation
    /// is attempted.
    fn is_process_alive(&self, pid: i32) -> Result<bool, GroupError>;

    /// Zero-effect liveness probe for a whole group. Same permission caveat
    /// as [`ProcessGroups::is_process_alive`].
    fn is_group_alive(&self, pgid: i32) -> Result<bool, GroupError>;

    /// Hook called right after a process is spawned into its own group.
    fn track_spawned(&self, _pid: i32) -> Result<(), GroupError> {
        Ok(())
    }

    /// Release any per-process bookkeeping created by `track_spawned`.
    fn release(&self, _pid: i32) {}
}

pub(crate) fn check_pid(pid: i32) -> Result<i32, GroupError> {
    if pid <= 0 {
        return Err(GroupError::InvalidPid(pid));
    }
    Ok(pid)
}

pub(crate) fn check_pgid(pgid: i32) -> Result<i32, GroupError> {
    if pgid <= 0 {
        return Err(GroupError::InvalidPgid(pgid));
    }
    Ok(pgid)
}

static PLATFORM: LazyLock<Arc<PlatformGroups>> = LazyLock::new(Arc::default);

/// The process-wide backend for this OS.
pub fn platform() -> &'static PlatformGroups {
    PLATFORM.as_ref()
}

/// Shared handle to the process-wide backend, for components that accept
/// any [`ProcessGroups`] implementation.
pub fn platform_groups() -> Arc<dyn ProcessGroups> {
    let shared: Arc<PlatformGroups> = Arc::clone(&PLATFORM);
    shared
}

/// Resolve the process group id of `pid`.
pub fn process_group_id(pid: i32) -> Result<i32, GroupError> {
    platform().group_id(pid)
}

/// Ask every process in group `pgid` to exit.
pub fn terminate_process_group(pgid: i32) -> Result<(), GroupError> {
    platform().signal_group(pgid, GroupSignal::Terminate)
}

/// Force every process in group `pgid` to exit.
pub fn kill_process_group(pgid: i32) -> Result<(), GroupError> {
    platform().signal_group(pgid, GroupSignal::Kill)
}

/// Whether process `pid` exists.
pub fn is_process_alive(pid: i32) -> Result<bool, GroupError> {
    platform().is_process_alive(pid)
}

/// Whether any process in group `pgid` exists.
pub fn is_process_group_alive(pgid: i32) -> Result<bool, GroupError> {
    platform().is_group_alive(pgid)
}
