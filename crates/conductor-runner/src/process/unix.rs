//! POSIX backend: real process groups, signals sent to the negated group id.

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::{Pid, getpgid};

use super::group::{GroupError, GroupSignal, ProcessGroups, check_pgid, check_pid};

/// Process groups backed by `getpgid(2)` / `killpg(2)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct PosixGroups;

impl ProcessGroups for PosixGroups {
    fn group_id(&self, pid: i32) -> Result<i32, GroupError> {
        let pid = check_pid(pid)?;
        getpgid(Some(Pid::from_raw(pid)))
            .map(Pid::as_raw)
            .map_err(|errno| os_error("getpgid", pid, errno))
    }

    fn signal_group(&self, pgid: i32, signal: GroupSignal) -> Result<(), GroupError> {
        let pgid = check_pgid(pgid)?;
        let sig = match signal {
            GroupSignal::Terminate => Signal::SIGTERM,
            GroupSignal::Kill => Signal::SIGKILL,
        };
        match killpg(Pid::from_raw(pgid), sig) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => Err(GroupError::GroupNotFound(pgid)),
            Err(errno) => Err(os_error("killpg", pgid, errno)),
        }
    }

    fn is_process_alive(&self, pid: i32) -> Result<bool, GroupError> {
        let pid = check_pid(pid)?;
        probe(kill(Pid::from_raw(pid), None), "kill", pid)
    }

    fn is_group_alive(&self, pgid: i32) -> Result<bool, GroupError> {
        let pgid = check_pgid(pgid)?;
        probe(killpg(Pid::from_raw(pgid), None), "killpg", pgid)
    }
}

/// Interpret the result of a signal-0 probe.
fn probe(result: nix::Result<()>, op: &'static str, id: i32) -> Result<bool, GroupError> {
    match result {
        Ok(()) | Err(Errno::EPERM) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(errno) => Err(os_error(op, id, errno)),
    }
}

fn os_error(op: &'static str, id: i32, errno: Errno) -> GroupError {
    GroupError::Os {
        op,
        id,
        source: std::io::Error::from(errno),
    }
}
