//! Windows backend.
//!
//! Windows has no process groups that can be signalled as a unit. The closest
//! tool is a Job Object: [`ProcessGroups::track_spawned`] puts each spawned
//! agent into its own kill-on-close job, keyed by pid. With a job registered,
//! terminate/kill end the whole job and liveness is the job's active-process
//! count. Without one, every operation degrades to the single process whose
//! pid doubles as the "group id". There is no graceful signal, so
//! [`GroupSignal::Terminate`] and [`GroupSignal::Kill`] behave the same.
#![allow(unsafe_code)]

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::{debug, warn};
use windows_sys::Win32::Foundation::{
    CloseHandle, ERROR_ACCESS_DENIED, ERROR_INVALID_PARAMETER, HANDLE, STILL_ACTIVE,
};
use windows_sys::Win32::System::JobObjects::{
    AssignProcessToJobObject, CreateJobObjectW, JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE,
    JOBOBJECT_BASIC_ACCOUNTING_INFORMATION, JOBOBJECT_EXTENDED_LIMIT_INFORMATION,
    JobObjectBasicAccountingInformation, JobObjectExtendedLimitInformation,
    QueryInformationJobObject, SetInformationJobObject, TerminateJobObject,
};
use windows_sys::Win32::System::Threading::{
    GetExitCodeProcess, OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION, PROCESS_SET_QUOTA,
    PROCESS_TERMINATE, TerminateProcess,
};

use super::group::{GroupError, GroupSignal, ProcessGroups, check_pgid, check_pid};

/// Exit code reported by processes ended through this backend.
const TERMINATED_EXIT_CODE: u32 = 1;

/// Owned kernel handle, closed on drop.
struct OwnedHandle(HANDLE);

// SAFETY: kernel object handles are process-global and usable from any thread.
unsafe impl Send for OwnedHandle {}

impl OwnedHandle {
    fn open_process(access: u32, pid: i32) -> Result<Self, std::io::Error> {
        #[allow(clippy::cast_sign_loss)]
        // SAFETY: plain FFI call; a null return is handled below.
        let handle = unsafe { OpenProcess(access, 0, pid as u32) };
        if handle.is_null() {
            return Err(std::io::Error::last_os_error());
        }
        Ok(Self(handle))
    }
}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        // SAFETY: the handle is owned by this value and closed exactly once.
        unsafe {
            CloseHandle(self.0);
        }
    }
}

/// Process "groups" emulated with Job Objects keyed by the spawned pid.
#[derive(Default)]
pub struct JobObjectGroups {
    jobs: Mutex<HashMap<i32, OwnedHandle>>,
}

impl std::fmt::Debug for JobObjectGroups {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tracked = self.jobs.lock().map(|jobs| jobs.len()).unwrap_or_default();
        f.debug_struct("JobObjectGroups")
            .field("tracked", &tracked)
            .finish()
    }
}

impl JobObjectGroups {
    fn create_job_for(pid: i32) -> Result<OwnedHandle, std::io::Error> {
        let process = OwnedHandle::open_process(PROCESS_SET_QUOTA | PROCESS_TERMINATE, pid)?;

        // SAFETY: null attributes and name create an anonymous job.
        let job = unsafe { CreateJobObjectW(std::ptr::null(), std::ptr::null()) };
        if job.is_null() {
            return Err(std::io::Error::last_os_error());
        }
        let job = OwnedHandle(job);

        // SAFETY: the struct is plain data; all-zero is a valid value.
        let mut limits: JOBOBJECT_EXTENDED_LIMIT_INFORMATION = unsafe { std::mem::zeroed() };
        limits.BasicLimitInformation.LimitFlags = JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE;
        #[allow(clippy::cast_possible_truncation)]
        let size = std::mem::size_of::<JOBOBJECT_EXTENDED_LIMIT_INFORMATION>() as u32;
        // SAFETY: pointer and size describe `limits`, which outlives the call.
        let ok = unsafe {
            SetInformationJobObject(
                job.0,
                JobObjectExtendedLimitInformation,
                std::ptr::from_ref(&limits).cast(),
                size,
            )
        };
        if ok == 0 {
            let error = std::io::Error::last_os_error();
            warn!(pid, error = %error, "Failed to set kill-on-close on job");
        }

        // SAFETY: both handles are valid for the duration of the call.
        if unsafe { AssignProcessToJobObject(job.0, process.0) } == 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(job)
    }

    fn terminate_job(&self, pid: i32) -> Option<Result<(), GroupError>> {
        let job = self.jobs.lock().ok()?.remove(&pid)?;
        // SAFETY: `job` is a live job handle owned by this call.
        let ok = unsafe { TerminateJobObject(job.0, TERMINATED_EXIT_CODE) };
        if ok == 0 {
            return Some(Err(os_error("TerminateJobObject", pid, std::io::Error::last_os_error())));
        }
        Some(Ok(()))
    }

    fn job_active_processes(&self, pid: i32) -> Option<Result<u32, GroupError>> {
        let jobs = self.jobs.lock().ok()?;
        let job = jobs.get(&pid)?;
        // SAFETY: the struct is plain data; all-zero is a valid value.
        let mut info: JOBOBJECT_BASIC_ACCOUNTING_INFORMATION = unsafe { std::mem::zeroed() };
        #[allow(clippy::cast_possible_truncation)]
        let size = std::mem::size_of::<JOBOBJECT_BASIC_ACCOUNTING_INFORMATION>() as u32;
        // SAFETY: pointer and size describe `info`; the job handle is held under the lock.
        let ok = unsafe {
            QueryInformationJobObject(
                job.0,
                JobObjectBasicAccountingInformation,
                std::ptr::from_mut(&mut info).cast(),
                size,
                std::ptr::null_mut(),
            )
        };
        drop(jobs);
        if ok == 0 {
            return Some(Err(os_error(
                "QueryInformationJobObject",
                pid,
                std::io::Error::last_os_error(),
            )));
        }
        Some(Ok(info.ActiveProcesses))
    }
}

impl ProcessGroups for JobObjectGroups {
    /// Windows has no group id; the pid stands in for it.
    fn group_id(&self, pid: i32) -> Result<i32, GroupError> {
        check_pid(pid)
    }

    fn signal_group(&self, pgid: i32, _signal: GroupSignal) -> Result<(), GroupError> {
        let pgid = check_pgid(pgid)?;
        if let Some(result) = self.terminate_job(pgid) {
            return result;
        }

        debug!(
            pid = pgid,
            "No job object registered, terminating single process"
        );
        let process = OwnedHandle::open_process(PROCESS_TERMINATE, pgid).map_err(|e| {
            if e.raw_os_error() == Some(ERROR_INVALID_PARAMETER as i32) {
                GroupError::GroupNotFound(pgid)
            } else {
                os_error("OpenProcess", pgid, e)
            }
        })?;
        // SAFETY: `process` holds a valid handle with PROCESS_TERMINATE access.
        if unsafe { TerminateProcess(process.0, TERMINATED_EXIT_CODE) } == 0 {
            return Err(os_error("TerminateProcess", pgid, std::io::Error::last_os_error()));
        }
        Ok(())
    }

    fn is_process_alive(&self, pid: i32) -> Result<bool, GroupError> {
        let pid = check_pid(pid)?;
        let process = match OwnedHandle::open_process(PROCESS_QUERY_LIMITED_INFORMATION, pid) {
            Ok(process) => process,
            Err(e) if e.raw_os_error() == Some(ERROR_ACCESS_DENIED as i32) => return Ok(true),
            Err(e) if e.raw_os_error() == Some(ERROR_INVALID_PARAMETER as i32) => {
                return Ok(false);
            }
            Err(e) => return Err(os_error("OpenProcess", pid, e)),
        };
        let mut code: u32 = 0;
        // SAFETY: `process` is valid and `code` outlives the call.
        if unsafe { GetExitCodeProcess(process.0, &raw mut code) } == 0 {
            return Err(os_error("GetExitCodeProcess", pid, std::io::Error::last_os_error()));
        }
        #[allow(clippy::cast_sign_loss)]
        let still_active = STILL_ACTIVE as u32;
        Ok(code == still_active)
    }

    fn is_group_alive(&self, pgid: i32) -> Result<bool, GroupError> {
        let pgid = check_pgid(pgid)?;
        match self.job_active_processes(pgid) {
            Some(count) => Ok(count? > 0),
            None => self.is_process_alive(pgid),
        }
    }

    fn track_spawned(&self, pid: i32) -> Result<(), GroupError> {
        let pid = check_pid(pid)?;
        match Self::create_job_for(pid) {
            Ok(job) => {
                if let Ok(mut jobs) = self.jobs.lock() {
                    jobs.insert(pid, job);
                }
            }
            // Without a job the pid-only fallback still works.
            Err(e) => warn!(pid, error = %e, "Job object unavailable, tracking single process"),
        }
        Ok(())
    }

    fn release(&self, pid: i32) {
        if let Ok(mut jobs) = self.jobs.lock() {
            jobs.remove(&pid);
        }
    }
}

fn os_error(op: &'static str, id: i32, source: std::io::Error) -> GroupError {
    GroupError::Os { op, id, source }
}
