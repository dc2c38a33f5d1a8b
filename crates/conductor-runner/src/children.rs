//! Discovery of, and waiting on, child runs started by a supervised task.
//!
//! A child run is any record under `<run_dir>/runs/*/run-info.yaml` that has
//! a parent run id and no end time. Its process group is probed for
//! liveness; children whose group vanished without a recorded exit are
//! marked failed in place so later scans skip them.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use conductor_core::run_info::{RUN_INFO_FILE, RUNS_DIR};
use conductor_core::{RunRecordStore, YamlRunStore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::process::{GroupError, ProcessGroups, platform_groups};

/// Poll interval used when the caller passes a zero interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// A live child run. Recomputed on every scan; never owns the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildProcess {
    pub run_id: String,
    pub pid: i32,
    pub pgid: i32,
    pub record_path: PathBuf,
}

/// Formats run ids as `[a b c]`.
pub struct RunIds<'a>(pub &'a [ChildProcess]);

impl fmt::Display for RunIds<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        let mut first = true;
        for child in self.0.iter().filter(|c| !c.run_id.trim().is_empty()) {
            if !first {
                f.write_str(" ")?;
            }
            f.write_str(&child.run_id)?;
            first = false;
        }
        f.write_str("]")
    }
}

/// Formats a duration as hours, minutes and seconds: `5m0s`, `1h0m0s`,
/// `2.5s`, `150ms`.
pub struct HumanDuration(pub Duration);

impl fmt::Display for HumanDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let d = self.0;
        if d.is_zero() {
            return f.write_str("0s");
        }
        let nanos = d.subsec_nanos();
        if d.as_secs() == 0 {
            return match nanos {
                n if n < 1_000 => write!(f, "{n}ns"),
                n if n < 1_000_000 => write_unit(f, n / 1_000, n % 1_000, 3, "\u{b5}s"),
                n => write_unit(f, n / 1_000_000, n % 1_000_000, 6, "ms"),
            };
        }
        let secs = d.as_secs();
        let (hours, minutes) = (secs / 3600, secs % 3600 / 60);
        if hours > 0 {
            write!(f, "{hours}h{minutes}m")?;
        } else if minutes > 0 {
            write!(f, "{minutes}m")?;
        }
        write_unit(f, secs % 60, u64::from(nanos), 9, "s")
    }
}

fn write_unit(
    f: &mut fmt::Formatter<'_>,
    whole: impl fmt::Display,
    frac: impl Into<u64>,
    digits: usize,
    unit: &str,
) -> fmt::Result {
    let frac = frac.into();
    if frac == 0 {
        return write!(f, "{whole}{unit}");
    }
    let frac = format!("{frac:0digits$}");
    write!(f, "{whole}.{}{unit}", frac.trim_end_matches('0'))
}

#[derive(Debug, thiserror::Error)]
pub enum ChildError {
    #[error("Run directory is empty")]
    EmptyRunDir,

    #[error("Failed to read runs directory {}: {source}", path.display())]
    ReadRunsDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read run-info for run {run}: {source}")]
    Record {
        run: String,
        #[source]
        source: conductor_core::Error,
    },

    #[error("Failed to check process group for run {run_id}: {source}")]
    Probe {
        run_id: String,
        #[source]
        source: GroupError,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ChildWaitError {
    #[error("Child wait timeout must be positive")]
    InvalidTimeout,

    #[error("Timed out waiting for children after {}", HumanDuration(*timeout))]
    Timeout {
        remaining: Vec<ChildProcess>,
        timeout: Duration,
    },

    #[error("Child wait canceled")]
    Canceled { remaining: Vec<ChildProcess> },
}

impl ChildWaitError {
    /// Children still alive when waiting stopped.
    pub fn remaining(&self) -> &[ChildProcess] {
        match self {
            Self::InvalidTimeout => &[],
            Self::Timeout { remaining, .. } | Self::Canceled { remaining } => remaining,
        }
    }
}

/// Result of a discovery scan.
///
/// `error` holds the first per-record failure; the scan still returns every
/// child it could establish as alive.
#[derive(Debug, Default)]
pub struct ActiveChildren {
    pub children: Vec<ChildProcess>,
    pub error: Option<ChildError>,
}

/// Finds and waits on child runs using pluggable liveness and storage.
#[derive(Clone)]
pub struct ChildMonitor {
    groups: Arc<dyn ProcessGroups>,
    store: Arc<dyn RunRecordStore>,
}

impl fmt::Debug for ChildMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChildMonitor").finish_non_exhaustive()
    }
}

impl Default for ChildMonitor {
    fn default() -> Self {
        Self::new(platform_groups(), Arc::new(YamlRunStore))
    }
}

impl ChildMonitor {
    pub fn new(groups: Arc<dyn ProcessGroups>, store: Arc<dyn RunRecordStore>) -> Self {
        Self { groups, store }
    }

    /// Scan `<run_dir>/runs/*` for unfinished child runs whose group is alive.
    pub fn find_active(&self, run_dir: &Path) -> Result<ActiveChildren, ChildError> {
        if run_dir.as_os_str().is_empty() || run_dir.to_string_lossy().trim().is_empty() {
            return Err(ChildError::EmptyRunDir);
        }
        let runs_dir = run_dir.join(RUNS_DIR);
        let entries = match std::fs::read_dir(&runs_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ActiveChildren::default());
            }
            Err(source) => {
                return Err(ChildError::ReadRunsDir {
                    path: runs_dir,
                    source,
                });
            }
        };

        let mut dirs: Vec<_> = entries
            .filter_map(std::result::Result::ok)
            .filter(|entry| entry.file_type().is_ok_and(|t| t.is_dir()))
            .collect();
        dirs.sort_by_key(std::fs::DirEntry::file_name);

        let mut found = ActiveChildren::default();
        for entry in dirs {
            let path = entry.path().join(RUN_INFO_FILE);
            let record = match self.store.read(&path) {
                Ok(record) => record,
                Err(source) => {
                    if found.error.is_none() {
                        found.error = Some(ChildError::Record {
                            run: entry.file_name().to_string_lossy().into_owned(),
                            source,
                        });
                    }
                    continue;
                }
            };
            if record.is_finished() || !record.is_child() {
                continue;
            }
            match self.groups.is_group_alive(record.pgid) {
                Ok(true) => found.children.push(ChildProcess {
                    run_id: record.run_id,
                    pid: record.pid,
                    pgid: record.pgid,
                    record_path: path,
                }),
                Ok(false) => self.mark_orphaned(&path),
                Err(source) => {
                    if found.error.is_none() {
                        found.error = Some(ChildError::Probe {
                            run_id: record.run_id,
                            source,
                        });
                    }
                }
            }
        }

        debug!(
            run_dir = %run_dir.display(),
            active = found.children.len(),
            "Scanned child runs"
        );
        Ok(found)
    }

    /// Poll until every child has exited, the timeout passes, or `cancel` fires.
    ///
    /// A zero `poll_interval` falls back to [`DEFAULT_POLL_INTERVAL`]. A zero
    /// `timeout` is rejected.
    pub async fn wait_for(
        &self,
        cancel: &CancellationToken,
        children: Vec<ChildProcess>,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<(), ChildWaitError> {
        if timeout.is_zero() {
            return Err(ChildWaitError::InvalidTimeout);
        }
        let poll_interval = if poll_interval.is_zero() {
            DEFAULT_POLL_INTERVAL
        } else {
            poll_interval
        };

        let deadline = tokio::time::Instant::now() + timeout;
        let mut remaining = children;
        loop {
            remaining = self.retain_alive(remaining);
            if remaining.is_empty() {
                return Ok(());
            }
            if tokio::time::Instant::now() > deadline {
                return Err(ChildWaitError::Timeout { remaining, timeout });
            }
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    return Err(ChildWaitError::Canceled { remaining });
                }
                () = tokio::time::sleep(poll_interval) => {}
            }
        }
    }

    /// Drop children whose group is gone, marking their records failed.
    /// A probe error keeps the child for the next tick.
    fn retain_alive(&self, children: Vec<ChildProcess>) -> Vec<ChildProcess> {
        children
            .into_iter()
            .filter(|child| match self.groups.is_group_alive(child.pgid) {
                Ok(alive) => {
                    if !alive {
                        info!(run_id = %child.run_id, pgid = child.pgid, "Child run exited");
                        self.mark_orphaned(&child.record_path);
                    }
                    alive
                }
                Err(e) => {
                    debug!(run_id = %child.run_id, error = %e, "Child probe failed, keeping");
                    true
                }
            })
            .collect()
    }

    fn mark_orphaned(&self, path: &Path) {
        if path.as_os_str().is_empty() {
            return;
        }
        let now = Utc::now();
        match self.store.update(path, &mut |record| {
            record.mark_orphaned(now);
        }) {
            Ok(true) => info!(path = %path.display(), "Marked orphaned child run as failed"),
            Ok(false) => {}
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to mark orphaned child run");
            }
        }
    }
}

/// [`ChildMonitor::find_active`] with the platform backend and YAML records.
pub fn find_active_children(run_dir: &Path) -> Result<ActiveChildren, ChildError> {
    ChildMonitor::default().find_active(run_dir)
}

/// [`ChildMonitor::wait_for`] with the platform backend and YAML records.
pub async fn wait_for_children(
    cancel: &CancellationToken,
    children: Vec<ChildProcess>,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<(), ChildWaitError> {
    ChildMonitor::default()
        .wait_for(cancel, children, timeout, poll_interval)
        .await
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use chrono::TimeZone;
    use conductor_core::run_info::run_info_path;
    use conductor_core::{RunRecord, RunStatus};

    use crate::process::GroupSignal;

    /// Liveness backend where each pgid survives a fixed number of probes.
    /// `u32::MAX` probes means alive forever.
    #[derive(Default)]
    pub(crate) struct FakeGroups {
        probes_left: Mutex<HashMap<i32, u32>>,
        broken: Mutex<Vec<i32>>,
    }

    impl FakeGroups {
        pub(crate) fn alive_for(&self, pgid: i32, probes: u32) {
            self.probes_left.lock().unwrap().insert(pgid, probes);
        }

        pub(crate) fn alive_forever(&self, pgid: i32) {
            self.alive_for(pgid, u32::MAX);
        }

        pub(crate) fn break_probe(&self, pgid: i32) {
            self.broken.lock().unwrap().push(pgid);
        }
    }

    impl ProcessGroups for FakeGroups {
        fn group_id(&self, pid: i32) -> Result<i32, GroupError> {
            Ok(pid)
        }

        fn signal_group(&self, pgid: i32, _signal: GroupSignal) -> Result<(), GroupError> {
            self.probes_left
                .lock()
                .unwrap()
                .remove(&pgid)
                .map(|_| ())
                .ok_or(GroupError::GroupNotFound(pgid))
        }

        fn is_process_alive(&self, pid: i32) -> Result<bool, GroupError> {
            self.is_group_alive(pid)
        }

        fn is_group_alive(&self, pgid: i32) -> Result<bool, GroupError> {
            if self.broken.lock().unwrap().contains(&pgid) {
                return Err(GroupError::Os {
                    op: "probe",
                    id: pgid,
                    source: std::io::Error::other("probe broke"),
                });
            }
            let mut probes = self.probes_left.lock().unwrap();
            match probes.get_mut(&pgid) {
                Some(0) | None => Ok(false),
                Some(left) => {
                    if *left != u32::MAX {
                        *left -= 1;
                    }
                    Ok(true)
                }
            }
        }
    }

    pub(crate) fn write_record(run_dir: &Path, run_id: &str, parent: &str, pgid: i32) -> PathBuf {
        let path = run_info_path(run_dir, run_id);
        let record = RunRecord {
            version: 1,
            run_id: run_id.to_string(),
            parent_run_id: parent.to_string(),
            pid: pgid,
            pgid,
            status: RunStatus::Running,
            ..RunRecord::default()
        };
        YamlRunStore.write(&path, &record).unwrap();
        path
    }

    pub(crate) fn monitor(groups: Arc<FakeGroups>) -> ChildMonitor {
        ChildMonitor::new(groups, Arc::new(YamlRunStore))
    }

    fn child(run_id: &str, pgid: i32, record_path: PathBuf) -> ChildProcess {
        ChildProcess {
            run_id: run_id.to_string(),
            pid: pgid,
            pgid,
            record_path,
        }
    }

    #[test]
    fn missing_runs_dir_is_empty() {
        let dir = tempfile::TempDir::new().unwrap();
        let found = find_active_children(dir.path()).unwrap();
        assert!(found.children.is_empty());
        assert!(found.error.is_none());
    }

    #[test]
    fn empty_run_dir_is_rejected() {
        assert!(matches!(
            find_active_children(Path::new(" ")),
            Err(ChildError::EmptyRunDir)
        ));
    }

    #[test]
    fn finished_and_root_runs_are_skipped() {
        let dir = tempfile::TempDir::new().unwrap();
        let groups = Arc::new(FakeGroups::default());

        let finished = write_record(dir.path(), "run-finished", "run-root", 101);
        YamlRunStore
            .update(&finished, &mut |r| {
                r.end_time = Some(Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap());
                r.status = RunStatus::Completed;
            })
            .unwrap();
        write_record(dir.path(), "run-root", "", 102);
        write_record(dir.path(), "run-live", "run-root", 103);
        for pgid in [101, 102, 103] {
            groups.alive_forever(pgid);
        }

        let found = monitor(groups).find_active(dir.path()).unwrap();
        assert!(found.error.is_none());
        let ids: Vec<_> = found.children.iter().map(|c| c.run_id.as_str()).collect();
        assert_eq!(ids, ["run-live"]);
        assert_eq!(found.children[0].pgid, 103);
    }

    #[test]
    fn dead_child_is_marked_failed() {
        let dir = tempfile::TempDir::new().unwrap();
        let groups = Arc::new(FakeGroups::default());
        let path = write_record(dir.path(), "run-dead", "run-root", 201);

        let found = monitor(groups).find_active(dir.path()).unwrap();
        assert!(found.children.is_empty());

        let record = YamlRunStore.read(&path).unwrap();
        assert_eq!(record.status, RunStatus::Failed);
        assert!(record.is_finished());
        assert_eq!(record.exit_code, -1);
    }

    #[test]
    fn per_record_errors_keep_partial_results() {
        let dir = tempfile::TempDir::new().unwrap();
        let groups = Arc::new(FakeGroups::default());

        let bad = dir.path().join(RUNS_DIR).join("run-bad");
        std::fs::create_dir_all(&bad).unwrap();
        std::fs::write(bad.join(RUN_INFO_FILE), "pid: [not a number").unwrap();
        write_record(dir.path(), "run-broken", "run-root", 301);
        write_record(dir.path(), "run-ok", "run-root", 302);
        groups.break_probe(301);
        groups.alive_forever(302);

        let found = monitor(groups).find_active(dir.path()).unwrap();
        assert_eq!(found.children.len(), 1);
        assert_eq!(found.children[0].run_id, "run-ok");
        // Entries are visited in name order, so the parse failure comes first.
        assert!(matches!(
            found.error,
            Some(ChildError::Record { ref run, .. }) if run == "run-bad"
        ));
    }

    #[cfg(unix)]
    #[test]
    fn unreadable_runs_dir_is_hard_error() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join(RUNS_DIR), b"not a directory").unwrap();
        assert!(matches!(
            find_active_children(dir.path()),
            Err(ChildError::ReadRunsDir { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_timeout_is_invalid() {
        let groups = Arc::new(FakeGroups::default());
        let err = monitor(groups)
            .wait_for(
                &CancellationToken::new(),
                Vec::new(),
                Duration::ZERO,
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ChildWaitError::InvalidTimeout));
    }

    #[tokio::test(start_paused = true)]
    async fn child_outliving_timeout_remains() {
        let dir = tempfile::TempDir::new().unwrap();
        let groups = Arc::new(FakeGroups::default());
        let path = write_record(dir.path(), "run-slow", "run-root", 401);
        groups.alive_forever(401);

        let err = monitor(groups)
            .wait_for(
                &CancellationToken::new(),
                vec![child("run-slow", 401, path.clone())],
                Duration::from_secs(3),
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ChildWaitError::Timeout { .. }));
        assert_eq!(err.remaining().len(), 1);
        assert_eq!(err.remaining()[0].run_id, "run-slow");
        assert!(!YamlRunStore.read(&path).unwrap().is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn child_exiting_in_time_drains() {
        let dir = tempfile::TempDir::new().unwrap();
        let groups = Arc::new(FakeGroups::default());
        let path = write_record(dir.path(), "run-quick", "run-root", 501);
        groups.alive_for(501, 2);

        monitor(groups)
            .wait_for(
                &CancellationToken::new(),
                vec![child("run-quick", 501, path.clone())],
                Duration::from_secs(10),
                Duration::from_secs(1),
            )
            .await
            .unwrap();

        let record = YamlRunStore.read(&path).unwrap();
        assert_eq!(record.status, RunStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_errors_keep_child() {
        let groups = Arc::new(FakeGroups::default());
        groups.break_probe(601);

        let err = monitor(groups)
            .wait_for(
                &CancellationToken::new(),
                vec![child("run-flaky", 601, PathBuf::new())],
                Duration::from_secs(2),
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();
        assert_eq!(err.remaining().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_waiting() {
        let groups = Arc::new(FakeGroups::default());
        groups.alive_forever(701);
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            canceller.cancel();
        });

        let err = monitor(groups)
            .wait_for(
                &cancel,
                vec![child("run-stuck", 701, PathBuf::new())],
                Duration::from_secs(60),
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ChildWaitError::Canceled { ref remaining } if remaining.len() == 1));
    }

    #[test]
    fn run_ids_format() {
        let children = vec![
            child("a", 1, PathBuf::new()),
            child(" ", 2, PathBuf::new()),
            child("b", 3, PathBuf::new()),
        ];
        assert_eq!(RunIds(&children).to_string(), "[a b]");
        assert_eq!(RunIds(&[]).to_string(), "[]");
    }

    #[test]
    fn human_duration_format() {
        let render = |d: Duration| HumanDuration(d).to_string();
        assert_eq!(render(Duration::from_secs(300)), "5m0s");
        assert_eq!(render(Duration::from_secs(3600)), "1h0m0s");
        assert_eq!(render(Duration::from_secs(3725)), "1h2m5s");
        assert_eq!(render(Duration::from_secs(2)), "2s");
        assert_eq!(render(Duration::from_millis(2500)), "2.5s");
        assert_eq!(render(Duration::from_millis(150)), "150ms");
        assert_eq!(render(Duration::from_micros(1500)), "1.5ms");
        assert_eq!(render(Duration::from_nanos(42)), "42ns");
        assert_eq!(render(Duration::ZERO), "0s");
    }
}
