//! Persisted run metadata (`runs/<id>/run-info.yaml`).
//!
//! Records are owned by the storage layer. The supervisor reads them to find
//! child runs and patches `status`, `end_time` and `exit_code` only when a
//! child's process group vanished without a recorded exit. Fields this crate
//! does not model are kept verbatim on rewrite.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Directory under a task run directory holding one sub-directory per run.
pub const RUNS_DIR: &str = "runs";

/// File name of a run record inside `runs/<id>/`.
pub const RUN_INFO_FILE: &str = "run-info.yaml";

/// Exit code recorded for runs whose exit was never observed.
pub const ORPHAN_EXIT_CODE: i32 = -1;

/// Lifecycle status of a run.
///
/// Statuses written by other tooling (`queued`, `blocked`, ...) are kept as
/// their raw string so a rewrite never changes them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Other(String),
}

impl RunStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Other(raw) => raw,
        }
    }
}

impl Default for RunStatus {
    fn default() -> Self {
        Self::Other(String::new())
    }
}

impl From<String> for RunStatus {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "running" => Self::Running,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::Other(raw),
        }
    }
}

impl From<RunStatus> for String {
    fn from(status: RunStatus) -> Self {
        match status {
            RunStatus::Other(raw) => raw,
            known => known.as_str().to_string(),
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted run metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub run_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub parent_run_id: String,
    #[serde(default)]
    pub pid: i32,
    #[serde(default)]
    pub pgid: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    /// Unset (or the zero timestamp written by older tooling) while running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exit_code: i32,
    #[serde(default)]
    pub status: RunStatus,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

impl RunRecord {
    /// Whether an end time has been recorded.
    pub fn is_finished(&self) -> bool {
        self.end_time.is_some_and(|t| t.timestamp() > 0)
    }

    /// Whether this run was started by another run of the same task.
    pub fn is_child(&self) -> bool {
        !self.parent_run_id.trim().is_empty()
    }

    /// Record an unobserved exit. Returns `false` if the run had already finished.
    pub fn mark_orphaned(&mut self, now: DateTime<Utc>) -> bool {
        if self.is_finished() {
            return false;
        }
        self.end_time = Some(now);
        if self.exit_code == 0 {
            self.exit_code = ORPHAN_EXIT_CODE;
        }
        self.status = RunStatus::Failed;
        true
    }
}

/// Path of the run record for `run_id` under a task run directory.
pub fn run_info_path(task_dir: &Path, run_id: &str) -> PathBuf {
    task_dir.join(RUNS_DIR).join(run_id).join(RUN_INFO_FILE)
}

/// Read/patch access to persisted run records.
pub trait RunRecordStore: Send + Sync {
    fn read(&self, path: &Path) -> Result<RunRecord>;

    fn write(&self, path: &Path, record: &RunRecord) -> Result<()>;

    /// Read, apply `patch`, and write back if anything changed.
    /// Returns whether the record was rewritten.
    fn update(&self, path: &Path, patch: &mut dyn FnMut(&mut RunRecord)) -> Result<bool> {
        let current = self.read(path)?;
        let mut next = current.clone();
        patch(&mut next);
        if next == current {
            return Ok(false);
        }
        self.write(path, &next)?;
        Ok(true)
    }
}

/// YAML file store with atomic (write-then-rename) updates.
#[derive(Debug, Clone, Copy, Default)]
pub struct YamlRunStore;

impl RunRecordStore for YamlRunStore {
    fn read(&self, path: &Path) -> Result<RunRecord> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::RunRecord {
            path: path.to_path_buf(),
            reason: format!("read failed: {e}"),
        })?;
        serde_yaml::from_str(&content).map_err(|e| Error::RunRecord {
            path: path.to_path_buf(),
            reason: format!("parse failed: {e}"),
        })
    }

    fn write(&self, path: &Path, record: &RunRecord) -> Result<()> {
        let data = serde_yaml::to_string(record)?;
        let dir = path.parent().ok_or_else(|| Error::RunRecord {
            path: path.to_path_buf(),
            reason: "path has no parent directory".to_string(),
        })?;
        std::fs::create_dir_all(dir)?;

        let tmp = dir.join(format!(".{RUN_INFO_FILE}.{}.tmp", uuid::Uuid::new_v4()));
        if let Err(e) = std::fs::write(&tmp, data).and_then(|()| std::fs::rename(&tmp, path)) {
            let _ = std::fs::remove_file(&tmp);
            return Err(Error::RunRecord {
                path: path.to_path_buf(),
                reason: format!("write failed: {e}"),
            });
        }
        Ok(())
    }
}
