//! The restart loop.
//!
//! Each iteration checks for the `DONE` marker, and while it is absent runs
//! the root agent again until the retry budget is spent. Once the marker
//! appears, any child runs still alive are drained before the task counts as
//! complete. Every transition is mirrored to the task's message sink.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use conductor_core::{MessageScope, MessageSink, Severity};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::policy::{Backoff, RetryPolicy};
use crate::admission::{AdmissionControl, AdmissionError};
use super::runner::RootRunner;
use crate::children::{
    ActiveChildren, ChildMonitor, ChildWaitError, DEFAULT_POLL_INTERVAL, HumanDuration, RunIds,
};

/// Completion marker file name inside the run directory.
pub const DONE_FILE: &str = "DONE";

/// How long to wait for child runs once `DONE` appears.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Supervisor canceled")]
    Canceled,

    #[error("Max restarts exceeded ({max})")]
    MaxRestartsExceeded { max: u32 },

    #[error("DONE marker is a directory: {}", .0.display())]
    MarkerIsDirectory(PathBuf),

    #[error("Failed to stat DONE marker {}: {source}", path.display())]
    MarkerStat {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to append message: {0}")]
    Message(#[from] conductor_core::Error),

    #[error(transparent)]
    ChildWait(ChildWaitError),

    #[error(transparent)]
    Admission(AdmissionError),
}

/// Builder for [`RestartSupervisor`]. All validation happens in [`build`](Self::build).
pub struct SupervisorBuilder {
    run_dir: PathBuf,
    sink: Option<Arc<dyn MessageSink>>,
    runner: Option<Arc<dyn RootRunner>>,
    policy: RetryPolicy,
    wait_timeout: Duration,
    poll_interval: Duration,
    project_id: String,
    task_id: String,
    monitor: Option<ChildMonitor>,
}

impl fmt::Debug for SupervisorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SupervisorBuilder")
            .field("run_dir", &self.run_dir)
            .field("policy", &self.policy)
            .field("wait_timeout", &self.wait_timeout)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl SupervisorBuilder {
    #[must_use]
    pub fn message_sink(mut self, sink: Arc<dyn MessageSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    #[must_use]
    pub fn root_runner(mut self, runner: impl RootRunner + 'static) -> Self {
        self.runner = Some(Arc::new(runner));
        self
    }

    #[must_use]
    pub const fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub const fn max_restarts(mut self, max: u32) -> Self {
        self.policy.max_restarts = max;
        self
    }

    /// Fixed pause between attempts. Replaces any backoff set earlier.
    #[must_use]
    pub const fn restart_delay(mut self, delay: Duration) -> Self {
        self.policy.backoff = Backoff::Fixed(delay);
        self
    }

    #[must_use]
    pub const fn wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Scope for emitted messages. Blank values are inferred from the run dir.
    #[must_use]
    pub fn project_task(mut self, project_id: &str, task_id: &str) -> Self {
        project_id.trim().clone_into(&mut self.project_id);
        task_id.trim().clone_into(&mut self.task_id);
        self
    }

    #[must_use]
    pub fn child_monitor(mut self, monitor: ChildMonitor) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn build(self) -> Result<RestartSupervisor, SupervisorError> {
        let invalid = |msg: &str| SupervisorError::Validation(msg.to_string());

        if self.run_dir.to_string_lossy().trim().is_empty() {
            return Err(invalid("run directory is empty"));
        }
        let meta = std::fs::metadata(&self.run_dir).map_err(|e| {
            SupervisorError::Validation(format!(
                "stat run directory {}: {e}",
                self.run_dir.display()
            ))
        })?;
        if !meta.is_dir() {
            return Err(invalid("run directory is not a directory"));
        }
        let sink = self.sink.ok_or_else(|| invalid("message sink is missing"))?;
        let runner = self.runner.ok_or_else(|| invalid("root runner is missing"))?;
        if self.wait_timeout.is_zero() {
            return Err(invalid("wait timeout must be positive"));
        }
        if self.poll_interval.is_zero() {
            return Err(invalid("poll interval must be positive"));
        }

        let (inferred_project, inferred_task) = infer_project_task(&self.run_dir);
        let project_id = if self.project_id.is_empty() {
            inferred_project
        } else {
            self.project_id
        };
        let task_id = if self.task_id.is_empty() {
            inferred_task
        } else {
            self.task_id
        };
        if project_id.is_empty() {
            return Err(invalid("project id is empty"));
        }

        Ok(RestartSupervisor {
            run_dir: self.run_dir,
            sink,
            runner,
            policy: self.policy,
            wait_timeout: self.wait_timeout,
            poll_interval: self.poll_interval,
            scope: MessageScope::new(project_id, task_id),
            monitor: self.monitor.unwrap_or_default(),
        })
    }
}

/// Project and task ids from the last two segments of `run_dir`.
fn infer_project_task(run_dir: &Path) -> (String, String) {
    let name = |p: Option<&Path>| {
        p.and_then(Path::file_name)
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    };
    let task = name(Some(run_dir));
    if task.is_empty() {
        return (String::new(), String::new());
    }
    (name(run_dir.parent()), task)
}

/// Restarts a task's root agent until it writes `DONE`, then drains child runs.
pub struct RestartSupervisor {
    run_dir: PathBuf,
    sink: Arc<dyn MessageSink>,
    runner: Arc<dyn RootRunner>,
    policy: RetryPolicy,
    wait_timeout: Duration,
    poll_interval: Duration,
    scope: MessageScope,
    monitor: ChildMonitor,
}

impl fmt::Debug for RestartSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestartSupervisor")
            .field("run_dir", &self.run_dir)
            .field("scope", &self.scope)
            .field("policy", &self.policy)
            .field("wait_timeout", &self.wait_timeout)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl RestartSupervisor {
    /// Start building a supervisor for `run_dir` with default limits.
    pub fn builder(run_dir: impl Into<PathBuf>) -> SupervisorBuilder {
        SupervisorBuilder {
            run_dir: run_dir.into(),
            sink: None,
            runner: None,
            policy: RetryPolicy::default(),
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            project_id: String::new(),
            task_id: String::new(),
            monitor: None,
        }
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn project_id(&self) -> &str {
        &self.scope.project_id
    }

    pub fn task_id(&self) -> &str {
        &self.scope.task_id
    }

    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Wait for a slot from `admission`, then [`run`](Self::run) while holding it.
    ///
    /// The slot is returned when the run ends, whatever the outcome.
    pub async fn run_admitted(
        &self,
        admission: &AdmissionControl,
        cancel: &CancellationToken,
    ) -> Result<(), SupervisorError> {
        let slot = admission.acquire(cancel).await.map_err(|e| match e {
            AdmissionError::Canceled => SupervisorError::Canceled,
            closed @ AdmissionError::Closed => SupervisorError::Admission(closed),
        })?;
        debug!(task_id = %self.scope.task_id, "Admitted");
        let result = self.run(cancel).await;
        slot.release();
        result
    }

    /// Drive the task to completion.
    ///
    /// Succeeds only after `DONE` appears. Cancellation is checked before
    /// every attempt and interrupts the restart delay and child waiting.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<(), SupervisorError> {
        let mut attempts: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(SupervisorError::Canceled);
            }
            if self.done_exists().await? {
                return self.handle_done(cancel).await;
            }
            if !self.policy.allows(attempts) {
                let max = self.policy.max_restarts;
                self.emit(
                    Severity::Error,
                    &format!("task failed: max restarts ({max}) exceeded"),
                )?;
                warn!(run_dir = %self.run_dir.display(), max, "Restart budget exhausted");
                return Err(SupervisorError::MaxRestartsExceeded { max });
            }

            self.emit(
                Severity::Info,
                &format!("starting root agent (restart #{attempts})"),
            )?;
            info!(task_id = %self.scope.task_id, attempt = attempts, "Starting root agent");
            if let Err(e) = self.runner.run(cancel.clone(), attempts).await {
                warn!(attempt = attempts, error = %format!("{e:#}"), "Root agent attempt failed");
                self.emit(
                    Severity::Warning,
                    &format!("root agent failed on restart #{attempts}: {e:#}"),
                )?;
            }
            let finished = attempts;
            attempts = attempts.saturating_add(1);

            if self.done_exists().await? {
                return self.handle_done(cancel).await;
            }

            let delay = self.policy.delay_after(finished);
            debug!(?delay, "Waiting before next attempt");
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(SupervisorError::Canceled),
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn handle_done(&self, cancel: &CancellationToken) -> Result<(), SupervisorError> {
        let ActiveChildren { children, error } = self
            .monitor
            .find_active(&self.run_dir)
            .unwrap_or_else(|e| ActiveChildren {
                children: Vec::new(),
                error: Some(e),
            });
        if let Some(e) = error {
            warn!(run_dir = %self.run_dir.display(), error = %e, "Child discovery incomplete");
            self.emit(
                Severity::Warning,
                &format!("failed to enumerate children: {e}"),
            )?;
        }

        if children.is_empty() {
            info!(task_id = %self.scope.task_id, "Task completed");
            return self.emit(
                Severity::Info,
                "task completed (DONE marker present, no active children)",
            );
        }

        self.emit(
            Severity::Info,
            &format!(
                "waiting for {} children to complete: {}",
                children.len(),
                RunIds(&children)
            ),
        )?;

        match self
            .monitor
            .wait_for(cancel, children, self.wait_timeout, self.poll_interval)
            .await
        {
            Ok(()) => {
                info!(task_id = %self.scope.task_id, "Task completed after children finished");
                self.emit(Severity::Info, "task completed (all children finished)")
            }
            Err(ChildWaitError::Timeout { remaining, timeout }) => {
                warn!(remaining = remaining.len(), ?timeout, "Gave up waiting for children");
                self.emit(
                    Severity::Warning,
                    &format!(
                        "timeout waiting for children after {}: {}",
                        HumanDuration(timeout),
                        RunIds(&remaining)
                    ),
                )
            }
            Err(ChildWaitError::Canceled { .. }) => Err(SupervisorError::Canceled),
            Err(e) => Err(SupervisorError::ChildWait(e)),
        }
    }

    async fn done_exists(&self) -> Result<bool, SupervisorError> {
        let path = self.run_dir.join(DONE_FILE);
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => Err(SupervisorError::MarkerIsDirectory(path)),
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(SupervisorError::MarkerStat { path, source }),
        }
    }

    fn emit(&self, severity: Severity, body: &str) -> Result<(), SupervisorError> {
        self.sink.append(&self.scope, severity, body)?;
        Ok(())
    }
}
