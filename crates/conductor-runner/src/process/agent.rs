//! A [`RootRunner`] that runs an agent CLI as a child process per attempt.

use std::fmt;
use std::time::Duration;

use anyhow::{Context, bail};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::manager::{ProcessHandle, ProcessManager, SpawnSpec};
use crate::supervisor::{RootRunner, RunFuture};

/// How long a canceled agent gets between SIGTERM and SIGKILL.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

type SpecFactory = Box<dyn Fn(u32) -> SpawnSpec + Send + Sync>;

/// Spawns a fresh agent process for every attempt and waits for it.
///
/// A non-zero exit fails the attempt. Cancellation stops the agent's whole
/// process group, escalating to a forced kill after the grace period.
pub struct AgentRunner {
    manager: ProcessManager,
    make_spec: SpecFactory,
    grace: Duration,
}

impl fmt::Debug for AgentRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentRunner")
            .field("manager", &self.manager)
            .field("grace", &self.grace)
            .finish_non_exhaustive()
    }
}

impl AgentRunner {
    /// `make_spec` builds the command for a given zero-based attempt.
    pub fn new(
        manager: ProcessManager,
        make_spec: impl Fn(u32) -> SpawnSpec + Send + Sync + 'static,
    ) -> Self {
        Self {
            manager,
            make_spec: Box::new(make_spec),
            grace: DEFAULT_GRACE_PERIOD,
        }
    }

    #[must_use]
    pub const fn grace_period(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    async fn run_attempt(&self, cancel: CancellationToken, attempt: u32) -> anyhow::Result<()> {
        let spec = (self.make_spec)(attempt);
        let mut handle = self
            .manager
            .spawn(spec)
            .with_context(|| format!("spawn root agent for attempt {attempt}"))?;

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            status = handle.wait() => Some(status),
        };
        let Some(status) = outcome else {
            self.stop(&mut handle).await;
            bail!("root agent canceled");
        };

        let status = status.context("wait for root agent")?;
        if !status.success() {
            bail!("root agent exited with {status}");
        }
        info!(attempt, pid = handle.pid(), "Root agent exited cleanly");
        Ok(())
    }

    async fn stop(&self, handle: &mut ProcessHandle) {
        let pid = handle.pid();
        if let Err(e) = handle.terminate() {
            warn!(pid, error = %e, "Failed to terminate agent process group");
        }
        if tokio::time::timeout(self.grace, handle.wait()).await.is_ok() {
            return;
        }
        warn!(pid, "Grace period expired, killing agent process group");
        if let Err(e) = handle.kill() {
            warn!(pid, error = %e, "Failed to kill agent process group");
        }
        if let Err(e) = handle.wait().await {
            warn!(pid, error = %e, "Failed to reap agent process");
        }
    }
}

impl RootRunner for AgentRunner {
    fn run(&self, cancel: CancellationToken, attempt: u32) -> RunFuture<'_> {
        Box::pin(self.run_attempt(cancel, attempt))
    }
}

#[cfg(all(test, unix))]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn runner(dir: &std::path::Path, script: &'static str) -> AgentRunner {
        let manager = ProcessManager::new(dir).unwrap();
        AgentRunner::new(manager, move |attempt| {
            SpawnSpec::new("/bin/sh").args(["-c", script, "agent", attempt.to_string().as_str()])
        })
        .grace_period(Duration::from_millis(500))
    }

    #[tokio::test]
    async fn clean_exit_succeeds() {
        let dir = tempfile::TempDir::new().unwrap();
        let runner = runner(dir.path(), "printf 'attempt %s' \"$1\"");
        runner.run(CancellationToken::new(), 4).await.unwrap();
        let out = std::fs::read_to_string(dir.path().join("agent-stdout.txt")).unwrap();
        assert_eq!(out, "attempt 4");
    }

    #[tokio::test]
    async fn nonzero_exit_fails_attempt() {
        let dir = tempfile::TempDir::new().unwrap();
        let runner = runner(dir.path(), "exit 2");
        let err = runner.run(CancellationToken::new(), 0).await.unwrap_err();
        assert!(err.to_string().contains("exit status: 2"), "{err}");
    }

    #[tokio::test]
    async fn cancellation_stops_process_group() {
        let dir = tempfile::TempDir::new().unwrap();
        let runner = runner(dir.path(), "sleep 30 & wait");
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            canceller.cancel();
        });

        let err = tokio::time::timeout(Duration::from_secs(10), runner.run(cancel, 0))
            .await
            .expect("canceled agent should stop promptly")
            .unwrap_err();
        assert!(err.to_string().contains("canceled"));
    }
}
