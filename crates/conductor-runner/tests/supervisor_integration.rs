#![cfg(unix)]
#![allow(clippy::unwrap_used, clippy::expect_used)] // Integration tests use unwrap for brevity

//! End-to-end supervision with real processes.
//!
//! Verifies that the restart supervisor, the agent runner and child
//! discovery work together against live process groups:
//! - an agent that writes `DONE` on its second attempt ends the loop
//! - a child run recorded in `runs/` keeps the task open until it exits

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use conductor_core::run_info::run_info_path;
use conductor_core::{MemorySink, MessageSink, RunRecord, RunRecordStore, RunStatus, YamlRunStore};
use conductor_runner::{AgentRunner, ProcessManager, RestartSupervisor, SpawnSpec};
use tokio_util::sync::CancellationToken;

fn task_dir(root: &Path) -> PathBuf {
    let dir = root.join("project").join("task-7");
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn shell_agent(run_dir: &Path, script: &'static str) -> AgentRunner {
    let manager = ProcessManager::new(run_dir).unwrap();
    let cwd = run_dir.to_path_buf();
    AgentRunner::new(manager, move |attempt| {
        SpawnSpec::new("/bin/sh")
            .args(["-c", script, "agent", attempt.to_string().as_str()])
            .working_dir(&cwd)
    })
}

#[tokio::test]
async fn agent_writing_done_on_second_attempt_completes_task() {
    let root = tempfile::TempDir::new().unwrap();
    let run_dir = task_dir(root.path());
    let sink = Arc::new(MemorySink::new());

    let supervisor = RestartSupervisor::builder(&run_dir)
        .message_sink(Arc::clone(&sink) as Arc<dyn MessageSink>)
        .root_runner(shell_agent(
            &run_dir,
            "echo \"attempt $1\"; if [ \"$1\" = 1 ]; then touch DONE; else exit 4; fi",
        ))
        .max_restarts(5)
        .restart_delay(Duration::from_millis(10))
        .build()
        .unwrap();

    tokio::time::timeout(
        Duration::from_secs(30),
        supervisor.run(&CancellationToken::new()),
    )
    .await
    .expect("supervisor should finish")
    .unwrap();

    assert_eq!(supervisor.project_id(), "project");
    assert_eq!(
        sink.bodies(),
        [
            "starting root agent (restart #0)",
            "root agent failed on restart #0: root agent exited with exit status: 4",
            "starting root agent (restart #1)",
            "task completed (DONE marker present, no active children)",
        ]
    );
    let stdout = std::fs::read_to_string(run_dir.join("agent-stdout.txt")).unwrap();
    assert_eq!(stdout, "attempt 0\nattempt 1\n");
}

#[tokio::test]
async fn live_child_group_is_drained_before_completion() {
    let root = tempfile::TempDir::new().unwrap();
    let run_dir = task_dir(root.path());

    // A child run in its own process group, recorded the way the storage
    // layer records it.
    let child_dir = run_dir.join("runs").join("run-child");
    let mut child = ProcessManager::new(&child_dir)
        .unwrap()
        .spawn(SpawnSpec::new("sleep").args(["1"]))
        .unwrap();
    let record_path = run_info_path(&run_dir, "run-child");
    let record = RunRecord {
        version: 1,
        run_id: "run-child".to_string(),
        parent_run_id: "run-root".to_string(),
        pid: child.pid(),
        pgid: child.pgid(),
        status: RunStatus::Running,
        ..RunRecord::default()
    };
    YamlRunStore.write(&record_path, &record).unwrap();
    let reaper = tokio::spawn(async move { child.wait().await });

    std::fs::write(run_dir.join("DONE"), b"").unwrap();
    let sink = Arc::new(MemorySink::new());
    let supervisor = RestartSupervisor::builder(&run_dir)
        .message_sink(Arc::clone(&sink) as Arc<dyn MessageSink>)
        .root_runner(shell_agent(&run_dir, "exit 0"))
        .poll_interval(Duration::from_millis(50))
        .wait_timeout(Duration::from_secs(20))
        .build()
        .unwrap();

    supervisor.run(&CancellationToken::new()).await.unwrap();
    reaper.await.unwrap().unwrap();

    assert_eq!(
        sink.bodies(),
        [
            "waiting for 1 children to complete: [run-child]",
            "task completed (all children finished)",
        ]
    );
    let healed = YamlRunStore.read(&record_path).unwrap();
    assert_eq!(healed.status, RunStatus::Failed);
    assert_eq!(healed.exit_code, -1);
    assert!(healed.is_finished());
}
