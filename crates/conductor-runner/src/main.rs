//! `Conductor` Runner
//!
//! Supervises tasks: restarts the given agent command in each task's run
//! directory until it writes `DONE`, then waits for any child runs. Several
//! `--run-dir`s are supervised concurrently, gated by `--max-concurrent-runs`.
//!
//! ```text
//! conductor-runner --run-dir runs/my-project/task-1 -- claude -p "..."
//! conductor-runner --run-dir runs/p/task-1 --run-dir runs/p/task-2 \
//!     --max-concurrent-runs 1 -- claude -p "..."
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use conductor_core::config::load_config;
use conductor_core::{JsonlSink, MessageSink};
use conductor_runner::process::StdinSource;
use conductor_runner::{AdmissionControl, AgentRunner, ProcessManager, RestartSupervisor, SpawnSpec};

/// Message log file written inside the run directory.
const MESSAGES_FILE: &str = "messages.jsonl";

#[derive(Parser, Debug)]
#[command(name = "conductor-runner")]
#[command(version, about = "Conductor runner - restart supervisor for agent CLIs")]
struct Args {
    /// Task run directory (created if missing). Repeat to supervise several tasks.
    #[arg(long = "run-dir", env = "CONDUCTOR_RUN_DIR", required = true)]
    run_dirs: Vec<PathBuf>,

    /// Project directory holding `.conductor/settings.json`
    #[arg(long, env = "CONDUCTOR_PROJECT_DIR")]
    project_dir: Option<PathBuf>,

    /// Project id for messages (defaults to the run dir's parent name)
    #[arg(long)]
    project_id: Option<String>,

    /// Task id for messages (defaults to the run dir's name; single run only)
    #[arg(long)]
    task_id: Option<String>,

    /// Working directory for the agent
    #[arg(long)]
    working_dir: Option<PathBuf>,

    /// File fed to the agent on stdin
    #[arg(long)]
    stdin_file: Option<PathBuf>,

    /// Maximum root agent attempts
    #[arg(long)]
    max_restarts: Option<u32>,

    /// Seconds to wait for child runs after `DONE`
    #[arg(long)]
    wait_timeout_secs: Option<u64>,

    /// Milliseconds between child liveness checks
    #[arg(long)]
    poll_interval_ms: Option<u64>,

    /// Milliseconds between attempts
    #[arg(long)]
    restart_delay_ms: Option<u64>,

    /// Maximum concurrently supervised runs (0 = unlimited)
    #[arg(long)]
    max_concurrent_runs: Option<usize>,

    /// Seconds to wait for graceful agent shutdown before SIGKILL.
    #[arg(long, default_value_t = 5, env = "CONDUCTOR_TERMINATE_TIMEOUT")]
    terminate_timeout: u64,

    /// Log level filter (e.g. "info", "debug", "warn").
    #[arg(long)]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "CONDUCTOR_LOG_JSON")]
    log_json: bool,

    /// Agent command and its arguments
    #[arg(last = true, required = true, num_args = 1..)]
    command: Vec<String>,
}

/// Restart and wait limits shared by every supervised run.
#[derive(Debug, Clone, Copy)]
struct Limits {
    max_restarts: u32,
    restart_delay: Duration,
    wait_timeout: Duration,
    poll_interval: Duration,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    if args.task_id.is_some() && args.run_dirs.len() > 1 {
        anyhow::bail!("--task-id cannot be combined with more than one --run-dir");
    }
    let config = load_config(args.project_dir.as_deref())?;

    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.runner.log_level.clone());
    let log_filter = format!("conductor_runner={log_level},conductor_core={log_level}");
    conductor_core::tracing_init::init_tracing(&log_filter, args.log_json);

    let supervisor_cfg = &config.supervisor;
    let limits = Limits {
        max_restarts: args.max_restarts.unwrap_or(supervisor_cfg.max_restarts),
        restart_delay: args
            .restart_delay_ms
            .map_or_else(|| supervisor_cfg.restart_delay(), Duration::from_millis),
        wait_timeout: args
            .wait_timeout_secs
            .map_or_else(|| supervisor_cfg.wait_timeout(), Duration::from_secs),
        poll_interval: args
            .poll_interval_ms
            .map_or_else(|| supervisor_cfg.poll_interval(), Duration::from_millis),
    };
    let max_concurrent = args
        .max_concurrent_runs
        .unwrap_or(config.runner.max_concurrent_runs);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        runs = args.run_dirs.len(),
        max_restarts = limits.max_restarts,
        max_concurrent,
        "Starting conductor-runner"
    );

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl+C, stopping supervision");
                cancel.cancel();
            }
        });
    }

    let admission = Arc::new(AdmissionControl::new(max_concurrent));
    admission.set_waiting_run_hook(Some(Arc::new(|delta: i64| {
        debug!(delta, "Queued runs changed");
    })));

    let mut runs = JoinSet::new();
    for run_dir in &args.run_dirs {
        let supervisor = build_supervisor(&args, run_dir, limits)?;
        let admission = Arc::clone(&admission);
        let cancel = cancel.clone();
        runs.spawn(async move {
            let result = supervisor.run_admitted(&admission, &cancel).await;
            (supervisor, result)
        });
    }

    let total = args.run_dirs.len();
    let mut failed = 0usize;
    while let Some(joined) = runs.join_next().await {
        let (supervisor, result) = joined.context("supervision task panicked")?;
        match result {
            Ok(()) => info!(task_id = supervisor.task_id(), "Task completed"),
            Err(e) => {
                error!(task_id = supervisor.task_id(), error = %e, "Task failed");
                failed += 1;
            }
        }
    }
    if failed > 0 {
        anyhow::bail!("{failed} of {total} tasks failed");
    }
    Ok(())
}

fn build_supervisor(
    args: &Args,
    run_dir: &Path,
    limits: Limits,
) -> anyhow::Result<RestartSupervisor> {
    std::fs::create_dir_all(run_dir)
        .with_context(|| format!("Failed to create run directory {}", run_dir.display()))?;

    let sink: Arc<dyn MessageSink> = Arc::new(JsonlSink::new(run_dir.join(MESSAGES_FILE)));
    let supervisor = RestartSupervisor::builder(run_dir)
        .message_sink(sink)
        .root_runner(agent_runner(args, run_dir)?)
        .max_restarts(limits.max_restarts)
        .restart_delay(limits.restart_delay)
        .wait_timeout(limits.wait_timeout)
        .poll_interval(limits.poll_interval)
        .project_task(
            args.project_id.as_deref().unwrap_or_default(),
            args.task_id.as_deref().unwrap_or_default(),
        )
        .build()?;
    Ok(supervisor)
}

fn agent_runner(args: &Args, run_dir: &Path) -> anyhow::Result<AgentRunner> {
    let (program, rest) = args
        .command
        .split_first()
        .context("agent command is required")?;
    let program = program.clone();
    let rest = rest.to_vec();
    let working_dir = args.working_dir.clone();
    let stdin_file = args.stdin_file.clone();

    let manager = ProcessManager::new(run_dir)?;
    let runner = AgentRunner::new(manager, move |_attempt| {
        let mut spec = SpawnSpec::new(program.clone()).args(rest.iter().cloned());
        if let Some(dir) = &working_dir {
            spec = spec.working_dir(dir);
        }
        if let Some(path) = &stdin_file {
            spec = spec.stdin(StdinSource::File(path.clone()));
        }
        spec
    })
    .grace_period(Duration::from_secs(args.terminate_timeout));
    Ok(runner)
}
