//! Agent process spawning.
//!
//! [`ProcessManager::spawn`] starts a command in its own process group with
//! stdout/stderr appended to capture files in the run directory, and returns
//! a [`ProcessHandle`] that owns the child until [`ProcessHandle::wait`]
//! reaps it.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::group::{GroupError, GroupSignal, ProcessGroups, platform_groups};
use super::stdio::{OutputSink, StdioCapture, spawn_tee};

/// Where the child's stdin comes from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum StdinSource {
    /// Always-empty input, so CLIs that read stdin see EOF instead of hanging.
    #[default]
    Null,
    /// Read from a file.
    File(PathBuf),
    /// Feed these bytes, then close.
    Bytes(Vec<u8>),
}

/// Everything needed to start one agent process.
#[derive(Default)]
pub struct SpawnSpec {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// When non-empty, replaces the inherited environment entirely.
    pub env: BTreeMap<String, String>,
    pub stdin: StdinSource,
    pub stdout_sink: Option<OutputSink>,
    pub stderr_sink: Option<OutputSink>,
}

impl fmt::Debug for SpawnSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpawnSpec")
            .field("command", &self.command)
            .field("args", &self.args)
            .field("working_dir", &self.working_dir)
            .field("env_keys", &self.env.keys().collect::<Vec<_>>())
            .field("stdin", &self.stdin)
            .field("stdout_sink", &self.stdout_sink.is_some())
            .field("stderr_sink", &self.stderr_sink.is_some())
            .finish()
    }
}

impl SpawnSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn stdin(mut self, stdin: StdinSource) -> Self {
        self.stdin = stdin;
        self
    }

    #[must_use]
    pub fn stdout_sink(mut self, sink: OutputSink) -> Self {
        self.stdout_sink = Some(sink);
        self
    }

    #[must_use]
    pub fn stderr_sink(mut self, sink: OutputSink) -> Self {
        self.stderr_sink = Some(sink);
        self
    }
}

/// Errors from spawning or reaping agent processes.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Run directory is empty")]
    EmptyRunDir,

    #[error("Command is empty")]
    EmptyCommand,

    #[error("Failed to open capture file {}: {source}", path.display())]
    Capture {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to open stdin {}: {source}", path.display())]
    Stdin {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to spawn {command}: {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Spawned process has no pid")]
    MissingPid,

    #[error("Failed to resolve process group for pid {pid}: {source}")]
    GroupResolution {
        pid: i32,
        #[source]
        source: GroupError,
    },

    #[error("Process {pid} is not running under this handle")]
    NotRunning { pid: i32 },

    #[error("Failed to wait for process {pid}: {source}")]
    WaitFailed {
        pid: i32,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to signal process group {pgid}: {source}")]
    Signal {
        pgid: i32,
        #[source]
        source: GroupError,
    },
}

/// Spawns agent processes whose output is captured under one run directory.
pub struct ProcessManager {
    run_dir: PathBuf,
    groups: Arc<dyn ProcessGroups>,
}

impl fmt::Debug for ProcessManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessManager")
            .field("run_dir", &self.run_dir)
            .finish_non_exhaustive()
    }
}

impl ProcessManager {
    /// Create a manager for `run_dir` using this platform's process groups.
    pub fn new(run_dir: impl AsRef<Path>) -> Result<Self, ProcessError> {
        Self::with_groups(run_dir, platform_groups())
    }

    pub fn with_groups(
        run_dir: impl AsRef<Path>,
        groups: Arc<dyn ProcessGroups>,
    ) -> Result<Self, ProcessError> {
        let run_dir = run_dir.as_ref();
        if run_dir.as_os_str().is_empty() || run_dir.to_string_lossy().trim().is_empty() {
            return Err(ProcessError::EmptyRunDir);
        }
        Ok(Self {
            run_dir: run_dir.to_path_buf(),
            groups,
        })
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Start `spec` as a new process group. Must be called within a Tokio runtime.
    pub fn spawn(&self, spec: SpawnSpec) -> Result<ProcessHandle, ProcessError> {
        let command = spec.command.trim().to_string();
        if command.is_empty() {
            return Err(ProcessError::EmptyCommand);
        }

        let mut capture = StdioCapture::open(&self.run_dir)?;
        let started = start(&command, spec, &capture);
        let (mut child, stdin_bytes, tees) = match started {
            Ok(parts) => parts,
            Err(e) => {
                capture.close();
                return Err(e);
            }
        };

        let pid = match child.id().and_then(|id| i32::try_from(id).ok()) {
            Some(pid) => pid,
            None => {
                kill_abandoned(&mut child);
                capture.close();
                return Err(ProcessError::MissingPid);
            }
        };

        if let Err(e) = self.groups.track_spawned(pid) {
            warn!(pid, error = %e, "Failed to register spawned process");
        }

        let pgid = match self.groups.group_id(pid) {
            Ok(pgid) => pgid,
            Err(source) => {
                warn!(pid, error = %source, "Killing process with unresolvable group");
                kill_abandoned(&mut child);
                self.groups.release(pid);
                capture.close();
                return Err(ProcessError::GroupResolution { pid, source });
            }
        };

        let mut pumps = Vec::with_capacity(3);
        for (stream, reader, sink) in tees.into_streams(&mut child) {
            let file = match stream {
                "stdout" => capture.stdout_clone(),
                _ => capture.stderr_clone(),
            };
            match file {
                Ok(file) => pumps.push(spawn_tee(reader, file, sink, stream)),
                Err(e) => warn!(pid, stream, error = %e, "Output tee unavailable"),
            }
        }
        if let (Some(bytes), Some(mut stdin)) = (stdin_bytes, child.stdin.take()) {
            pumps.push(tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&bytes).await {
                    debug!(error = %e, "Child closed stdin early");
                }
            }));
        }

        info!(
            pid,
            pgid,
            command = %command,
            run_dir = %self.run_dir.display(),
            "Spawned agent process"
        );

        Ok(ProcessHandle {
            pid,
            pgid,
            stdout_path: capture.stdout_path().to_path_buf(),
            stderr_path: capture.stderr_path().to_path_buf(),
            child: Some(child),
            capture,
            pumps,
            groups: Arc::clone(&self.groups),
        })
    }
}

/// Sinks that need a pipe + pump instead of a direct file descriptor.
struct Tees {
    stdout: Option<OutputSink>,
    stderr: Option<OutputSink>,
}

type TeeStream = (
    &'static str,
    Box<dyn tokio::io::AsyncRead + Send + Unpin>,
    OutputSink,
);

impl Tees {
    fn into_streams(self, child: &mut Child) -> Vec<TeeStream> {
        let mut streams: Vec<TeeStream> = Vec::new();
        if let (Some(sink), Some(out)) = (self.stdout, child.stdout.take()) {
            streams.push(("stdout", Box::new(out), sink));
        }
        if let (Some(sink), Some(err)) = (self.stderr, child.stderr.take()) {
            streams.push(("stderr", Box::new(err), sink));
        }
        streams
    }
}

/// Best-effort kill of a child that will never get a handle.
fn kill_abandoned(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        warn!(pid = ?child.id(), error = %e, "Failed to kill abandoned process");
    }
}

fn start(
    command: &str,
    spec: SpawnSpec,
    capture: &StdioCapture,
) -> Result<(Child, Option<Vec<u8>>, Tees), ProcessError> {
    let mut cmd = Command::new(command);
    cmd.args(&spec.args);
    if let Some(dir) = &spec.working_dir {
        cmd.current_dir(dir);
    }
    if !spec.env.is_empty() {
        cmd.env_clear().envs(&spec.env);
    }

    let stdout = if spec.stdout_sink.is_some() {
        Stdio::piped()
    } else {
        Stdio::from(capture.stdout_clone()?)
    };
    let stderr = if spec.stderr_sink.is_some() {
        Stdio::piped()
    } else {
        Stdio::from(capture.stderr_clone()?)
    };
    let (stdin, stdin_bytes) = match spec.stdin {
        StdinSource::Null => (Stdio::null(), None),
        StdinSource::File(path) => {
            let file = std::fs::File::open(&path)
                .map_err(|source| ProcessError::Stdin { path, source })?;
            (Stdio::from(file), None)
        }
        StdinSource::Bytes(bytes) => (Stdio::piped(), Some(bytes)),
    };
    cmd.stdin(stdin).stdout(stdout).stderr(stderr);

    #[cfg(unix)]
    cmd.process_group(0);
    #[cfg(windows)]
    cmd.creation_flags(windows_sys::Win32::System::Threading::CREATE_NEW_PROCESS_GROUP);

    let child = cmd.spawn().map_err(|source| ProcessError::SpawnFailed {
        command: command.to_string(),
        source,
    })?;
    Ok((
        child,
        stdin_bytes,
        Tees {
            stdout: spec.stdout_sink,
            stderr: spec.stderr_sink,
        },
    ))
}

/// Exclusive owner of one spawned process.
pub struct ProcessHandle {
    pid: i32,
    pgid: i32,
    stdout_path: PathBuf,
    stderr_path: PathBuf,
    child: Option<Child>,
    capture: StdioCapture,
    pumps: Vec<JoinHandle<()>>,
    groups: Arc<dyn ProcessGroups>,
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("pgid", &self.pgid)
            .field("stdout_path", &self.stdout_path)
            .field("stderr_path", &self.stderr_path)
            .field("reaped", &self.child.is_none())
            .finish_non_exhaustive()
    }
}

impl ProcessHandle {
    pub const fn pid(&self) -> i32 {
        self.pid
    }

    pub const fn pgid(&self) -> i32 {
        self.pgid
    }

    pub fn stdout_path(&self) -> &Path {
        &self.stdout_path
    }

    pub fn stderr_path(&self) -> &Path {
        &self.stderr_path
    }

    /// Whether the capture files have been released.
    pub const fn capture_closed(&self) -> bool {
        self.capture.is_closed()
    }

    /// Wait for the process to exit and reap it.
    ///
    /// Capture files are closed on every return path of the first call.
    /// Later calls report [`ProcessError::NotRunning`].
    pub async fn wait(&mut self) -> Result<ExitStatus, ProcessError> {
        let Some(child) = self.child.as_mut() else {
            return Err(ProcessError::NotRunning { pid: self.pid });
        };
        let result = child.wait().await;
        self.child = None;

        for pump in self.pumps.drain(..) {
            if let Err(e) = pump.await {
                warn!(pid = self.pid, error = %e, "Output pump task failed");
            }
        }
        self.capture.close();
        self.groups.release(self.pid);

        match result {
            Ok(status) => {
                info!(pid = self.pid, ?status, "Agent process exited");
                Ok(status)
            }
            Err(source) => Err(ProcessError::WaitFailed {
                pid: self.pid,
                source,
            }),
        }
    }

    /// Ask the whole process group to exit.
    pub fn terminate(&self) -> Result<(), ProcessError> {
        self.signal(GroupSignal::Terminate)
    }

    /// Force the whole process group to exit.
    pub fn kill(&self) -> Result<(), ProcessError> {
        self.signal(GroupSignal::Kill)
    }

    fn signal(&self, signal: GroupSignal) -> Result<(), ProcessError> {
        debug!(pgid = self.pgid, ?signal, "Signalling agent process group");
        self.groups
            .signal_group(self.pgid, signal)
            .map_err(|source| ProcessError::Signal {
                pgid: self.pgid,
                source,
            })
    }
}

#[cfg(all(test, unix))]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::process::stdio::{STDERR_FILE, STDOUT_FILE};

    fn sh(script: &str) -> SpawnSpec {
        SpawnSpec::new("/bin/sh").args(["-c", script])
    }

    async fn run(manager: &ProcessManager, spec: SpawnSpec) -> (ProcessHandle, ExitStatus) {
        let mut handle = manager.spawn(spec).unwrap();
        let status = tokio::time::timeout(Duration::from_secs(10), handle.wait())
            .await
            .expect("process should exit")
            .unwrap();
        (handle, status)
    }

    #[test]
    fn empty_run_dir_rejected() {
        assert!(matches!(ProcessManager::new(""), Err(ProcessError::EmptyRunDir)));
    }

    #[tokio::test]
    async fn empty_command_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let manager = ProcessManager::new(dir.path()).unwrap();
        let err = manager.spawn(SpawnSpec::new("   ")).unwrap_err();
        assert!(matches!(err, ProcessError::EmptyCommand));
        assert!(!dir.path().join(STDOUT_FILE).exists());
    }

    #[tokio::test]
    async fn captures_stdout_and_stderr_exactly() {
        let dir = tempfile::TempDir::new().unwrap();
        let manager = ProcessManager::new(dir.path()).unwrap();
        let (handle, status) = run(&manager, sh("printf 'hello\\nworld'; printf 'oops' >&2")).await;

        assert!(status.success());
        assert!(handle.capture_closed());
        assert_eq!(
            std::fs::read(handle.stdout_path()).unwrap(),
            b"hello\nworld"
        );
        assert_eq!(std::fs::read(handle.stderr_path()).unwrap(), b"oops");
    }

    #[tokio::test]
    async fn existing_capture_content_is_kept_as_prefix() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join(STDOUT_FILE), b"0123456789").unwrap();
        let manager = ProcessManager::new(dir.path()).unwrap();
        let (handle, _) = run(&manager, sh("printf abc")).await;

        let content = std::fs::read(handle.stdout_path()).unwrap();
        assert_eq!(&content[..10], b"0123456789");
        assert_eq!(content, b"0123456789abc");
    }

    #[tokio::test]
    async fn creates_missing_run_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let run_dir = dir.path().join("project").join("task");
        let manager = ProcessManager::new(&run_dir).unwrap();
        run(&manager, sh("printf x")).await;
        assert!(run_dir.join(STDOUT_FILE).exists());
        assert!(run_dir.join(STDERR_FILE).exists());
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let dir = tempfile::TempDir::new().unwrap();
        let manager = ProcessManager::new(dir.path()).unwrap();
        let err = manager
            .spawn(SpawnSpec::new("/definitely/not/a/binary"))
            .unwrap_err();
        assert!(matches!(err, ProcessError::SpawnFailed { .. }));
    }

    #[tokio::test]
    async fn second_wait_is_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let manager = ProcessManager::new(dir.path()).unwrap();
        let (mut handle, _) = run(&manager, sh("exit 0")).await;
        assert!(matches!(handle.wait().await, Err(ProcessError::NotRunning { .. })));
    }

    #[tokio::test]
    async fn child_leads_its_own_group() {
        let dir = tempfile::TempDir::new().unwrap();
        let manager = ProcessManager::new(dir.path()).unwrap();
        let (handle, _) = run(&manager, sh("exit 0")).await;
        assert_eq!(handle.pid(), handle.pgid());
        assert!(handle.pid() > 0);
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported_in_status() {
        let dir = tempfile::TempDir::new().unwrap();
        let manager = ProcessManager::new(dir.path()).unwrap();
        let (_, status) = run(&manager, sh("exit 3")).await;
        assert_eq!(status.code(), Some(3));
    }

    #[tokio::test]
    async fn absent_stdin_reads_as_empty() {
        let dir = tempfile::TempDir::new().unwrap();
        let manager = ProcessManager::new(dir.path()).unwrap();
        let (handle, status) = run(&manager, SpawnSpec::new("cat")).await;
        assert!(status.success());
        assert!(std::fs::read(handle.stdout_path()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn stdin_bytes_are_delivered() {
        let dir = tempfile::TempDir::new().unwrap();
        let manager = ProcessManager::new(dir.path()).unwrap();
        let spec = SpawnSpec::new("cat").stdin(StdinSource::Bytes(b"prompt text".to_vec()));
        let (handle, _) = run(&manager, spec).await;
        assert_eq!(std::fs::read(handle.stdout_path()).unwrap(), b"prompt text");
    }

    #[tokio::test]
    async fn environment_replaces_inherited() {
        let dir = tempfile::TempDir::new().unwrap();
        let manager = ProcessManager::new(dir.path()).unwrap();
        let spec = sh("printf '%s|%s' \"$AGENT_NAME\" \"${CARGO_MANIFEST_DIR:-unset}\"")
            .env("AGENT_NAME", "claude");
        let (handle, _) = run(&manager, spec).await;
        assert_eq!(
            std::fs::read_to_string(handle.stdout_path()).unwrap(),
            "claude|unset"
        );
    }

    #[tokio::test]
    async fn output_is_teed_to_extra_sink() {
        let dir = tempfile::TempDir::new().unwrap();
        let manager = ProcessManager::new(dir.path()).unwrap();
        let sink_path = dir.path().join("sink.txt");
        let sink = tokio::fs::File::create(&sink_path).await.unwrap();

        let spec = sh("printf 'to both'; printf 'file only' >&2").stdout_sink(Box::new(sink));
        let (handle, _) = run(&manager, spec).await;

        assert_eq!(
            std::fs::read_to_string(handle.stdout_path()).unwrap(),
            "to both"
        );
        assert_eq!(std::fs::read_to_string(&sink_path).unwrap(), "to both");
        assert_eq!(
            std::fs::read_to_string(handle.stderr_path()).unwrap(),
            "file only"
        );
    }

    /// Backend that cannot resolve any group and remembers what it released.
    #[derive(Default)]
    struct UnresolvableGroups {
        released: std::sync::Mutex<Vec<i32>>,
    }

    impl ProcessGroups for UnresolvableGroups {
        fn group_id(&self, pid: i32) -> Result<i32, GroupError> {
            Err(GroupError::GroupNotFound(pid))
        }

        fn signal_group(&self, pgid: i32, _signal: GroupSignal) -> Result<(), GroupError> {
            Err(GroupError::GroupNotFound(pgid))
        }

        fn is_process_alive(&self, _pid: i32) -> Result<bool, GroupError> {
            Ok(false)
        }

        fn is_group_alive(&self, _pgid: i32) -> Result<bool, GroupError> {
            Ok(false)
        }

        fn release(&self, pid: i32) {
            self.released.lock().unwrap().push(pid);
        }
    }

    #[tokio::test]
    async fn unresolvable_group_kills_and_releases() {
        let dir = tempfile::TempDir::new().unwrap();
        let groups = Arc::new(UnresolvableGroups::default());
        let manager =
            ProcessManager::with_groups(dir.path(), Arc::clone(&groups) as Arc<dyn ProcessGroups>)
                .unwrap();

        let err = manager.spawn(sh("sleep 30")).unwrap_err();

        let pid = match err {
            ProcessError::GroupResolution { pid, .. } => pid,
            other => panic!("expected group resolution error, got {other:?}"),
        };
        assert!(pid > 0);
        assert_eq!(*groups.released.lock().unwrap(), [pid]);
        assert!(dir.path().join(STDOUT_FILE).exists());
    }

    #[tokio::test]
    async fn terminate_reaches_the_group() {
        let dir = tempfile::TempDir::new().unwrap();
        let manager = ProcessManager::new(dir.path()).unwrap();
        let mut handle = manager.spawn(sh("sleep 30 & wait")).unwrap();
        handle.terminate().unwrap();
        let status = tokio::time::timeout(Duration::from_secs(10), handle.wait())
            .await
            .expect("terminated group should exit")
            .unwrap();
        assert!(!status.success());
    }
}
