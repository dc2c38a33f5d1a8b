//! Captured agent stdout/stderr.
//!
//! Output always lands in `agent-stdout.txt` / `agent-stderr.txt` inside the
//! run directory, opened in append mode so a restarted agent never truncates
//! what an earlier attempt wrote.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::manager::ProcessError;

pub const STDOUT_FILE: &str = "agent-stdout.txt";
pub const STDERR_FILE: &str = "agent-stderr.txt";

/// Extra destination that receives a copy of captured output.
pub type OutputSink = Box<dyn AsyncWrite + Send + Unpin>;

/// The pair of capture files for one spawned process.
///
/// Files are released exactly once by [`StdioCapture::close`]; later calls
/// are no-ops.
#[derive(Debug)]
pub struct StdioCapture {
    stdout_path: PathBuf,
    stderr_path: PathBuf,
    stdout: Option<File>,
    stderr: Option<File>,
}

impl StdioCapture {
    /// Open (creating if needed) both capture files under `run_dir`.
    pub fn open(run_dir: &Path) -> Result<Self, ProcessError> {
        let stdout_path = run_dir.join(STDOUT_FILE);
        let stderr_path = run_dir.join(STDERR_FILE);
        let stdout = open_append(&stdout_path)?;
        let stderr = open_append(&stderr_path)?;
        Ok(Self {
            stdout_path,
            stderr_path,
            stdout: Some(stdout),
            stderr: Some(stderr),
        })
    }

    pub fn stdout_path(&self) -> &Path {
        &self.stdout_path
    }

    pub fn stderr_path(&self) -> &Path {
        &self.stderr_path
    }

    pub const fn is_closed(&self) -> bool {
        self.stdout.is_none() && self.stderr.is_none()
    }

    /// A second descriptor for the stdout file, for handing to a child or pump.
    pub(crate) fn stdout_clone(&self) -> Result<File, ProcessError> {
        clone_file(self.stdout.as_ref(), &self.stdout_path)
    }

    pub(crate) fn stderr_clone(&self) -> Result<File, ProcessError> {
        clone_file(self.stderr.as_ref(), &self.stderr_path)
    }

    /// Release both files. Returns `false` if they were already closed.
    pub fn close(&mut self) -> bool {
        let was_open = !self.is_closed();
        drop(self.stdout.take());
        drop(self.stderr.take());
        if was_open {
            debug!(stdout = %self.stdout_path.display(), "Closed stdio capture");
        }
        was_open
    }
}

fn open_append(path: &Path) -> Result<File, ProcessError> {
    let capture_err = |source| ProcessError::Capture {
        path: path.to_path_buf(),
        source,
    };
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(capture_err)?;
    }
    let mut options = OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o644);
    }
    options.open(path).map_err(capture_err)
}

fn clone_file(file: Option<&File>, path: &Path) -> Result<File, ProcessError> {
    let file = file.ok_or_else(|| ProcessError::Capture {
        path: path.to_path_buf(),
        source: std::io::Error::other("capture already closed"),
    })?;
    file.try_clone().map_err(|source| ProcessError::Capture {
        path: path.to_path_buf(),
        source,
    })
}

/// Copy `reader` into both the capture file and `sink` until EOF.
///
/// A failing sink is dropped from the copy; the capture file keeps receiving
/// output.
pub(crate) fn spawn_tee<R>(
    reader: R,
    file: File,
    sink: OutputSink,
    stream: &'static str,
) -> JoinHandle<()>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let mut reader = reader;
        let mut file = tokio::fs::File::from_std(file);
        let mut sink = Some(sink);
        let mut buf = vec![0u8; 8 * 1024];

        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    warn!(stream, error = %e, "Failed to read child output");
                    break;
                }
            };
            let chunk = &buf[..n];
            if let Err(e) = file.write_all(chunk).await {
                warn!(stream, error = %e, "Failed to write capture file");
            }
            if let Some(out) = sink.as_mut()
                && let Err(e) = out.write_all(chunk).await
            {
                warn!(stream, error = %e, "Output sink failed, continuing with file only");
                sink = None;
            }
        }

        if let Err(e) = file.flush().await {
            warn!(stream, error = %e, "Failed to flush capture file");
        }
        if let Some(mut out) = sink
            && let Err(e) = out.flush().await
        {
            warn!(stream, error = %e, "Failed to flush output sink");
        }
    })
}
