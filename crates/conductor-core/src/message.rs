//! Task status messages.
//!
//! The supervisor mirrors every observable transition to a [`MessageSink`].
//! The log format itself belongs to the sink; the supervisor only needs
//! `append(scope, severity, body) -> id`.

use std::fmt;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Message severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Project/task pair a message belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageScope {
    pub project_id: String,
    pub task_id: String,
}

impl MessageScope {
    pub fn new(project_id: impl Into<String>, task_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            task_id: task_id.into(),
        }
    }
}

/// A persisted message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub project_id: String,
    pub task_id: String,
    pub body: String,
}

impl Message {
    fn new(scope: &MessageScope, severity: Severity, body: &str) -> Result<Self> {
        if body.trim().is_empty() {
            return Err(Error::Message("message body is empty".to_string()));
        }
        Ok(Self {
            id: format!("MSG-{}", uuid::Uuid::new_v4()),
            timestamp: Utc::now(),
            severity,
            project_id: scope.project_id.clone(),
            task_id: scope.task_id.clone(),
            body: body.to_string(),
        })
    }
}

/// Append-only, structured message destination.
pub trait MessageSink: Send + Sync {
    /// Append one message and return its id.
    fn append(&self, scope: &MessageScope, severity: Severity, body: &str) -> Result<String>;
}

/// In-memory sink. Useful for embedding and for inspecting what a run emitted.
#[derive(Debug, Default)]
pub struct MemorySink {
    messages: Mutex<Vec<Message>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every message appended so far, in append order.
    pub fn messages(&self) -> Vec<Message> {
        self.messages
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    /// Bodies of every message appended so far.
    pub fn bodies(&self) -> Vec<String> {
        self.messages().into_iter().map(|m| m.body).collect()
    }
}

impl MessageSink for MemorySink {
    fn append(&self, scope: &MessageScope, severity: Severity, body: &str) -> Result<String> {
        let message = Message::new(scope, severity, body)?;
        let id = message.id.clone();
        self.messages
            .lock()
            .map_err(|_| Error::Message("memory sink lock poisoned".to_string()))?
            .push(message);
        Ok(id)
    }
}

/// Append-only NDJSON file sink, one message per line.
#[derive(Debug)]
pub struct JsonlSink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every message back from the file. Blank lines are skipped.
    pub fn read_all(&self) -> Result<Vec<Message>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(Error::from))
            .collect()
    }
}

impl MessageSink for JsonlSink {
    fn append(&self, scope: &MessageScope, severity: Severity, body: &str) -> Result<String> {
        let message = Message::new(scope, severity, body)?;
        let mut line = serde_json::to_string(&message)?;
        line.push('\n');

        let _guard = self
            .lock
            .lock()
            .map_err(|_| Error::Message("jsonl sink lock poisoned".to_string()))?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.flush()?;
        Ok(message.id)
    }
}
