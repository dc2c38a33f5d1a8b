//! `Conductor` Core Library
//!
//! Shared functionality for `Conductor` components:
//! - Configuration resolution and hierarchy
//! - Message sink contract for task status messages
//! - Persisted run-record storage (`run-info.yaml`)
//! - Common error types and tracing setup

pub mod config;
pub mod error;
pub mod message;
pub mod run_info;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
pub use message::{JsonlSink, MemorySink, Message, MessageScope, MessageSink, Severity};
pub use run_info::{RunRecord, RunRecordStore, RunStatus, YamlRunStore};
