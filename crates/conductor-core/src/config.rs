//! Configuration resolution for Conductor.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/conductor/settings.json)
//! 3. Project config (.conductor/settings.json)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)
//!
//! Each file layer only needs to name the keys it overrides; missing keys fall
//! through to the layer below.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Complete Conductor configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Config {
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
}

/// Process-wide runner settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunnerConfig {
    /// Maximum supervised runs executing at once. `0` means unlimited.
    pub max_concurrent_runs: usize,
    pub log_level: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_runs: 0,
            log_level: "info".to_string(),
        }
    }
}

/// Restart supervisor defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SupervisorConfig {
    pub max_restarts: u32,
    pub wait_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub restart_delay_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_restarts: 100,
            wait_timeout_secs: 300,
            poll_interval_ms: 1_000,
            restart_delay_ms: 1_000,
        }
    }
}

impl SupervisorConfig {
    pub const fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }

    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub const fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    let project_path = project_dir.map(|dir| dir.join(".conductor").join("settings.json"));
    let mut config = load_config_files(global_config_path().as_deref(), project_path.as_deref())?;
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

/// Merge the global and project files (either may be absent) over the defaults.
pub fn load_config_files(global: Option<&Path>, project: Option<&Path>) -> Result<Config> {
    let mut merged = serde_json::to_value(Config::default())?;
    for path in [global, project].into_iter().flatten() {
        if path.exists() {
            let layer = load_config_file(path)?;
            merge_values(&mut merged, layer);
        }
    }
    serde_json::from_value(merged)
        .map_err(|e| Error::Config(format!("Invalid merged configuration: {e}")))
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        env_path("USERPROFILE").map(|h| h.join(".conductor").join("settings.json"))
    }
    #[cfg(target_os = "macos")]
    {
        env_path("HOME").map(|h| h.join("Library/Application Support/conductor/settings.json"))
    }
    #[cfg(target_os = "linux")]
    {
        env_path("XDG_CONFIG_HOME")
            .or_else(|| env_path("HOME").map(|h| h.join(".config")))
            .map(|p| p.join("conductor").join("settings.json"))
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

#[cfg(any(target_os = "windows", target_os = "macos", target_os = "linux"))]
fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var_os(key).map(PathBuf::from)
}

fn load_config_file(path: &Path) -> Result<serde_json::Value> {
    let shown = path.display();
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Failed to read config file {shown}: {e}")))?;
    let value: serde_json::Value = serde_json::from_str(&content)
        .map_err(|e| Error::Config(format!("Failed to parse config file {shown}: {e}")))?;
    if !value.is_object() {
        return Err(Error::Config(format!("Config file {shown} must contain a JSON object")));
    }
    Ok(value)
}

fn merge_values(base: &mut serde_json::Value, overlay: serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base), serde_json::Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(slot) => merge_values(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// Apply `CONDUCTOR_*` overrides using `lookup` to read variables.
pub fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    fn parsed<T: std::str::FromStr>(
        lookup: &impl Fn(&str) -> Option<String>,
        key: &str,
    ) -> Option<T> {
        let raw = lookup(key)?;
        raw.trim().parse().map_or_else(
            |_| {
                tracing::warn!(key, value = %raw, "Ignoring unparsable environment override");
                None
            },
            Some,
        )
    }

    if let Some(n) = parsed(&lookup, "CONDUCTOR_MAX_CONCURRENT_RUNS") {
        config.runner.max_concurrent_runs = n;
    }
    if let Some(n) = parsed(&lookup, "CONDUCTOR_MAX_RESTARTS") {
        config.supervisor.max_restarts = n;
    }
    if let Some(n) = parsed(&lookup, "CONDUCTOR_WAIT_TIMEOUT_SECS") {
        config.supervisor.wait_timeout_secs = n;
    }
    if let Some(n) = parsed(&lookup, "CONDUCTOR_POLL_INTERVAL_MS") {
        config.supervisor.poll_interval_ms = n;
    }
    if let Some(n) = parsed(&lookup, "CONDUCTOR_RESTART_DELAY_MS") {
        config.supervisor.restart_delay_ms = n;
    }
    if let Some(val) = lookup("CONDUCTOR_LOG_LEVEL") {
        config.runner.log_level = val;
    }
}
