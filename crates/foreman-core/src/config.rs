//! Configuration resolution for Foreman.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/foreman/settings.json)
//! 3. Project config (.foreman/settings.json)
//! 4. Environment variables (`FOREMAN_*`)
//! 5. CLI arguments (highest priority, applied by the binary)
//!
//! Files are merged key by key, so a project file only needs the keys it
//! changes.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Complete Foreman configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub orchestrator: OrchestratorConfig,
    pub worker: WorkerConfig,
    pub server: ServerConfig,
    pub daemon: DaemonConfig,
}

/// Scheduling and supervision limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Concurrent primary workers.
    pub max_primary: usize,
    /// Concurrent verification workers. Zero disables verification.
    pub max_verification: usize,
    /// Features per primary batch.
    pub batch_size: usize,
    /// Silence after which a worker is presumed crashed.
    pub stale_timeout_secs: u64,
    /// Fixed scheduling tick.
    pub tick_interval_ms: u64,
    /// Grace between SIGTERM and SIGKILL when stopping a worker.
    pub terminate_timeout_secs: u64,
    /// Upper bound for the one-shot intake command.
    pub intake_timeout_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_primary: 3,
            max_verification: 1,
            batch_size: 1,
            stale_timeout_secs: 30 * 60,
            tick_interval_ms: 5_000,
            terminate_timeout_secs: 5,
            intake_timeout_secs: 60 * 60,
        }
    }
}

impl OrchestratorConfig {
    pub const fn stale_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_timeout_secs)
    }

    pub const fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub const fn terminate_timeout(&self) -> Duration {
        Duration::from_secs(self.terminate_timeout_secs)
    }

    pub const fn intake_timeout(&self) -> Duration {
        Duration::from_secs(self.intake_timeout_secs)
    }
}

/// How worker processes are launched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Worker executable.
    pub command: PathBuf,
    /// Extra arguments passed to every worker.
    pub args: Vec<String>,
    /// Working directory for workers (defaults to the daemon's cwd).
    pub working_directory: Option<PathBuf>,
    /// Command run once when the backlog is empty (program followed by args).
    pub intake_command: Option<Vec<String>>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            command: PathBuf::from("foreman-worker"),
            args: Vec::new(),
            working_directory: None,
            intake_command: None,
        }
    }
}

/// Observer-facing server settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    /// Per-observer queue length; the oldest events are dropped past it.
    pub broadcast_capacity: usize,
    pub heartbeat_interval_secs: u64,
    /// An observer silent for this long is disconnected.
    pub client_timeout_secs: u64,
    /// Size of the recent-event tail carried by orchestrator updates.
    pub recent_events: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 8765)),
            broadcast_capacity: 256,
            heartbeat_interval_secs: 15,
            client_timeout_secs: 45,
            recent_events: 20,
        }
    }
}

/// Daemon process settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub database_path: Option<PathBuf>,
    pub log_level: String,
    pub log_json: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

impl Config {
    /// Reject settings the orchestrator cannot run with.
    pub fn validate(&self) -> Result<()> {
        let o = &self.orchestrator;
        if o.max_primary == 0 {
            return Err(Error::Config("orchestrator.max_primary must be at least 1".into()));
        }
        if o.batch_size == 0 {
            return Err(Error::Config("orchestrator.batch_size must be at least 1".into()));
        }
        if o.stale_timeout_secs == 0 {
            return Err(Error::Config(
                "orchestrator.stale_timeout_secs must be positive".into(),
            ));
        }
        if o.tick_interval_ms == 0 {
            return Err(Error::Config("orchestrator.tick_interval_ms must be positive".into()));
        }
        if self.server.broadcast_capacity == 0 {
            return Err(Error::Config("server.broadcast_capacity must be positive".into()));
        }
        if let Some(cmd) = &self.worker.intake_command
            && cmd.is_empty()
        {
            return Err(Error::Config("worker.intake_command must not be empty".into()));
        }
        Ok(())
    }
}

/// Configuration source priority (lowest to highest).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConfigSource {
    Default = 0,
    Global = 1,
    Project = 2,
    Environment = 3,
    Cli = 4,
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    let global = global_config_path();
    let project = project_dir.map(|dir| dir.join(".foreman").join("settings.json"));
    let files: Vec<&Path> = [global.as_deref(), project.as_deref()]
        .into_iter()
        .flatten()
        .filter(|p| p.exists())
        .collect();

    let mut config = load_layers(&files)?;
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

/// Merge defaults with the given config files, later files winning.
pub fn load_layers(files: &[&Path]) -> Result<Config> {
    let mut merged = serde_json::to_value(Config::default())?;
    for path in files {
        let overlay = load_config_file(path)?;
        merge_values(&mut merged, overlay);
    }
    serde_json::from_value(merged)
        .map_err(|e| Error::Config(format!("Invalid merged configuration: {e}")))
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    config_dir().map(|p| p.join("settings.json"))
}

/// Get the default database path for the daemon.
pub fn database_path() -> Option<PathBuf> {
    config_dir().map(|p| p.join("foreman.db"))
}

fn config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .ok()
            .map(|h| PathBuf::from(h).join(".foreman"))
    }
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/foreman"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("foreman"))
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

fn load_config_file(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
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

/// Apply `FOREMAN_*` overrides. `lookup` is usually `std::env::var`.
pub fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    fn parsed<T: std::str::FromStr>(
        lookup: &impl Fn(&str) -> Option<String>,
        key: &str,
    ) -> Option<T> {
        lookup(key).and_then(|v| v.trim().parse().ok())
    }

    if let Some(n) = parsed(&lookup, "FOREMAN_MAX_PRIMARY") {
        config.orchestrator.max_primary = n;
    }
    if let Some(n) = parsed(&lookup, "FOREMAN_MAX_VERIFICATION") {
        config.orchestrator.max_verification = n;
    }
    if let Some(n) = parsed(&lookup, "FOREMAN_BATCH_SIZE") {
        config.orchestrator.batch_size = n;
    }
    if let Some(n) = parsed(&lookup, "FOREMAN_STALE_TIMEOUT_SECS") {
        config.orchestrator.stale_timeout_secs = n;
    }
    if let Some(addr) = parsed(&lookup, "FOREMAN_ADDR") {
        config.server.addr = addr;
    }
    if let Some(cmd) = lookup("FOREMAN_WORKER_COMMAND") {
        config.worker.command = PathBuf::from(cmd);
    }
    if let Some(path) = lookup("FOREMAN_DB_PATH") {
        config.daemon.database_path = Some(PathBuf::from(path));
    }
    if let Some(level) = lookup("FOREMAN_LOG_LEVEL") {
        config.daemon.log_level = level;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn default_stale_timeout_is_thirty_minutes() {
        let config = Config::default();
        assert_eq!(config.orchestrator.stale_timeout(), Duration::from_secs(1800));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn project_file_overrides_only_its_keys() {
        let dir = tempfile::tempdir().unwrap();
        let global = dir.path().join("global.json");
        let project = dir.path().join("project.json");
        std::fs::write(
            &global,
            r#"{"orchestrator":{"max_primary":6,"batch_size":4},"worker":{"command":"/bin/agent"}}"#,
        )
        .unwrap();
        std::fs::write(&project, r#"{"orchestrator":{"batch_size":2}}"#).unwrap();

        let config = load_layers(&[&global, &project]).unwrap();
        assert_eq!(config.orchestrator.max_primary, 6);
        assert_eq!(config.orchestrator.batch_size, 2);
        assert_eq!(config.worker.command, PathBuf::from("/bin/agent"));
        assert_eq!(config.orchestrator.max_verification, 1);
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ nope").unwrap();
        assert!(matches!(load_layers(&[&path]), Err(Error::Config(_))));
    }

    #[test]
    fn env_overrides_apply() {
        let vars: HashMap<&str, &str> = [
            ("FOREMAN_MAX_PRIMARY", "5"),
            ("FOREMAN_ADDR", "0.0.0.0:9000"),
            ("FOREMAN_BATCH_SIZE", "not-a-number"),
        ]
        .into_iter()
        .collect();
        let mut config = Config::default();
        apply_env_overrides(&mut config, |k| vars.get(k).map(ToString::to_string));
        assert_eq!(config.orchestrator.max_primary, 5);
        assert_eq!(config.server.addr.port(), 9000);
        assert_eq!(config.orchestrator.batch_size, 1);
    }

    #[test]
    fn validate_rejects_zero_limits() {
        let mut config = Config::default();
        config.orchestrator.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.orchestrator.max_primary = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.worker.intake_command = Some(vec![]);
        assert!(config.validate().is_err());
    }
}
