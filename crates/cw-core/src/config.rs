use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::DEFAULT_FAILURE_THRESHOLD;

/// Environment variable that overrides the config file location.
pub const CONFIG_ENV: &str = "CRONWARDEN_CONFIG";

/// Top-level configuration loaded from `~/.cronwarden/config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load config from `$CRONWARDEN_CONFIG` or `~/.cronwarden/config.toml`,
    /// falling back to defaults when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings that are not fully expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.paths.state_dir.trim().is_empty() {
            return Err(ConfigError::Validation(
                "paths.state_dir must not be empty".to_string(),
            ));
        }
        if self.scheduler.max_wait_secs == 0 {
            return Err(ConfigError::Validation(
                "scheduler.max_wait_secs must be positive".to_string(),
            ));
        }
        if self.scheduler.failure_threshold == 0 {
            return Err(ConfigError::Validation(
                "scheduler.failure_threshold must be positive".to_string(),
            ));
        }
        if self.agent.command.trim().is_empty() {
            return Err(ConfigError::Validation(
                "agent.command must not be empty".to_string(),
            ));
        }
        if self.monitor.interval_secs == 0 {
            return Err(ConfigError::Validation(
                "monitor.interval_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            if !path.is_empty() {
                return PathBuf::from(path);
            }
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".cronwarden")
            .join("config.toml")
    }

    /// The state directory with a leading `~` expanded.
    pub fn state_dir(&self) -> PathBuf {
        expand_home(&self.paths.state_dir)
    }

    /// The registry document (`<state_dir>/tasks.json`).
    pub fn registry_path(&self) -> PathBuf {
        self.state_dir().join("tasks.json")
    }

    /// The daemon lockfile (`<state_dir>/daemon.lock`).
    pub fn lockfile_path(&self) -> PathBuf {
        self.state_dir().join("daemon.lock")
    }

    /// Directory for the rolling daemon lifecycle log.
    pub fn log_dir(&self) -> PathBuf {
        self.state_dir().join("logs")
    }

    /// Directory for per-execution log artifacts.
    pub fn executions_dir(&self) -> PathBuf {
        self.state_dir().join("executions")
    }
}

fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(rest),
        None if path == "~" => dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")),
        None => PathBuf::from(path),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
        }
    }
}

fn default_state_dir() -> String {
    "~/.cronwarden".into()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Longest the loop sleeps before re-checking the registry.
    #[serde(default = "default_max_wait_secs")]
    pub max_wait_secs: u64,
    /// How long shutdown waits for in-flight executions.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    /// Consecutive failed firings before a task is disabled.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_wait_secs: default_max_wait_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            failure_threshold: default_failure_threshold(),
        }
    }
}

impl SchedulerConfig {
    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

fn default_max_wait_secs() -> u64 {
    3600
}
fn default_shutdown_grace_secs() -> u64 {
    5
}
fn default_failure_threshold() -> u32 {
    DEFAULT_FAILURE_THRESHOLD
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries per firing after the initial attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry; doubles for each following retry.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    2000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Executable invoked for every attempt.
    #[serde(default = "default_agent_command")]
    pub command: String,
    /// Arguments placed before the instructions reference.
    #[serde(default = "default_agent_args")]
    pub args: Vec<String>,
    /// Optional wall-clock limit for a single attempt.
    #[serde(default)]
    pub attempt_timeout_secs: Option<u64>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: default_agent_command(),
            args: default_agent_args(),
            attempt_timeout_secs: None,
        }
    }
}

fn default_agent_command() -> String {
    "claude".into()
}
fn default_agent_args() -> Vec<String> {
    vec!["-p".into()]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_monitor_interval_secs")]
    pub interval_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_monitor_interval_secs(),
        }
    }
}

fn default_monitor_interval_secs() -> u64 {
    300
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// How long `stop` waits for the daemon process to exit.
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            stop_timeout_secs: default_stop_timeout_secs(),
        }
    }
}

fn default_stop_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_scheduling_policy() {
        let cfg = Config::default();
        assert_eq!(cfg.scheduler.max_wait_secs, 3600);
        assert_eq!(cfg.scheduler.shutdown_grace_secs, 5);
        assert_eq!(cfg.scheduler.failure_threshold, 3);
        assert_eq!(cfg.retry.max_retries, 3);
        assert_eq!(cfg.retry.base_delay_ms, 2000);
        assert_eq!(cfg.monitor.interval_secs, 300);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [paths]
            state_dir = "/var/lib/cronwarden"

            [retry]
            base_delay_ms = 10
            "#,
        )
        .unwrap();
        assert_eq!(cfg.retry.base_delay_ms, 10);
        assert_eq!(cfg.retry.max_retries, 3);
        assert_eq!(cfg.registry_path(), PathBuf::from("/var/lib/cronwarden/tasks.json"));
        assert_eq!(cfg.lockfile_path(), PathBuf::from("/var/lib/cronwarden/daemon.lock"));
    }

    #[test]
    fn zero_threshold_is_rejected() {
        let mut cfg = Config::default();
        cfg.scheduler.failure_threshold = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn empty_agent_command_is_rejected() {
        let mut cfg = Config::default();
        cfg.agent.command = "  ".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn tilde_expands_to_home() {
        let cfg = Config::default();
        assert!(!cfg.state_dir().starts_with("~"));
        assert!(cfg.state_dir().ends_with(".cronwarden"));
    }

    #[test]
    fn toml_round_trip() {
        let mut cfg = Config::default();
        cfg.agent.attempt_timeout_secs = Some(600);
        let text = cfg.to_toml().unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed, cfg);
    }
}
