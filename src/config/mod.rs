//! Configuration management.
//!
//! Saler configuration can come from:
//! - Config file (~/.config/saler/config.toml)
//! - An explicit `--config` file
//! - Environment variables (SALER_*)
//!
//! Later sources win, section by section for files and key by key for the
//! environment.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Saler configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    /// External checks and messaging
    #[serde(default)]
    pub external: ExternalConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Storage configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to SQLite database
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

impl StorageConfig {
    /// Configured path, or `<data_dir>/saler.db`.
    pub fn resolved_database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| Config::data_dir().join("saler.db"))
    }
}

/// Run execution limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Node visits allowed per run before it is failed
    #[serde(default = "default_max_steps")]
    pub max_steps_per_run: usize,

    /// Upper bound on a flow's own `maxFlowRetries`
    #[serde(default = "default_max_flow_retries")]
    pub max_flow_retries: u32,

    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Per-attempt action timeout when the node sets none
    #[serde(default = "default_action_timeout")]
    pub action_timeout_seconds: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps_per_run: default_max_steps(),
            max_flow_retries: default_max_flow_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            action_timeout_seconds: default_action_timeout(),
        }
    }
}

fn default_max_steps() -> usize {
    10_000
}

fn default_max_flow_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_retry_max_delay_ms() -> u64 {
    30_000
}

fn default_action_timeout() -> u64 {
    30
}

/// Background worker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_sla_sweep_interval")]
    pub sla_sweep_interval_seconds: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            sla_sweep_interval_seconds: default_sla_sweep_interval(),
        }
    }
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_sla_sweep_interval() -> u64 {
    60
}

/// External integrations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalConfig {
    /// Timeout for `api` and `ai` condition checks
    #[serde(default = "default_api_timeout")]
    pub api_timeout_seconds: u64,

    #[serde(default)]
    pub ai_endpoint: Option<String>,

    /// Where `send_message` delivers; messages are only recorded when unset
    #[serde(default)]
    pub messaging_endpoint: Option<String>,
}

impl Default for ExternalConfig {
    fn default() -> Self {
        Self {
            api_timeout_seconds: default_api_timeout(),
            ai_endpoint: None,
            messaging_endpoint: None,
        }
    }
}

fn default_api_timeout() -> u64 {
    10
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("Unknown log format: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,

    /// EnvFilter directive; `RUST_LOG` takes precedence
    #[serde(default)]
    pub filter: Option<String>,
}

impl Config {
    /// Load configuration from default locations, then `explicit` if given.
    ///
    /// A missing default file is fine; a missing or malformed explicit file
    /// is an error.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();

        let primary_path = Self::config_dir().join("config.toml");
        if primary_path.exists() {
            config.apply_partial(Self::load_partial_from_path(&primary_path)?);
        }

        if let Some(path) = explicit {
            config.apply_partial(Self::load_partial_from_path(path)?);
        }

        config.apply_env_overrides();
        Ok(config)
    }

    /// Get the data directory.
    pub fn data_dir() -> PathBuf {
        dirs::data_dir()
            .map(|d| d.join("saler"))
            .unwrap_or_else(|| PathBuf::from(".saler"))
    }

    /// Get the config directory.
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("saler"))
            .unwrap_or_else(|| PathBuf::from(".saler"))
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(path) = var("SALER_DATABASE_PATH") {
            self.storage.database_path = Some(PathBuf::from(path));
        }
        if let Some(interval) = var("SALER_POLL_INTERVAL_MS") {
            if let Ok(parsed) = interval.parse::<u64>() {
                self.worker.poll_interval_ms = parsed;
            }
        }
        if let Some(timeout) = var("SALER_ACTION_TIMEOUT_SECONDS") {
            if let Ok(parsed) = timeout.parse::<u64>() {
                self.engine.action_timeout_seconds = parsed;
            }
        }
        if let Some(endpoint) = var("SALER_AI_ENDPOINT") {
            self.external.ai_endpoint = Some(endpoint);
        }
        if let Some(endpoint) = var("SALER_MESSAGING_ENDPOINT") {
            self.external.messaging_endpoint = Some(endpoint);
        }
        if let Some(format) = var("SALER_LOG_FORMAT") {
            if let Ok(parsed) = format.parse::<LogFormat>() {
                self.logging.format = parsed;
            }
        }
    }

    fn load_partial_from_path(path: &Path) -> Result<PartialConfig> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Cannot read {}: {}", path.display(), e)))?;
        toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Invalid config {}: {}", path.display(), e)))
    }

    fn apply_partial(&mut self, partial: PartialConfig) {
        if let Some(storage) = partial.storage {
            self.storage = storage;
        }
        if let Some(engine) = partial.engine {
            self.engine = engine;
        }
        if let Some(worker) = partial.worker {
            self.worker = worker;
        }
        if let Some(external) = partial.external {
            self.external = external;
        }
        if let Some(logging) = partial.logging {
            self.logging = logging;
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct PartialConfig {
    storage: Option<StorageConfig>,
    engine: Option<EngineConfig>,
    worker: Option<WorkerConfig>,
    external: Option<ExternalConfig>,
    logging: Option<LoggingConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.engine.max_steps_per_run, 10_000);
        assert_eq!(config.engine.retry_base_delay_ms, 500);
        assert_eq!(config.worker.poll_interval_ms, 1000);
        assert_eq!(config.external.api_timeout_seconds, 10);
        assert_eq!(config.logging.format, LogFormat::Text);
    }

    #[test]
    fn test_partial_file_keeps_other_sections() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[engine]
action_timeout_seconds = 5

[logging]
format = "json"
"#
        )
        .unwrap();

        let mut config = Config::default();
        config.apply_partial(Config::load_partial_from_path(file.path()).unwrap());

        assert_eq!(config.engine.action_timeout_seconds, 5);
        assert_eq!(config.engine.max_steps_per_run, 10_000);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.worker, WorkerConfig::default());
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[engine\nbroken").unwrap();
        let err = Config::load_partial_from_path(file.path()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("SALER_DATABASE_PATH", "/tmp/saler-test.db"),
            ("SALER_POLL_INTERVAL_MS", "250"),
            ("SALER_ACTION_TIMEOUT_SECONDS", "not-a-number"),
            ("SALER_LOG_FORMAT", "JSON"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(
            config.storage.resolved_database_path(),
            PathBuf::from("/tmp/saler-test.db")
        );
        assert_eq!(config.worker.poll_interval_ms, 250);
        // Unparseable values leave the default in place
        assert_eq!(config.engine.action_timeout_seconds, 30);
        assert_eq!(config.logging.format, LogFormat::Json);
    }
}
