//! Configuration parsing for the coven daemon.
//!
//! Reads the `key=value` format from `.coven/config`.
//! Precedence: CLI flags > `--config` file > `.coven/config` > defaults.

use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
    #[error("unknown config key: {0}")]
    UnknownKey(String),
}

/// Daemon configuration.
///
/// All paths the daemon touches are derived from the repository root at
/// runtime; the config only carries tunables.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bead source poll interval in milliseconds.
    pub poll_interval_ms: u64,
    /// Interval between `state.snapshot` heartbeat broadcasts.
    pub heartbeat_interval_sec: u64,
    /// Grace between SIGTERM and SIGKILL when stopping an agent.
    pub grace_period_sec: u64,
    /// Grace the daemon gives in-flight workflows at shutdown.
    pub shutdown_grace_sec: u64,

    /// Default timeout for agent steps.
    pub agent_timeout_sec: u64,
    /// Default timeout for script steps.
    pub script_timeout_sec: u64,
    /// Manager-level ceiling for any spawned process without a step timeout.
    pub process_timeout_sec: u64,

    /// Per-agent output ring buffer ceiling in bytes.
    pub buffer_ceiling_bytes: usize,
    /// Debounce window for state.json writes.
    pub persist_debounce_ms: u64,
    /// Per-subscriber event channel depth.
    pub subscriber_buffer: usize,

    /// Bead source CLI (must support `list --ready --json` and
    /// `update <id> --status <s>`).
    pub bead_cmd: String,
    /// Agent CLI invoked by agent steps.
    pub agent_cmd: String,
    /// Extra arguments passed to the agent CLI before the prompt.
    pub agent_args: Vec<String>,

    /// Grimoire used when neither a label nor a mapping selects one.
    /// Empty means the built-in `implement-bead`.
    pub default_grimoire: String,
    /// Branch merge steps target. Empty means the detected default branch.
    pub merge_target: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            heartbeat_interval_sec: 30,
            grace_period_sec: 5,
            shutdown_grace_sec: 10,
            agent_timeout_sec: 15 * 60,
            script_timeout_sec: 5 * 60,
            process_timeout_sec: 30 * 60,
            buffer_ceiling_bytes: 10 * 1024 * 1024,
            persist_debounce_ms: 200,
            subscriber_buffer: 100,
            bead_cmd: "bd".to_string(),
            agent_cmd: "claude".to_string(),
            agent_args: vec![
                "-p".to_string(),
                "--output-format".to_string(),
                "stream-json".to_string(),
            ],
            default_grimoire: String::new(),
            merge_target: String::new(),
        }
    }
}

impl Config {
    /// Load config from a file, merging with defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    /// Load and merge values from a config file.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content)
    }

    /// Parse config content (key=value format).
    pub fn parse_content(&mut self, content: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();

            // Skip empty lines and comments
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };

            let key = key.trim();
            let value = Self::unquote(value.trim());

            self.apply_value(key, &value)?;
        }
        Ok(())
    }

    /// Remove surrounding quotes from a value.
    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
        value.parse().map_err(|_| ConfigError::InvalidInt {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    fn parse_usize(key: &str, value: &str) -> Result<usize, ConfigError> {
        value.parse().map_err(|_| ConfigError::InvalidInt {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    /// Apply a single config value.
    fn apply_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "poll_interval_ms" => self.poll_interval_ms = Self::parse_u64(key, value)?,
            "heartbeat_interval_sec" => {
                self.heartbeat_interval_sec = Self::parse_u64(key, value)?;
            }
            "grace_period_sec" => self.grace_period_sec = Self::parse_u64(key, value)?,
            "shutdown_grace_sec" => self.shutdown_grace_sec = Self::parse_u64(key, value)?,
            "agent_timeout_sec" => self.agent_timeout_sec = Self::parse_u64(key, value)?,
            "script_timeout_sec" => self.script_timeout_sec = Self::parse_u64(key, value)?,
            "process_timeout_sec" => self.process_timeout_sec = Self::parse_u64(key, value)?,
            "buffer_ceiling_bytes" => self.buffer_ceiling_bytes = Self::parse_usize(key, value)?,
            "persist_debounce_ms" => self.persist_debounce_ms = Self::parse_u64(key, value)?,
            "subscriber_buffer" => self.subscriber_buffer = Self::parse_usize(key, value)?,
            "bead_cmd" => self.bead_cmd = value.to_string(),
            "agent_cmd" => self.agent_cmd = value.to_string(),
            "agent_args" => {
                self.agent_args = value.split_whitespace().map(String::from).collect();
            }
            "default_grimoire" => self.default_grimoire = value.to_string(),
            "merge_target" => self.merge_target = value.to_string(),
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_sec)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_sec)
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_timeout_sec)
    }

    pub fn script_timeout(&self) -> Duration {
        Duration::from_secs(self.script_timeout_sec)
    }

    pub fn process_timeout(&self) -> Duration {
        Duration::from_secs(self.process_timeout_sec)
    }
}
