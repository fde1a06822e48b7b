//! Configuration parsing for the iteration engine.
//!
//! Uses a `key=value` format read from `.taskloop/config`.
//! Precedence: CLI flags > `--config` file > `.taskloop/config` > defaults.

use crate::types::ErrorStrategy;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default config location, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = ".taskloop/config";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
    #[error("unknown config key: {0}")]
    UnknownKey(String),
}

/// Error handling policy applied when an iteration fails.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ErrorHandling {
    pub strategy: ErrorStrategy,
    /// Retries per task before it is skipped (only for `retry`).
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for ErrorHandling {
    fn default() -> Self {
        Self {
            strategy: ErrorStrategy::Skip,
            max_retries: 3,
            retry_delay_ms: 5000,
        }
    }
}

/// Engine and adapter configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    /// Working directory handed to the agent and the session store.
    pub cwd: PathBuf,

    // Agent
    pub agent_command: String,
    pub agent_args: Vec<String>,
    pub model: Option<String>,
    /// Per-execution timeout in seconds (0 = no timeout).
    pub agent_timeout_sec: u64,

    // Loop control
    /// Iteration cap (0 = unlimited).
    pub max_iterations: u32,
    pub iteration_delay_ms: u64,
    pub error_handling: ErrorHandling,

    // Tracker
    pub tracker_file: PathBuf,
    /// Epic whose description is included in prompts.
    pub epic_id: Option<String>,

    // Prompt
    pub prompt_file: Option<PathBuf>,

    // Persistence
    pub session_db: PathBuf,
    pub log_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cwd: PathBuf::from("."),
            agent_command: "claude".to_string(),
            agent_args: vec!["-p".to_string(), "--dangerously-skip-permissions".to_string()],
            model: None,
            agent_timeout_sec: 0,
            max_iterations: 10,
            iteration_delay_ms: 1000,
            error_handling: ErrorHandling::default(),
            tracker_file: PathBuf::from(".taskloop/tasks.json"),
            epic_id: None,
            prompt_file: None,
            session_db: PathBuf::from(".taskloop/session.db"),
            log_dir: PathBuf::from(".taskloop/iterations"),
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

    /// Resolve a path relative to `cwd` unless it is already absolute.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.cwd.join(path)
        }
    }

    /// Per-execution agent timeout; `None` when `agent_timeout_sec` is 0.
    pub fn agent_timeout(&self) -> Option<Duration> {
        (self.agent_timeout_sec > 0).then(|| Duration::from_secs(self.agent_timeout_sec))
    }

    /// Model-selection flags passed to the agent.
    pub fn model_flags(&self) -> Vec<String> {
        match &self.model {
            Some(model) => vec!["--model".to_string(), model.clone()],
            None => Vec::new(),
        }
    }

    /// Parse config content (key=value format).
    pub fn parse_content(&mut self, content: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();

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

    fn optional(value: &str) -> Option<String> {
        if value.is_empty() {
            None
        } else {
            Some(value.to_string())
        }
    }

    fn parse_int<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
        value.parse().map_err(|_| ConfigError::InvalidInt {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    /// Apply a single config value.
    fn apply_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "cwd" => self.cwd = PathBuf::from(value),
            "agent_command" => self.agent_command = value.to_string(),
            "agent_args" => {
                self.agent_args = value.split_whitespace().map(str::to_string).collect();
            }
            "model" => self.model = Self::optional(value),
            "agent_timeout_sec" => self.agent_timeout_sec = Self::parse_int(key, value)?,
            "max_iterations" => self.max_iterations = Self::parse_int(key, value)?,
            "iteration_delay_ms" => self.iteration_delay_ms = Self::parse_int(key, value)?,
            "error_strategy" => {
                self.error_handling.strategy =
                    value.parse().map_err(ConfigError::InvalidLine)?;
            }
            "max_retries" => self.error_handling.max_retries = Self::parse_int(key, value)?,
            "retry_delay_ms" => self.error_handling.retry_delay_ms = Self::parse_int(key, value)?,
            "tracker_file" => self.tracker_file = PathBuf::from(value),
            "epic_id" => self.epic_id = Self::optional(value),
            "prompt_file" => self.prompt_file = Self::optional(value).map(PathBuf::from),
            "session_db" => self.session_db = PathBuf::from(value),
            "log_dir" => self.log_dir = PathBuf::from(value),
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn default_values() {
        let config = Config::default();
        assert_eq!(config.agent_command, "claude");
        assert_eq!(config.max_iterations, 10);
        assert_eq!(config.iteration_delay_ms, 1000);
        assert_eq!(config.error_handling.strategy, ErrorStrategy::Skip);
        assert_eq!(config.error_handling.max_retries, 3);
        assert_eq!(config.error_handling.retry_delay_ms, 5000);
        assert!(config.model.is_none());
        assert!(config.agent_timeout().is_none());
    }

    #[test]
    fn agent_timeout_from_seconds() {
        let config = Config {
            agent_timeout_sec: 90,
            ..Config::default()
        };
        assert_eq!(config.agent_timeout(), Some(Duration::from_secs(90)));
    }

    #[test]
    fn parse_simple_config() {
        let mut config = Config::default();
        config
            .parse_content(
                r#"
# Loop settings
max_iterations=25
error_strategy="retry"
max_retries=2
retry_delay_ms=250
model='sonnet'
agent_args=-p --verbose
"#,
            )
            .unwrap();

        assert_eq!(config.max_iterations, 25);
        assert_eq!(config.error_handling.strategy, ErrorStrategy::Retry);
        assert_eq!(config.error_handling.max_retries, 2);
        assert_eq!(config.error_handling.retry_delay_ms, 250);
        assert_eq!(config.model.as_deref(), Some("sonnet"));
        assert_eq!(config.agent_args, vec!["-p", "--verbose"]);
    }

    #[test]
    fn empty_optional_values_clear_the_field() {
        let mut config = Config {
            model: Some("opus".to_string()),
            ..Config::default()
        };
        config.parse_content("model=\nepic_id=").unwrap();
        assert!(config.model.is_none());
        assert!(config.epic_id.is_none());
    }

    #[test]
    fn invalid_integer_is_rejected() {
        let mut config = Config::default();
        let err = config.parse_content("max_iterations=lots").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidInt { ref key, .. } if key == "max_iterations"));
    }

    #[test]
    fn invalid_strategy_is_rejected() {
        let mut config = Config::default();
        let err = config.parse_content("error_strategy=panic").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidLine(_)));
    }

    #[test]
    fn unknown_key_is_rejected() {
        let mut config = Config::default();
        let err = config.parse_content("colour=blue").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownKey(ref k) if k == "colour"));
    }

    #[test]
    fn line_without_equals_is_rejected() {
        let mut config = Config::default();
        assert!(matches!(
            config.parse_content("just some words"),
            Err(ConfigError::InvalidLine(_))
        ));
    }

    #[test]
    fn from_file_merges_with_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "max_iterations=0").unwrap();
        writeln!(file, "tracker_file=tasks/backlog.json").unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.max_iterations, 0);
        assert_eq!(config.tracker_file, PathBuf::from("tasks/backlog.json"));
        assert_eq!(config.agent_command, "claude");
    }

    #[test]
    fn resolve_joins_relative_paths_to_cwd() {
        let config = Config {
            cwd: PathBuf::from("/work"),
            ..Config::default()
        };
        assert_eq!(
            config.resolve(Path::new(".taskloop/tasks.json")),
            PathBuf::from("/work/.taskloop/tasks.json")
        );
        assert_eq!(config.resolve(Path::new("/abs")), PathBuf::from("/abs"));
    }

    #[test]
    fn model_flags_only_when_model_set() {
        assert!(Config::default().model_flags().is_empty());
        let config = Config {
            model: Some("haiku".to_string()),
            ..Config::default()
        };
        assert_eq!(config.model_flags(), vec!["--model", "haiku"]);
    }
}
