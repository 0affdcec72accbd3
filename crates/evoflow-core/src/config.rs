use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{EvoflowError, Result};

/// Top-level EvoFlow configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub store: StoreConfig,
    /// JSONL event logging configuration.
    #[serde(default)]
    pub log: Option<LogConfig>,
}

/// What happens to the rest of a run once a node fails permanently.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop dispatching on the first permanent failure.
    #[default]
    FailFast,
    /// Keep running independent branches until the frontier is exhausted.
    BestEffort,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum agent executions running at once per workflow execution.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    /// Per-attempt deadline applied when neither the node nor the agent sets one.
    #[serde(default)]
    pub default_timeout_secs: Option<u64>,
    #[serde(default = "default_workspace")]
    pub workspace: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            failure_policy: FailurePolicy::default(),
            default_timeout_secs: None,
            workspace: default_workspace(),
        }
    }
}

fn default_max_concurrency() -> usize {
    4
}

fn default_workspace() -> String {
    "~/.evoflow".to_string()
}

/// Retry configuration with exponential backoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Multiply each delay by a random factor in 0.8..1.2.
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            jitter: default_jitter(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_jitter() -> bool {
    true
}

/// SQLite execution history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_enabled")]
    pub enabled: bool,
    /// Database file. Relative paths resolve against the workspace.
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            enabled: default_store_enabled(),
            path: default_store_path(),
        }
    }
}

fn default_store_enabled() -> bool {
    true
}

fn default_store_path() -> String {
    "executions.db".to_string()
}

/// JSONL event logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable event logging (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files. Default: <workspace>/logs
    #[serde(default)]
    pub log_dir: Option<String>,
}

fn default_log_enabled() -> bool {
    true
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| EvoflowError::ConfigNotFound(path.display().to_string()))?;

        let config = Self::parse(&content)?;
        debug!(path = %path.display(), "Config loaded");
        Ok(config)
    }

    /// Parse config from TOML text, with env var expansion.
    pub fn parse(content: &str) -> Result<Self> {
        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| EvoflowError::Config(e.to_string()))?;
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<()> {
        if self.engine.max_concurrency == 0 {
            return Err(EvoflowError::Config(
                "engine.max_concurrency must be at least 1".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(EvoflowError::Config(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Resolve the workspace directory (expand ~).
    pub fn workspace_dir(&self) -> PathBuf {
        let ws = &self.engine.workspace;
        if let Some(rest) = ws.strip_prefix("~/") {
            if let Some(home) = dirs_home() {
                return home.join(rest);
            }
        }
        PathBuf::from(ws)
    }

    /// Resolve the SQLite database path.
    pub fn store_path(&self) -> PathBuf {
        resolve_in(&self.workspace_dir(), &self.store.path)
    }

    /// Resolve the JSONL log directory, if logging is enabled.
    pub fn log_dir(&self) -> Option<PathBuf> {
        let log = self.log.as_ref().filter(|l| l.enabled)?;
        let dir = log.log_dir.as_deref().unwrap_or("logs");
        Some(resolve_in(&self.workspace_dir(), dir))
    }
}

fn resolve_in(base: &Path, path: &str) -> PathBuf {
    let p = PathBuf::from(path);
    if p.is_absolute() {
        p
    } else {
        base.join(p)
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_EVOFLOW_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_EVOFLOW_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_EVOFLOW_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_EVOFLOW_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_EVOFLOW_VAR}\"");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config = AppConfig::parse("").unwrap();
        assert_eq!(config.engine.max_concurrency, 4);
        assert_eq!(config.engine.failure_policy, FailurePolicy::FailFast);
        assert!(config.engine.default_timeout_secs.is_none());
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.initial_backoff_ms, 500);
        assert_eq!(config.retry.max_backoff_ms, 30_000);
        assert!(config.store.enabled);
        assert!(config.log.is_none());
    }

    #[test]
    fn test_best_effort_policy() {
        let config = AppConfig::parse(
            r#"
[engine]
failure_policy = "best_effort"
max_concurrency = 2
"#,
        )
        .unwrap();
        assert_eq!(config.engine.failure_policy, FailurePolicy::BestEffort);
        assert_eq!(config.engine.max_concurrency, 2);
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let err = AppConfig::parse("[engine]\nmax_concurrency = 0\n").unwrap_err();
        assert!(matches!(err, EvoflowError::Config(_)));
    }

    #[test]
    fn test_paths_resolve_against_workspace() {
        let config = AppConfig::parse(
            r#"
[engine]
workspace = "/tmp/evoflow-ws"

[store]
path = "history.db"

[log]
"#,
        )
        .unwrap();
        assert_eq!(config.store_path(), PathBuf::from("/tmp/evoflow-ws/history.db"));
        assert_eq!(config.log_dir(), Some(PathBuf::from("/tmp/evoflow-ws/logs")));
    }
}
