use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, StrapError};

/// Top-level kubestrap configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub ssh: SshConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on concurrently dispatched (step, host) pairs.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Timeout applied to steps that do not set `timeout_ms`.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    /// Ceiling for exponential retry backoff.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default)]
    pub fact_wait: FactWait,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            default_timeout_ms: default_timeout_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            fact_wait: FactWait::default(),
        }
    }
}

fn default_max_parallel() -> usize { 8 }
fn default_timeout_ms() -> u64 { 300_000 }
fn default_max_backoff_ms() -> u64 { 30_000 }

/// How a fact read behaves when the fact has not been written yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FactWait {
    /// Return `MissingFact` immediately.
    #[default]
    FailFast,
    /// Wait until the fact is written or the run is cancelled.
    Block,
}

/// Defaults for SSH connections. Inventory entries override per host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    #[serde(default = "default_ssh_user")]
    pub user: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default)]
    pub identity_file: Option<String>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// How long a multiplexed master connection outlives its last session.
    #[serde(default = "default_control_persist")]
    pub control_persist_secs: u64,
    /// Directory for ControlMaster sockets. Default: system temp dir.
    #[serde(default)]
    pub control_dir: Option<String>,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: default_ssh_user(),
            port: default_ssh_port(),
            identity_file: None,
            connect_timeout_secs: default_connect_timeout(),
            control_persist_secs: default_control_persist(),
            control_dir: None,
            extra_args: vec![],
        }
    }
}

fn default_ssh_user() -> String { "root".to_string() }
fn default_ssh_port() -> u16 { 22 }
fn default_connect_timeout() -> u64 { 10 }
fn default_control_persist() -> u64 { 60 }

/// JSONL run log configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Directory for run logs. One `<run_id>.jsonl` file per run.
    #[serde(default = "default_log_dir")]
    pub dir: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: default_log_dir(),
        }
    }
}

fn default_log_dir() -> String { "~/.kubestrap/runs".to_string() }

impl AppConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = read(path)?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| StrapError::Config(e.to_string()))?;
        info!(
            path = %path.display(),
            max_parallel = config.engine.max_parallel,
            ssh_user = %config.ssh.user,
            "Loaded config"
        );
        Ok(config)
    }

    /// Load config, falling back to defaults when the file does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            debug!(path = %path.display(), "No config file, using defaults");
            Ok(Self::default())
        }
    }

    /// Resolve the run log directory (expand ~).
    pub fn log_dir(&self) -> PathBuf {
        expand_home(&self.log.dir)
    }
}

/// Read a TOML file verbatim and deserialize it.
///
/// Plan files go through here: `${VAR}` in a step command belongs to the
/// remote shell and must reach it untouched.
pub fn load_toml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = read(path)?;
    parse_toml(path, &content)
}

/// Read a TOML file with `${ENV_VAR}` expansion and deserialize it.
pub fn load_toml_with_env<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = read(path)?;
    parse_toml(path, &expand_env_vars(&content))
}

fn read(path: &Path) -> Result<String> {
    debug!(path = %path.display(), "Loading TOML file");
    std::fs::read_to_string(path).map_err(|_| StrapError::ConfigNotFound(path.display().to_string()))
}

fn parse_toml<T: serde::de::DeserializeOwned>(path: &Path, content: &str) -> Result<T> {
    toml::from_str(content).map_err(|e| StrapError::Config(format!("{}: {}", path.display(), e)))
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

/// Expand a leading `~/` to `$HOME`.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_KUBESTRAP_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_KUBESTRAP_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_KUBESTRAP_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_KUBESTRAP_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_KUBESTRAP_VAR}\"");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.engine.max_parallel, 8);
        assert_eq!(config.engine.default_timeout_ms, 300_000);
        assert_eq!(config.engine.fact_wait, FactWait::FailFast);
        assert_eq!(config.ssh.user, "root");
        assert_eq!(config.ssh.port, 22);
        assert!(!config.log.enabled);
    }

    #[test]
    fn test_fact_wait_kebab_case() {
        let config: AppConfig = toml::from_str(
            r#"
[engine]
fact_wait = "block"
max_parallel = 2
"#,
        )
        .unwrap();
        assert_eq!(config.engine.fact_wait, FactWait::Block);
        assert_eq!(config.engine.max_parallel, 2);
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let config = AppConfig::load_or_default(Path::new("/nonexistent/kubestrap.toml")).unwrap();
        assert_eq!(config.ssh.connect_timeout_secs, 10);
    }

    #[test]
    fn test_load_missing_file_is_not_found() {
        let err = AppConfig::load(Path::new("/nonexistent/kubestrap.toml")).unwrap_err();
        assert!(matches!(err, StrapError::ConfigNotFound(_)));
    }

    #[test]
    fn test_expand_home() {
        std::env::set_var("HOME", "/home/ops");
        assert_eq!(expand_home("~/runs"), PathBuf::from("/home/ops/runs"));
        assert_eq!(expand_home("/var/log"), PathBuf::from("/var/log"));
    }
}
