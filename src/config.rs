//! Configuration
//!
//! Runner settings load from an optional YAML file, then `RUNWATCH_*`
//! environment variables override individual keys. Consumer-side settings
//! ([`ReaderConfig`], [`WatchConfig`]) are plain structs with defaults.
//!
//! # Environment
//!
//! | Variable                  | Key              |
//! |---------------------------|------------------|
//! | `RUNWATCH_STATE_PATH`     | `state_path`     |
//! | `RUNWATCH_CONTROL_SOCKET` | `control_socket` |
//! | `RUNWATCH_BINARY_DIR`     | `binary_dir`     |
//! | `RUNWATCH_SECRETS`        | `secrets` (comma separated) |
//! | `RUNWATCH_REVEAL_LAST`    | `reveal_last`    |
//! | `RUNWATCH_PAUSE_SCOPE`    | `pause_scope`    |

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::obfuscator::{FullMask, Replacer, RevealLast};
use crate::process::PauseScope;

/// Where `setup` provisions the runner binary by default.
pub const DEFAULT_BINARY_DIR: &str = "/.runwatch/bin";

/// How often running commands are checked against their time limits.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Interval between resource usage samples.
pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_millis(500);

/// Default location of the persisted execution state.
pub static DEFAULT_STATE_PATH: Lazy<PathBuf> =
    Lazy::new(|| runtime_dir().join("state.json"));

/// Default location of the control socket.
pub static DEFAULT_CONTROL_SOCKET: Lazy<PathBuf> =
    Lazy::new(|| runtime_dir().join("control.sock"));

fn runtime_dir() -> PathBuf {
    // A shared volume mounted at /.runwatch takes precedence over tmp
    let shared = PathBuf::from("/.runwatch");
    if shared.is_dir() {
        debug!("Using shared runtime directory {}", shared.display());
        return shared;
    }
    std::env::temp_dir().join("runwatch")
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid value '{value}' for {key}")]
    InvalidValue { key: &'static str, value: String },
}

/// Settings of the in-container runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub state_path: PathBuf,
    pub control_socket: PathBuf,
    pub binary_dir: PathBuf,
    /// Values redacted from step output
    pub secrets: Vec<String>,
    /// Keep this many trailing characters of each secret visible
    pub reveal_last: Option<usize>,
    pub pause_scope: PauseScope,
    pub check_interval_ms: u64,
    pub monitor_interval_ms: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            state_path: DEFAULT_STATE_PATH.clone(),
            control_socket: DEFAULT_CONTROL_SOCKET.clone(),
            binary_dir: PathBuf::from(DEFAULT_BINARY_DIR),
            secrets: Vec::new(),
            reveal_last: None,
            pause_scope: PauseScope::default(),
            check_interval_ms: DEFAULT_CHECK_INTERVAL.as_millis() as u64,
            monitor_interval_ms: DEFAULT_MONITOR_INTERVAL.as_millis() as u64,
        }
    }
}

impl RunnerConfig {
    /// Loads a YAML config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = serde_yaml::from_str(&content).map_err(|source| ConfigError::Yaml {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Loaded runner config from {}", path.display());
        Ok(config)
    }

    /// Loads the file when given, then applies the process environment.
    pub fn resolve(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Overrides keys from `RUNWATCH_*` variables found by `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("RUNWATCH_STATE_PATH") {
            self.state_path = PathBuf::from(path);
        }
        if let Some(path) = lookup("RUNWATCH_CONTROL_SOCKET") {
            self.control_socket = PathBuf::from(path);
        }
        if let Some(dir) = lookup("RUNWATCH_BINARY_DIR") {
            self.binary_dir = PathBuf::from(dir);
        }
        if let Some(secrets) = lookup("RUNWATCH_SECRETS") {
            self.secrets.extend(
                secrets
                    .split(',')
                    .filter(|s| !s.is_empty())
                    .map(str::to_string),
            );
        }
        if let Some(reveal) = lookup("RUNWATCH_REVEAL_LAST") {
            let count = reveal.parse().map_err(|_| ConfigError::InvalidValue {
                key: "RUNWATCH_REVEAL_LAST",
                value: reveal.clone(),
            })?;
            self.reveal_last = Some(count);
        }
        if let Some(scope) = lookup("RUNWATCH_PAUSE_SCOPE") {
            self.pause_scope = match scope.as_str() {
                "subtree" => PauseScope::Subtree,
                "container" => PauseScope::Container,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: "RUNWATCH_PAUSE_SCOPE",
                        value: scope,
                    })
                }
            };
        }
        Ok(())
    }

    /// Replacement strategy for redacted secrets.
    pub fn replacer(&self) -> Box<dyn Replacer> {
        match self.reveal_last {
            Some(count) => Box::new(RevealLast(count)),
            None => Box::new(FullMask::default()),
        }
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms.max(1))
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms.max(1))
    }
}

/// Settings of the log stream reader.
#[derive(Debug, Clone, PartialEq)]
pub struct ReaderConfig {
    /// Keep the stream open and reopen it on early end
    pub follow: bool,
    /// Retries for one transient error streak
    pub max_retries: u32,
    /// Silence tolerated once the container is known finished
    pub idle_timeout: Duration,
    /// How often a silent stream re-checks state
    pub poll_interval: Duration,
    /// Pause before reopening an ended stream
    pub reopen_delay: Duration,
    pub chunk_max_bytes: usize,
    pub chunk_max_age: Duration,
    pub channel_capacity: usize,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            follow: true,
            max_retries: 5,
            idle_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(200),
            reopen_delay: Duration::from_millis(250),
            chunk_max_bytes: 16 * 1024,
            chunk_max_age: Duration::from_millis(500),
            channel_capacity: 64,
        }
    }
}

/// Settings of the watch orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchConfig {
    /// Stream logs while containers run; otherwise read finished ones once
    pub follow: bool,
    /// Re-list the unit after this long without lifecycle events
    pub silence_timeout: Duration,
    pub channel_capacity: usize,
    pub reader: ReaderConfig,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            follow: true,
            silence_timeout: Duration::from_secs(10),
            channel_capacity: 128,
            reader: ReaderConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = RunnerConfig::default();
        assert_eq!(config.binary_dir, PathBuf::from(DEFAULT_BINARY_DIR));
        assert!(config.state_path.ends_with("state.json"));
        assert!(config.control_socket.ends_with("control.sock"));
        assert_eq!(config.check_interval(), DEFAULT_CHECK_INTERVAL);
        assert_eq!(config.pause_scope, PauseScope::Subtree);
    }

    #[test]
    fn test_load_yaml_with_partial_keys() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("runner.yaml");
        fs::write(
            &path,
            "state_path: /data/state.json\nsecrets: [abc]\npause_scope: container\n",
        )
        .unwrap();

        let config = RunnerConfig::load(&path).unwrap();
        assert_eq!(config.state_path, PathBuf::from("/data/state.json"));
        assert_eq!(config.secrets, vec!["abc"]);
        assert_eq!(config.pause_scope, PauseScope::Container);
        assert_eq!(config.binary_dir, PathBuf::from(DEFAULT_BINARY_DIR));
    }

    #[test]
    fn test_load_errors() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            RunnerConfig::load(&dir.path().join("missing.yaml")),
            Err(ConfigError::Io { .. })
        ));
        let path = dir.path().join("bad.yaml");
        fs::write(&path, "check_interval_ms: [not, a, number]").unwrap();
        assert!(matches!(
            RunnerConfig::load(&path),
            Err(ConfigError::Yaml { .. })
        ));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = RunnerConfig::default();
        config.secrets = vec!["from-file".into()];
        config
            .apply_env(env(&[
                ("RUNWATCH_STATE_PATH", "/tmp/s.json"),
                ("RUNWATCH_SECRETS", "one,two"),
                ("RUNWATCH_REVEAL_LAST", "3"),
                ("RUNWATCH_PAUSE_SCOPE", "container"),
            ]))
            .unwrap();

        assert_eq!(config.state_path, PathBuf::from("/tmp/s.json"));
        assert_eq!(config.secrets, vec!["from-file", "one", "two"]);
        assert_eq!(config.reveal_last, Some(3));
        assert_eq!(config.pause_scope, PauseScope::Container);
        assert_eq!(config.replacer().replace(b"abcdef"), b"***def".to_vec());
    }

    #[test]
    fn test_invalid_env_values() {
        let mut config = RunnerConfig::default();
        assert!(matches!(
            config.apply_env(env(&[("RUNWATCH_REVEAL_LAST", "many")])),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            config.apply_env(env(&[("RUNWATCH_PAUSE_SCOPE", "everything")])),
            Err(ConfigError::InvalidValue { .. })
        ));
    }
}
