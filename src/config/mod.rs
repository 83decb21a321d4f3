//! Sentinel configuration.
//!
//! Unlike an older generation of this codebase, configuration is not a
//! process-wide `OnceLock` singleton: callers load a [`Config`] once at
//! startup and thread it explicitly through listener, handler and notifier
//! construction. The only process-wide mutable state left is the running
//! flag and a handful of counters (see `sentinel::Sentinel`).
//!
//! ## Loading order
//!
//! 1. `SENTINEL_ALERT_CONFIG` environment variable (path to a TOML file)
//! 2. `./sentinel.toml` in the current working directory
//! 3. `~/.config/alert-sentinel/sentinel.toml`
//! 4. Built-in defaults (see [`Config::default`])

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

const ENV_VAR: &str = "SENTINEL_ALERT_CONFIG";
const LOCAL_FILE: &str = "sentinel.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Which transport the listener uses to ingest notices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ListenerMode {
    /// Kafka-compatible streaming broker with SASL authentication.
    Stream,
    /// Legacy VOEvent Transport Protocol socket.
    Socket,
}

impl Default for ListenerMode {
    fn default() -> Self {
        ListenerMode::Stream
    }
}

/// SASL mechanism used to authenticate to the streaming broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SaslMechanism {
    Plain,
    Oauthbearer,
}

impl Default for SaslMechanism {
    fn default() -> Self {
        SaslMechanism::Plain
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KafkaConfig {
    pub brokers: String,
    pub user: String,
    pub password: String,
    pub mechanism: SaslMechanism,
    /// Token endpoint used to mint OAUTHBEARER tokens; ignored for PLAIN.
    pub oauth_token_url: Option<String>,
    pub group_id: String,
    /// Replay from the earliest retained offset instead of LATEST.
    pub backdate: bool,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            user: String::new(),
            password: String::new(),
            mechanism: SaslMechanism::default(),
            oauth_token_url: None,
            group_id: "alert-sentinel".to_string(),
            backdate: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    /// `host:port` pairs to cycle through on reconnect.
    pub addresses: Vec<String>,
    pub keepalive_secs: u64,
    pub max_reconnect_backoff_secs: u64,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            addresses: vec!["voserver.example.org:8099".to_string()],
            keepalive_secs: 90,
            max_reconnect_backoff_secs: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub enable_slack: bool,
    pub slack_bot_token: String,
    pub slack_default_channel: String,
    pub slack_wakeup_channel: Option<String>,
    pub slack_ignored_channel: Option<String>,
    /// Per-event-type channel overrides, keyed by `GW` / `GRB` / `NU`.
    pub slack_event_channels: HashMap<String, String>,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            enable_slack: false,
            slack_bot_token: String::new(),
            slack_default_channel: "#alerts".to_string(),
            slack_wakeup_channel: None,
            slack_ignored_channel: None,
            slack_event_channels: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base directory for transient artifacts (downloaded skymaps, plots).
    pub file_path: PathBuf,
    /// Output directory for rendered reports.
    pub html_path: PathBuf,
    /// Notice roles that are silently skipped by the dispatcher.
    pub ignored_roles: Vec<String>,
    /// Process `role=test` notices instead of skipping them.
    pub process_test_notices: bool,
    /// Local IVORN authority used when synthesizing a missing IVORN.
    pub local_ivo: String,
    pub listener_mode: ListenerMode,
    pub kafka: KafkaConfig,
    pub socket: SocketConfig,
    pub notify: NotifyConfig,
    /// Timeout for HTTP skymap downloads, in seconds.
    pub skymap_download_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            file_path: PathBuf::from("."),
            html_path: PathBuf::from("./html"),
            ignored_roles: vec!["utility".to_string()],
            process_test_notices: false,
            local_ivo: "ivo://localhost/alert-sentinel".to_string(),
            listener_mode: ListenerMode::default(),
            kafka: KafkaConfig::default(),
            socket: SocketConfig::default(),
            notify: NotifyConfig::default(),
            skymap_download_timeout_secs: 60,
        }
    }
}

impl Config {
    /// Effective set of ignored roles, folding in the `test` role unless
    /// `process_test_notices` is set.
    pub fn effective_ignored_roles(&self) -> Vec<String> {
        let mut roles = self.ignored_roles.clone();
        if !self.process_test_notices && !roles.iter().any(|r| r == "test") {
            roles.push("test".to_string());
        }
        roles
    }

    /// Load configuration following the documented search order, falling
    /// back to [`Config::default`] if nothing is found.
    pub fn load() -> Result<Self, ConfigError> {
        if let Ok(path) = std::env::var(ENV_VAR) {
            return Self::from_file(&path);
        }
        if Path::new(LOCAL_FILE).is_file() {
            return Self::from_file(LOCAL_FILE);
        }
        if let Some(home) = dirs_home() {
            let candidate = home.join(".config/alert-sentinel").join(LOCAL_FILE);
            if candidate.is_file() {
                return Self::from_file(&candidate);
            }
        }
        tracing::info!("no sentinel.toml found, using built-in defaults");
        Ok(Self::default())
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::info!(path = %path.display(), "loaded sentinel configuration");
        Ok(config)
    }
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_ignores_utility_and_test() {
        let config = Config::default();
        let roles = config.effective_ignored_roles();
        assert!(roles.iter().any(|r| r == "utility"));
        assert!(roles.iter().any(|r| r == "test"));
    }

    #[test]
    fn process_test_notices_keeps_test_role() {
        let mut config = Config::default();
        config.process_test_notices = true;
        let roles = config.effective_ignored_roles();
        assert!(!roles.iter().any(|r| r == "test"));
    }

    #[test]
    fn from_file_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("sentinel.toml");
        std::fs::write(
            &path,
            r#"
            local_ivo = "ivo://test/alert-sentinel"
            [kafka]
            brokers = "broker.example:9092"
            "#,
        )
        .expect("write config");
        let config = Config::from_file(&path).expect("parse config");
        assert_eq!(config.local_ivo, "ivo://test/alert-sentinel");
        assert_eq!(config.kafka.brokers, "broker.example:9092");
    }
}
