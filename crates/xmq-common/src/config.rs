//! ---
//! xmq_section: "01-core-functionality"
//! xmq_subsection: "module"
//! xmq_type: "source"
//! xmq_scope: "code"
//! xmq_description: "Shared primitives and utilities for the messaging runtime."
//! xmq_version: "v0.0.0-prealpha"
//! xmq_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;

/// Receiver pattern used when neither the configuration nor the caller names one.
pub const DEFAULT_RECEIVER_QUEUE: &str = "/xmessage/*/master/*";

fn default_receiver_queue() -> String {
    DEFAULT_RECEIVER_QUEUE.to_owned()
}

fn default_true() -> bool {
    true
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(250)
}

fn default_stop_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_dump_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

/// Primary configuration object for a messaging node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqConfig {
    /// Identity of this client on the broker. Derived from the host name when absent.
    #[serde(default)]
    pub client_id: Option<String>,
    /// Subscription pattern and implicit destination for outbound messages.
    #[serde(default = "default_receiver_queue")]
    pub default_receiver_queue: String,
    /// Broker endpoints to connect to.
    #[serde(default)]
    pub brokers: Vec<BrokerConfig>,
    /// Key material location and enforcement.
    #[serde(default)]
    pub auth: AuthConfig,
    /// Shared object manager behaviour.
    #[serde(default)]
    pub shared: SharedConfig,
    /// Background listener tuning.
    #[serde(default)]
    pub listener: ListenerConfig,
    /// Optional periodic dump of every shared object.
    #[serde(default)]
    pub dumper: DumperConfig,
    /// Tracing output.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Metadata describing where an [`MqConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedMqConfig {
    pub config: MqConfig,
    pub source: PathBuf,
}

impl MqConfig {
    pub const ENV_CONFIG_PATH: &str = "XMQ_CONFIG";

    /// Load configuration from disk, respecting the `XMQ_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedMqConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(path.clone())?;
                return Ok(LoadedMqConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(path.clone())?;
                return Ok(LoadedMqConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: PathBuf) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<MqConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        if !self.default_receiver_queue.starts_with('/') {
            return Err(anyhow!(
                "default_receiver_queue '{}' must be an absolute queue path",
                self.default_receiver_queue
            ));
        }
        for broker in &self.brokers {
            if broker.url.trim().is_empty() {
                return Err(anyhow!("broker url must not be empty"));
            }
        }
        if self.auth.require && self.auth.key_file.is_none() {
            return Err(anyhow!("auth.require is set but no auth.key_file is configured"));
        }
        if self.listener.poll_interval.is_zero() {
            return Err(anyhow!("listener.poll_interval must be greater than zero"));
        }
        if self.dumper.interval.is_zero() {
            return Err(anyhow!("dumper.interval must be greater than zero"));
        }
        Ok(())
    }

    /// True when any broker requests signing or encryption.
    pub fn wants_auth(&self) -> bool {
        self.auth.require || self.brokers.iter().any(|b| b.sign || b.encrypt)
    }
}

impl Default for MqConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            default_receiver_queue: default_receiver_queue(),
            brokers: Vec::new(),
            auth: AuthConfig::default(),
            shared: SharedConfig::default(),
            listener: ListenerConfig::default(),
            dumper: DumperConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl std::str::FromStr for MqConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: MqConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// One broker endpoint and the authentication applied to traffic through it.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct BrokerConfig {
    pub url: String,
    #[serde(default)]
    pub sign: bool,
    #[serde(default)]
    pub encrypt: bool,
    #[serde(default)]
    pub advisory_status: bool,
    #[serde(default)]
    pub advisory_query: bool,
    #[serde(default)]
    pub advisory_flush_backlog: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthConfig {
    /// Key/value file consumed by the keyring.
    #[serde(default)]
    pub key_file: Option<PathBuf>,
    /// Refuse to start without key material.
    #[serde(default)]
    pub require: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedConfig {
    /// Register unknown subjects named by inbound updates instead of dropping them.
    #[serde(default)]
    pub auto_create: bool,
    /// Queue used as broadcast target for objects created from inbound updates.
    #[serde(default)]
    pub auto_reply_queue: Option<String>,
    /// Derive the auto-reply queue from the subject when none is configured.
    #[serde(default = "default_true")]
    pub derive_auto_reply: bool,
    /// Queue change notifications for consumers.
    #[serde(default)]
    pub notifications: bool,
    /// Emit outbound updates at all.
    #[serde(default = "default_true")]
    pub broadcast: bool,
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self {
            auto_create: false,
            auto_reply_queue: None,
            derive_auto_reply: true,
            notifications: false,
            broadcast: true,
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// Upper bound on how long one receive waits before rechecking cancellation.
    #[serde(default = "default_poll_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub poll_interval: Duration,
    /// How long `stop` waits for the listener to drain and exit.
    #[serde(default = "default_stop_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub stop_timeout: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            stop_timeout: default_stop_timeout(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DumperConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_dump_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub interval: Duration,
}

impl Default for DumperConfig {
    fn default() -> Self {
        Self {
            path: None,
            interval: default_dump_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
client_id = "/xmessage/node1/fst"
default_receiver_queue = "/xmessage/*/fst"

[[brokers]]
url = "mem://broker:1097//xmessage/"
sign = true
advisory_status = true

[auth]
key_file = "/etc/xmq/keys.toml"
require = true

[listener]
poll_interval = 50

[dumper]
path = "/var/tmp/xmq.dump"
interval = 10
"#;

    #[test]
    fn parses_full_document() {
        let config: MqConfig = SAMPLE.parse().expect("valid config");
        assert_eq!(config.client_id.as_deref(), Some("/xmessage/node1/fst"));
        assert_eq!(config.brokers.len(), 1);
        assert!(config.brokers[0].sign);
        assert!(!config.brokers[0].encrypt);
        assert_eq!(config.listener.poll_interval, Duration::from_millis(50));
        assert_eq!(config.dumper.interval, Duration::from_secs(10));
        assert!(config.shared.broadcast);
        assert!(config.wants_auth());
    }

    #[test]
    fn defaults_are_plain_mode() {
        let config: MqConfig = "".parse().expect("empty config is valid");
        assert_eq!(config.default_receiver_queue, DEFAULT_RECEIVER_QUEUE);
        assert!(!config.wants_auth());
        assert!(config.dumper.path.is_none());
    }

    #[test]
    fn require_without_key_file_is_rejected() {
        let err = "[auth]\nrequire = true\n"
            .parse::<MqConfig>()
            .expect_err("must fail");
        assert!(err.to_string().contains("key_file"));
    }

    #[test]
    fn relative_receiver_queue_is_rejected() {
        assert!("default_receiver_queue = \"xmessage\"\n"
            .parse::<MqConfig>()
            .is_err());
    }

    #[test]
    fn load_prefers_first_existing_candidate() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("xmq.toml");
        std::fs::write(&path, SAMPLE).expect("write config");
        let missing = dir.path().join("missing.toml");
        let loaded = MqConfig::load_with_source(&[missing.clone(), path.clone()]).expect("load");
        assert_eq!(loaded.source, path);
        assert_eq!(loaded.config.brokers.len(), 1);
        assert!(MqConfig::load(&[missing]).is_err());
    }
}
