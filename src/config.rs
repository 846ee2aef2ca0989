//! Configuration module
//!
//! Bus configuration loaded from a TOML file. Every field has a default so
//! a missing or partial file still yields a usable configuration; an
//! unreadable or malformed file is an error, surfaced before the bus is
//! built.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use serde::Deserialize;

use crate::shared::types::errors::{BusError, BusResult};
use crate::shared::utills::retry::RetryConfig;

/// Event bus configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Broker address the embedding application connects to.
    pub amqp_addr: String,
    /// Identity embedded in node-scoped queue names. When unset, falls back
    /// to the HOSTNAME environment variable, then to a random identity
    /// stable for the lifetime of the process.
    pub node_id: Option<String>,
    /// Publish retries after the initial attempt.
    pub publish_retries: u32,
    /// Delay in seconds before the first publish retry; doubles per retry.
    pub publish_retry_delay_secs: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            amqp_addr: "amqp://localhost:5672".to_string(),
            node_id: None,
            publish_retries: 5,
            publish_retry_delay_secs: 2,
        }
    }
}

impl BusConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> BusResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| BusError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config: Self = toml::from_str(&raw)
            .map_err(|e| BusError::Config(format!("invalid config {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Missing connection info is fatal at startup, before the bus exists.
    pub fn validate(&self) -> BusResult<()> {
        if self.amqp_addr.trim().is_empty() {
            return Err(BusError::Config("amqp_addr must not be empty".to_string()));
        }
        Ok(())
    }

    /// Resolved node identity used to suffix node-scoped queue names.
    pub fn resolve_node_id(&self) -> String {
        if let Some(id) = &self.node_id {
            return id.clone();
        }
        if let Ok(host) = std::env::var("HOSTNAME") {
            if !host.is_empty() {
                return host;
            }
        }
        process_fallback_id().to_string()
    }

    /// Retry settings applied to publish attempts.
    pub fn retry(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.publish_retries,
            initial_delay: Duration::from_secs(self.publish_retry_delay_secs),
            ..RetryConfig::default()
        }
    }
}

// Without a configured node_id or HOSTNAME, queue names must still be stable
// within the process so reconnects reuse the same queues.
fn process_fallback_id() -> &'static str {
    static ID: OnceLock<String> = OnceLock::new();
    ID.get_or_init(|| uuid::Uuid::new_v4().simple().to_string())
}

/// Default config file location (~/.config/quiz-eventbus/config.toml).
pub fn default_config_path() -> PathBuf {
    dirs_next::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("quiz-eventbus")
        .join("config.toml")
}
