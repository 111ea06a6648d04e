//! Consumer configuration.
//!
//! Configuration is loaded from environment variables with defaults suited to
//! local development, then validated before a consumer is built from it.

use platform_bus::BusError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Invalid configuration value.
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue {
        /// Configuration key.
        key: String,
        /// Error message.
        message: String,
    },
}

impl ConfigError {
    fn invalid(key: &str, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.to_string(),
            message: message.into(),
        }
    }
}

impl From<ConfigError> for BusError {
    fn from(err: ConfigError) -> Self {
        BusError::Config(err.to_string())
    }
}

/// Settings for a transport-backed consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Topics to consume, without prefix.
    pub topics: Vec<String>,

    /// Namespace prefix joined to every topic.
    pub topic_prefix: String,

    /// Maximum wait of a single transport poll in milliseconds.
    pub poll_timeout_ms: u64,

    /// Pause the transport while the subscriber reports no demand.
    pub respect_demand: bool,

    /// Acknowledge messages whose handler panicked.
    pub commit_on_panic: bool,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            topics: Vec::new(),
            topic_prefix: String::new(),
            poll_timeout_ms: 100,
            respect_demand: true,
            commit_on_panic: true,
        }
    }
}

impl ConsumerConfig {
    /// Configuration for `topics` with defaults for everything else.
    pub fn for_topics<I, S>(topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            topics: topics.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `BUS_TOPICS`: Comma-separated topic list
    /// - `BUS_TOPIC_PREFIX`: Topic namespace prefix (default: none)
    /// - `BUS_POLL_TIMEOUT_MS`: Poll timeout in milliseconds (default: 100)
    /// - `BUS_RESPECT_DEMAND`: Pause on zero demand (default: true)
    /// - `BUS_COMMIT_ON_PANIC`: Commit messages whose handler panicked (default: true)
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            topics: std::env::var("BUS_TOPICS")
                .map(|s| parse_topics(&s))
                .unwrap_or(default.topics),
            topic_prefix: std::env::var("BUS_TOPIC_PREFIX").unwrap_or(default.topic_prefix),
            poll_timeout_ms: std::env::var("BUS_POLL_TIMEOUT_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(default.poll_timeout_ms),
            respect_demand: std::env::var("BUS_RESPECT_DEMAND")
                .map(|s| s != "false" && s != "0")
                .unwrap_or(default.respect_demand),
            commit_on_panic: std::env::var("BUS_COMMIT_ON_PANIC")
                .map(|s| s != "false" && s != "0")
                .unwrap_or(default.commit_on_panic),
        }
    }

    /// Get the poll timeout as a Duration.
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    /// Check that the configuration can drive a consumer.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.topics.is_empty() {
            return Err(ConfigError::invalid("topics", "at least one topic is required"));
        }
        if self.topics.iter().any(|t| t.trim().is_empty()) {
            return Err(ConfigError::invalid("topics", "topic names must not be empty"));
        }
        if self.poll_timeout_ms == 0 {
            return Err(ConfigError::invalid("poll_timeout_ms", "must be greater than zero"));
        }
        Ok(())
    }
}

fn parse_topics(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(String::from)
        .collect()
}
