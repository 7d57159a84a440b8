//! Typed configuration from environment variables or a TOML file.
//!
//! Loads once at startup and fails fast on values that don't parse.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Tuning knobs for a [`Dispatcher`](crate::engine::Dispatcher).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Worker hooks allowed to run at the same time.
    pub max_parallel: usize,
    /// How long the dispatch loop waits on an empty queue before
    /// re-checking the stop flag.
    pub poll_interval_ms: u64,
    /// Capacity of the completed and failed buffers.
    pub history_capacity: usize,
    /// Capacity of the event log.
    pub event_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_parallel: 10,
            poll_interval_ms: 1000,
            history_capacity: 100,
            event_capacity: 1000,
        }
    }
}

impl DispatcherConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_parallel == 0 {
            return Err(Error::Config("max_parallel must be at least 1".to_string()));
        }
        if self.poll_interval_ms == 0 {
            return Err(Error::Config(
                "poll_interval_ms must be at least 1".to_string(),
            ));
        }
        if self.history_capacity == 0 {
            return Err(Error::Config(
                "history_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Process-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub otel_endpoint: Option<String>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dispatcher: DispatcherConfig::default(),
            otel_endpoint: None,
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let defaults = DispatcherConfig::default();
        let dispatcher = DispatcherConfig {
            max_parallel: parsed_var("PLANQ_MAX_PARALLEL", defaults.max_parallel)?,
            poll_interval_ms: parsed_var("PLANQ_POLL_INTERVAL_MS", defaults.poll_interval_ms)?,
            history_capacity: parsed_var("PLANQ_HISTORY_CAPACITY", defaults.history_capacity)?,
            event_capacity: parsed_var("PLANQ_EVENT_CAPACITY", defaults.event_capacity)?,
        };
        dispatcher.validate()?;

        Ok(Self {
            dispatcher,
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| default_log_level()),
        })
    }

    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("bad config {}: {e}", path.display())))?;
        config.dispatcher.validate()?;
        Ok(config)
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn parsed_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("invalid {name}={raw:?}: {e}"))),
        Err(_) => Ok(default),
    }
}
