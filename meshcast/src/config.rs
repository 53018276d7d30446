//! Relay core configuration

use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Mesh configuration shared by broadcaster and viewer sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Ceiling on direct links the broadcaster maintains before offloading to relays
    pub max_direct_connections: usize,
    /// Direct link count at which the broadcaster reports it is near capacity
    pub relay_threshold: usize,
    /// How often a relay reports its sub-tree size upstream
    pub count_report_interval_ms: u64,
    /// How often the broadcaster publishes the aggregate viewer count
    pub publish_interval_ms: u64,
    /// How often a viewer without an inbound link re-announces itself
    pub join_retry_interval_ms: u64,
    /// STUN/TURN URLs handed to the peer-connection library
    pub ice_servers: Vec<String>,
    pub logging: LoggingConfig,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            max_direct_connections: 10,
            relay_threshold: 5,
            count_report_interval_ms: 5000,
            publish_interval_ms: 5000,
            join_retry_interval_ms: 5000,
            ice_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            logging: LoggingConfig::default(),
        }
    }
}

/// Log output layout
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One JSON object per event
    Json,
    /// Single-line human readable output
    #[default]
    Compact,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Level for the meshcast crates; `RUST_LOG` overrides it entirely
    pub level: String,
    pub format: LogFormat,
    /// Level for everything else, mostly the peer-connection stack
    pub dependency_level: String,
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
            dependency_level: "warn".to_string(),
            ansi: true,
        }
    }
}

impl MeshConfig {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // MESHCAST_MAX_DIRECT_CONNECTIONS etc. Single-underscore field names
        // are matched through the `__` nesting separator.
        builder = builder.add_source(
            Environment::with_prefix("MESHCAST")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("ice_servers"),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Check invariants between fields, collecting every problem found
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.max_direct_connections == 0 {
            errors.push("max_direct_connections must be at least 1".to_string());
        }
        if self.relay_threshold > self.max_direct_connections {
            errors.push(format!(
                "relay_threshold ({}) must not exceed max_direct_connections ({})",
                self.relay_threshold, self.max_direct_connections
            ));
        }
        for (name, value) in [
            ("count_report_interval_ms", self.count_report_interval_ms),
            ("publish_interval_ms", self.publish_interval_ms),
            ("join_retry_interval_ms", self.join_retry_interval_ms),
        ] {
            if value == 0 {
                errors.push(format!("{name} must be greater than zero"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    #[must_use]
    pub const fn count_report_interval(&self) -> Duration {
        Duration::from_millis(self.count_report_interval_ms)
    }

    #[must_use]
    pub const fn publish_interval(&self) -> Duration {
        Duration::from_millis(self.publish_interval_ms)
    }

    #[must_use]
    pub const fn join_retry_interval(&self) -> Duration {
        Duration::from_millis(self.join_retry_interval_ms)
    }
}
