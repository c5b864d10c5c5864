//! Multiplexer configuration

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Tunables for the multiplexer and its socket bridges
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MuxConfig {
    /// Bound on creating and binding a tunnel for one accepted connection
    #[serde(with = "duration_secs")]
    pub dial_timeout: Duration,

    /// Capacity of each tunnel's inbound and outbound queues
    pub queue_depth: usize,

    /// Buffer size for reads from local sockets
    pub read_chunk_size: usize,

    /// How long the demux loop waits on one slow tunnel before closing it.
    /// `None` blocks indefinitely.
    #[serde(with = "duration_secs_option")]
    pub inbound_deliver_timeout: Option<Duration>,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(30),
            queue_depth: 16,
            read_chunk_size: 16384,
            inbound_deliver_timeout: None,
        }
    }
}

impl MuxConfig {
    pub fn builder() -> MuxConfigBuilder {
        MuxConfigBuilder::default()
    }

    /// Parse a YAML document, filling unspecified fields with defaults
    pub fn from_yaml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: MuxConfig = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_depth == 0 {
            return Err(ConfigError::Invalid(
                "queue_depth must be at least 1".to_string(),
            ));
        }
        if self.read_chunk_size == 0 {
            return Err(ConfigError::Invalid(
                "read_chunk_size must be at least 1".to_string(),
            ));
        }
        if self.dial_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "dial_timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for MuxConfig
#[derive(Default)]
pub struct MuxConfigBuilder {
    config: MuxConfig,
}

impl MuxConfigBuilder {
    pub fn dial_timeout(mut self, timeout: Duration) -> Self {
        self.config.dial_timeout = timeout;
        self
    }

    pub fn queue_depth(mut self, depth: usize) -> Self {
        self.config.queue_depth = depth;
        self
    }

    pub fn read_chunk_size(mut self, size: usize) -> Self {
        self.config.read_chunk_size = size;
        self
    }

    pub fn inbound_deliver_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.inbound_deliver_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<MuxConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Helper module for serializing Duration as seconds
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

mod duration_secs_option {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(duration) => serializer.serialize_some(&duration.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = Option::<u64>::deserialize(deserializer)?;
        Ok(secs.map(Duration::from_secs))
    }
}
