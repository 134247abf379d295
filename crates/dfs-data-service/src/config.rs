//! Data server configuration.

use std::path::PathBuf;
use std::time::Duration;

use dfs_config::{Config, ConfigError};
use dfs_logging::LogConfig;
use dfs_proto::DEFAULT_MAX_PACKET_SIZE;
use dfs_types::ServerAddress;
use serde::{Deserialize, Serialize};

/// Upper bound on the configurable packet size (16 MiB).
pub const MAX_PACKET_SIZE_LIMIT: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataServerConfig {
    /// Address the block server binds to.
    pub listen: ServerAddress,

    /// This node's identity in replica chains. A port of 0 is replaced with
    /// the port actually bound.
    pub advertised_address: ServerAddress,

    pub coordinator_address: ServerAddress,

    /// Directory holding committed blocks, `temp/` and the `fsid` file.
    pub storage_dir: PathBuf,

    /// Payload size of every packet except the last one of a block. Must not
    /// change for an existing storage directory.
    pub max_packet_size: usize,

    #[serde(with = "duration_secs")]
    pub heartbeat_interval: Duration,

    /// How long a failed write connection stays open after the error reply.
    #[serde(with = "duration_secs")]
    pub error_linger: Duration,

    /// Bound on waiting for downstream acknowledgements during replication.
    #[serde(with = "duration_secs")]
    pub replication_timeout: Duration,

    /// Timeout of one heartbeat exchange with the coordinator.
    #[serde(with = "duration_secs")]
    pub heartbeat_timeout: Duration,

    pub log: LogConfig,
}

impl Default for DataServerConfig {
    fn default() -> Self {
        Self {
            listen: ServerAddress::new("0.0.0.0", 9500),
            advertised_address: ServerAddress::new("127.0.0.1", 9500),
            coordinator_address: ServerAddress::new("127.0.0.1", 9000),
            storage_dir: PathBuf::from("data"),
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            heartbeat_interval: Duration::from_secs(3),
            error_linger: Duration::from_secs(2),
            replication_timeout: Duration::from_secs(60),
            heartbeat_timeout: Duration::from_secs(10),
            log: LogConfig::default(),
        }
    }
}

impl Config for DataServerConfig {
    fn hot_update(&mut self, other: &Self) {
        self.heartbeat_interval = other.heartbeat_interval;
        self.error_linger = other.error_linger;
        self.replication_timeout = other.replication_timeout;
        self.heartbeat_timeout = other.heartbeat_timeout;
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_packet_size == 0 || self.max_packet_size > MAX_PACKET_SIZE_LIMIT {
            return Err(ConfigError::OutOfRange {
                field: "max_packet_size",
                value: self.max_packet_size.to_string(),
                reason: "must be between 1 byte and 16 MiB",
            });
        }
        for (field, value) in [
            ("heartbeat_interval", self.heartbeat_interval),
            ("replication_timeout", self.replication_timeout),
            ("heartbeat_timeout", self.heartbeat_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::OutOfRange {
                    field,
                    value: format!("{:?}", value),
                    reason: "must be positive",
                });
            }
        }
        if self.storage_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("storage_dir must not be empty".into()));
        }
        Ok(())
    }
}

/// Durations are written as (fractional) seconds.
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(duration.as_secs_f64())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
