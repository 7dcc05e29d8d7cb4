//! Node configuration

use crate::error::{Result, ShareError};
use crate::types::PeerId;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Smallest accepted chunk size (1 KiB)
pub const MIN_CHUNK_SIZE: usize = 1024;
/// Largest accepted chunk size (1 MiB)
pub const MAX_CHUNK_SIZE: usize = 1024 * 1024;

/// Sharing node configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ShareConfig {
    /// Our own peer id
    pub local_id: String,

    /// Name announced to peers in `user-info`
    #[serde(default)]
    pub display_name: Option<String>,

    /// Connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Connect timeout used on low-bandwidth links
    #[serde(default = "default_extended_connect_timeout")]
    pub extended_connect_timeout_secs: u64,

    /// Lower bound of the backup dial delay
    #[serde(default = "default_backup_dial_min")]
    pub backup_dial_min_ms: u64,

    /// Upper bound of the backup dial delay
    #[serde(default = "default_backup_dial_max")]
    pub backup_dial_max_ms: u64,

    /// Liveness probe interval
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Silence before a health check is sent
    #[serde(default = "default_soft_timeout")]
    pub soft_timeout_secs: u64,

    /// Silence before the session is declared dead
    #[serde(default = "default_hard_timeout")]
    pub hard_timeout_secs: u64,

    /// Interval of the dead-session sweep
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// First reconnection delay before jitter
    #[serde(default = "default_reconnect_base_delay")]
    pub reconnect_base_delay_ms: u64,

    /// Cap on reconnection delays
    #[serde(default = "default_max_reconnect_delay")]
    pub max_reconnect_delay_secs: u64,

    /// Reconnection attempts before giving up
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Chunk size in bytes
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Unacknowledged chunks allowed per outbound transfer
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight_chunks: usize,

    /// First ack timeout, doubled per retry
    #[serde(default = "default_chunk_ack_timeout")]
    pub chunk_ack_timeout_ms: u64,

    /// Retransmissions per chunk before the transfer fails
    #[serde(default = "default_max_chunk_retries")]
    pub max_chunk_retries: u32,

    /// Out-of-range chunks tolerated per inbound transfer
    #[serde(default = "default_max_protocol_violations")]
    pub max_protocol_violations: u32,

    /// Idle time after which an inbound transfer is abandoned
    #[serde(default = "default_inbound_idle_timeout")]
    pub inbound_idle_timeout_secs: u64,

    /// Analytics publish debounce
    #[serde(default = "default_analytics_debounce")]
    pub analytics_debounce_ms: u64,

    /// Minimum speed sampling interval
    #[serde(default = "default_speed_sample_interval")]
    pub speed_sample_interval_ms: u64,

    /// Samples in the rolling-average window
    #[serde(default = "default_speed_window")]
    pub speed_window_samples: usize,

    /// Entries kept in the connection history
    #[serde(default = "default_connection_history_limit")]
    pub connection_history_limit: usize,

    /// Received chat messages kept
    #[serde(default = "default_chat_history_limit")]
    pub chat_history_limit: usize,

    /// Capacity of the event broadcast channel
    #[serde(default = "default_event_capacity")]
    pub event_channel_capacity: usize,
}

// Default value functions
fn default_connect_timeout() -> u64 {
    25
}

fn default_extended_connect_timeout() -> u64 {
    35
}

fn default_backup_dial_min() -> u64 {
    300
}

fn default_backup_dial_max() -> u64 {
    550
}

fn default_heartbeat_interval() -> u64 {
    5
}

fn default_soft_timeout() -> u64 {
    20
}

fn default_hard_timeout() -> u64 {
    30
}

fn default_sweep_interval() -> u64 {
    8
}

fn default_reconnect_base_delay() -> u64 {
    1000
}

fn default_max_reconnect_delay() -> u64 {
    30
}

fn default_max_reconnect_attempts() -> u32 {
    6
}

fn default_chunk_size() -> usize {
    64 * 1024
}

fn default_max_in_flight() -> usize {
    16
}

fn default_chunk_ack_timeout() -> u64 {
    1000
}

fn default_max_chunk_retries() -> u32 {
    4
}

fn default_max_protocol_violations() -> u32 {
    8
}

fn default_inbound_idle_timeout() -> u64 {
    120
}

fn default_analytics_debounce() -> u64 {
    50
}

fn default_speed_sample_interval() -> u64 {
    500
}

fn default_speed_window() -> usize {
    20
}

fn default_connection_history_limit() -> usize {
    100
}

fn default_chat_history_limit() -> usize {
    500
}

fn default_event_capacity() -> usize {
    4096
}

impl ShareConfig {
    /// Create a configuration with defaults for `local_id`
    pub fn new(local_id: impl Into<String>) -> Self {
        Self {
            local_id: local_id.into(),
            display_name: None,
            connect_timeout_secs: default_connect_timeout(),
            extended_connect_timeout_secs: default_extended_connect_timeout(),
            backup_dial_min_ms: default_backup_dial_min(),
            backup_dial_max_ms: default_backup_dial_max(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            soft_timeout_secs: default_soft_timeout(),
            hard_timeout_secs: default_hard_timeout(),
            sweep_interval_secs: default_sweep_interval(),
            reconnect_base_delay_ms: default_reconnect_base_delay(),
            max_reconnect_delay_secs: default_max_reconnect_delay(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            chunk_size: default_chunk_size(),
            max_in_flight_chunks: default_max_in_flight(),
            chunk_ack_timeout_ms: default_chunk_ack_timeout(),
            max_chunk_retries: default_max_chunk_retries(),
            max_protocol_violations: default_max_protocol_violations(),
            inbound_idle_timeout_secs: default_inbound_idle_timeout(),
            analytics_debounce_ms: default_analytics_debounce(),
            speed_sample_interval_ms: default_speed_sample_interval(),
            speed_window_samples: default_speed_window(),
            connection_history_limit: default_connection_history_limit(),
            chat_history_limit: default_chat_history_limit(),
            event_channel_capacity: default_event_capacity(),
        }
    }

    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ShareError::Config(format!("Failed to read config file: {}", e)))?;

        let config: ShareConfig = toml::from_str(&contents)
            .map_err(|e| ShareError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let local_id = std::env::var("SILVER_SHARE_LOCAL_ID")
            .map_err(|_| ShareError::Config("SILVER_SHARE_LOCAL_ID not set".to_string()))?;

        let mut config = Self::new(local_id);

        if let Ok(name) = std::env::var("SILVER_SHARE_DISPLAY_NAME") {
            config.display_name = Some(name);
        }

        if let Ok(size) = std::env::var("SILVER_SHARE_CHUNK_SIZE") {
            config.chunk_size = size
                .parse()
                .map_err(|_| ShareError::Config("Invalid SILVER_SHARE_CHUNK_SIZE".to_string()))?;
        }

        if let Ok(secs) = std::env::var("SILVER_SHARE_CONNECT_TIMEOUT") {
            config.connect_timeout_secs = secs
                .parse()
                .map_err(|_| ShareError::Config("Invalid SILVER_SHARE_CONNECT_TIMEOUT".to_string()))?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        PeerId::parse(&self.local_id)
            .map_err(|_| ShareError::Config(format!("local_id is not a valid peer id: {}", self.local_id)))?;

        let non_zero = [
            ("connect_timeout_secs", self.connect_timeout_secs),
            ("extended_connect_timeout_secs", self.extended_connect_timeout_secs),
            ("heartbeat_interval_secs", self.heartbeat_interval_secs),
            ("soft_timeout_secs", self.soft_timeout_secs),
            ("hard_timeout_secs", self.hard_timeout_secs),
            ("sweep_interval_secs", self.sweep_interval_secs),
            ("reconnect_base_delay_ms", self.reconnect_base_delay_ms),
            ("max_reconnect_delay_secs", self.max_reconnect_delay_secs),
            ("chunk_ack_timeout_ms", self.chunk_ack_timeout_ms),
            ("analytics_debounce_ms", self.analytics_debounce_ms),
            ("speed_sample_interval_ms", self.speed_sample_interval_ms),
        ];
        for (name, value) in non_zero {
            if value == 0 {
                return Err(ShareError::Config(format!("{} must be > 0", name)));
            }
        }

        if self.extended_connect_timeout_secs < self.connect_timeout_secs {
            return Err(ShareError::Config(
                "extended_connect_timeout_secs cannot be less than connect_timeout_secs".to_string(),
            ));
        }

        if self.backup_dial_min_ms > self.backup_dial_max_ms {
            return Err(ShareError::Config(
                "backup_dial_min_ms cannot be greater than backup_dial_max_ms".to_string(),
            ));
        }

        if self.soft_timeout_secs >= self.hard_timeout_secs {
            return Err(ShareError::Config(
                "soft_timeout_secs must be less than hard_timeout_secs".to_string(),
            ));
        }

        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&self.chunk_size) {
            return Err(ShareError::Config(format!(
                "chunk_size must be between {} and {} bytes",
                MIN_CHUNK_SIZE, MAX_CHUNK_SIZE
            )));
        }

        if self.max_in_flight_chunks == 0 {
            return Err(ShareError::Config("max_in_flight_chunks must be > 0".to_string()));
        }

        if self.max_reconnect_attempts == 0 {
            return Err(ShareError::Config("max_reconnect_attempts must be > 0".to_string()));
        }

        if self.speed_window_samples == 0 || self.connection_history_limit == 0 {
            return Err(ShareError::Config(
                "analytics windows must hold at least one entry".to_string(),
            ));
        }

        if self.event_channel_capacity == 0 {
            return Err(ShareError::Config("event_channel_capacity must be > 0".to_string()));
        }

        Ok(())
    }

    /// Parsed local id
    pub fn local_peer_id(&self) -> Result<PeerId> {
        PeerId::parse(&self.local_id)
    }

    pub fn connect_timeout(&self, low_bandwidth: bool) -> Duration {
        if low_bandwidth {
            Duration::from_secs(self.extended_connect_timeout_secs)
        } else {
            Duration::from_secs(self.connect_timeout_secs)
        }
    }

    pub fn chunk_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.chunk_ack_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_creation() {
        let config = ShareConfig::new("NODE0001");
        assert_eq!(config.local_id, "NODE0001");
        assert_eq!(config.chunk_size, 64 * 1024);
        assert_eq!(config.hard_timeout_secs, 30);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = ShareConfig::new("NODE0001");

        config.local_id = "bad id".to_string();
        assert!(config.validate().is_err());
        config.local_id = "NODE0001".to_string();

        config.chunk_size = 512;
        assert!(config.validate().is_err());
        config.chunk_size = 2 * 1024 * 1024;
        assert!(config.validate().is_err());
        config.chunk_size = 64 * 1024;

        config.soft_timeout_secs = 30;
        assert!(config.validate().is_err());
        config.soft_timeout_secs = 20;

        config.backup_dial_min_ms = 600;
        assert!(config.validate().is_err());
        config.backup_dial_min_ms = 300;

        config.chunk_ack_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_src = r#"
            local_id = "NODE0002"
            display_name = "laptop"
            chunk_size = 16384
        "#;
        let config: ShareConfig = toml::from_str(toml_src).unwrap();
        assert_eq!(config.display_name.as_deref(), Some("laptop"));
        assert_eq!(config.chunk_size, 16384);
        assert_eq!(config.connect_timeout_secs, 25);
        assert_eq!(config.max_reconnect_attempts, 6);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_connect_timeout_extension() {
        let config = ShareConfig::new("NODE0001");
        assert_eq!(config.connect_timeout(false), Duration::from_secs(25));
        assert_eq!(config.connect_timeout(true), Duration::from_secs(35));
    }
}
