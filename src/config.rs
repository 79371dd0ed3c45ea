//! Mesh Configuration
//!
//! Every tuning knob of the engine lives here: TTL, MTU, dedup filter
//! sizing and rotation cadence, handshake retry policy, rate limits and
//! timeouts. Values are plain numbers so the whole struct round-trips
//! through JSON.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;

/// Smallest MTU that still carries a signed announce in one frame
pub const MIN_MTU: usize = 384;

/// Longest nickname carried in an announce
pub const MAX_NICKNAME_LEN: usize = 32;

/// Largest application payload that still fits one packet once the
/// envelope header, compression prefix and AEAD overhead are added
pub const MAX_MESSAGE_SIZE_LIMIT: usize = u16::MAX as usize - 128;

/// Tuning parameters for a mesh node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Nickname announced to neighbours
    pub nickname: String,
    /// TTL given to freshly originated packets
    pub max_ttl: u8,
    /// Largest frame written to a bearer
    pub mtu: usize,
    /// Largest application payload accepted by `send_message`
    pub max_message_size: usize,
    /// Payloads at least this large are LZ4 compressed when it helps
    pub compression_threshold: usize,

    pub dedup: DedupConfig,
    pub session: SessionConfig,
    pub relay: RelayConfig,
    pub timing: TimingConfig,

    /// Capacity of the application message stream
    pub message_buffer: usize,
    /// Capacity of the peer event broadcast channel
    pub event_buffer: usize,
    /// Acknowledge delivered point-to-point messages
    pub delivery_acks: bool,
    /// Sign broadcast messages with the identity key
    pub sign_broadcasts: bool,
}

/// Gossip dedup filter sizing and rotation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Fingerprints one generation is sized for
    pub capacity: usize,
    /// Target false-positive rate of one generation
    pub false_positive_rate: f64,
    /// Rotate once inserted / capacity reaches this ratio
    pub rotate_fill_ratio: f64,
    /// Rotate at least this often
    pub rotation_interval_secs: u64,
    /// How long a retired generation is still queried
    pub grace_period_secs: u64,
}

/// Noise session policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub handshake_timeout_secs: u64,
    /// Minimum wait after a failure before a retry
    pub retry_cooldown_secs: u64,
    /// Handshake attempts allowed per window
    pub max_attempts_per_window: u32,
    pub attempt_window_secs: u64,
    /// AuthErrors within `auth_failure_window_secs` that trigger a block
    pub auth_block_threshold: u32,
    pub auth_failure_window_secs: u64,
    pub auth_block_duration_secs: u64,
}

/// Relay fan-out limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Packets relayed on behalf of one neighbour per window
    pub max_relays_per_window: u32,
    pub rate_window_secs: u64,
    /// Frames buffered per neighbour before oldest-first drop
    pub peer_queue_capacity: usize,
    /// Concurrent incomplete fragment sets
    pub max_reassembly_sets: usize,
    /// Bytes buffered across all incomplete fragment sets
    pub max_reassembly_bytes: usize,
}

/// Periodic work and I/O bounds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub reassembly_timeout_secs: u64,
    /// Peers with no traffic for this long are evicted
    pub liveness_timeout_secs: u64,
    pub announce_interval_secs: u64,
    pub sweep_interval_ms: u64,
    pub connect_timeout_ms: u64,
    pub write_timeout_ms: u64,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            nickname: "anon".to_string(),
            max_ttl: 7,
            mtu: 512,
            max_message_size: 32 * 1024,
            compression_threshold: 256,
            dedup: DedupConfig::default(),
            session: SessionConfig::default(),
            relay: RelayConfig::default(),
            timing: TimingConfig::default(),
            message_buffer: 1000,
            event_buffer: 256,
            delivery_acks: true,
            sign_broadcasts: true,
        }
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            false_positive_rate: 0.001,
            rotate_fill_ratio: 1.0,
            rotation_interval_secs: 300,
            grace_period_secs: 60,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_secs: 30,
            retry_cooldown_secs: 5,
            max_attempts_per_window: 5,
            attempt_window_secs: 60,
            auth_block_threshold: 3,
            auth_failure_window_secs: 60,
            auth_block_duration_secs: 300,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_relays_per_window: 200,
            rate_window_secs: 10,
            peer_queue_capacity: 256,
            max_reassembly_sets: 64,
            max_reassembly_bytes: 1024 * 1024,
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            reassembly_timeout_secs: 30,
            liveness_timeout_secs: 90,
            announce_interval_secs: 30,
            sweep_interval_ms: 1000,
            connect_timeout_ms: 10_000,
            write_timeout_ms: 2_000,
        }
    }
}

impl MeshConfig {
    /// Parse a JSON document; missing fields keep their defaults
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: MeshConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON config file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = tokio::fs::read_to_string(path.as_ref()).await?;
        let config = Self::from_json_str(&raw)?;
        log::info!("Loaded mesh config from {}", path.as_ref().display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
            ConfigError::Invalid { field, reason: reason.into() }
        }

        if self.mtu < MIN_MTU || self.mtu > u16::MAX as usize {
            return Err(invalid("mtu", format!("must be within {}..={}", MIN_MTU, u16::MAX)));
        }
        if self.nickname.is_empty() || self.nickname.len() > MAX_NICKNAME_LEN {
            return Err(invalid("nickname", format!("must be 1..={} bytes", MAX_NICKNAME_LEN)));
        }
        if self.max_message_size == 0 || self.max_message_size > MAX_MESSAGE_SIZE_LIMIT {
            return Err(invalid("max_message_size", format!("must be within 1..={}", MAX_MESSAGE_SIZE_LIMIT)));
        }
        if self.dedup.capacity == 0 {
            return Err(invalid("dedup.capacity", "must be positive"));
        }
        if !(self.dedup.false_positive_rate > 0.0 && self.dedup.false_positive_rate < 1.0) {
            return Err(invalid("dedup.false_positive_rate", "must be within (0, 1)"));
        }
        if self.dedup.rotate_fill_ratio <= 0.0 {
            return Err(invalid("dedup.rotate_fill_ratio", "must be positive"));
        }
        if self.session.max_attempts_per_window == 0 {
            return Err(invalid("session.max_attempts_per_window", "must be positive"));
        }
        if self.session.auth_block_threshold == 0 {
            return Err(invalid("session.auth_block_threshold", "must be positive"));
        }
        if self.relay.peer_queue_capacity == 0 {
            return Err(invalid("relay.peer_queue_capacity", "must be positive"));
        }
        if self.message_buffer == 0 || self.event_buffer == 0 {
            return Err(invalid("message_buffer", "channel capacities must be positive"));
        }
        if self.timing.sweep_interval_ms == 0 {
            return Err(invalid("timing.sweep_interval_ms", "must be positive"));
        }
        if self.timing.announce_interval_secs == 0 {
            return Err(invalid("timing.announce_interval_secs", "must be positive"));
        }
        if self.timing.liveness_timeout_secs <= self.timing.announce_interval_secs {
            return Err(invalid("timing.liveness_timeout_secs", "must exceed the announce interval"));
        }
        Ok(())
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.session.handshake_timeout_secs)
    }

    pub fn reassembly_timeout(&self) -> Duration {
        Duration::from_secs(self.timing.reassembly_timeout_secs)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.timing.liveness_timeout_secs)
    }

    pub fn announce_interval(&self) -> Duration {
        Duration::from_secs(self.timing.announce_interval_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.timing.sweep_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.timing.connect_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.timing.write_timeout_ms)
    }
}

impl DedupConfig {
    pub fn rotation_interval(&self) -> Duration {
        Duration::from_secs(self.rotation_interval_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

impl RelayConfig {
    pub fn rate_window(&self) -> Duration {
        Duration::from_secs(self.rate_window_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(MeshConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = MeshConfig::from_json_str(r#"{"max_ttl": 3, "dedup": {"capacity": 1000}}"#).unwrap();
        assert_eq!(config.max_ttl, 3);
        assert_eq!(config.dedup.capacity, 1000);
        assert_eq!(config.dedup.false_positive_rate, DedupConfig::default().false_positive_rate);
        assert_eq!(config.mtu, 512);
    }

    #[test]
    fn test_rejects_tiny_mtu() {
        let err = MeshConfig::from_json_str(r#"{"mtu": 20}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "mtu", .. }));
    }

    #[test]
    fn test_rejects_long_nickname() {
        let mut config = MeshConfig::default();
        config.nickname = "x".repeat(MAX_NICKNAME_LEN + 1);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { field: "nickname", .. })));
    }

    #[test]
    fn test_rejects_bad_fp_rate() {
        let mut config = MeshConfig::default();
        config.dedup.false_positive_rate = 1.5;
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let err = MeshConfig::load("/nonexistent/bitchat-mesh.json").await.unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
