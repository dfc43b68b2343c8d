//! Session configuration.
//!
//! All fields have defaults, so a YAML document only needs the values it changes:
//!
//! ```rust
//! use oxygen_stream::{DropPolicy, StreamConfig};
//!
//! let config = StreamConfig::from_yaml_str(
//!     "queue_capacity: 1024\ndrop_policy: drop_oldest\nwire:\n  checksum: fnv1a\n",
//! )
//! .unwrap();
//! assert_eq!(config.queue_capacity, 1024);
//! assert_eq!(config.drop_policy, DropPolicy::DropOldest);
//! assert_eq!(config.connect_retries, 5);
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::{WELCOME_SIZE, WireFormat};
use crate::error::ConfigError;

/// What the reader task does when the delivery queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropPolicy {
    /// Wait for the consumer, up to `delivery_timeout_ms`
    #[default]
    Block,
    /// Overwrite the oldest queued events; the consumer sees a `Dropped` marker
    DropOldest,
}

/// Timeouts, retry budgets, queue sizing and wire format of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub reconnect_backoff_initial_ms: u64,
    pub reconnect_backoff_max_ms: u64,
    /// Connection attempts before giving up
    pub connect_retries: u32,
    pub connect_timeout_ms: u64,
    pub negotiation_timeout_ms: u64,
    /// Silence after which the stream is considered stalled
    pub keep_alive_timeout_ms: u64,
    pub queue_capacity: usize,
    pub drop_policy: DropPolicy,
    pub delivery_timeout_ms: u64,
    /// Resync attempts per episode before the stream is declared lost
    pub resync_max_attempts: u32,
    /// Bytes skipped per decode call while searching for a start token
    pub resync_scan_window: usize,
    /// Bytes discarded per resync episode before the stream is declared lost
    pub resync_scan_limit: usize,
    /// Consecutive valid frames required to leave resync, and delivered frames required
    /// before the next resync starts a fresh attempt budget
    pub resync_confirm_frames: u32,
    /// Bytes of welcome message read after connecting; 0 when the peer sends none
    pub welcome_size: usize,
    pub wire: WireFormat,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            reconnect_backoff_initial_ms: 100,
            reconnect_backoff_max_ms: 5000,
            connect_retries: 5,
            connect_timeout_ms: 3000,
            negotiation_timeout_ms: 5000,
            keep_alive_timeout_ms: 2000,
            queue_capacity: 256,
            drop_policy: DropPolicy::Block,
            delivery_timeout_ms: 1000,
            resync_max_attempts: 8,
            resync_scan_window: 64 * 1024,
            resync_scan_limit: 1024 * 1024,
            resync_confirm_frames: 1,
            welcome_size: WELCOME_SIZE,
            wire: WireFormat::default(),
        }
    }
}

impl StreamConfig {
    /// Parse and validate a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: StreamConfig = serde_yaml_ng::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a YAML file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        Self::from_yaml_str(&yaml)
    }

    /// Check value ranges and cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero = [
            ("reconnect_backoff_initial_ms", self.reconnect_backoff_initial_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("negotiation_timeout_ms", self.negotiation_timeout_ms),
            ("keep_alive_timeout_ms", self.keep_alive_timeout_ms),
            ("delivery_timeout_ms", self.delivery_timeout_ms),
            ("connect_retries", self.connect_retries.into()),
            ("queue_capacity", self.queue_capacity as u64),
            ("resync_max_attempts", self.resync_max_attempts.into()),
            ("resync_scan_window", self.resync_scan_window as u64),
            ("resync_confirm_frames", self.resync_confirm_frames.into()),
        ];
        if let Some((field, _)) = non_zero.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::invalid(*field, "must be greater than zero"));
        }

        if self.reconnect_backoff_max_ms < self.reconnect_backoff_initial_ms {
            return Err(ConfigError::invalid(
                "reconnect_backoff_max_ms",
                "must not be below reconnect_backoff_initial_ms",
            ));
        }
        if self.resync_scan_limit < self.resync_scan_window {
            return Err(ConfigError::invalid(
                "resync_scan_limit",
                "must not be below resync_scan_window",
            ));
        }
        // tokio's broadcast channel panics above this
        if self.drop_policy == DropPolicy::DropOldest && self.queue_capacity > usize::MAX / 2 {
            return Err(ConfigError::invalid("queue_capacity", "too large for drop_oldest"));
        }
        self.wire.validate()
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }

    pub fn keep_alive_timeout(&self) -> Duration {
        Duration::from_millis(self.keep_alive_timeout_ms)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }

    /// Backoff before connection attempt `attempt` (1-based), doubling up to the max.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(20);
        let millis = self.reconnect_backoff_initial_ms.saturating_mul(factor);
        Duration::from_millis(millis.min(self.reconnect_backoff_max_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ChecksumKind;

    #[test]
    fn defaults_are_valid() {
        let config = StreamConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.wire.checksum, ChecksumKind::Crc32);
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let config =
            StreamConfig::from_yaml_str("keep_alive_timeout_ms: 250\nresync_confirm_frames: 3\n")
                .unwrap();
        assert_eq!(config.keep_alive_timeout(), Duration::from_millis(250));
        assert_eq!(config.resync_confirm_frames, 3);
        assert_eq!(config.queue_capacity, 256);
        assert_eq!(config.welcome_size, 64);
        assert_eq!(config.wire, WireFormat::default());
    }

    #[test]
    fn invalid_values_are_reported_by_field() {
        let err = StreamConfig::from_yaml_str("queue_capacity: 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "queue_capacity", .. }));

        let err = StreamConfig::from_yaml_str(
            "reconnect_backoff_initial_ms: 500\nreconnect_backoff_max_ms: 100",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "reconnect_backoff_max_ms", .. }));

        let err = StreamConfig::from_yaml_str("wire:\n  end_token: OXYGEN<<").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "wire.end_token", .. }));
    }

    #[test]
    fn instrument_wire_preset_from_yaml() {
        let config =
            StreamConfig::from_yaml_str("welcome_size: 0\nwire:\n  checksum: none\n").unwrap();
        assert_eq!(config.welcome_size, 0);
        assert_eq!(config.wire, WireFormat::oxygen());
    }

    #[test]
    fn malformed_yaml_is_a_parse_error() {
        let err = StreamConfig::from_yaml_str("drop_policy: sometimes").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = StreamConfig::from_path("/nonexistent/oxygen-stream.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let config = StreamConfig {
            reconnect_backoff_initial_ms: 100,
            reconnect_backoff_max_ms: 1000,
            ..Default::default()
        };
        let delays: Vec<_> = (1..=6).map(|n| config.backoff(n).as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
    }
}
