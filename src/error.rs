//! Error types for the DataStream client.
//!
//! Errors fall into two groups:
//!
//! - **Frame errors** ([`FrameError`]) are produced by the frame codec and the
//!   demultiplexer. They are absorbed by the session's resynchronization logic and
//!   are never delivered to consumers one by one.
//! - **Session errors** ([`StreamError`]) accompany a session state transition and
//!   are what consumers observe through [`crate::StateSnapshot::error`].
//!
//! ```rust
//! use oxygen_stream::StreamError;
//!
//! let error = StreamError::connect_failed("127.0.0.1:10003 refused");
//! assert!(error.is_retryable());
//!
//! let error = StreamError::negotiation_failed("duplicate channel 'AI 1'");
//! assert!(!error.is_retryable());
//! ```

use std::time::Duration;
use thiserror::Error;

/// Result type alias for DataStream operations.
pub type Result<T, E = StreamError> = std::result::Result<T, E>;

/// Session-level error taxonomy.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum StreamError {
    #[error("Failed to connect to instrument: {reason}")]
    Connect {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Channel negotiation failed: {reason}")]
    Negotiation { reason: String },

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("Stream lost after {attempts} resync attempts: {reason}")]
    StreamLost { attempts: u32, reason: String },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Transport I/O error")]
    Io(#[from] std::io::Error),

    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("Session is closed")]
    Closed,
}

impl StreamError {
    /// Returns whether starting the session again could succeed without changes.
    pub fn is_retryable(&self) -> bool {
        match self {
            StreamError::Connect { .. } => true,
            StreamError::StreamLost { .. } => true,
            StreamError::Io(_) => true,
            StreamError::Timeout { .. } => true,
            StreamError::Frame(_) => true,
            StreamError::Negotiation { .. } => false,
            StreamError::Config(_) => false,
            StreamError::Closed => false,
        }
    }

    /// Helper constructor for connection errors.
    pub fn connect_failed(reason: impl Into<String>) -> Self {
        StreamError::Connect { reason: reason.into(), source: None }
    }

    /// Helper constructor for connection errors with source.
    pub fn connect_failed_with_source(
        reason: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        StreamError::Connect { reason: reason.into(), source: Some(source) }
    }

    /// Helper constructor for negotiation errors.
    pub fn negotiation_failed(reason: impl Into<String>) -> Self {
        StreamError::Negotiation { reason: reason.into() }
    }

    /// Helper constructor for an exhausted resync budget.
    pub fn stream_lost(attempts: u32, reason: impl Into<String>) -> Self {
        StreamError::StreamLost { attempts, reason: reason.into() }
    }
}

/// Violations of the wire format detected while decoding a frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum FrameError {
    #[error("Start token not found ({skipped} bytes skipped)")]
    BadStartToken { skipped: usize },

    #[error("Declared frame size {size} outside {min}..={max}")]
    BadLength { size: usize, min: usize, max: usize },

    #[error("End token mismatch in frame of {size} bytes")]
    BadTrailer { size: usize },

    #[error("Checksum mismatch: expected {expected:#010x}, computed {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("Malformed frame: {details}")]
    Malformed { details: String },

    #[error("Payload does not match layout generation {generation}: {details}")]
    LayoutMismatch { generation: u64, details: String },
}

impl FrameError {
    pub(crate) fn malformed(details: impl Into<String>) -> Self {
        FrameError::Malformed { details: details.into() }
    }
}

/// Invalid configuration, reported before any connection attempt.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("Invalid value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("Failed to parse configuration")]
    Parse(#[from] serde_yaml_ng::Error),

    #[error("Failed to read configuration file {path}")]
    Read {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid { field, reason: reason.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn error_messages_carry_their_context(
                reason in ".*",
                attempts in 0u32..100,
                size in 0usize..1_000_000,
            ) {
                let connect = StreamError::connect_failed(reason.clone());
                prop_assert!(connect.to_string().contains(&reason));

                let negotiation = StreamError::negotiation_failed(reason.clone());
                prop_assert!(negotiation.to_string().contains(&reason));

                let lost = StreamError::stream_lost(attempts, reason.clone());
                let lost_msg = lost.to_string();
                prop_assert!(lost_msg.contains(&attempts.to_string()));
                prop_assert!(lost_msg.contains(&reason));

                let frame: StreamError = FrameError::BadTrailer { size }.into();
                prop_assert!(frame.to_string().contains(&size.to_string()));
            }

            #[test]
            fn checksum_mismatch_formats_both_values(expected in any::<u32>(), actual in any::<u32>()) {
                let msg = FrameError::ChecksumMismatch { expected, actual }.to_string();
                let expected_hex = format!("{:#010x}", expected);
                let actual_hex = format!("{:#010x}", actual);
                prop_assert!(msg.contains(&expected_hex));
                prop_assert!(msg.contains(&actual_hex));
            }
        }
    }

    #[test]
    fn error_traits_validation() {
        fn assert_send_sync_static<T: Send + Sync + 'static>() {}
        assert_send_sync_static::<StreamError>();
        assert_send_sync_static::<FrameError>();
        assert_send_sync_static::<ConfigError>();
    }

    #[test]
    fn retry_classification() {
        assert!(StreamError::connect_failed("refused").is_retryable());
        assert!(StreamError::stream_lost(3, "budget").is_retryable());
        assert!(!StreamError::negotiation_failed("rejected").is_retryable());
        assert!(!StreamError::Closed.is_retryable());
        assert!(!StreamError::from(ConfigError::invalid("queue_capacity", "zero")).is_retryable());
    }

    #[test]
    fn source_chain_is_preserved() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let error = StreamError::connect_failed_with_source("dial failed", Box::new(io));
        let source = std::error::Error::source(&error).expect("source should be kept");
        assert_eq!(source.to_string(), "refused");
    }
}
