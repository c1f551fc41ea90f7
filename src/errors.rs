//! Error types for Everline protocol operations
//!
//! One enum covers both roles. Only `TransportInitFailed` is fatal; the
//! rest are reported and absorbed by the next cadence.

use std::io;

use thiserror::Error;

/// Result type alias for Everline operations
pub type Result<T> = std::result::Result<T, EverlineError>;

/// Everline protocol error enumeration
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EverlineError {
    /// Local I/O failure outside the transport (config files, GPIO files)
    #[error("I/O error: {0}")]
    Io(String),

    /// A datagram could not be handed to the link; non-fatal
    #[error("transport send failed: {0}")]
    TransportSendFailed(String),

    /// The link could not be brought up; the process should abort
    #[error("transport init failed: {0}")]
    TransportInitFailed(String),

    /// Received buffer does not match the fixed record size
    #[error("invalid packet length: expected {expected}, received {received}")]
    InvalidPacketLength { expected: usize, received: usize },

    /// Leading tag byte is not a known packet kind
    #[error("unknown packet kind: {0:#04x}")]
    UnknownPacketKind(u8),

    /// Identity empty or longer than the wire field allows
    #[error("invalid follower identity: {0}")]
    InvalidIdentity(String),

    /// Link address text could not be parsed
    #[error("invalid link address: {0}")]
    InvalidLinkAddress(String),

    /// Configuration could not be loaded or failed validation
    #[error("configuration error: {0}")]
    Config(String),

    /// Input line could not be sampled
    #[error("input source error: {0}")]
    Input(String),
}

impl EverlineError {
    /// Wrong-length and unknown-tag packets; dropped silently by receivers.
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            Self::InvalidPacketLength { .. } | Self::UnknownPacketKind(_)
        )
    }
}

impl From<io::Error> for EverlineError {
    fn from(err: io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_classification() {
        assert!(EverlineError::UnknownPacketKind(7).is_malformed());
        assert!(EverlineError::InvalidPacketLength { expected: 27, received: 3 }.is_malformed());
        assert!(!EverlineError::TransportSendFailed("busy".into()).is_malformed());
    }

    #[test]
    fn test_display_messages() {
        let err = EverlineError::InvalidPacketLength { expected: 27, received: 28 };
        assert_eq!(err.to_string(), "invalid packet length: expected 27, received 28");
        assert_eq!(
            EverlineError::UnknownPacketKind(1).to_string(),
            "unknown packet kind: 0x01"
        );
    }
}
