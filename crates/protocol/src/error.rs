//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering all wire-level failure modes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Failed to serialize a message.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize a message.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    /// A resize request with a zero dimension.
    #[error("invalid terminal size: {cols}x{rows}")]
    InvalidResize {
        /// Requested columns.
        cols: u16,
        /// Requested rows.
        rows: u16,
    },

    /// A frame payload did not match its kind.
    #[error("malformed {kind} frame payload")]
    MalformedFrame {
        /// The frame kind that failed to decode.
        kind: &'static str,
    },
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProtocolError::InvalidResize { cols: 0, rows: 24 };
        assert_eq!(err.to_string(), "invalid terminal size: 0x24");

        let err = ProtocolError::MalformedFrame { kind: "resize" };
        assert_eq!(err.to_string(), "malformed resize frame payload");
    }

    #[test]
    fn test_from_json_syntax_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: ProtocolError = json_err.into();
        assert!(matches!(err, ProtocolError::Deserialization(_)));
    }
}
