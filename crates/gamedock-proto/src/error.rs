//! Protocol-level errors and wire error codes.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced while encoding, decoding, or framing envelopes.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// Frame length prefix exceeds the configured maximum.
    #[error("frame of {actual} bytes exceeds maximum of {max}")]
    FrameTooLarge {
        /// Declared frame length.
        actual: usize,
        /// Configured maximum.
        max: usize,
    },

    /// Envelope was not valid JSON or did not match the expected shape.
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Payload was missing for a message type that requires one.
    #[error("message '{0}' requires a payload")]
    MissingPayload(&'static str),

    /// Chunk data was not valid base64.
    #[error("invalid chunk encoding: {0}")]
    ChunkEncoding(#[from] base64::DecodeError),

    /// Underlying transport failed.
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    /// Peer closed the connection mid-frame or between frames.
    #[error("connection closed by peer")]
    ConnectionClosed,
}

/// Wire error codes carried in the envelope `error` field.
///
/// The numbering follows HTTP conventions so hubs can map them without a
/// lookup table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    /// Malformed message or failed validation (path traversal, bad name).
    BadRequest = 400,
    /// Missing, invalid, or revoked token; pairing not completed.
    Unauthorized = 401,
    /// Referenced entity (session, game) does not exist.
    NotFound = 404,
    /// Protocol version outside the supported range.
    VersionIncompatible = 406,
    /// An upload session is already receiving.
    SessionConflict = 409,
    /// Declared transfer size exceeds available space.
    TooLarge = 413,
    /// Pairing is locked out after repeated failures.
    Locked = 423,
    /// Rate limit: pairing attempts rejected for the lockout window.
    RateLimited = 429,
    /// Storage failure (disk full, permissions) or internal error.
    Internal = 500,
}

impl ErrorCode {
    /// Raw numeric code as carried on the wire.
    #[must_use]
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

/// Error body attached to an `error` response envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WireError {
    /// Numeric code, see [`ErrorCode`].
    pub code: u16,
    /// Human-readable description. Never contains secrets.
    pub message: String,
}

impl WireError {
    /// Build a wire error from a code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.as_u16(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_values() {
        assert_eq!(ErrorCode::Unauthorized.as_u16(), 401);
        assert_eq!(ErrorCode::VersionIncompatible.as_u16(), 406);
        assert_eq!(ErrorCode::Locked.as_u16(), 423);
        assert_eq!(ErrorCode::RateLimited.as_u16(), 429);
    }

    #[test]
    fn test_wire_error_serialization() {
        let err = WireError::new(ErrorCode::NotFound, "no such session");
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("404"));
        assert!(json.contains("no such session"));
    }
}
