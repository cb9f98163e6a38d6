//! Error types for the agent engine.
//!
//! Errors are categorized by how the connection engine recovers from them:
//!
//! - **Protocol/Validation/Session**: answered with an `error` response,
//!   connection stays open
//! - **Auth**: answered with an `error` response; repeated offenses may
//!   close the connection
//! - **Storage**: surfaced to the hub and to the observer via the
//!   `server_error` topic
//! - **Fatal**: listener or store cannot function; the process reports and
//!   exits rather than silently restarting

use std::borrow::Cow;

use gamedock_proto::{ErrorCode, WireError};
use thiserror::Error;

/// Errors that can occur in agent operations.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Malformed or unsupported message.
    #[error("protocol error: {0}")]
    Protocol(Cow<'static, str>),

    /// Protocol version outside the supported range.
    #[error("unsupported protocol version {requested} (supported {min}..={max})")]
    VersionIncompatible {
        /// Version the hub requested.
        requested: u32,
        /// Oldest supported version.
        min: u32,
        /// Newest supported version.
        max: u32,
    },

    /// Missing, invalid, or revoked credentials.
    #[error("auth error: {0}")]
    Auth(Cow<'static, str>),

    /// Pairing is locked out after repeated failures.
    #[error("pairing locked for {retry_after_secs}s")]
    PairingLocked {
        /// Seconds until pairing may be retried.
        retry_after_secs: u64,
    },

    /// Input rejected before any resource was touched.
    #[error("validation error: {0}")]
    Validation(Cow<'static, str>),

    /// Destination path escapes the install root.
    #[error("destination '{0}' escapes the install root")]
    PathTraversal(String),

    /// Declared transfer exceeds available space.
    #[error("declared size {declared} exceeds available space {available}")]
    InsufficientSpace {
        /// Declared total size in bytes.
        declared: u64,
        /// Free bytes under the install root.
        available: u64,
    },

    /// A second upload was declared while one is receiving.
    #[error("an upload session is already active")]
    SessionConflict,

    /// A session-scoped message arrived with no active session.
    #[error("no active upload session")]
    NoActiveSession,

    /// Session id does not match the active session.
    #[error("unknown upload session '{0}'")]
    SessionNotFound(String),

    /// Received bytes or checksum do not match the declaration.
    #[error("session integrity failure: {0}")]
    SessionIntegrity(Cow<'static, str>),

    /// Referenced game does not exist.
    #[error("game '{0}' is not installed")]
    GameNotFound(String),

    /// Disk or filesystem failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Listener cannot bind or persisted state cannot be read.
    #[error("fatal: {0}")]
    Fatal(Cow<'static, str>),
}

impl AgentError {
    /// Returns true if the engine should keep the connection open after
    /// answering with an error response.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, AgentError::Fatal(_))
    }

    /// Returns true if the observer must be informed via `server_error`
    /// in addition to the hub-facing error response.
    #[must_use]
    pub fn is_observer_visible(&self) -> bool {
        matches!(self, AgentError::Storage(_) | AgentError::Fatal(_))
    }

    /// Create a protocol error with static context.
    #[must_use]
    pub const fn protocol(context: &'static str) -> Self {
        AgentError::Protocol(Cow::Borrowed(context))
    }

    /// Create an auth error with static context.
    #[must_use]
    pub const fn auth(context: &'static str) -> Self {
        AgentError::Auth(Cow::Borrowed(context))
    }

    /// Create a validation error with static context.
    #[must_use]
    pub const fn validation(context: &'static str) -> Self {
        AgentError::Validation(Cow::Borrowed(context))
    }

    /// Translate into the wire error body sent back to the hub.
    #[must_use]
    pub fn to_wire(&self) -> WireError {
        let code = match self {
            AgentError::Protocol(_) => ErrorCode::BadRequest,
            AgentError::VersionIncompatible { .. } => ErrorCode::VersionIncompatible,
            AgentError::Auth(_) => ErrorCode::Unauthorized,
            AgentError::PairingLocked { .. } => ErrorCode::RateLimited,
            AgentError::Validation(_) | AgentError::PathTraversal(_) => ErrorCode::BadRequest,
            AgentError::InsufficientSpace { .. } => ErrorCode::TooLarge,
            AgentError::SessionConflict => ErrorCode::SessionConflict,
            AgentError::NoActiveSession | AgentError::SessionNotFound(_) => ErrorCode::NotFound,
            AgentError::SessionIntegrity(_) => ErrorCode::BadRequest,
            AgentError::GameNotFound(_) => ErrorCode::NotFound,
            AgentError::Storage(_) | AgentError::Fatal(_) => ErrorCode::Internal,
        };
        WireError::new(code, self.to_string())
    }
}

impl From<std::io::Error> for AgentError {
    fn from(err: std::io::Error) -> Self {
        AgentError::Storage(err.to_string())
    }
}

/// Result type for agent operations.
pub type Result<T> = std::result::Result<T, AgentError>;
