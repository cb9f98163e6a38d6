//! # Gamedock Wire Protocol
//!
//! Message envelope, typed payloads, and framing for the hub/agent link.
//!
//! This crate defines:
//! - The JSON message envelope (`id`, `type`, `payload`, `error`)
//! - The closed set of message types and their payload shapes
//! - Length-prefixed framing over an async byte stream
//! - Protocol version constants and wire error codes
//!
//! ## Framing
//!
//! ```text
//! ┌──────────────────┬──────────────────────────────────────────┐
//! │ length (u32, BE) │ JSON envelope (UTF-8, `length` bytes)    │
//! └──────────────────┴──────────────────────────────────────────┘
//! ```
//!
//! Every request carries an `id` that the peer echoes in its response.
//! Push messages (events the agent originates) use an empty `id`.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod error;
pub mod message;

pub use codec::{read_envelope, write_envelope};
pub use error::{ErrorCode, ProtoError, WireError};
pub use message::{
    AgentStatus, BeginUpload, ChunkAck, Envelope, FinishUpload, HubConnect, InstalledEntry,
    InstalledList, MessageKind, OperationResult, PairConfirm, PairSuccess, PairingRequired,
    StatusResponse, UninstallRequest, UploadAccepted, UploadCancel, UploadChunk,
};

/// Current protocol version spoken by this agent.
pub const PROTOCOL_VERSION: u32 = 1;

/// Oldest protocol version the agent still accepts.
pub const PROTOCOL_MIN_SUPPORTED: u32 = 1;

/// Maximum size of a single framed envelope (header JSON plus
/// base64-encoded chunk bytes).
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Chunk size the agent advertises to hubs in `upload_accepted`.
pub const ADVERTISED_CHUNK_SIZE: usize = 1024 * 1024;
