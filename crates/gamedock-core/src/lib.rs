//! # Gamedock Core
//!
//! Agent engine for the Gamedock deployment protocol: the device-side
//! half that pairs with a hub, authenticates it, and receives chunked
//! game uploads.
//!
//! This crate provides:
//! - Pairing state machine with rate-limited code verification
//! - Persisted hub-authorization store with constant-time token checks
//! - Single-slot chunked upload sessions with staged, atomic installs
//! - Bounded per-topic event queues for an optional on-device observer
//! - The per-connection protocol engine and TCP server
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        AgentServer                               │
//! │   (TCP accept loop, one serviced connection, maintenance)       │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                     ConnectionEngine                             │
//! │   (phase machine + envelope dispatch, transport-free)           │
//! ├────────────────┬──────────────────┬─────────────────────────────┤
//! │ PairingManager │  UploadManager   │  Library                    │
//! │ (codes, tokens,│  (staging I/O,   │  (installed artifacts)      │
//! │  lockout)      │   finalization)  │                             │
//! ├────────────────┴──────────────────┴─────────────────────────────┤
//! │                        EventQueue                                │
//! │   (bounded per-topic FIFOs toward the observer)                 │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod identity;
pub mod library;
pub mod pairing;
pub mod server;
pub mod store;
pub mod upload;

pub use config::AgentConfig;
pub use engine::{Action, AgentState, ConnectionEngine, Phase};
pub use error::{AgentError, Result};
pub use events::{EventEntry, EventQueue, OperationEvent, Topic};
pub use identity::{AGENT_VERSION, Advertisement, AgentIdentity};
pub use library::{InstalledGame, Library};
pub use pairing::{HubInfo, PairingConfig, PairingManager};
pub use server::{AgentHandle, AgentServer};
pub use store::{AuthorizedHub, HubToken, TokenStore};
pub use upload::{ChunkAckInfo, SessionState, UploadConfig, UploadManager, UploadStatus};
