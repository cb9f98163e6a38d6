//! Message envelope and typed payloads.
//!
//! Dispatch is a closed enum: unrecognized `type` strings deserialize to
//! [`MessageKind::Unknown`] and the engine answers them with a protocol
//! error instead of dropping the connection.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use crate::error::{ProtoError, WireError};

/// The closed set of message types on the hub/agent link.
///
/// Request/response pairs flow hub→agent→hub; push kinds are emitted by the
/// agent without a correlating request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    // Handshake and pairing
    /// Hub introduces itself; carries protocol version and optional token.
    HubConnect,
    /// Agent accepts an authenticated hub.
    AgentStatus,
    /// Agent requires pairing; payload carries the code TTL (never the code).
    PairingRequired,
    /// Hub submits the pairing code the user read off the device.
    PairConfirm,
    /// Pairing succeeded; payload carries the minted token.
    PairSuccess,
    /// Pairing failed (wrong code, expired, or locked out).
    PairFailed,

    // Keepalive and status
    /// Keepalive probe.
    Ping,
    /// Keepalive answer.
    Pong,
    /// Hub asks for agent status.
    GetStatus,
    /// Status answer.
    StatusResponse,

    // Upload session
    /// Declare an incoming transfer.
    BeginUpload,
    /// Agent accepted the transfer; payload carries session id + chunk size.
    UploadAccepted,
    /// One chunk of file data.
    UploadChunk,
    /// Agent acknowledges a chunk.
    ChunkAck,
    /// Hub declares the transfer complete.
    FinishUpload,
    /// Hub abandons the transfer.
    CancelUpload,
    /// Generic completion answer for finish/cancel/uninstall.
    OperationResult,

    // Library management
    /// Hub asks for the installed-game list.
    ListInstalled,
    /// Installed-game list answer.
    InstalledList,
    /// Hub removes a previously installed game.
    Uninstall,

    // Errors
    /// Error response correlated to a request id.
    Error,

    /// Fallback for unrecognized type strings.
    #[serde(other)]
    Unknown,
}

/// JSON message envelope.
///
/// Every request is correlated to its response via `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Correlation id; empty for agent-originated push messages.
    #[serde(default)]
    pub id: String,
    /// Message type tag.
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// Type-specific payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    /// Error body, only present on `error` envelopes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl Envelope {
    /// Build a response envelope with a typed payload.
    ///
    /// # Errors
    ///
    /// Returns [`ProtoError::Malformed`] if the payload fails to serialize.
    pub fn response<T: Serialize>(
        id: impl Into<String>,
        kind: MessageKind,
        payload: &T,
    ) -> Result<Self, ProtoError> {
        Ok(Self {
            id: id.into(),
            kind,
            payload: Some(serde_json::to_value(payload)?),
            error: None,
        })
    }

    /// Build a payload-less envelope (ping/pong, simple requests).
    pub fn bare(id: impl Into<String>, kind: MessageKind) -> Self {
        Self {
            id: id.into(),
            kind,
            payload: None,
            error: None,
        }
    }

    /// Build an error envelope correlated to `id`.
    pub fn error(id: impl Into<String>, error: WireError) -> Self {
        Self {
            id: id.into(),
            kind: MessageKind::Error,
            payload: None,
            error: Some(error),
        }
    }

    /// Deserialize the payload into a concrete type.
    ///
    /// # Errors
    ///
    /// Returns [`ProtoError::MissingPayload`] if no payload is present, or
    /// [`ProtoError::Malformed`] if it does not match `T`.
    pub fn decode_payload<T: for<'de> Deserialize<'de>>(
        &self,
        kind_name: &'static str,
    ) -> Result<T, ProtoError> {
        let value = self
            .payload
            .as_ref()
            .ok_or(ProtoError::MissingPayload(kind_name))?;
        Ok(serde_json::from_value(value.clone())?)
    }
}

/// `hub_connect` payload: handshake and optional token presentation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HubConnect {
    /// Stable hub identifier.
    pub hub_id: String,
    /// Hub display name.
    #[serde(default)]
    pub name: String,
    /// Hub platform tag (e.g. "windows", "linux").
    #[serde(default)]
    pub platform: String,
    /// Hub software version, informational.
    #[serde(default)]
    pub version: String,
    /// Protocol version the hub speaks. Zero is treated as version 1
    /// (pre-negotiation hubs never sent the field).
    #[serde(default)]
    pub protocol_version: u32,
    /// Bearer token from a previous pairing, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// `agent_status` payload: sent when a hub authenticates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatus {
    /// Agent display name.
    pub name: String,
    /// Agent software version.
    pub version: String,
    /// Agent platform tag.
    pub platform: String,
    /// Whether the agent is accepting transfers.
    pub accept_connections: bool,
    /// Protocol version the agent speaks.
    pub protocol_version: u32,
    /// Whether hardware telemetry streaming is offered.
    #[serde(default)]
    pub telemetry_enabled: bool,
    /// Telemetry sampling interval in seconds.
    #[serde(default)]
    pub telemetry_interval: u64,
    /// Whether console-log streaming is offered.
    #[serde(default)]
    pub console_log_enabled: bool,
}

/// `pairing_required` payload.
///
/// The code itself goes to the on-device observer, never to the hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingRequired {
    /// Seconds until the pairing code expires.
    pub expires_in: u64,
}

/// `pair_confirm` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairConfirm {
    /// The human-entered pairing code.
    pub code: String,
}

/// `pair_success` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairSuccess {
    /// Bearer token for future connections.
    pub token: String,
}

/// `status_response` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    /// Agent identity.
    pub agent_id: String,
    /// Agent display name.
    pub agent_name: String,
    /// Agent platform tag.
    pub platform: String,
    /// Agent software version.
    pub version: String,
    /// Install root as configured (unexpanded).
    pub install_path: String,
    /// Whether an upload session is currently receiving.
    pub uploading: bool,
}

/// `begin_upload` payload: declares an incoming transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BeginUpload {
    /// Game name; becomes the destination directory under the install root.
    pub name: String,
    /// Declared total size in bytes across all files.
    pub total_size: u64,
    /// Relative destination hint under the install root. Defaults to `name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
}

/// `upload_accepted` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadAccepted {
    /// Session id to present on every chunk.
    pub session_id: String,
    /// Preferred chunk size in bytes.
    pub chunk_size: usize,
}

/// `upload_chunk` payload: one chunk of file data, base64-encoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadChunk {
    /// Session id from `upload_accepted`.
    pub session_id: String,
    /// Relative path of the file this chunk belongs to.
    pub file_path: String,
    /// Byte offset of this chunk within the whole transfer.
    pub offset: u64,
    /// Base64-encoded chunk bytes.
    pub data: String,
}

impl UploadChunk {
    /// Decode the chunk bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ProtoError::ChunkEncoding`] on invalid base64.
    pub fn decode_data(&self) -> Result<Vec<u8>, ProtoError> {
        Ok(BASE64.decode(&self.data)?)
    }

    /// Build a chunk payload from raw bytes.
    pub fn from_bytes(
        session_id: impl Into<String>,
        file_path: impl Into<String>,
        offset: u64,
        bytes: &[u8],
    ) -> Self {
        Self {
            session_id: session_id.into(),
            file_path: file_path.into(),
            offset,
            data: BASE64.encode(bytes),
        }
    }
}

/// `chunk_ack` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkAck {
    /// Session id.
    pub session_id: String,
    /// Bytes accepted from this chunk (zero for idempotently ignored
    /// duplicates).
    pub bytes_written: u64,
    /// Total bytes received so far.
    pub total_received: u64,
}

/// `finish_upload` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinishUpload {
    /// Session id.
    pub session_id: String,
    /// Optional BLAKE3 hash (hex) over the concatenated transfer bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

/// `cancel_upload` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadCancel {
    /// Session id.
    pub session_id: String,
}

/// `operation_result` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResult {
    /// Whether the operation succeeded.
    pub success: bool,
    /// Final artifact path on success, when applicable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Failure or status detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// One entry of `installed_list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstalledEntry {
    /// Game name (directory name under the install root).
    pub name: String,
    /// Absolute path of the installed directory.
    pub path: String,
    /// Total size in bytes.
    pub size: u64,
}

/// `installed_list` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstalledList {
    /// Installed games.
    pub games: Vec<InstalledEntry>,
}

/// `uninstall` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UninstallRequest {
    /// Game name to remove.
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn test_kind_tag_roundtrip() {
        let json = serde_json::to_string(&MessageKind::BeginUpload).unwrap();
        assert_eq!(json, "\"begin_upload\"");
        let kind: MessageKind = serde_json::from_str("\"pair_confirm\"").unwrap();
        assert_eq!(kind, MessageKind::PairConfirm);
    }

    #[test]
    fn test_unknown_kind_falls_back() {
        let kind: MessageKind = serde_json::from_str("\"launch_missiles\"").unwrap();
        assert_eq!(kind, MessageKind::Unknown);
    }

    #[test]
    fn test_envelope_roundtrip() {
        let env = Envelope::response(
            "req-1",
            MessageKind::UploadAccepted,
            &UploadAccepted {
                session_id: "s-1".into(),
                chunk_size: 1024,
            },
        )
        .unwrap();

        let json = serde_json::to_string(&env).unwrap();
        let parsed: Envelope = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.id, "req-1");
        assert_eq!(parsed.kind, MessageKind::UploadAccepted);
        let payload: UploadAccepted = parsed.decode_payload("upload_accepted").unwrap();
        assert_eq!(payload.session_id, "s-1");
        assert_eq!(payload.chunk_size, 1024);
    }

    #[test]
    fn test_error_envelope() {
        let env = Envelope::error("req-2", WireError::new(ErrorCode::Unauthorized, "no token"));
        let json = serde_json::to_string(&env).unwrap();
        let parsed: Envelope = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.kind, MessageKind::Error);
        assert_eq!(parsed.error.unwrap().code, 401);
    }

    #[test]
    fn test_missing_payload_rejected() {
        let env = Envelope::bare("req-3", MessageKind::BeginUpload);
        let result: Result<BeginUpload, _> = env.decode_payload("begin_upload");
        assert!(matches!(result, Err(ProtoError::MissingPayload(_))));
    }

    #[test]
    fn test_chunk_data_roundtrip() {
        let chunk = UploadChunk::from_bytes("s-1", "bin/game.exe", 4096, b"chunk bytes");
        assert_eq!(chunk.decode_data().unwrap(), b"chunk bytes");
    }

    #[test]
    fn test_chunk_bad_base64() {
        let chunk = UploadChunk {
            session_id: "s-1".into(),
            file_path: "a".into(),
            offset: 0,
            data: "not//valid!!base64~~".into(),
        };
        assert!(matches!(
            chunk.decode_data(),
            Err(ProtoError::ChunkEncoding(_))
        ));
    }

    #[test]
    fn test_hub_connect_defaults() {
        // Minimal handshake from an old hub: only hubId present.
        let json = r#"{"hubId":"hub-1"}"#;
        let hc: HubConnect = serde_json::from_str(json).unwrap();
        assert_eq!(hc.hub_id, "hub-1");
        assert_eq!(hc.protocol_version, 0);
        assert!(hc.token.is_none());
    }
}
