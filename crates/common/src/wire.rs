//! Tunnel wire protocol.
//!
//! Every message on a tunnel connection is one `TunnelFrame`, serialized as
//! JSON and prefixed with a big-endian `u32` payload length. Binary payloads
//! travel as base64 strings inside `download_backup` / `upload_backup_chunk`
//! frames so control and data share a single message-typed channel.

use base64::{engine::general_purpose, Engine as _};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Errors produced by the frame codec.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("malformed tunnel frame: {0}")]
    MalformedFrame(#[from] serde_json::Error),
    #[error("invalid base64 chunk: {0}")]
    InvalidChunk(#[from] base64::DecodeError),
    #[error("frame exceeds maximum length of {max} bytes")]
    FrameTooLarge { max: usize },
    #[error("stream ended mid-frame")]
    Truncated,
}

/// Upper bound on a single encoded frame. Chunked payloads keep individual
/// frames small; anything larger indicates a broken or hostile peer.
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

/// A frame exchanged between the control plane and an agent.
///
/// The `type` tag values are part of the agent contract and must not change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum TunnelFrame {
    // Handshake and keepalive.
    ClientHello {
        node_id: Uuid,
        agent_version: String,
        heartbeat_interval_secs: u64,
    },
    ServerHello {
        tunnel_id: Uuid,
        heartbeat_timeout_secs: u64,
    },
    Heartbeat {
        sent_at: String,
    },
    HeartbeatAck {
        received_at: String,
    },

    // Commands issued by the control plane. `request_id` is present when the
    // caller expects a correlated reply.
    InstallServer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        server_id: Uuid,
        server_uuid: Uuid,
        #[serde(default)]
        data: serde_json::Value,
    },
    StartServer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        server_id: Uuid,
    },
    StopServer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        server_id: Uuid,
    },
    DeleteBackup {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        server_uuid: Uuid,
        backup_path: String,
    },
    DownloadBackupStart {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        server_uuid: Uuid,
        backup_path: String,
    },
    UploadBackupStart {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        server_uuid: Uuid,
        backup_path: String,
    },
    UploadBackupChunk {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        chunk: String,
    },
    UploadBackupComplete {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },

    // Correlated results reported by the agent.
    Reply {
        request_id: String,
        #[serde(default)]
        data: serde_json::Value,
    },
    ReplyError {
        request_id: String,
        message: String,
    },

    // Binary stream frames produced by the agent for one in-flight
    // `download_backup_start` request, ended by `stream_end` on success or
    // `stream_error` on failure.
    DownloadBackup {
        request_id: String,
        chunk: String,
    },
    StreamEnd {
        request_id: String,
    },
    StreamError {
        request_id: String,
        message: String,
    },
}

impl TunnelFrame {
    /// Correlation id carried by this frame, if any.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            TunnelFrame::ClientHello { .. }
            | TunnelFrame::ServerHello { .. }
            | TunnelFrame::Heartbeat { .. }
            | TunnelFrame::HeartbeatAck { .. } => None,
            TunnelFrame::InstallServer { request_id, .. }
            | TunnelFrame::StartServer { request_id, .. }
            | TunnelFrame::StopServer { request_id, .. }
            | TunnelFrame::DeleteBackup { request_id, .. }
            | TunnelFrame::DownloadBackupStart { request_id, .. }
            | TunnelFrame::UploadBackupStart { request_id, .. }
            | TunnelFrame::UploadBackupChunk { request_id, .. }
            | TunnelFrame::UploadBackupComplete { request_id } => request_id.as_deref(),
            TunnelFrame::Reply { request_id, .. }
            | TunnelFrame::ReplyError { request_id, .. }
            | TunnelFrame::DownloadBackup { request_id, .. }
            | TunnelFrame::StreamEnd { request_id }
            | TunnelFrame::StreamError { request_id, .. } => Some(request_id),
        }
    }

    /// Stamps a correlation id into a command frame. Frames that carry a
    /// mandatory id or no id at all are left untouched.
    pub fn set_request_id(&mut self, id: String) {
        match self {
            TunnelFrame::InstallServer { request_id, .. }
            | TunnelFrame::StartServer { request_id, .. }
            | TunnelFrame::StopServer { request_id, .. }
            | TunnelFrame::DeleteBackup { request_id, .. }
            | TunnelFrame::DownloadBackupStart { request_id, .. }
            | TunnelFrame::UploadBackupStart { request_id, .. }
            | TunnelFrame::UploadBackupChunk { request_id, .. }
            | TunnelFrame::UploadBackupComplete { request_id } => *request_id = Some(id),
            TunnelFrame::ClientHello { .. }
            | TunnelFrame::ServerHello { .. }
            | TunnelFrame::Heartbeat { .. }
            | TunnelFrame::HeartbeatAck { .. }
            | TunnelFrame::Reply { .. }
            | TunnelFrame::ReplyError { .. }
            | TunnelFrame::DownloadBackup { .. }
            | TunnelFrame::StreamEnd { .. }
            | TunnelFrame::StreamError { .. } => {}
        }
    }
}

/// Operations an agent services through the file tunnel long-poll path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOperation {
    ReadDirectory,
    DownloadBackup,
    UploadBackup,
    DeleteBackup,
}

impl FileOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileOperation::ReadDirectory => "read_directory",
            FileOperation::DownloadBackup => "download_backup",
            FileOperation::UploadBackup => "upload_backup",
            FileOperation::DeleteBackup => "delete_backup",
        }
    }
}

/// One unit of work handed to a polling agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRequest {
    pub request_id: String,
    pub operation: FileOperation,
    pub server_uuid: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Set when inbound upload bytes are staged for this request; the agent
    /// fetches them separately.
    #[serde(default)]
    pub has_upload: bool,
}

/// Encodes a binary chunk for embedding in a JSON frame.
pub fn encode_chunk(data: &[u8]) -> String {
    general_purpose::STANDARD.encode(data)
}

/// Decodes a base64 chunk from a frame.
pub fn decode_chunk(chunk: &str) -> Result<Bytes, WireError> {
    Ok(Bytes::from(general_purpose::STANDARD.decode(chunk)?))
}

/// Serializes a frame with its length prefix.
pub fn encode_frame(frame: &TunnelFrame) -> Result<Bytes, WireError> {
    let payload = serde_json::to_vec(frame)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge { max: MAX_FRAME_LEN });
    }
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);
    Ok(buf.freeze())
}

/// Attempts to parse one frame from the front of `buffer`.
///
/// Returns `Ok(None)` when the buffer does not yet hold a complete frame;
/// consumed bytes are removed only once a full frame is available.
pub fn try_parse_frame(buffer: &mut BytesMut) -> Result<Option<TunnelFrame>, WireError> {
    if buffer.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]) as usize;
    if len > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge { max: MAX_FRAME_LEN });
    }
    if buffer.len() < 4 + len {
        return Ok(None);
    }

    buffer.advance(4);
    let payload = buffer.split_to(len);
    let frame = serde_json::from_slice(&payload)?;
    Ok(Some(frame))
}
