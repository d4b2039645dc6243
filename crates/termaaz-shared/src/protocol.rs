//! The wire envelope and its per-kind payloads.
//!
//! One JSON object per line crosses the wire, shaped as
//! `{kind, senderId, senderName, timestamp, payload}`. The payload is a
//! closed tagged union keyed by `kind`; every variant carries its own
//! concretely typed fields.

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::types::{FileId, MessageId, Priority, SharedFile, Todo, TodoId, User, UserId};

/// The wire envelope. This is the only thing that crosses the wire;
/// all other entities are local projections built from received
/// envelopes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub sender_id: UserId,
    pub sender_name: String,
    pub timestamp: i64,
    #[serde(flatten)]
    pub payload: Payload,
}

impl Envelope {
    /// Serialize to a single newline-terminated wire line.
    pub fn to_line(&self) -> Result<String, ProtocolError> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Parse one wire line (without requiring the trailing newline).
    pub fn from_line(line: &str) -> Result<Self, ProtocolError> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Err(ProtocolError::Empty);
        }
        Ok(serde_json::from_str(trimmed)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum Payload {
    Join(JoinPayload),
    Leave(LeavePayload),
    Chat(ChatPayload),
    Typing(TypingPayload),
    StopTyping(TypingPayload),
    TodoAdd(Todo),
    TodoUpdate(TodoPatch),
    TodoDelete(TodoDeletePayload),
    FileShare(SharedFile),
    FileRequest(FileRequestPayload),
    FileChunk(ChunkPayload),
    /// Opaque signaling for the external video subsystem.
    VideoOffer(serde_json::Value),
    VideoAnswer(serde_json::Value),
    VideoIce(serde_json::Value),
    /// Opaque rendered frame from the external video subsystem; the
    /// core never inspects frame contents.
    VideoFrame(serde_json::Value),
    Ping(Empty),
    Pong(Empty),
    SyncRequest(Empty),
    SyncResponse(RoomSnapshot),
}

impl Payload {
    /// Wire name of this payload's kind, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Join(_) => "join",
            Payload::Leave(_) => "leave",
            Payload::Chat(_) => "chat",
            Payload::Typing(_) => "typing",
            Payload::StopTyping(_) => "stop_typing",
            Payload::TodoAdd(_) => "todo_add",
            Payload::TodoUpdate(_) => "todo_update",
            Payload::TodoDelete(_) => "todo_delete",
            Payload::FileShare(_) => "file_share",
            Payload::FileRequest(_) => "file_request",
            Payload::FileChunk(_) => "file_chunk",
            Payload::VideoOffer(_) => "video_offer",
            Payload::VideoAnswer(_) => "video_answer",
            Payload::VideoIce(_) => "video_ice",
            Payload::VideoFrame(_) => "video_frame",
            Payload::Ping(_) => "ping",
            Payload::Pong(_) => "pong",
            Payload::SyncRequest(_) => "sync_request",
            Payload::SyncResponse(_) => "sync_response",
        }
    }
}

/// Empty payload body, serialized as `{}` so that kinds like `ping`
/// always carry a payload field.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Empty {}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinPayload {
    pub user_id: UserId,
    pub user_name: String,
    pub user_color: String,
    pub protocol_version: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeavePayload {
    pub user_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatPayload {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
    pub user_color: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    pub user_color: String,
}

/// Partial todo update: only the present fields are applied.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TodoPatch {
    pub id: TodoId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_by: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TodoDeletePayload {
    pub id: TodoId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRequestPayload {
    pub file_id: FileId,
}

/// One fixed-size slice of a file's bytes, tagged with its index.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkPayload {
    pub file_id: FileId,
    pub chunk_index: u32,
    pub total_chunks: u32,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

/// Full state snapshot exchanged during the join-time sync handshake.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshot {
    pub messages: Vec<crate::types::Message>,
    pub todos: Vec<Todo>,
    pub shared_files: Vec<SharedFile>,
    pub members: Vec<User>,
}

/// Chunk bytes travel base64-encoded inside the JSON line.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
