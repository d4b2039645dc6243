use serde::{Deserialize, Serialize};

use crate::constants::USER_COLORS;
use crate::time::now_millis;

fn random_hex(len: usize) -> String {
    let bytes: Vec<u8> = (0..len).map(|_| rand::random::<u8>()).collect();
    hex::encode(bytes)
}

/// Pick a random color from the fixed palette.
pub fn random_color() -> String {
    let idx = rand::random::<usize>() % USER_COLORS.len();
    USER_COLORS[idx].to_string()
}

// Entity ids are random hex strings, stable for the session. An 8-byte
// id for participants and files, a 4-byte short id for messages and
// todos.

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn random() -> Self {
        Self(random_hex(8))
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn random() -> Self {
        Self(random_hex(4))
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TodoId(pub String);

impl TodoId {
    pub fn random() -> Self {
        Self(random_hex(4))
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for TodoId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(pub String);

impl FileId {
    pub fn random() -> Self {
        Self(random_hex(8))
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One human participant. The id is the join key across peer records,
/// room membership, and authorship fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub color: String,
    pub joined_at: i64,
    pub is_typing: bool,
    pub last_seen: i64,
}

impl User {
    /// Create a fresh local identity with a random id and color.
    pub fn new(name: impl Into<String>) -> Self {
        let now = now_millis();
        Self {
            id: UserId::random(),
            name: name.into(),
            color: random_color(),
            joined_at: now,
            is_typing: false,
            last_seen: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    System,
    File,
    Url,
    Reply,
}

/// A chat entry. Immutable once created; the room only appends and trims.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub user_id: UserId,
    pub user_name: String,
    pub user_color: String,
    pub content: String,
    pub timestamp: i64,
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_info: Option<SharedFile>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

/// A shared todo item. Mutable in place via partial updates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Todo {
    pub id: TodoId,
    pub content: String,
    pub completed: bool,
    pub created_by: UserId,
    pub created_by_name: String,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<UserId>,
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_by: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
}

/// A file advertised to the room. `is_available` stays false on the
/// receiving side until every byte has been downloaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedFile {
    pub id: FileId,
    pub name: String,
    pub size: u64,
    /// Path on the sharer's machine. Informational only for remote peers.
    pub remote_path: String,
    /// Path where the bytes live locally, once available.
    pub local_path: String,
    pub shared_by: UserId,
    pub shared_by_name: String,
    pub shared_at: i64,
    pub mime_type: String,
    pub is_directory: bool,
    pub is_available: bool,
}

/// The singleton local replica of the collaboration session.
#[derive(Debug, Clone)]
pub struct Room {
    pub id: String,
    pub name: String,
    pub topic: Vec<u8>,
    pub created_at: i64,
    pub members: Vec<User>,
    pub messages: Vec<Message>,
    pub todos: Vec<Todo>,
    pub shared_files: Vec<SharedFile>,
}

impl Room {
    pub fn new(id: impl Into<String>, name: impl Into<String>, topic: Vec<u8>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            topic,
            created_at: now_millis(),
            members: Vec::new(),
            messages: Vec::new(),
            todos: Vec::new(),
            shared_files: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_lengths() {
        assert_eq!(UserId::random().0.len(), 16);
        assert_eq!(MessageId::random().0.len(), 8);
        assert_eq!(FileId::random().0.len(), 16);
    }

    #[test]
    fn test_random_color_is_from_palette() {
        let color = random_color();
        assert!(USER_COLORS.contains(&color.as_str()));
    }

    #[test]
    fn test_user_serializes_camel_case() {
        let user = User::new("alice");
        let json = serde_json::to_value(&user).unwrap();
        assert!(json.get("joinedAt").is_some());
        assert!(json.get("isTyping").is_some());
        assert!(json.get("joined_at").is_none());
    }

    #[test]
    fn test_priority_wire_names() {
        assert_eq!(serde_json::to_string(&Priority::High).unwrap(), "\"high\"");
        let p: Priority = serde_json::from_str("\"low\"").unwrap();
        assert_eq!(p, Priority::Low);
    }
}
