//! Room state: CRUD operations and the anti-entropy merge.

use std::collections::HashSet;

use tracing::debug;

use termaaz_shared::constants::{
    MAX_VISIBLE_MESSAGES, SYSTEM_USER_COLOR, SYSTEM_USER_ID, SYSTEM_USER_NAME,
};
use termaaz_shared::protocol::{RoomSnapshot, TodoPatch};
use termaaz_shared::time::now_millis;
use termaaz_shared::types::{
    FileId, Message, MessageId, MessageKind, Priority, Room, SharedFile, Todo, TodoId, User,
    UserId,
};

use crate::error::{Result, StoreError};

/// A message about to enter the room; the store assigns the id.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub user_id: UserId,
    pub user_name: String,
    pub user_color: String,
    pub content: String,
    pub timestamp: i64,
    pub kind: MessageKind,
    pub reply_to: Option<MessageId>,
    pub file_info: Option<SharedFile>,
}

/// The canonical local replica. Owned by a single engine task; every
/// mutation happens inside that task's handler code.
#[derive(Debug)]
pub struct RoomState {
    room: Room,
    local_user: User,
}

impl RoomState {
    /// Create the replica for a freshly created or joined room. The
    /// local user becomes the first member.
    pub fn new(mut room: Room, local_user: User) -> Self {
        room.members.push(local_user.clone());
        Self { room, local_user }
    }

    pub fn room(&self) -> &Room {
        &self.room
    }

    pub fn local_user(&self) -> &User {
        &self.local_user
    }

    pub fn set_local_name(&mut self, name: impl Into<String>) {
        let name = name.into();
        if let Some(member) = self
            .room
            .members
            .iter_mut()
            .find(|m| m.id == self.local_user.id)
        {
            member.name = name.clone();
        }
        self.local_user.name = name;
    }

    // --- Messages ------------------------------------------------------

    /// Append a message, assigning a fresh id, and trim the list to the
    /// most recent `MAX_VISIBLE_MESSAGES` (oldest dropped first).
    pub fn add_message(&mut self, new: NewMessage) -> Message {
        let message = Message {
            id: MessageId::random(),
            user_id: new.user_id,
            user_name: new.user_name,
            user_color: new.user_color,
            content: new.content,
            timestamp: new.timestamp,
            kind: new.kind,
            reply_to: new.reply_to,
            file_info: new.file_info,
        };
        self.room.messages.push(message.clone());

        if self.room.messages.len() > MAX_VISIBLE_MESSAGES {
            let excess = self.room.messages.len() - MAX_VISIBLE_MESSAGES;
            self.room.messages.drain(..excess);
        }

        message
    }

    /// Append a message with the fixed system author.
    pub fn add_system_message(&mut self, content: impl Into<String>) -> Message {
        self.add_message(NewMessage {
            user_id: UserId::new(SYSTEM_USER_ID),
            user_name: SYSTEM_USER_NAME.to_string(),
            user_color: SYSTEM_USER_COLOR.to_string(),
            content: content.into(),
            timestamp: now_millis(),
            kind: MessageKind::System,
            reply_to: None,
            file_info: None,
        })
    }

    pub fn messages(&self) -> &[Message] {
        &self.room.messages
    }

    pub fn clear_messages(&mut self) {
        self.room.messages.clear();
    }

    // --- Todos ----------------------------------------------------------

    /// Create a todo authored by the local user.
    pub fn add_todo(&mut self, content: impl Into<String>, priority: Priority) -> Todo {
        let todo = Todo {
            id: TodoId::random(),
            content: content.into(),
            completed: false,
            created_by: self.local_user.id.clone(),
            created_by_name: self.local_user.name.clone(),
            created_at: now_millis(),
            assigned_to: None,
            priority,
            completed_by: None,
            completed_at: None,
        };
        self.room.todos.push(todo.clone());
        todo
    }

    /// Insert a todo created elsewhere, preserving its id so that the
    /// merge dedup keys stay globally unique. Returns false on a
    /// duplicate id.
    pub fn insert_todo(&mut self, todo: Todo) -> bool {
        if self.room.todos.iter().any(|t| t.id == todo.id) {
            return false;
        }
        self.room.todos.push(todo);
        true
    }

    /// Apply a partial update in place. Setting `completed = true`
    /// stamps the completer: the patch's own stamp wins when present,
    /// otherwise the local user is recorded. Last applied wins; there
    /// is no causal ordering for concurrent updates.
    pub fn update_todo(&mut self, patch: &TodoPatch) -> Option<Todo> {
        let todo = self.room.todos.iter_mut().find(|t| t.id == patch.id)?;

        if let Some(content) = &patch.content {
            todo.content = content.clone();
        }
        if let Some(priority) = patch.priority {
            todo.priority = priority;
        }
        if let Some(assigned_to) = &patch.assigned_to {
            todo.assigned_to = Some(assigned_to.clone());
        }
        if let Some(completed) = patch.completed {
            todo.completed = completed;
            if completed {
                todo.completed_by = Some(
                    patch
                        .completed_by
                        .clone()
                        .unwrap_or_else(|| self.local_user.id.clone()),
                );
                todo.completed_at = Some(patch.completed_at.unwrap_or_else(now_millis));
            }
        }

        Some(todo.clone())
    }

    pub fn delete_todo(&mut self, id: &TodoId) -> bool {
        let before = self.room.todos.len();
        self.room.todos.retain(|t| &t.id != id);
        self.room.todos.len() < before
    }

    pub fn todos(&self) -> &[Todo] {
        &self.room.todos
    }

    // --- Shared files ----------------------------------------------------

    /// Record a shared file. Returns false on a duplicate id.
    pub fn add_shared_file(&mut self, file: SharedFile) -> bool {
        if self.room.shared_files.iter().any(|f| f.id == file.id) {
            return false;
        }
        self.room.shared_files.push(file);
        true
    }

    /// Flip a shared-file record to locally available after a completed
    /// download.
    pub fn mark_file_available(&mut self, id: &FileId, local_path: &str) -> Result<SharedFile> {
        let file = self
            .room
            .shared_files
            .iter_mut()
            .find(|f| &f.id == id)
            .ok_or(StoreError::NotFound)?;
        file.is_available = true;
        file.local_path = local_path.to_string();
        Ok(file.clone())
    }

    pub fn shared_files(&self) -> &[SharedFile] {
        &self.room.shared_files
    }

    // --- Members ----------------------------------------------------------

    /// Add a member; no-op when the user id is already present.
    pub fn add_peer(&mut self, user: User) -> bool {
        if self.room.members.iter().any(|m| m.id == user.id) {
            return false;
        }
        self.room.members.push(user);
        true
    }

    pub fn remove_peer(&mut self, user_id: &UserId) -> Option<User> {
        let idx = self.room.members.iter().position(|m| &m.id == user_id)?;
        Some(self.room.members.remove(idx))
    }

    pub fn set_peer_typing(&mut self, user_id: &UserId, is_typing: bool) -> bool {
        match self.room.members.iter_mut().find(|m| &m.id == user_id) {
            Some(member) => {
                member.is_typing = is_typing;
                true
            }
            None => false,
        }
    }

    pub fn members(&self) -> &[User] {
        &self.room.members
    }

    pub fn typing_users(&self) -> Vec<&User> {
        self.room
            .members
            .iter()
            .filter(|m| m.is_typing && m.id != self.local_user.id)
            .collect()
    }

    // --- Anti-entropy merge ------------------------------------------------

    /// Merge a remote snapshot: add only entries whose id is not
    /// already present, per list, then re-sort messages ascending by
    /// timestamp. Commutative and idempotent for additions; concurrent
    /// field updates are out of scope here.
    pub fn sync_from_peer(&mut self, snapshot: RoomSnapshot) {
        let existing: HashSet<MessageId> =
            self.room.messages.iter().map(|m| m.id.clone()).collect();
        for message in snapshot.messages {
            if !existing.contains(&message.id) {
                self.room.messages.push(message);
            }
        }
        self.room.messages.sort_by_key(|m| m.timestamp);

        let existing: HashSet<TodoId> = self.room.todos.iter().map(|t| t.id.clone()).collect();
        for todo in snapshot.todos {
            if !existing.contains(&todo.id) {
                self.room.todos.push(todo);
            }
        }

        let existing: HashSet<FileId> = self
            .room
            .shared_files
            .iter()
            .map(|f| f.id.clone())
            .collect();
        for file in snapshot.shared_files {
            if !existing.contains(&file.id) {
                self.room.shared_files.push(file);
            }
        }

        let existing: HashSet<UserId> = self.room.members.iter().map(|m| m.id.clone()).collect();
        for member in snapshot.members {
            if !existing.contains(&member.id) {
                self.room.members.push(member);
            }
        }

        debug!(
            messages = self.room.messages.len(),
            todos = self.room.todos.len(),
            files = self.room.shared_files.len(),
            members = self.room.members.len(),
            "Merged remote snapshot"
        );
    }

    /// Snapshot of the four lists for transmission to a syncing peer.
    pub fn sync_data(&self) -> RoomSnapshot {
        RoomSnapshot {
            messages: self.room.messages.clone(),
            todos: self.room.todos.clone(),
            shared_files: self.room.shared_files.clone(),
            members: self.room.members.clone(),
        }
    }
}
