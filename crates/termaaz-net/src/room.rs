//! Creating and joining rooms: ties a transport, a topic, and a fresh
//! engine together.

use tokio::sync::mpsc;
use tracing::info;

use termaaz_shared::types::{Room, User};

use crate::engine::{spawn_engine, EngineConfig, RoomEvent, RoomHandle};
use crate::error::NetError;
use crate::topic::{generate_room_code, Topic};
use crate::transport::Transport;

/// A live room session. Dropping it does not announce departure; call
/// [`JoinedRoom::leave`] for a graceful exit.
pub struct JoinedRoom {
    pub room_id: String,
    pub local_user: User,
    pub handle: RoomHandle,
    pub events: mpsc::Receiver<RoomEvent>,
    transport: Box<dyn Transport>,
}

impl JoinedRoom {
    /// Broadcast a leave, stop the engine, and stop advertising on the
    /// transport.
    pub async fn leave(mut self) -> Result<(), NetError> {
        self.handle.shutdown().await?;
        self.transport.leave().await.map_err(NetError::Transport)?;
        Ok(())
    }
}

impl std::fmt::Debug for JoinedRoom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinedRoom")
            .field("room_id", &self.room_id)
            .field("local_user", &self.local_user.id)
            .finish_non_exhaustive()
    }
}

/// Create a new room under a freshly generated 4-digit code.
pub async fn create_room<T: Transport + 'static>(
    transport: T,
    user_name: impl Into<String>,
    config: EngineConfig,
) -> Result<JoinedRoom, NetError> {
    let code = generate_room_code();
    join_room(transport, &code, user_name, config).await
}

/// Join the room identified by `room_id`. Anyone who derives the same
/// topic converges on the same mesh; there is no distinguished host.
pub async fn join_room<T: Transport + 'static>(
    mut transport: T,
    room_id: &str,
    user_name: impl Into<String>,
    config: EngineConfig,
) -> Result<JoinedRoom, NetError> {
    let room_id = room_id.trim().to_string();
    let topic = Topic::for_room(&room_id);
    let incoming = transport.join(&topic).await.map_err(NetError::Transport)?;

    let local_user = User::new(user_name);
    let room = Room::new(&room_id, format!("Room {room_id}"), topic.to_vec());
    let (handle, events) = spawn_engine(room, local_user.clone(), incoming, config)?;

    info!(room = %room_id, topic = %topic, user = %local_user.id, "Joined room");
    Ok(JoinedRoom {
        room_id,
        local_user,
        handle,
        events,
        transport: Box::new(transport),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryHub;

    fn test_config(dir: &std::path::Path) -> EngineConfig {
        EngineConfig {
            download_dir: dir.join("downloads"),
            ..EngineConfig::default()
        }
    }

    #[tokio::test]
    async fn test_create_room_reports_ready() {
        let dir = tempfile::tempdir().unwrap();
        let hub = MemoryHub::new();

        let mut joined = create_room(hub.transport(), "alice", test_config(dir.path()))
            .await
            .unwrap();

        assert_eq!(joined.room_id.len(), 4);
        match joined.events.recv().await.unwrap() {
            RoomEvent::Ready {
                room_id,
                local_user,
            } => {
                assert_eq!(room_id, joined.room_id);
                assert_eq!(local_user.name, "alice");
            }
            other => panic!("expected Ready, got {other:?}"),
        }

        joined.leave().await.unwrap();
    }

    #[tokio::test]
    async fn test_room_id_is_trimmed_before_topic_derivation() {
        let dir = tempfile::tempdir().unwrap();
        let hub = MemoryHub::new();

        let joined = join_room(hub.transport(), " 4321 ", "bob", test_config(dir.path()))
            .await
            .unwrap();
        assert_eq!(joined.room_id, "4321");
        joined.leave().await.unwrap();
    }
}
