//! The room engine: a single task that owns the room replica, the peer
//! registry, and the file manager, and multiplexes three inputs over
//! one loop: local commands, inbound wire traffic, and the heartbeat
//! timer. Handlers run to completion before the next input is taken,
//! so every mutation of shared state is atomic without locks.

use std::path::PathBuf;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use termaaz_files::{ChunkOutcome, FileChunker, FileManager};
use termaaz_shared::constants::{
    DOWNLOAD_DIR_NAME, MAX_MESSAGE_LENGTH, PEER_TIMEOUT_MS, PING_INTERVAL_MS, PROTOCOL_VERSION,
};
use termaaz_shared::protocol::{
    ChatPayload, ChunkPayload, Empty, Envelope, FileRequestPayload, JoinPayload, LeavePayload,
    Payload, RoomSnapshot, TodoDeletePayload, TodoPatch, TypingPayload,
};
use termaaz_shared::time::now_millis;
use termaaz_shared::types::{FileId, Message, MessageId, MessageKind, Priority, Room, SharedFile, Todo, TodoId, User, UserId};
use termaaz_store::{NewMessage, RoomState};

use crate::error::NetError;
use crate::framer::{Connection, Framer};
use crate::peers::{ConnId, PeerRegistry};
use crate::transport::IncomingPeer;

/// Tunables for one engine instance. Tests shrink the intervals; the
/// defaults match the wire protocol's expectations.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub download_dir: PathBuf,
    pub ping_interval: Duration,
    pub peer_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            ping_interval: Duration::from_millis(PING_INTERVAL_MS),
            peer_timeout: Duration::from_millis(PEER_TIMEOUT_MS),
        }
    }
}

fn default_download_dir() -> PathBuf {
    let base = directories::UserDirs::new()
        .map(|dirs| dirs.home_dir().join("Desktop"))
        .unwrap_or_else(std::env::temp_dir);
    base.join(DOWNLOAD_DIR_NAME)
}

/// Which video signaling message to relay. The payload itself stays
/// opaque to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoSignalKind {
    Offer,
    Answer,
    Ice,
}

/// What callers may ask the engine to do.
pub enum EngineCommand {
    SendChat {
        content: String,
        reply_to: Option<MessageId>,
    },
    SetTyping(bool),
    AddTodo {
        content: String,
        priority: Priority,
    },
    UpdateTodo(TodoPatch),
    DeleteTodo(TodoId),
    ShareFile(PathBuf),
    DownloadFile(FileId),
    SendVideoSignal {
        kind: VideoSignalKind,
        signal: serde_json::Value,
    },
    SendVideoFrame(serde_json::Value),
    RequestSync,
    SetUserName(String),
    GetPeers(oneshot::Sender<Vec<User>>),
    GetSnapshot(oneshot::Sender<RoomSnapshot>),
    Shutdown,
}

/// State changes the engine reports back to its owner.
#[derive(Debug, Clone)]
pub enum RoomEvent {
    /// The engine task is up and listening for peers.
    Ready { room_id: String, local_user: User },
    PeerJoined(User),
    PeerLeft(User),
    MessageAdded(Message),
    PeerTyping {
        user_id: UserId,
        user_name: String,
        is_typing: bool,
    },
    TodoAdded(Todo),
    TodoUpdated(Todo),
    TodoDeleted(TodoId),
    FileShared(SharedFile),
    ShareFailed {
        path: PathBuf,
        error: String,
    },
    TransferProgress {
        file_id: FileId,
        received: u32,
        total: u32,
    },
    TransferComplete {
        file: SharedFile,
        save_path: PathBuf,
    },
    TransferError {
        file_id: FileId,
        error: String,
    },
    VideoSignal {
        from: UserId,
        kind: VideoSignalKind,
        signal: serde_json::Value,
    },
    VideoFrame {
        from: UserId,
        frame: serde_json::Value,
    },
    /// A remote snapshot was merged into the local replica.
    Synced,
    /// The engine task has shut down; the room is gone.
    Destroyed,
}

/// Cloneable command-side handle to a running engine.
#[derive(Debug, Clone)]
pub struct RoomHandle {
    commands: mpsc::Sender<EngineCommand>,
}

impl RoomHandle {
    async fn send(&self, command: EngineCommand) -> Result<(), NetError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| NetError::EngineClosed)
    }

    pub async fn send_chat(
        &self,
        content: impl Into<String>,
        reply_to: Option<MessageId>,
    ) -> Result<(), NetError> {
        self.send(EngineCommand::SendChat {
            content: content.into(),
            reply_to,
        })
        .await
    }

    pub async fn set_typing(&self, is_typing: bool) -> Result<(), NetError> {
        self.send(EngineCommand::SetTyping(is_typing)).await
    }

    pub async fn add_todo(
        &self,
        content: impl Into<String>,
        priority: Priority,
    ) -> Result<(), NetError> {
        self.send(EngineCommand::AddTodo {
            content: content.into(),
            priority,
        })
        .await
    }

    pub async fn update_todo(&self, patch: TodoPatch) -> Result<(), NetError> {
        self.send(EngineCommand::UpdateTodo(patch)).await
    }

    pub async fn delete_todo(&self, id: TodoId) -> Result<(), NetError> {
        self.send(EngineCommand::DeleteTodo(id)).await
    }

    pub async fn share_file(&self, path: impl Into<PathBuf>) -> Result<(), NetError> {
        self.send(EngineCommand::ShareFile(path.into())).await
    }

    pub async fn download_file(&self, id: FileId) -> Result<(), NetError> {
        self.send(EngineCommand::DownloadFile(id)).await
    }

    pub async fn send_video_signal(
        &self,
        kind: VideoSignalKind,
        signal: serde_json::Value,
    ) -> Result<(), NetError> {
        self.send(EngineCommand::SendVideoSignal { kind, signal })
            .await
    }

    pub async fn send_video_frame(&self, frame: serde_json::Value) -> Result<(), NetError> {
        self.send(EngineCommand::SendVideoFrame(frame)).await
    }

    pub async fn request_sync(&self) -> Result<(), NetError> {
        self.send(EngineCommand::RequestSync).await
    }

    pub async fn set_user_name(&self, name: impl Into<String>) -> Result<(), NetError> {
        self.send(EngineCommand::SetUserName(name.into())).await
    }

    /// Current member list, as the engine sees it.
    pub async fn peers(&self) -> Result<Vec<User>, NetError> {
        let (tx, rx) = oneshot::channel();
        self.send(EngineCommand::GetPeers(tx)).await?;
        rx.await.map_err(|_| NetError::EngineClosed)
    }

    /// Full snapshot of messages, todos, files, and members.
    pub async fn snapshot(&self) -> Result<RoomSnapshot, NetError> {
        let (tx, rx) = oneshot::channel();
        self.send(EngineCommand::GetSnapshot(tx)).await?;
        rx.await.map_err(|_| NetError::EngineClosed)
    }

    /// Announce departure to all peers and stop the engine.
    pub async fn shutdown(&self) -> Result<(), NetError> {
        self.send(EngineCommand::Shutdown).await
    }
}

/// Everything flowing into the engine from the network side.
enum Inbound {
    NewPeer(IncomingPeer),
    Message { conn_id: ConnId, envelope: Envelope },
    Closed { conn_id: ConnId },
}

/// Start the engine for a room. `incoming` is the transport's stream of
/// discovered peer connections.
pub fn spawn_engine(
    room: Room,
    local_user: User,
    incoming: mpsc::Receiver<IncomingPeer>,
    config: EngineConfig,
) -> Result<(RoomHandle, mpsc::Receiver<RoomEvent>), NetError> {
    let files = FileManager::new(
        &config.download_dir,
        local_user.id.clone(),
        local_user.name.clone(),
    )?;

    let (command_tx, command_rx) = mpsc::channel(64);
    let (event_tx, event_rx) = mpsc::channel(256);
    let (inbound_tx, inbound_rx) = mpsc::channel(256);

    // Fold discovered connections into the engine's inbound stream.
    let forward_tx = inbound_tx.clone();
    let mut incoming = incoming;
    tokio::spawn(async move {
        while let Some(peer) = incoming.recv().await {
            if forward_tx.send(Inbound::NewPeer(peer)).await.is_err() {
                break;
            }
        }
    });

    let engine = Engine {
        state: RoomState::new(room, local_user),
        peers: PeerRegistry::new(),
        files,
        events: event_tx,
        inbound_tx,
        config,
        sent_sync_request: false,
    };
    tokio::spawn(engine.run(command_rx, inbound_rx));

    Ok((
        RoomHandle {
            commands: command_tx,
        },
        event_rx,
    ))
}

struct Engine {
    state: RoomState,
    peers: PeerRegistry,
    files: FileManager,
    events: mpsc::Sender<RoomEvent>,
    inbound_tx: mpsc::Sender<Inbound>,
    config: EngineConfig,
    sent_sync_request: bool,
}

impl Engine {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<EngineCommand>,
        mut inbound: mpsc::Receiver<Inbound>,
    ) {
        info!(
            room = %self.state.room().id,
            user = %self.state.local_user().id,
            "Room engine started"
        );
        self.emit(RoomEvent::Ready {
            room_id: self.state.room().id.clone(),
            local_user: self.state.local_user().clone(),
        })
        .await;

        let mut heartbeat = tokio::time::interval(self.config.ping_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = commands.recv() => {
                    match command {
                        Some(command) => {
                            if self.handle_command(command).await {
                                break;
                            }
                        }
                        // Every handle dropped: tear the room down.
                        None => {
                            self.announce_leave().await;
                            break;
                        }
                    }
                }
                Some(input) = inbound.recv() => {
                    self.handle_inbound(input).await;
                }
                _ = heartbeat.tick() => {
                    self.heartbeat().await;
                }
            }
        }

        self.emit(RoomEvent::Destroyed).await;
        info!(room = %self.state.room().id, "Room engine stopped");
    }

    async fn emit(&self, event: RoomEvent) {
        let _ = self.events.send(event).await;
    }

    fn envelope(&self, payload: Payload) -> Envelope {
        Envelope {
            sender_id: self.state.local_user().id.clone(),
            sender_name: self.state.local_user().name.clone(),
            timestamp: now_millis(),
            payload,
        }
    }

    // --- Commands ----------------------------------------------------------

    /// Returns true when the engine should stop.
    async fn handle_command(&mut self, command: EngineCommand) -> bool {
        match command {
            EngineCommand::SendChat { content, reply_to } => {
                self.send_chat(content, reply_to).await;
            }
            EngineCommand::SetTyping(is_typing) => {
                let local_id = self.state.local_user().id.clone();
                self.state.set_peer_typing(&local_id, is_typing);
                let payload = TypingPayload {
                    user_color: self.state.local_user().color.clone(),
                };
                let payload = if is_typing {
                    Payload::Typing(payload)
                } else {
                    Payload::StopTyping(payload)
                };
                self.broadcast(payload).await;
            }
            EngineCommand::AddTodo { content, priority } => {
                let todo = self.state.add_todo(content, priority);
                self.broadcast(Payload::TodoAdd(todo.clone())).await;
                self.emit(RoomEvent::TodoAdded(todo)).await;
            }
            EngineCommand::UpdateTodo(patch) => {
                if let Some(todo) = self.state.update_todo(&patch) {
                    // The broadcast patch carries the applied completion
                    // stamp so every replica records the same completer.
                    let mut wire = patch;
                    if wire.completed == Some(true) {
                        wire.completed_by = todo.completed_by.clone();
                        wire.completed_at = todo.completed_at;
                    }
                    self.broadcast(Payload::TodoUpdate(wire)).await;
                    self.emit(RoomEvent::TodoUpdated(todo)).await;
                }
            }
            EngineCommand::DeleteTodo(id) => {
                if self.state.delete_todo(&id) {
                    self.broadcast(Payload::TodoDelete(TodoDeletePayload { id: id.clone() }))
                        .await;
                    self.emit(RoomEvent::TodoDeleted(id)).await;
                }
            }
            EngineCommand::ShareFile(path) => {
                self.share_file(path).await;
            }
            EngineCommand::DownloadFile(id) => {
                self.download_file(id).await;
            }
            EngineCommand::SendVideoSignal { kind, signal } => {
                let payload = match kind {
                    VideoSignalKind::Offer => Payload::VideoOffer(signal),
                    VideoSignalKind::Answer => Payload::VideoAnswer(signal),
                    VideoSignalKind::Ice => Payload::VideoIce(signal),
                };
                self.broadcast(payload).await;
            }
            EngineCommand::SendVideoFrame(frame) => {
                self.broadcast(Payload::VideoFrame(frame)).await;
            }
            EngineCommand::RequestSync => {
                self.broadcast(Payload::SyncRequest(Empty {})).await;
            }
            EngineCommand::SetUserName(name) => {
                self.state.set_local_name(name.clone());
                self.files.set_local_user_name(name);
            }
            EngineCommand::GetPeers(reply) => {
                let _ = reply.send(self.state.members().to_vec());
            }
            EngineCommand::GetSnapshot(reply) => {
                let _ = reply.send(self.state.sync_data());
            }
            EngineCommand::Shutdown => {
                self.announce_leave().await;
                return true;
            }
        }
        false
    }

    async fn send_chat(&mut self, content: String, reply_to: Option<MessageId>) {
        let content = truncate_chars(content, MAX_MESSAGE_LENGTH);
        if content.trim().is_empty() {
            return;
        }

        let local = self.state.local_user().clone();
        let kind = if reply_to.is_some() {
            MessageKind::Reply
        } else {
            MessageKind::Text
        };
        let message = self.state.add_message(NewMessage {
            user_id: local.id,
            user_name: local.name,
            user_color: local.color.clone(),
            content: content.clone(),
            timestamp: now_millis(),
            kind,
            reply_to: reply_to.clone(),
            file_info: None,
        });

        self.broadcast(Payload::Chat(ChatPayload {
            content,
            reply_to,
            user_color: local.color,
        }))
        .await;
        self.emit(RoomEvent::MessageAdded(message)).await;
    }

    async fn share_file(&mut self, path: PathBuf) {
        let file = match self.files.share_local(&path) {
            Ok(file) => file,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "Failed to share file");
                self.emit(RoomEvent::ShareFailed {
                    path,
                    error: err.to_string(),
                })
                .await;
                return;
            }
        };

        self.state.add_shared_file(file.clone());
        let local = self.state.local_user().clone();
        let message = self.state.add_message(NewMessage {
            user_id: local.id,
            user_name: local.name,
            user_color: local.color,
            content: format!("Shared: {}", file.name),
            timestamp: now_millis(),
            kind: MessageKind::File,
            reply_to: None,
            file_info: Some(file.clone()),
        });

        self.broadcast(Payload::FileShare(file.clone())).await;
        self.emit(RoomEvent::FileShared(file)).await;
        self.emit(RoomEvent::MessageAdded(message)).await;
    }

    async fn download_file(&mut self, id: FileId) {
        let Some(file) = self
            .state
            .shared_files()
            .iter()
            .find(|f| f.id == id)
            .cloned()
        else {
            warn!(file = %id, "Download requested for unknown file");
            return;
        };
        if file.shared_by == self.state.local_user().id {
            debug!(file = %id, "File is shared locally, nothing to download");
            return;
        }

        let Some(conn_id) = self.peers.conn_id_for_user(&file.shared_by) else {
            warn!(file = %id, sharer = %file.shared_by, "Sharer is not connected");
            self.emit(RoomEvent::TransferError {
                file_id: id,
                error: "sharer is not connected".into(),
            })
            .await;
            return;
        };

        self.files.register_remote(file.clone());
        self.files.init_receive(&file);
        let request = self.envelope(Payload::FileRequest(FileRequestPayload {
            file_id: id.clone(),
        }));
        debug!(file = %id, sharer = %file.shared_by, "Requesting file");
        self.send_to(&conn_id, &request).await;
    }

    // --- Inbound -----------------------------------------------------------

    async fn handle_inbound(&mut self, input: Inbound) {
        match input {
            Inbound::NewPeer(peer) => self.handle_new_peer(peer).await,
            Inbound::Message { conn_id, envelope } => {
                self.handle_envelope(conn_id, envelope).await;
            }
            Inbound::Closed { conn_id } => {
                debug!(conn = %conn_id, "Peer stream closed");
                self.evict(&conn_id).await;
            }
        }
    }

    async fn handle_new_peer(&mut self, peer: IncomingPeer) {
        let conn_id = peer
            .transport_id
            .map(ConnId)
            .unwrap_or_else(ConnId::random);
        debug!(conn = %conn_id, "Peer connection established");

        let (read_half, write_half) = tokio::io::split(peer.stream);
        self.peers
            .insert_connecting(conn_id.clone(), Connection::new(Box::new(write_half)));
        spawn_reader(conn_id.clone(), read_half, self.inbound_tx.clone());

        // Introduce ourselves immediately; the remote does the same.
        let local = self.state.local_user().clone();
        let join = self.envelope(Payload::Join(JoinPayload {
            user_id: local.id,
            user_name: local.name,
            user_color: local.color,
            protocol_version: PROTOCOL_VERSION,
        }));
        self.send_to(&conn_id, &join).await;
    }

    async fn handle_envelope(&mut self, conn_id: ConnId, envelope: Envelope) {
        let sender_id = envelope.sender_id.clone();
        let sender_name = envelope.sender_name.clone();

        match envelope.payload {
            Payload::Join(join) => self.handle_join(conn_id, join, envelope.timestamp).await,
            Payload::Leave(leave) => {
                if let Some(conn_id) = self.peers.conn_id_for_user(&leave.user_id) {
                    self.evict(&conn_id).await;
                }
            }
            Payload::Chat(chat) => {
                self.state.set_peer_typing(&sender_id, false);
                let kind = if chat.reply_to.is_some() {
                    MessageKind::Reply
                } else {
                    MessageKind::Text
                };
                let message = self.state.add_message(NewMessage {
                    user_id: sender_id,
                    user_name: sender_name,
                    user_color: chat.user_color,
                    content: truncate_chars(chat.content, MAX_MESSAGE_LENGTH),
                    timestamp: envelope.timestamp,
                    kind,
                    reply_to: chat.reply_to,
                    file_info: None,
                });
                self.emit(RoomEvent::MessageAdded(message)).await;
            }
            Payload::Typing(_) => {
                self.peer_typing(sender_id, sender_name, true).await;
            }
            Payload::StopTyping(_) => {
                self.peer_typing(sender_id, sender_name, false).await;
            }
            Payload::TodoAdd(todo) => {
                if self.state.insert_todo(todo.clone()) {
                    self.emit(RoomEvent::TodoAdded(todo)).await;
                }
            }
            Payload::TodoUpdate(patch) => {
                if let Some(todo) = self.state.update_todo(&patch) {
                    self.emit(RoomEvent::TodoUpdated(todo)).await;
                }
            }
            Payload::TodoDelete(del) => {
                if self.state.delete_todo(&del.id) {
                    self.emit(RoomEvent::TodoDeleted(del.id)).await;
                }
            }
            Payload::FileShare(file) => {
                let record = self.files.register_remote(file);
                if self.state.add_shared_file(record.clone()) {
                    let user_color = self
                        .state
                        .members()
                        .iter()
                        .find(|u| u.id == sender_id)
                        .map(|u| u.color.clone())
                        .unwrap_or_default();
                    let message = self.state.add_message(NewMessage {
                        user_id: sender_id,
                        user_name: sender_name,
                        user_color,
                        content: format!("Shared: {}", record.name),
                        timestamp: envelope.timestamp,
                        kind: MessageKind::File,
                        reply_to: None,
                        file_info: Some(record.clone()),
                    });
                    self.emit(RoomEvent::FileShared(record)).await;
                    self.emit(RoomEvent::MessageAdded(message)).await;
                }
            }
            Payload::FileRequest(request) => {
                self.serve_file(&conn_id, &request.file_id);
            }
            Payload::FileChunk(chunk) => {
                self.receive_chunk(chunk).await;
            }
            Payload::VideoOffer(signal) => {
                self.emit(RoomEvent::VideoSignal {
                    from: sender_id,
                    kind: VideoSignalKind::Offer,
                    signal,
                })
                .await;
            }
            Payload::VideoAnswer(signal) => {
                self.emit(RoomEvent::VideoSignal {
                    from: sender_id,
                    kind: VideoSignalKind::Answer,
                    signal,
                })
                .await;
            }
            Payload::VideoIce(signal) => {
                self.emit(RoomEvent::VideoSignal {
                    from: sender_id,
                    kind: VideoSignalKind::Ice,
                    signal,
                })
                .await;
            }
            Payload::VideoFrame(frame) => {
                self.emit(RoomEvent::VideoFrame {
                    from: sender_id,
                    frame,
                })
                .await;
            }
            Payload::Ping(_) => {
                let pong = self.envelope(Payload::Pong(Empty {}));
                self.send_to(&conn_id, &pong).await;
            }
            Payload::Pong(_) => {
                self.peers.record_pong(&conn_id);
            }
            Payload::SyncRequest(_) => {
                let response = self.envelope(Payload::SyncResponse(self.state.sync_data()));
                debug!(conn = %conn_id, "Serving room snapshot");
                self.send_to(&conn_id, &response).await;
            }
            Payload::SyncResponse(snapshot) => {
                self.state.sync_from_peer(snapshot);
                self.emit(RoomEvent::Synced).await;
            }
        }
    }

    async fn handle_join(&mut self, conn_id: ConnId, join: JoinPayload, timestamp: i64) {
        if join.protocol_version != PROTOCOL_VERSION {
            warn!(
                conn = %conn_id,
                theirs = join.protocol_version,
                ours = PROTOCOL_VERSION,
                "Protocol version mismatch"
            );
        }

        let user = User {
            id: join.user_id,
            name: join.user_name,
            color: join.user_color,
            joined_at: timestamp,
            is_typing: false,
            last_seen: now_millis(),
        };

        if !self.peers.mark_joined(&conn_id, user.clone()) {
            return;
        }
        if self.state.add_peer(user.clone()) {
            let message = self
                .state
                .add_system_message(format!("{} joined the room", user.name));
            self.emit(RoomEvent::MessageAdded(message)).await;
            self.emit(RoomEvent::PeerJoined(user)).await;
        }

        // Pull the room state from the first peer we complete a
        // handshake with; everyone present already converged.
        if !self.sent_sync_request && self.peers.joined_count() == 1 {
            self.sent_sync_request = true;
            let request = self.envelope(Payload::SyncRequest(Empty {}));
            debug!(conn = %conn_id, "Requesting room snapshot");
            self.send_to(&conn_id, &request).await;
        }
    }

    async fn peer_typing(&mut self, user_id: UserId, user_name: String, is_typing: bool) {
        if self.state.set_peer_typing(&user_id, is_typing) {
            self.emit(RoomEvent::PeerTyping {
                user_id,
                user_name,
                is_typing,
            })
            .await;
        }
    }

    /// Sender side of a transfer: a spawned task streams every chunk of
    /// a locally available file to the requesting connection. The pump
    /// is paced by the peer's bulk queue, so a requester that stops
    /// reading stalls only its own transfer, never the engine loop.
    fn serve_file(&mut self, conn_id: &ConnId, file_id: &FileId) {
        let Some(file) = self.files.get(file_id).cloned() else {
            warn!(file = %file_id, "Request for a file we never shared");
            return;
        };
        let Some(peer) = self.peers.get_mut(conn_id) else {
            return;
        };
        let bulk = peer.conn.bulk_sender();

        let file_id = file_id.clone();
        let sender_id = self.state.local_user().id.clone();
        let sender_name = self.state.local_user().name.clone();
        tokio::spawn(async move {
            let mut chunker = match FileChunker::open(file).await {
                Ok(chunker) => chunker,
                Err(err) => {
                    warn!(file = %file_id, error = %err, "Cannot open file for transfer");
                    return;
                }
            };

            debug!(file = %file_id, chunks = chunker.total_chunks(), "Streaming file");
            loop {
                match chunker.next_chunk().await {
                    Ok(Some(chunk)) => {
                        let envelope = Envelope {
                            sender_id: sender_id.clone(),
                            sender_name: sender_name.clone(),
                            timestamp: now_millis(),
                            payload: Payload::FileChunk(chunk),
                        };
                        if !bulk.send(&envelope).await {
                            debug!(file = %file_id, "Requester went away mid-transfer");
                            return;
                        }
                    }
                    Ok(None) => return,
                    Err(err) => {
                        warn!(file = %file_id, error = %err, "Read failed mid-transfer");
                        return;
                    }
                }
            }
        });
    }

    /// Receiver side: store the chunk, finalize on the last distinct
    /// index, report progress either way.
    async fn receive_chunk(&mut self, chunk: ChunkPayload) {
        let file_id = chunk.file_id.clone();
        match self
            .files
            .receive_chunk(&file_id, chunk.chunk_index, chunk.data)
            .await
        {
            ChunkOutcome::Progress { received, total } => {
                self.emit(RoomEvent::TransferProgress {
                    file_id,
                    received,
                    total,
                })
                .await;
            }
            ChunkOutcome::Duplicate { received, total } => {
                debug!(file = %file_id, received, total, "Duplicate chunk ignored");
            }
            ChunkOutcome::Complete { file, save_path } => {
                let file = match self
                    .state
                    .mark_file_available(&file.id, &save_path.display().to_string())
                {
                    Ok(updated) => updated,
                    Err(_) => file,
                };
                let message = self
                    .state
                    .add_system_message(format!("Downloaded {}", file.name));
                self.emit(RoomEvent::MessageAdded(message)).await;
                self.emit(RoomEvent::TransferComplete { file, save_path })
                    .await;
            }
            ChunkOutcome::Failed { error } => {
                self.emit(RoomEvent::TransferError {
                    file_id,
                    error: error.to_string(),
                })
                .await;
            }
            ChunkOutcome::Unknown => {
                debug!(file = %file_id, "Chunk for an untracked transfer");
            }
        }
    }

    // --- Liveness ----------------------------------------------------------

    /// Evict peers that have gone silent, then ping everyone left.
    async fn heartbeat(&mut self) {
        for conn_id in self.peers.expired_conn_ids(self.config.peer_timeout) {
            debug!(conn = %conn_id, "Peer timed out");
            self.evict(&conn_id).await;
        }

        let ping = self.envelope(Payload::Ping(Empty {}));
        let mut dead = Vec::new();
        for peer in self.peers.iter_all_mut() {
            if !peer.conn.send(&ping) {
                dead.push(peer.conn_id.clone());
            }
        }
        for conn_id in dead {
            self.evict(&conn_id).await;
        }
    }

    /// Remove a connection; a joined peer additionally leaves the room.
    async fn evict(&mut self, conn_id: &ConnId) {
        let Some(peer) = self.peers.remove(conn_id) else {
            return;
        };
        let Some(user) = peer.user else {
            return;
        };
        self.peer_departed(user).await;
    }

    async fn peer_departed(&mut self, user: User) {
        if self.state.remove_peer(&user.id).is_none() {
            return;
        }
        info!(peer = %user.id, name = %user.name, "Peer left the room");

        let message = self
            .state
            .add_system_message(format!("{} left the room", user.name));
        self.emit(RoomEvent::MessageAdded(message)).await;

        // In-flight downloads from the departed sender can never finish.
        for file_id in self.files.cancel_transfers_from(&user.id) {
            self.emit(RoomEvent::TransferError {
                file_id,
                error: "sharer left the room".into(),
            })
            .await;
        }

        self.emit(RoomEvent::PeerLeft(user)).await;
    }

    // --- Output ------------------------------------------------------------

    /// Send one envelope to every joined peer. A failed write evicts the
    /// peer; there is no retry.
    async fn broadcast(&mut self, payload: Payload) {
        let envelope = self.envelope(payload);
        let mut dead = Vec::new();
        for peer in self.peers.iter_joined_mut() {
            if !peer.conn.send(&envelope) {
                dead.push(peer.conn_id.clone());
            }
        }
        for conn_id in dead {
            self.evict(&conn_id).await;
        }
    }

    /// Send one envelope to one connection. Returns false (and evicts)
    /// when the write fails.
    async fn send_to(&mut self, conn_id: &ConnId, envelope: &Envelope) -> bool {
        let ok = match self.peers.get_mut(conn_id) {
            Some(peer) => peer.conn.send(envelope),
            None => return false,
        };
        if !ok {
            self.evict(conn_id).await;
        }
        ok
    }

    async fn announce_leave(&mut self) {
        let user_id = self.state.local_user().id.clone();
        self.broadcast(Payload::Leave(LeavePayload { user_id })).await;
    }
}

/// Pump one connection's read side into the engine's inbound channel.
fn spawn_reader(
    conn_id: ConnId,
    mut reader: tokio::io::ReadHalf<Box<dyn crate::transport::PeerStream>>,
    tx: mpsc::Sender<Inbound>,
) {
    tokio::spawn(async move {
        let mut framer = Framer::new();
        let mut buf = vec![0u8; 8 * 1024];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    framer.push(&buf[..n]);
                    while let Some(envelope) = framer.next_message() {
                        let message = Inbound::Message {
                            conn_id: conn_id.clone(),
                            envelope,
                        };
                        if tx.send(message).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
        let _ = tx.send(Inbound::Closed { conn_id }).await;
    });
}

/// Cap a string at `max` characters without splitting a code point.
fn truncate_chars(text: String, max: usize) -> String {
    if text.chars().count() <= max {
        return text;
    }
    text.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_chars_respects_boundaries() {
        assert_eq!(truncate_chars("hello".into(), 10), "hello");
        assert_eq!(truncate_chars("hello".into(), 3), "hel");
        // Multi-byte characters count as one.
        assert_eq!(truncate_chars("héllo".into(), 2), "hé");
    }

    #[test]
    fn test_default_config_uses_protocol_timings() {
        let config = EngineConfig::default();
        assert_eq!(config.ping_interval, Duration::from_millis(5_000));
        assert_eq!(config.peer_timeout, Duration::from_millis(15_000));
        assert!(config
            .download_dir
            .to_string_lossy()
            .contains(DOWNLOAD_DIR_NAME));
    }
}
