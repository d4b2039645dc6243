//! # termaaz-net
//!
//! The peer protocol and state-synchronization engine: line framing of
//! wire envelopes, peer lifecycle and heartbeats, the join-time sync
//! handshake, and the chunked file transfer that rides over the same
//! links.
//!
//! The engine event loop runs in a dedicated tokio task that owns the
//! room replica, the peer registry, and the file manager. External code
//! communicates with it through typed command and event channels, which
//! reproduces the run-to-completion handler atomicity of the protocol:
//! no lock guards the shared state because only the engine task touches
//! it.

pub mod engine;
pub mod framer;
pub mod peers;
pub mod room;
pub mod topic;
pub mod transport;

mod error;

pub use engine::{spawn_engine, EngineConfig, RoomEvent, RoomHandle, VideoSignalKind};
pub use error::NetError;
pub use room::{create_room, join_room, JoinedRoom};
pub use topic::{generate_room_code, Topic};
pub use transport::{IncomingPeer, MemoryHub, MemoryTransport, PeerStream, Transport};
