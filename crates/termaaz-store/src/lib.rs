//! # termaaz-store
//!
//! The canonical local replica of a room: messages, todos, shared-file
//! records, and the member list, with CRUD operations and the
//! anti-entropy merge used by the join-time sync handshake.
//!
//! All state is in-memory for the lifetime of the process. The store is
//! synchronous and owned by a single engine task; nothing outside that
//! task mutates room contents.

pub mod room;

mod error;

pub use error::StoreError;
pub use room::{NewMessage, RoomState};
