//! Peer lifecycle tracking.
//!
//! A peer enters as Connecting (stream accepted, no `join` seen yet),
//! becomes Joined once its `join` envelope arrives, and leaves either
//! gracefully (`leave`) or silently (heartbeat timeout / failed write).
//! There is no rejoin: a returning peer is a fresh record.

use std::collections::HashMap;

use tokio::time::{Duration, Instant};
use tracing::debug;

use termaaz_shared::types::{User, UserId};

use crate::framer::Connection;

/// Local key for one connection: the transport-level identity when the
/// transport has one, a random fallback otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnId(pub String);

impl ConnId {
    pub fn random() -> Self {
        Self(hex::encode(rand::random::<[u8; 8]>()))
    }
}

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One tracked peer link and, once joined, its user.
#[derive(Debug)]
pub struct Peer {
    pub conn_id: ConnId,
    pub user: Option<User>,
    pub conn: Connection,
    pub is_connected: bool,
    pub last_ping_at: Instant,
}

impl Peer {
    pub fn is_joined(&self) -> bool {
        self.user.is_some()
    }
}

/// Tracks all live peer links. Owned exclusively by the engine task.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: HashMap<ConnId, Peer>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a freshly accepted connection that has not joined yet.
    pub fn insert_connecting(&mut self, conn_id: ConnId, conn: Connection) {
        let peer = Peer {
            conn_id: conn_id.clone(),
            user: None,
            conn,
            is_connected: true,
            last_ping_at: Instant::now(),
        };
        self.peers.insert(conn_id, peer);
    }

    /// Attach the user from a received `join`. Returns false when the
    /// connection is no longer tracked.
    pub fn mark_joined(&mut self, conn_id: &ConnId, user: User) -> bool {
        match self.peers.get_mut(conn_id) {
            Some(peer) => {
                debug!(conn = %conn_id, user = %user.id, name = %user.name, "Peer joined");
                peer.user = Some(user);
                peer.last_ping_at = Instant::now();
                true
            }
            None => false,
        }
    }

    pub fn get_mut(&mut self, conn_id: &ConnId) -> Option<&mut Peer> {
        self.peers.get_mut(conn_id)
    }

    /// Remove a peer. Removal is the single eviction path, so a peer
    /// can only ever be evicted once.
    pub fn remove(&mut self, conn_id: &ConnId) -> Option<Peer> {
        self.peers.remove(conn_id)
    }

    pub fn conn_id_for_user(&self, user_id: &UserId) -> Option<ConnId> {
        self.peers
            .values()
            .find(|p| p.user.as_ref().is_some_and(|u| &u.id == user_id))
            .map(|p| p.conn_id.clone())
    }

    /// Update liveness from a `pong`. `Instant::now()` keeps
    /// `last_ping_at` monotonically non-decreasing.
    pub fn record_pong(&mut self, conn_id: &ConnId) -> bool {
        match self.peers.get_mut(conn_id) {
            Some(peer) => {
                peer.last_ping_at = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Connections silent for longer than `timeout`.
    pub fn expired_conn_ids(&self, timeout: Duration) -> Vec<ConnId> {
        let now = Instant::now();
        self.peers
            .values()
            .filter(|p| now.duration_since(p.last_ping_at) > timeout)
            .map(|p| p.conn_id.clone())
            .collect()
    }

    pub fn iter_all_mut(&mut self) -> impl Iterator<Item = &mut Peer> {
        self.peers.values_mut()
    }

    pub fn iter_joined_mut(&mut self) -> impl Iterator<Item = &mut Peer> {
        self.peers.values_mut().filter(|p| p.is_joined())
    }

    pub fn joined_count(&self) -> usize {
        self.peers.values().filter(|p| p.is_joined()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink_conn() -> Connection {
        Connection::new(Box::new(tokio::io::sink()))
    }

    #[tokio::test]
    async fn test_join_lifecycle() {
        let mut registry = PeerRegistry::new();
        let conn_id = ConnId::random();

        registry.insert_connecting(conn_id.clone(), sink_conn());
        assert!(registry.get_mut(&conn_id).is_some());
        assert_eq!(registry.joined_count(), 0);

        let user = User::new("bob");
        assert!(registry.mark_joined(&conn_id, user.clone()));
        assert_eq!(registry.joined_count(), 1);
        assert_eq!(registry.conn_id_for_user(&user.id), Some(conn_id.clone()));

        let removed = registry.remove(&conn_id).unwrap();
        assert_eq!(removed.user.unwrap().id, user.id);
        // A second eviction of the same peer is impossible.
        assert!(registry.remove(&conn_id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pong_keeps_peer_alive_and_silence_expires_it() {
        let mut registry = PeerRegistry::new();
        let quiet = ConnId::random();
        let chatty = ConnId::random();
        registry.insert_connecting(quiet.clone(), sink_conn());
        registry.insert_connecting(chatty.clone(), sink_conn());

        let timeout = Duration::from_millis(15_000);

        tokio::time::advance(Duration::from_millis(10_000)).await;
        assert!(registry.expired_conn_ids(timeout).is_empty());
        registry.record_pong(&chatty);

        tokio::time::advance(Duration::from_millis(10_000)).await;
        let expired = registry.expired_conn_ids(timeout);
        assert_eq!(expired, vec![quiet.clone()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_ping_is_monotonic() {
        let mut registry = PeerRegistry::new();
        let conn_id = ConnId::random();
        registry.insert_connecting(conn_id.clone(), sink_conn());

        let t0 = registry.get_mut(&conn_id).unwrap().last_ping_at;
        tokio::time::advance(Duration::from_millis(100)).await;
        registry.record_pong(&conn_id);
        let t1 = registry.get_mut(&conn_id).unwrap().last_ping_at;
        registry.record_pong(&conn_id);
        let t2 = registry.get_mut(&conn_id).unwrap().last_ping_at;

        assert!(t1 >= t0);
        assert!(t2 >= t1);
    }
}
