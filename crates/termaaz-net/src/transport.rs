//! The pluggable discovery/transport contract.
//!
//! A transport advertises the local node under a topic, discovers other
//! nodes advertising the same topic, and yields one bidirectional byte
//! stream per discovered peer. The core never dials proactively; it
//! only reacts to the connections handed to it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::debug;

use crate::topic::Topic;

/// A raw bidirectional byte stream to one peer.
pub trait PeerStream: AsyncRead + AsyncWrite + Send + Sync + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Sync + Unpin> PeerStream for T {}

/// One connection the transport discovered.
pub struct IncomingPeer {
    /// Transport-level identity of the remote node, when the transport
    /// has one. The engine falls back to a random id otherwise.
    pub transport_id: Option<String>,
    pub stream: Box<dyn PeerStream>,
}

impl std::fmt::Debug for IncomingPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncomingPeer")
            .field("transport_id", &self.transport_id)
            .finish_non_exhaustive()
    }
}

/// Discovery/transport provider contract.
#[async_trait]
pub trait Transport: Send {
    /// Advertise under `topic` and start yielding connections to peers
    /// found there.
    async fn join(&mut self, topic: &Topic) -> anyhow::Result<mpsc::Receiver<IncomingPeer>>;

    /// Stop advertising and release transport resources.
    async fn leave(&mut self) -> anyhow::Result<()>;
}

type HubState = HashMap<[u8; 32], Vec<(String, mpsc::Sender<IncomingPeer>)>>;

/// In-process discovery hub: every transport joined to the same topic
/// gets a duplex pipe to every other. Serves tests and single-machine
/// demos; real deployments plug in a DHT-backed transport instead.
#[derive(Debug, Clone, Default)]
pub struct MemoryHub {
    topics: Arc<Mutex<HubState>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport handle for one simulated node.
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            hub: self.clone(),
            node_id: hex::encode(rand::random::<[u8; 8]>()),
            joined: None,
        }
    }
}

#[derive(Debug)]
pub struct MemoryTransport {
    hub: MemoryHub,
    node_id: String,
    joined: Option<[u8; 32]>,
}

impl MemoryTransport {
    pub fn node_id(&self) -> &str {
        &self.node_id
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn join(&mut self, topic: &Topic) -> anyhow::Result<mpsc::Receiver<IncomingPeer>> {
        let (tx, rx) = mpsc::channel(64);
        let mut topics = self.hub.topics.lock().expect("hub lock poisoned");
        let nodes = topics.entry(*topic.as_bytes()).or_default();

        // Pairwise links with everyone already on the topic.
        for (other_id, other_tx) in nodes.iter() {
            let (ours, theirs) = tokio::io::duplex(256 * 1024);
            let _ = other_tx.try_send(IncomingPeer {
                transport_id: Some(self.node_id.clone()),
                stream: Box::new(theirs),
            });
            let _ = tx.try_send(IncomingPeer {
                transport_id: Some(other_id.clone()),
                stream: Box::new(ours),
            });
            debug!(node = %self.node_id, other = %other_id, "Linked memory peers");
        }

        nodes.push((self.node_id.clone(), tx));
        self.joined = Some(*topic.as_bytes());
        Ok(rx)
    }

    async fn leave(&mut self) -> anyhow::Result<()> {
        if let Some(topic) = self.joined.take() {
            let mut topics = self.hub.topics.lock().expect("hub lock poisoned");
            if let Some(nodes) = topics.get_mut(&topic) {
                nodes.retain(|(id, _)| id != &self.node_id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_hub_links_joiners_pairwise() {
        let hub = MemoryHub::new();
        let topic = Topic::for_room("1234");

        let mut a = hub.transport();
        let mut b = hub.transport();
        let mut c = hub.transport();

        let mut rx_a = a.join(&topic).await.unwrap();
        let mut rx_b = b.join(&topic).await.unwrap();
        let mut rx_c = c.join(&topic).await.unwrap();

        // b connects to a; c connects to a and b.
        assert_eq!(rx_a.recv().await.unwrap().transport_id.unwrap(), b.node_id);
        assert_eq!(rx_a.recv().await.unwrap().transport_id.unwrap(), c.node_id);
        assert_eq!(rx_b.recv().await.unwrap().transport_id.unwrap(), a.node_id);
        assert_eq!(rx_b.recv().await.unwrap().transport_id.unwrap(), c.node_id);
        assert_eq!(rx_c.recv().await.unwrap().transport_id.unwrap(), a.node_id);
        assert_eq!(rx_c.recv().await.unwrap().transport_id.unwrap(), b.node_id);

        // A departed node no longer receives links.
        b.leave().await.unwrap();
        let mut d = hub.transport();
        let _rx_d = d.join(&topic).await.unwrap();
        assert_eq!(rx_a.recv().await.unwrap().transport_id.unwrap(), d.node_id);
        assert!(rx_b.try_recv().is_err());
    }
}
