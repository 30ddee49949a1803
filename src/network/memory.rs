//! In-process transport: every node lives in one [`InMemoryNetwork`] hub and
//! streams are `tokio::io::duplex` pipes.

use crate::error::{ChainError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

use super::framing::{framed, FramedStream};
use super::{PeerEvent, PeerId, PeerTransport, StreamHandler, TopicMessage};

const DUPLEX_BUFFER: usize = 64 * 1024;
const TOPIC_BUFFER: usize = 64;
const EVENT_BUFFER: usize = 64;

struct NodeEntry {
    handlers: HashMap<String, StreamHandler>,
    topics: HashMap<String, Vec<mpsc::Sender<TopicMessage>>>,
    events: broadcast::Sender<PeerEvent>,
}

#[derive(Default)]
struct HubState {
    nodes: HashMap<PeerId, NodeEntry>,
    rendezvous: HashMap<String, BTreeSet<PeerId>>,
}

#[derive(Clone, Default)]
pub struct InMemoryNetwork {
    state: Arc<Mutex<HubState>>,
}

impl InMemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a node and returns its transport.
    pub fn join(&self, id: PeerId) -> Arc<InMemoryTransport> {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let mut state = self.state.lock();
        for node in state.nodes.values() {
            let _ = node.events.send(PeerEvent::Connected(id.clone()));
        }
        state.nodes.insert(
            id.clone(),
            NodeEntry {
                handlers: HashMap::new(),
                topics: HashMap::new(),
                events,
            },
        );
        Arc::new(InMemoryTransport {
            id,
            hub: self.clone(),
        })
    }

    /// Removes a node; every remaining node sees `PeerEvent::Disconnected`.
    pub fn disconnect(&self, id: &PeerId) {
        let mut state = self.state.lock();
        state.nodes.remove(id);
        for members in state.rendezvous.values_mut() {
            members.remove(id);
        }
        for node in state.nodes.values() {
            let _ = node.events.send(PeerEvent::Disconnected(id.clone()));
        }
    }
}

pub struct InMemoryTransport {
    id: PeerId,
    hub: InMemoryNetwork,
}

#[async_trait]
impl PeerTransport for InMemoryTransport {
    fn local_peer_id(&self) -> PeerId {
        self.id.clone()
    }

    async fn advertise(&self, rendezvous: &str) -> Result<()> {
        self.hub
            .state
            .lock()
            .rendezvous
            .entry(rendezvous.to_string())
            .or_default()
            .insert(self.id.clone());
        Ok(())
    }

    async fn discover(&self, rendezvous: &str) -> Result<Vec<PeerId>> {
        let state = self.hub.state.lock();
        Ok(state
            .rendezvous
            .get(rendezvous)
            .map(|members| members.iter().filter(|p| **p != self.id).cloned().collect())
            .unwrap_or_default())
    }

    async fn open_stream(&self, peer: &PeerId, protocol: &str) -> Result<FramedStream> {
        let handler = {
            let state = self.hub.state.lock();
            let node = state
                .nodes
                .get(peer)
                .ok_or_else(|| ChainError::NetworkError(format!("Unknown peer {}", peer)))?;
            node.handlers.get(protocol).cloned().ok_or_else(|| {
                ChainError::NetworkError(format!("Peer {} does not speak {}", peer, protocol))
            })?
        };

        let (local, remote) = tokio::io::duplex(DUPLEX_BUFFER);
        tokio::spawn(handler(self.id.clone(), framed(remote)));
        Ok(framed(local))
    }

    fn set_stream_handler(&self, protocol: &str, handler: StreamHandler) {
        if let Some(node) = self.hub.state.lock().nodes.get_mut(&self.id) {
            node.handlers.insert(protocol.to_string(), handler);
        }
    }

    async fn join_topic(&self, topic: &str) -> Result<mpsc::Receiver<TopicMessage>> {
        let (tx, rx) = mpsc::channel(TOPIC_BUFFER);
        let mut state = self.hub.state.lock();
        let node = state
            .nodes
            .get_mut(&self.id)
            .ok_or_else(|| ChainError::NetworkError("Node has left the network".to_string()))?;
        node.topics.entry(topic.to_string()).or_default().push(tx);
        Ok(rx)
    }

    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<()> {
        let subscribers: Vec<mpsc::Sender<TopicMessage>> = {
            let state = self.hub.state.lock();
            state
                .nodes
                .iter()
                .filter(|(id, _)| **id != self.id)
                .filter_map(|(_, node)| node.topics.get(topic))
                .flatten()
                .cloned()
                .collect()
        };
        for subscriber in subscribers {
            let message = TopicMessage {
                from: self.id.clone(),
                data: data.clone(),
            };
            if subscriber.try_send(message).is_err() {
                tracing::debug!(topic, "Dropped topic message for a full or closed subscriber");
            }
        }
        Ok(())
    }

    fn peer_events(&self) -> broadcast::Receiver<PeerEvent> {
        match self.hub.state.lock().nodes.get(&self.id) {
            Some(node) => node.events.subscribe(),
            None => broadcast::channel(1).1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::framing::{read_message, send_and_close};
    use crate::network::stream_handler;
    use std::time::Duration;

    #[tokio::test]
    async fn test_stream_reaches_remote_handler() {
        let result = tokio::time::timeout(Duration::from_secs(5), async {
            let network = InMemoryNetwork::new();
            let a = network.join(PeerId::new("a"));
            let b = network.join(PeerId::new("b"));

            let (tx, mut rx) = mpsc::channel(1);
            b.set_stream_handler(
                "/echo",
                stream_handler(move |peer: PeerId, mut stream: FramedStream| {
                    let tx = tx.clone();
                    async move {
                        if let Ok(bytes) = read_message(&mut stream).await {
                            let _ = tx.send((peer, bytes)).await;
                        }
                    }
                }),
            );

            let stream = a.open_stream(&PeerId::new("b"), "/echo").await.unwrap();
            send_and_close(stream, b"ping").await.unwrap();
            let (from, bytes) = rx.recv().await.unwrap();
            assert_eq!(from, PeerId::new("a"));
            assert_eq!(bytes, b"ping".to_vec());

            assert!(a.open_stream(&PeerId::new("b"), "/missing").await.is_err());
        })
        .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_rendezvous_and_disconnect() {
        let result = tokio::time::timeout(Duration::from_secs(5), async {
            let network = InMemoryNetwork::new();
            let a = network.join(PeerId::new("a"));
            let b = network.join(PeerId::new("b"));
            let mut events = a.peer_events();

            a.advertise("blocks").await.unwrap();
            b.advertise("blocks").await.unwrap();
            assert_eq!(a.discover("blocks").await.unwrap(), vec![PeerId::new("b")]);

            network.disconnect(&PeerId::new("b"));
            assert_eq!(
                events.recv().await.unwrap(),
                PeerEvent::Disconnected(PeerId::new("b"))
            );
            assert!(a.discover("blocks").await.unwrap().is_empty());
        })
        .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_publish_skips_sender() {
        let result = tokio::time::timeout(Duration::from_secs(5), async {
            let network = InMemoryNetwork::new();
            let a = network.join(PeerId::new("a"));
            let b = network.join(PeerId::new("b"));
            let mut a_rx = a.join_topic("mempool").await.unwrap();
            let mut b_rx = b.join_topic("mempool").await.unwrap();

            a.publish("mempool", vec![1, 2, 3]).await.unwrap();
            let got = b_rx.recv().await.unwrap();
            assert_eq!(got.data, vec![1, 2, 3]);
            assert_eq!(got.from, PeerId::new("a"));
            assert!(a_rx.try_recv().is_err());
        })
        .await;
        assert!(result.is_ok());
    }
}
