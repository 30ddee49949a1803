//! TCP transport.
//!
//! Every stream is a fresh connection. The dialer's first frame is a CBOR
//! [`StreamHeader`] naming itself, its listen address and the protocol; the
//! rest of the stream belongs to that protocol. Rendezvous registrations are
//! kept by whichever node receives them, so bootstrap peers act as the
//! rendezvous points. Pub/sub fans out directly to every known peer.

use crate::codec;
use crate::error::{ChainError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use super::framing::{framed, read_message, send_and_close, write_message, FramedStream};
use super::{PeerEvent, PeerId, PeerTransport, StreamHandler, TopicMessage};

pub const RENDEZVOUS_ADVERTISE_PROTOCOL: &str = "/comiccoin/rendezvous/advertise/1.0.0";
pub const RENDEZVOUS_DISCOVER_PROTOCOL: &str = "/comiccoin/rendezvous/discover/1.0.0";
pub const PUBSUB_PROTOCOL: &str = "/comiccoin/pubsub/1.0.0";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const TOPIC_BUFFER: usize = 64;
const EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StreamHeader {
    peer_id: PeerId,
    listen_addr: String,
    protocol: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PeerRecord {
    peer_id: PeerId,
    addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TopicEnvelope {
    topic: String,
    #[serde(with = "serde_bytes")]
    data: Vec<u8>,
}

#[derive(Default)]
struct TcpState {
    address_book: HashMap<PeerId, String>,
    handlers: HashMap<String, StreamHandler>,
    topics: HashMap<String, Vec<mpsc::Sender<TopicMessage>>>,
    rendezvous: HashMap<String, BTreeMap<PeerId, String>>,
}

pub struct TcpTransport {
    id: PeerId,
    listen_addr: String,
    bootstrap_peers: Vec<String>,
    state: Mutex<TcpState>,
    events: broadcast::Sender<PeerEvent>,
}

/// A peer listening on `0.0.0.0` is reachable at the address it dialed from.
fn resolve_listen_addr(advertised: &str, remote: SocketAddr) -> String {
    match advertised.parse::<SocketAddr>() {
        Ok(addr) if addr.ip().is_unspecified() => SocketAddr::new(remote.ip(), addr.port()).to_string(),
        _ => advertised.to_string(),
    }
}

impl TcpTransport {
    /// Binds `listen_addr` and starts accepting streams until `cancel` fires.
    pub async fn bind(
        listen_addr: &str,
        bootstrap_peers: Vec<String>,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(listen_addr).await.map_err(|e| {
            ChainError::NetworkError(format!("Failed to bind {}: {}", listen_addr, e))
        })?;
        let local_addr = listener.local_addr()?.to_string();
        let (events, _) = broadcast::channel(EVENT_BUFFER);

        let transport = Arc::new(TcpTransport {
            id: PeerId::random(),
            listen_addr: local_addr,
            bootstrap_peers,
            state: Mutex::new(TcpState::default()),
            events,
        });
        tracing::info!(peer = %transport.id, addr = %transport.listen_addr, "TCP transport listening");

        let acceptor = transport.clone();
        tokio::spawn(async move { acceptor.accept_loop(listener, cancel).await });
        Ok(transport)
    }

    pub fn listen_addr(&self) -> &str {
        &self.listen_addr
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!(addr = %self.listen_addr, "TCP transport stopped");
                    return;
                }
                accepted = listener.accept() => match accepted {
                    Ok((socket, remote)) => {
                        let this = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = this.handle_inbound(socket, remote).await {
                                tracing::debug!(remote = %remote, error = %e, "Inbound stream failed");
                            }
                        });
                    }
                    Err(e) => tracing::warn!(error = %e, "Accept failed"),
                },
            }
        }
    }

    async fn handle_inbound(&self, socket: TcpStream, remote: SocketAddr) -> Result<()> {
        let mut stream = framed(socket);
        let header: StreamHeader = codec::from_cbor(&read_message(&mut stream).await?)?;
        let addr = resolve_listen_addr(&header.listen_addr, remote);
        self.remember(&header.peer_id, &addr);

        match header.protocol.as_str() {
            RENDEZVOUS_ADVERTISE_PROTOCOL => {
                let topic = read_topic(&mut stream).await?;
                tracing::debug!(peer = %header.peer_id, topic = %topic, "Registered rendezvous");
                self.state
                    .lock()
                    .rendezvous
                    .entry(topic)
                    .or_default()
                    .insert(header.peer_id, addr);
                Ok(())
            }
            RENDEZVOUS_DISCOVER_PROTOCOL => {
                let topic = read_topic(&mut stream).await?;
                let records: Vec<PeerRecord> = {
                    let state = self.state.lock();
                    state
                        .rendezvous
                        .get(&topic)
                        .map(|members| {
                            members
                                .iter()
                                .map(|(peer_id, addr)| PeerRecord {
                                    peer_id: peer_id.clone(),
                                    addr: addr.clone(),
                                })
                                .collect()
                        })
                        .unwrap_or_default()
                };
                send_and_close(stream, &codec::to_cbor(&records)?).await
            }
            PUBSUB_PROTOCOL => {
                let envelope: TopicEnvelope = codec::from_cbor(&read_message(&mut stream).await?)?;
                self.deliver(&header.peer_id, envelope);
                Ok(())
            }
            protocol => {
                let handler = self.state.lock().handlers.get(protocol).cloned();
                match handler {
                    Some(handler) => {
                        handler(header.peer_id, stream).await;
                        Ok(())
                    }
                    None => Err(ChainError::NetworkError(format!(
                        "No handler for protocol {}",
                        protocol
                    ))),
                }
            }
        }
    }

    fn remember(&self, peer: &PeerId, addr: &str) {
        if *peer == self.id {
            return;
        }
        let previous = self
            .state
            .lock()
            .address_book
            .insert(peer.clone(), addr.to_string());
        if previous.is_none() {
            let _ = self.events.send(PeerEvent::Connected(peer.clone()));
        }
    }

    /// Drops an unreachable peer and reports it as disconnected.
    fn forget(&self, peer: &PeerId) {
        let removed = {
            let mut state = self.state.lock();
            for members in state.rendezvous.values_mut() {
                members.remove(peer);
            }
            state.address_book.remove(peer).is_some()
        };
        if removed {
            let _ = self.events.send(PeerEvent::Disconnected(peer.clone()));
        }
    }

    fn deliver(&self, from: &PeerId, envelope: TopicEnvelope) {
        let subscribers = self
            .state
            .lock()
            .topics
            .get(&envelope.topic)
            .cloned()
            .unwrap_or_default();
        for subscriber in subscribers {
            let message = TopicMessage {
                from: from.clone(),
                data: envelope.data.clone(),
            };
            if subscriber.try_send(message).is_err() {
                tracing::debug!(topic = %envelope.topic, "Dropped topic message for a full or closed subscriber");
            }
        }
    }

    async fn connect(&self, addr: &str, protocol: &str) -> Result<FramedStream> {
        let socket = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| ChainError::Timeout(format!("connecting to {}", addr)))?
            .map_err(|e| ChainError::NetworkError(format!("Failed to connect to {}: {}", addr, e)))?;
        let mut stream = framed(socket);
        let header = StreamHeader {
            peer_id: self.id.clone(),
            listen_addr: self.listen_addr.clone(),
            protocol: protocol.to_string(),
        };
        write_message(&mut stream, &codec::to_cbor(&header)?).await?;
        Ok(stream)
    }

    async fn query_rendezvous(&self, bootstrap: &str, rendezvous: &str) -> Result<Vec<PeerRecord>> {
        let mut stream = self.connect(bootstrap, RENDEZVOUS_DISCOVER_PROTOCOL).await?;
        write_message(&mut stream, rendezvous.as_bytes()).await?;
        codec::from_cbor(&read_message(&mut stream).await?)
    }
}

async fn read_topic(stream: &mut FramedStream) -> Result<String> {
    String::from_utf8(read_message(stream).await?)
        .map_err(|_| ChainError::NetworkError("Rendezvous topic is not valid UTF-8".to_string()))
}

#[async_trait]
impl PeerTransport for TcpTransport {
    fn local_peer_id(&self) -> PeerId {
        self.id.clone()
    }

    async fn advertise(&self, rendezvous: &str) -> Result<()> {
        self.state
            .lock()
            .rendezvous
            .entry(rendezvous.to_string())
            .or_default()
            .insert(self.id.clone(), self.listen_addr.clone());

        for bootstrap in &self.bootstrap_peers {
            let result = match self.connect(bootstrap, RENDEZVOUS_ADVERTISE_PROTOCOL).await {
                Ok(stream) => send_and_close(stream, rendezvous.as_bytes()).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                tracing::warn!(bootstrap = %bootstrap, rendezvous, error = %e, "Failed to advertise");
            }
        }
        Ok(())
    }

    async fn discover(&self, rendezvous: &str) -> Result<Vec<PeerId>> {
        let mut found: BTreeMap<PeerId, String> = self
            .state
            .lock()
            .rendezvous
            .get(rendezvous)
            .cloned()
            .unwrap_or_default();

        for bootstrap in &self.bootstrap_peers {
            match self.query_rendezvous(bootstrap, rendezvous).await {
                Ok(records) => {
                    for record in records {
                        found.insert(record.peer_id, record.addr);
                    }
                }
                Err(e) => tracing::debug!(bootstrap = %bootstrap, error = %e, "Rendezvous query failed"),
            }
        }

        found.remove(&self.id);
        for (peer, addr) in &found {
            self.remember(peer, addr);
        }
        Ok(found.into_keys().collect())
    }

    async fn open_stream(&self, peer: &PeerId, protocol: &str) -> Result<FramedStream> {
        let addr = self
            .state
            .lock()
            .address_book
            .get(peer)
            .cloned()
            .ok_or_else(|| ChainError::NetworkError(format!("No address known for peer {}", peer)))?;
        match self.connect(&addr, protocol).await {
            Ok(stream) => Ok(stream),
            Err(e) => {
                self.forget(peer);
                Err(e)
            }
        }
    }

    fn set_stream_handler(&self, protocol: &str, handler: StreamHandler) {
        self.state.lock().handlers.insert(protocol.to_string(), handler);
    }

    async fn join_topic(&self, topic: &str) -> Result<mpsc::Receiver<TopicMessage>> {
        let (tx, rx) = mpsc::channel(TOPIC_BUFFER);
        self.state
            .lock()
            .topics
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<()> {
        let payload = codec::to_cbor(&TopicEnvelope {
            topic: topic.to_string(),
            data,
        })?;
        let targets: Vec<(PeerId, String)> = self
            .state
            .lock()
            .address_book
            .iter()
            .map(|(peer, addr)| (peer.clone(), addr.clone()))
            .collect();

        for (peer, addr) in targets {
            let result = match self.connect(&addr, PUBSUB_PROTOCOL).await {
                Ok(stream) => send_and_close(stream, &payload).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                tracing::debug!(peer = %peer, topic, error = %e, "Publish failed, dropping peer");
                self.forget(&peer);
            }
        }
        Ok(())
    }

    fn peer_events(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::stream_handler;

    #[test]
    fn test_resolve_unspecified_listen_addr() {
        let remote: SocketAddr = "10.0.0.7:50000".parse().unwrap();
        assert_eq!(resolve_listen_addr("0.0.0.0:26642", remote), "10.0.0.7:26642");
        assert_eq!(resolve_listen_addr("192.168.1.2:9000", remote), "192.168.1.2:9000");
    }

    #[tokio::test]
    async fn test_tcp_discovery_streams_and_pubsub() {
        let result = tokio::time::timeout(Duration::from_secs(10), async {
            let cancel = CancellationToken::new();
            let a = TcpTransport::bind("127.0.0.1:0", vec![], cancel.clone()).await.unwrap();
            let b = TcpTransport::bind("127.0.0.1:0", vec![a.listen_addr().to_string()], cancel.clone())
                .await
                .unwrap();

            a.advertise("comiccoin/blockdatadto").await.unwrap();
            b.advertise("comiccoin/blockdatadto").await.unwrap();
            assert_eq!(b.discover("comiccoin/blockdatadto").await.unwrap(), vec![a.local_peer_id()]);
            assert_eq!(a.discover("comiccoin/blockdatadto").await.unwrap(), vec![b.local_peer_id()]);

            let (tx, mut rx) = mpsc::channel(1);
            a.set_stream_handler(
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
            let stream = b.open_stream(&a.local_peer_id(), "/echo").await.unwrap();
            send_and_close(stream, b"hello").await.unwrap();
            let (from, bytes) = rx.recv().await.unwrap();
            assert_eq!(from, b.local_peer_id());
            assert_eq!(bytes, b"hello".to_vec());

            let mut sub = a.join_topic("comiccoin/mempool").await.unwrap();
            b.publish("comiccoin/mempool", vec![9, 9]).await.unwrap();
            let message = sub.recv().await.unwrap();
            assert_eq!(message.data, vec![9, 9]);
            assert_eq!(message.from, b.local_peer_id());

            cancel.cancel();
        })
        .await;
        assert!(result.is_ok());
    }
}
