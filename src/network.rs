//! Peer-to-peer plumbing.
//!
//! Consensus code talks to peers only through [`PeerTransport`]. Two
//! transports are provided: [`memory::InMemoryNetwork`] for tests and
//! single-process clusters, and [`tcp::TcpTransport`] for real deployments.

pub mod framing;
pub mod memory;
pub mod peers;
pub mod protocol;
pub mod pubsub;
pub mod tcp;

use crate::error::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};

pub use framing::FramedStream;
pub use peers::PeerSet;
pub use protocol::BlockDataDtoProtocol;
pub use pubsub::PubSub;

#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        PeerId(id.into())
    }

    pub fn random() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        PeerId(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PeerId({})", self.0)
    }
}

/// Any byte stream a transport can hand out.
pub trait PeerIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> PeerIo for T {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    Connected(PeerId),
    Disconnected(PeerId),
}

/// A message received on a pub/sub topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicMessage {
    pub from: PeerId,
    pub data: Vec<u8>,
}

/// Called once per inbound stream; the transport runs each call as its own task.
pub type StreamHandler = Arc<dyn Fn(PeerId, FramedStream) -> BoxFuture<'static, ()> + Send + Sync>;

pub fn stream_handler<F, Fut>(f: F) -> StreamHandler
where
    F: Fn(PeerId, FramedStream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |peer: PeerId, stream: FramedStream| -> BoxFuture<'static, ()> {
        Box::pin(f(peer, stream))
    })
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    fn local_peer_id(&self) -> PeerId;

    /// Announces this node under `rendezvous`.
    async fn advertise(&self, rendezvous: &str) -> Result<()>;

    /// Peers currently advertised under `rendezvous`, excluding ourselves.
    async fn discover(&self, rendezvous: &str) -> Result<Vec<PeerId>>;

    /// Opens a fresh stream to `peer` speaking `protocol`.
    async fn open_stream(&self, peer: &PeerId, protocol: &str) -> Result<FramedStream>;

    fn set_stream_handler(&self, protocol: &str, handler: StreamHandler);

    async fn join_topic(&self, topic: &str) -> Result<mpsc::Receiver<TopicMessage>>;

    /// Delivers `data` to every other subscriber of `topic`.
    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<()>;

    fn peer_events(&self) -> broadcast::Receiver<PeerEvent>;
}
