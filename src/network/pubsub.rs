//! Topic gossip over a [`PeerTransport`].

use crate::error::Result;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

use super::{PeerTransport, TopicMessage};

pub struct PubSub {
    transport: Arc<dyn PeerTransport>,
    topic: String,
    subscription: Mutex<mpsc::Receiver<TopicMessage>>,
}

impl PubSub {
    /// Joins and subscribes to `topic`.
    pub async fn join(transport: Arc<dyn PeerTransport>, topic: &str) -> Result<Self> {
        let subscription = transport.join_topic(topic).await?;
        tracing::info!(topic, peer = %transport.local_peer_id(), "Joined topic");
        Ok(PubSub {
            transport,
            topic: topic.to_string(),
            subscription: Mutex::new(subscription),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub async fn broadcast(&self, payload: Vec<u8>) -> Result<()> {
        self.transport.publish(&self.topic, payload).await
    }

    /// Blocks until the next message; `None` once the transport is gone.
    pub async fn receive(&self) -> Option<TopicMessage> {
        self.subscription.lock().await.recv().await
    }
}
