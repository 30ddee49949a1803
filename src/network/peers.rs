//! Live peer set kept current by discovery and disconnect events.

use crate::error::{ChainError, Result};
use parking_lot::RwLock;
use rand::seq::IteratorRandom;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use super::{PeerEvent, PeerId, PeerTransport};

#[derive(Clone, Default)]
pub struct PeerSet {
    peers: Arc<RwLock<BTreeSet<PeerId>>>,
}

impl PeerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the peer was not known before.
    pub fn insert(&self, peer: PeerId) -> bool {
        self.peers.write().insert(peer)
    }

    pub fn remove(&self, peer: &PeerId) -> bool {
        self.peers.write().remove(peer)
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.peers.read().contains(peer)
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    pub fn snapshot(&self) -> Vec<PeerId> {
        self.peers.read().iter().cloned().collect()
    }

    /// Uniformly random live peer.
    pub fn random(&self) -> Result<PeerId> {
        self.peers
            .read()
            .iter()
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or(ChainError::NoPeersConnected)
    }
}

/// Every `interval`, advertises under `rendezvous` and refreshes `peers`;
/// peers the transport reports as disconnected are dropped immediately.
pub async fn run_discovery(
    transport: Arc<dyn PeerTransport>,
    rendezvous: String,
    peers: PeerSet,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut events = transport.peer_events();
    let mut events_open = true;
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!(rendezvous = %rendezvous, "Discovery stopped");
                return;
            }
            _ = ticker.tick() => {
                // Rendezvous registrations do not survive a restart of the remote side.
                if let Err(e) = transport.advertise(&rendezvous).await {
                    tracing::warn!(rendezvous = %rendezvous, error = %e, "Failed to advertise");
                }
                match transport.discover(&rendezvous).await {
                    Ok(found) => {
                        for peer in found {
                            if peers.insert(peer.clone()) {
                                tracing::info!(peer = %peer, rendezvous = %rendezvous, "Peer connected");
                            }
                        }
                    }
                    Err(e) => tracing::debug!(rendezvous = %rendezvous, error = %e, "Discovery round failed"),
                }
            }
            event = events.recv(), if events_open => match event {
                Ok(PeerEvent::Disconnected(peer)) => {
                    if peers.remove(&peer) {
                        tracing::info!(peer = %peer, "Peer disconnected");
                    }
                }
                Ok(PeerEvent::Connected(_)) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Peer event stream lagged");
                }
                Err(RecvError::Closed) => events_open = false,
            },
        }
    }
}
