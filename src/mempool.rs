//! Pending transactions: gossip relay and the local pool the proposer drains.

use crate::codec;
use crate::error::Result;
use crate::network::{PeerTransport, PubSub};
use crate::transaction::SignedTransaction;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

/// A gossiped, unconfirmed transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MempoolTransaction {
    pub id: String,
    pub signed_transaction: SignedTransaction,
}

impl MempoolTransaction {
    /// The id is the stamped signing digest of the transaction.
    pub fn new(signed_transaction: SignedTransaction) -> Result<Self> {
        Ok(MempoolTransaction {
            id: signed_transaction.hash_hex()?,
            signed_transaction,
        })
    }
}

/// CBOR `MempoolTransaction`s over one pub/sub topic. No validation or
/// deduplication happens here.
pub struct MempoolRelay {
    pubsub: PubSub,
}

impl MempoolRelay {
    pub async fn join(transport: Arc<dyn PeerTransport>, rendezvous: &str) -> Result<Self> {
        Ok(MempoolRelay {
            pubsub: PubSub::join(transport, rendezvous).await?,
        })
    }

    pub async fn broadcast_to_network(&self, tx: &MempoolTransaction) -> Result<()> {
        self.pubsub.broadcast(codec::to_cbor(tx)?).await
    }

    /// Blocks for the next decodable transaction; `None` once the topic closes.
    pub async fn receive_from_network(&self) -> Option<MempoolTransaction> {
        while let Some(message) = self.pubsub.receive().await {
            match codec::from_cbor::<MempoolTransaction>(&message.data) {
                Ok(tx) => return Some(tx),
                Err(e) => {
                    tracing::warn!(peer = %message.from, error = %e, "Discarding undecodable mempool payload")
                }
            }
        }
        None
    }
}

#[derive(Default)]
struct PoolInner {
    order: VecDeque<MempoolTransaction>,
    ids: HashSet<String>,
}

/// FIFO of transactions waiting for the next proposed block.
#[derive(Clone, Default)]
pub struct PendingPool {
    inner: Arc<Mutex<PoolInner>>,
}

impl PendingPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if a transaction with the same id is already queued.
    pub fn insert(&self, tx: MempoolTransaction) -> bool {
        let mut inner = self.inner.lock();
        if !inner.ids.insert(tx.id.clone()) {
            return false;
        }
        inner.order.push_back(tx);
        true
    }

    pub fn len(&self) -> usize {
        self.inner.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().order.is_empty()
    }

    /// Removes and returns up to `max` transactions in arrival order.
    pub fn drain(&self, max: usize) -> Vec<MempoolTransaction> {
        let mut inner = self.inner.lock();
        let take = max.min(inner.order.len());
        let drained: Vec<MempoolTransaction> = inner.order.drain(..take).collect();
        for tx in &drained {
            inner.ids.remove(&tx.id);
        }
        drained
    }

    /// Puts transactions back at the head of the queue in their original
    /// order, skipping any id queued again in the meantime.
    pub fn restore(&self, txs: Vec<MempoolTransaction>) {
        let mut inner = self.inner.lock();
        for tx in txs.into_iter().rev() {
            if inner.ids.insert(tx.id.clone()) {
                inner.order.push_front(tx);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::network::memory::InMemoryNetwork;
    use crate::network::PeerId;
    use crate::transaction::Transaction;
    use std::time::Duration;

    fn mempool_tx(nonce: u64) -> MempoolTransaction {
        let alice = KeyPair::generate();
        let signed = Transaction::new_coin(1, nonce, alice.address(), KeyPair::generate().address(), 5)
            .sign(&alice)
            .unwrap();
        MempoolTransaction::new(signed).unwrap()
    }

    #[test]
    fn test_pending_pool_fifo_and_dedup() {
        let pool = PendingPool::new();
        let first = mempool_tx(0);
        let second = mempool_tx(1);
        assert!(pool.insert(first.clone()));
        assert!(!pool.insert(first.clone()));
        assert!(pool.insert(second.clone()));

        assert_eq!(pool.drain(1), vec![first.clone()]);
        assert!(pool.insert(first));
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.drain(10)[0], second);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_restore_returns_drained_to_front() {
        let pool = PendingPool::new();
        let (a, b, c) = (mempool_tx(0), mempool_tx(1), mempool_tx(2));
        pool.insert(a.clone());
        pool.insert(b.clone());
        let drained = pool.drain(2);
        pool.insert(c.clone());
        pool.insert(b.clone());

        pool.restore(drained);
        assert_eq!(pool.drain(10), vec![a, c, b]);
    }

    #[tokio::test]
    async fn test_relay_round_trip() {
        let result = tokio::time::timeout(Duration::from_secs(5), async {
            let network = InMemoryNetwork::new();
            let a = MempoolRelay::join(network.join(PeerId::new("a")), "comiccoin/mempool").await.unwrap();
            let b = MempoolRelay::join(network.join(PeerId::new("b")), "comiccoin/mempool").await.unwrap();

            let tx = mempool_tx(3);
            a.broadcast_to_network(&tx).await.unwrap();
            assert_eq!(b.receive_from_network().await.unwrap(), tx);
        })
        .await;
        assert!(result.is_ok());
    }
}
