//! Block data serving and on-demand chain synchronization.
//!
//! `BlockDataServer` answers peers' block-by-hash requests from the local
//! ledger. `ChainSync` asks peers for blocks; the answers arrive on the
//! block data response channel, which the validation service consumes.

use crate::blockchain::BlockData;
use crate::error::{ChainError, Result};
use crate::network::protocol::BlockDataRequest;
use crate::network::{BlockDataDtoProtocol, PeerId};
use crate::repository::Ledger;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct BlockDataServer {
    ledger: Ledger,
    protocol: Arc<BlockDataDtoProtocol>,
}

impl BlockDataServer {
    pub fn new(ledger: Ledger, protocol: Arc<BlockDataDtoProtocol>) -> Self {
        BlockDataServer { ledger, protocol }
    }

    /// Serves requests until cancelled or the request channel closes.
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            let request = tokio::select! {
                _ = cancel.cancelled() => break,
                request = self.protocol.receive_request_from_network() => request,
            };
            let Some(request) = request else { break };
            if let Err(e) = self.serve(&request).await {
                tracing::warn!(peer = %request.peer, hash = %request.hash, error = %e, "Failed to serve block data");
            }
        }
        tracing::debug!("Block data server stopped");
    }

    /// Returns whether the block was found and sent. Unknown hashes are
    /// ignored so the requester times out.
    pub async fn serve(&self, request: &BlockDataRequest) -> Result<bool> {
        match self.ledger.blocks.get_by_hash(&request.hash)? {
            Some(block_data) => {
                self.protocol.send_response_to_peer(&request.peer, &block_data).await?;
                tracing::debug!(peer = %request.peer, number = block_data.header.number, "Served block data");
                Ok(true)
            }
            None => {
                tracing::debug!(peer = %request.peer, hash = %request.hash, "Requested block not found");
                Ok(false)
            }
        }
    }
}

pub struct ChainSync {
    protocol: Arc<BlockDataDtoProtocol>,
}

impl ChainSync {
    pub fn new(protocol: Arc<BlockDataDtoProtocol>) -> Self {
        ChainSync { protocol }
    }

    /// Fire and forget; the block arrives on the response channel.
    pub async fn request_block(&self, hash: &str) -> Result<PeerId> {
        self.protocol.send_request_to_random_peer(hash).await
    }

    /// Requests `hash` and waits for it on the response channel, skipping
    /// unrelated responses. Only usable while no validation service is
    /// draining the same channel.
    pub async fn fetch_block(&self, hash: &str) -> Result<BlockData> {
        let peer = self.request_block(hash).await?;
        loop {
            let response = self.protocol.receive_response_from_network().await?;
            if response.block_data.hash == hash {
                return Ok(response.block_data);
            }
            tracing::debug!(
                expected = %hash,
                got = %response.block_data.hash,
                from = %response.peer,
                asked = %peer,
                "Skipping unrelated block data response"
            );
        }
    }

    /// Walks back from `hash` until a block already stored locally, returning
    /// the missing blocks oldest first.
    pub async fn fetch_missing_ancestry(&self, ledger: &Ledger, hash: &str) -> Result<Vec<BlockData>> {
        let mut missing = Vec::new();
        let mut next = hash.to_string();
        while ledger.blocks.get_by_hash(&next)?.is_none() {
            let block_data = self.fetch_block(&next).await?;
            if block_data.header.number == 0 {
                return Err(ChainError::ResyncRequired(format!(
                    "Peer chain shares no block with the local ledger below {}",
                    hash
                )));
            }
            next = block_data.header.prev_block_hash.clone();
            missing.push(block_data);
        }
        missing.reverse();
        Ok(missing)
    }
}
