//! Block data request/response exchange.
//!
//! A request is the hex block hash; a response is a CBOR `BlockData`. Each
//! message travels on its own stream. Inbound messages of each kind funnel
//! into a single-slot channel, so the consumer handles them one at a time.

use crate::blockchain::BlockData;
use crate::codec;
use crate::error::{ChainError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

use super::framing::{read_message, send_and_close};
use super::{stream_handler, FramedStream, PeerId, PeerSet, PeerTransport};

pub const BLOCK_DATA_REQUEST_PROTOCOL: &str = "/comiccoin/blockdatadto/request/1.0.0";
pub const BLOCK_DATA_RESPONSE_PROTOCOL: &str = "/comiccoin/blockdatadto/response/1.0.0";

pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(45);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDataRequest {
    pub peer: PeerId,
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDataResponse {
    pub peer: PeerId,
    pub block_data: BlockData,
}

pub struct BlockDataDtoProtocol {
    transport: Arc<dyn PeerTransport>,
    peers: PeerSet,
    requests: Mutex<mpsc::Receiver<BlockDataRequest>>,
    responses: Mutex<mpsc::Receiver<BlockDataResponse>>,
    response_timeout: Duration,
}

impl BlockDataDtoProtocol {
    /// Registers both stream handlers on `transport`.
    pub fn new(transport: Arc<dyn PeerTransport>, peers: PeerSet, response_timeout: Duration) -> Self {
        let (request_tx, request_rx) = mpsc::channel(1);
        let (response_tx, response_rx) = mpsc::channel(1);

        transport.set_stream_handler(
            BLOCK_DATA_REQUEST_PROTOCOL,
            stream_handler(move |peer: PeerId, mut stream: FramedStream| {
                let request_tx = request_tx.clone();
                async move {
                    let payload = match read_message(&mut stream).await {
                        Ok(payload) => payload,
                        Err(e) => {
                            tracing::warn!(peer = %peer, error = %e, "Failed to read block data request");
                            return;
                        }
                    };
                    match String::from_utf8(payload) {
                        Ok(hash) => {
                            let _ = request_tx.send(BlockDataRequest { peer, hash }).await;
                        }
                        Err(_) => tracing::warn!(peer = %peer, "Block data request is not valid UTF-8"),
                    }
                }
            }),
        );

        transport.set_stream_handler(
            BLOCK_DATA_RESPONSE_PROTOCOL,
            stream_handler(move |peer: PeerId, mut stream: FramedStream| {
                let response_tx = response_tx.clone();
                async move {
                    let payload = match read_message(&mut stream).await {
                        Ok(payload) => payload,
                        Err(e) => {
                            tracing::warn!(peer = %peer, error = %e, "Failed to read block data response");
                            return;
                        }
                    };
                    match codec::from_cbor::<BlockData>(&payload) {
                        Ok(block_data) => {
                            let _ = response_tx.send(BlockDataResponse { peer, block_data }).await;
                        }
                        Err(e) => tracing::warn!(peer = %peer, error = %e, "Undecodable block data response"),
                    }
                }
            }),
        );

        BlockDataDtoProtocol {
            transport,
            peers,
            requests: Mutex::new(request_rx),
            responses: Mutex::new(response_rx),
            response_timeout,
        }
    }

    pub fn peers(&self) -> &PeerSet {
        &self.peers
    }

    /// Asks a uniformly random live peer for the block with `hash`.
    pub async fn send_request_to_random_peer(&self, hash: &str) -> Result<PeerId> {
        let peer = self.peers.random()?;
        let stream = match self.transport.open_stream(&peer, BLOCK_DATA_REQUEST_PROTOCOL).await {
            Ok(stream) => stream,
            Err(e) => {
                self.peers.remove(&peer);
                return Err(e);
            }
        };
        send_and_close(stream, hash.as_bytes()).await?;
        tracing::debug!(peer = %peer, hash, "Requested block data");
        Ok(peer)
    }

    /// Waits for the next inbound request.
    pub async fn receive_request_from_network(&self) -> Option<BlockDataRequest> {
        self.requests.lock().await.recv().await
    }

    pub async fn send_response_to_peer(&self, peer: &PeerId, block_data: &BlockData) -> Result<()> {
        let payload = codec::to_cbor(block_data)?;
        let stream = self.transport.open_stream(peer, BLOCK_DATA_RESPONSE_PROTOCOL).await?;
        send_and_close(stream, &payload).await
    }

    /// Pushes `block_data` to every live peer; returns how many accepted it.
    pub async fn broadcast_response(&self, block_data: &BlockData) -> usize {
        let mut delivered = 0;
        for peer in self.peers.snapshot() {
            match self.send_response_to_peer(&peer, block_data).await {
                Ok(()) => delivered += 1,
                Err(e) => tracing::warn!(peer = %peer, error = %e, "Failed to push block data"),
            }
        }
        delivered
    }

    /// Waits up to the configured response timeout.
    pub async fn receive_response_from_network(&self) -> Result<BlockDataResponse> {
        self.receive_response_within(self.response_timeout)
            .await?
            .ok_or_else(|| ChainError::Timeout("block data response".to_string()))
    }

    /// `Ok(None)` when nothing arrived within `wait`.
    pub async fn receive_response_within(&self, wait: Duration) -> Result<Option<BlockDataResponse>> {
        let mut responses = self.responses.lock().await;
        match tokio::time::timeout(wait, responses.recv()).await {
            Ok(Some(response)) => Ok(Some(response)),
            Ok(None) => Err(ChainError::NetworkError("Response channel closed".to_string())),
            Err(_) => Ok(None),
        }
    }
}
