//! Node wiring: config, storage, transport and the long-running services.

use crate::config::Config;
use crate::crypto::{KeyPair, PlaintextKeyProvider};
use crate::error::{ChainError, Result};
use crate::genesis::{self, GenesisService};
use crate::lock::KeyedMutex;
use crate::mempool::{MempoolRelay, MempoolTransaction, PendingPool};
use crate::network::peers::run_discovery;
use crate::network::tcp::TcpTransport;
use crate::network::{BlockDataDtoProtocol, PeerSet, PeerTransport};
use crate::proposer::BlockProposer;
use crate::repository::Ledger;
use crate::storage::open_storage;
use crate::sync::BlockDataServer;
use crate::transaction::SignedTransaction;
use crate::validation::PoaValidationService;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    /// Holds the validator key and proposes blocks.
    Authority,
    /// Validates and applies blocks proposed by the authority.
    Follower,
}

pub struct Node {
    config: Config,
    ledger: Ledger,
    transport: Arc<dyn PeerTransport>,
    block_peers: PeerSet,
    protocol: Arc<BlockDataDtoProtocol>,
    relay: Arc<MempoolRelay>,
    pool: PendingPool,
    locks: KeyedMutex,
    authority: Option<KeyPair>,
    cancel: CancellationToken,
}

impl Node {
    /// Opens storage, binds the TCP transport and bootstraps genesis.
    pub async fn init(config: Config) -> Result<Self> {
        config.validate()?;
        let cancel = CancellationToken::new();
        let transport = TcpTransport::bind(
            &config.network.listen_addr,
            config.network.bootstrap_peers.clone(),
            cancel.clone(),
        )
        .await?;
        Self::with_transport(config, transport, cancel).await
    }

    /// Same as [`Node::init`] over an already constructed transport.
    pub async fn with_transport(
        config: Config,
        transport: Arc<dyn PeerTransport>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let storage = open_storage(&config.database.path)?;
        let ledger = Ledger::new(storage);
        let authority = bootstrap_genesis(&config, &ledger).await?;

        let block_peers = PeerSet::new();
        let protocol = Arc::new(BlockDataDtoProtocol::new(
            transport.clone(),
            block_peers.clone(),
            config.network.response_timeout(),
        ));
        let relay = Arc::new(MempoolRelay::join(transport.clone(), &config.network.mempool_rendezvous).await?);

        let node = Node {
            config,
            ledger,
            transport,
            block_peers,
            protocol,
            relay,
            pool: PendingPool::new(),
            locks: KeyedMutex::new(),
            authority,
            cancel,
        };
        info!(
            peer = %node.transport.local_peer_id(),
            chain_id = node.config.chain.chain_id,
            role = ?node.role(),
            "Node initialized"
        );
        Ok(node)
    }

    pub fn role(&self) -> NodeRole {
        if self.authority.is_some() {
            NodeRole::Authority
        } else {
            NodeRole::Follower
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn pending(&self) -> &PendingPool {
        &self.pool
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn shutdown(&self) {
        info!("Shutting down node");
        self.cancel.cancel();
    }

    /// Validates a locally submitted transaction, queues it if this node
    /// proposes blocks, and gossips it. Returns the mempool id.
    pub async fn submit_transaction(&self, signed: SignedTransaction) -> Result<String> {
        let chain_id = self.config.chain.chain_id;
        let tip = self
            .ledger
            .latest_block(chain_id)?
            .ok_or(ChainError::ChainNotInitialized(chain_id))?;
        let authority = tip.validator.address()?;
        signed.validate(chain_id, signed.transaction.from == authority)?;

        let tx = MempoolTransaction::new(signed)?;
        let id = tx.id.clone();
        if self.authority.is_some() {
            self.pool.insert(tx.clone());
        }
        self.relay.broadcast_to_network(&tx).await?;
        info!(id = %id, "Transaction submitted");
        Ok(id)
    }

    /// Runs every service until shutdown. A consensus divergence under the
    /// strict failure policy stops the node with that error.
    pub async fn run(&self) -> Result<()> {
        let interval = self.config.network.discovery_interval();
        for (rendezvous, peers) in [
            (self.config.network.block_data_rendezvous.clone(), self.block_peers.clone()),
            (self.config.network.mempool_rendezvous.clone(), PeerSet::new()),
        ] {
            tokio::spawn(run_discovery(
                self.transport.clone(),
                rendezvous,
                peers,
                interval,
                self.cancel.clone(),
            ));
        }

        let server = BlockDataServer::new(self.ledger.clone(), self.protocol.clone());
        let server_cancel = self.cancel.clone();
        tokio::spawn(async move { server.run(server_cancel).await });

        let relay = self.relay.clone();
        let pool = self.authority.as_ref().map(|_| self.pool.clone());
        let relay_cancel = self.cancel.clone();
        tokio::spawn(async move { ingest_mempool(relay, pool, relay_cancel).await });

        if let Some(authority) = &self.authority {
            let proposer = BlockProposer::new(
                self.config.chain.chain_id,
                self.config.chain.difficulty,
                self.config.miner.max_transactions_per_block,
                self.ledger.clone(),
                authority.clone(),
                self.pool.clone(),
                self.locks.clone(),
                Some(self.protocol.clone()),
            );
            let block_interval = self.config.miner.block_interval();
            let proposer_cancel = self.cancel.clone();
            tokio::spawn(async move {
                if let Err(e) = proposer.run(block_interval, proposer_cancel).await {
                    error!(error = %e, "Block proposer stopped");
                }
            });
        }

        let validation = PoaValidationService::new(
            self.config.chain.chain_id,
            self.ledger.clone(),
            self.protocol.clone(),
            self.locks.clone(),
            self.config.validation.failure_policy,
            self.config.validation.poll_interval(),
        );
        let result = validation.run(self.cancel.clone()).await;
        self.cancel.cancel();
        result
    }
}

async fn ingest_mempool(relay: Arc<MempoolRelay>, pool: Option<PendingPool>, cancel: CancellationToken) {
    loop {
        let tx = tokio::select! {
            _ = cancel.cancelled() => return,
            tx = relay.receive_from_network() => tx,
        };
        let Some(tx) = tx else { return };
        match &pool {
            Some(pool) => {
                if pool.insert(tx.clone()) {
                    tracing::debug!(id = %tx.id, "Queued relayed transaction");
                }
            }
            None => tracing::trace!(id = %tx.id, "Observed relayed transaction"),
        }
    }
}

/// Brings the ledger to a usable tip. Returns the authority key when this
/// node is configured to mine.
async fn bootstrap_genesis(config: &Config, ledger: &Ledger) -> Result<Option<KeyPair>> {
    let service = GenesisService::new(
        ledger.clone(),
        config.chain.chain_id,
        config.chain.difficulty,
        config.genesis.initial_supply,
        config.genesis.validator_id.clone(),
        config.genesis.token_metadata_uri.clone(),
    );
    let initialized = service.is_initialized()?;
    let artifact = Path::new(&config.genesis.artifact_path);

    let authority = if config.miner.enabled {
        Some(genesis::load_coinbase_key(
            &config.genesis.coinbase_key_path,
            &PlaintextKeyProvider,
            "",
            !initialized,
        )?)
    } else {
        None
    };

    if initialized {
        info!("Blockchain already initialized");
    } else if artifact.exists() {
        service.import_artifact(artifact)?;
    } else if let Some(coinbase) = authority.clone() {
        let artifact_path = artifact.to_path_buf();
        let block_data = tokio::task::spawn_blocking(move || {
            let block_data = service.create(&coinbase, &CancellationToken::new())?;
            genesis::write_artifact(&block_data, &artifact_path)?;
            Ok::<_, ChainError>(block_data)
        })
        .await
        .map_err(|e| ChainError::IoError(format!("Genesis task failed: {}", e)))??;
        info!(hash = %block_data.hash, path = %config.genesis.artifact_path, "Genesis artifact written");
    } else {
        return Err(ChainError::Config(format!(
            "No genesis artifact at {} and mining is disabled",
            config.genesis.artifact_path
        )));
    }

    if let Some(keypair) = &authority {
        let tip = ledger
            .latest_block(config.chain.chain_id)?
            .ok_or(ChainError::ChainNotInitialized(config.chain.chain_id))?;
        if tip.validator.public_key_bytes != keypair.public_key_bytes() {
            warn!("Coinbase key is not the chain's validator; block proposals will be refused");
        }
    }
    Ok(authority)
}
