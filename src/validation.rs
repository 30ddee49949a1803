//! Proof-of-Authority validation of proposed blocks.
//!
//! One consumer loop polls the block data channel, and every proposal is
//! processed inside the `validator-service` critical section:
//! structural checks, dedup, tip lookup, authority signature, continuity,
//! transaction application in one storage transaction, root checks, then
//! persist and advance the tip.

use crate::blockchain::{apply_block_transactions, validate_chain_continuity, BlockData, BlockchainState};
use crate::config::FailurePolicy;
use crate::error::{ChainError, Result};
use crate::lock::{KeyedMutex, VALIDATOR_SERVICE_LOCK};
use crate::miner;
use crate::network::BlockDataDtoProtocol;
use crate::repository::Ledger;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Proposals parked while waiting for their predecessor.
const MAX_QUARANTINED: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    Applied { number: u64, hash: String },
    /// Already stored locally; nothing to do.
    Duplicate { hash: String },
    /// Malformed proposal, dropped without touching state.
    Rejected { hash: String, reason: String },
    /// Diverged from the local tip; its predecessor was requested.
    Quarantined { hash: String, requested: String },
}

pub struct PoaValidationService {
    chain_id: u16,
    ledger: Ledger,
    protocol: Arc<BlockDataDtoProtocol>,
    locks: KeyedMutex,
    policy: FailurePolicy,
    poll_interval: Duration,
    quarantine: Mutex<HashMap<String, BlockData>>,
}

impl PoaValidationService {
    pub fn new(
        chain_id: u16,
        ledger: Ledger,
        protocol: Arc<BlockDataDtoProtocol>,
        locks: KeyedMutex,
        policy: FailurePolicy,
        poll_interval: Duration,
    ) -> Self {
        PoaValidationService {
            chain_id,
            ledger,
            protocol,
            locks,
            policy,
            poll_interval,
            quarantine: Mutex::new(HashMap::new()),
        }
    }

    /// Runs until cancelled. Under `FailurePolicy::Strict` a consensus
    /// divergence ends the loop with `ChainError::ResyncRequired`.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        tracing::info!(chain_id = self.chain_id, policy = ?self.policy, "Validation service started");
        loop {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Validation service stopped");
                    return Ok(());
                }
                outcome = self.run_once() => outcome,
            };
            match outcome {
                Ok(_) => {}
                Err(e) if e.is_transient() => {
                    tracing::debug!(error = %e, "Transient error while waiting for proposals");
                    tokio::time::sleep(self.poll_interval).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Handles at most one proposal. `Ok(None)` when none arrived within the poll interval.
    pub async fn run_once(&self) -> Result<Option<ValidationOutcome>> {
        let response = match self.protocol.receive_response_within(self.poll_interval).await? {
            Some(response) => response,
            None => return Ok(None),
        };
        tracing::debug!(peer = %response.peer, hash = %response.block_data.hash, "Received proposal");
        self.validate_and_apply(response.block_data).await.map(Some)
    }

    pub async fn validate_and_apply(&self, block_data: BlockData) -> Result<ValidationOutcome> {
        let _guard = self.locks.acquire(VALIDATOR_SERVICE_LOCK).await;

        let first = self.handle(block_data).await?;
        // Applying a block may unblock a quarantined successor, and so on.
        let mut applied = match &first {
            ValidationOutcome::Applied { hash, .. } => Some(hash.clone()),
            _ => None,
        };
        while let Some(parent) = applied.take() {
            let child = self.take_quarantined_child(&parent);
            if let Some(child) = child {
                if let ValidationOutcome::Applied { hash, .. } = self.handle(child).await? {
                    applied = Some(hash);
                }
            }
        }
        Ok(first)
    }

    async fn handle(&self, block_data: BlockData) -> Result<ValidationOutcome> {
        let hash = block_data.hash.clone();
        match self.process(&block_data) {
            Ok(outcome) => {
                if let ValidationOutcome::Applied { number, hash } = &outcome {
                    tracing::info!(number, hash = %hash, "Block validated and applied");
                }
                Ok(outcome)
            }
            Err(e) if e.is_consensus_divergence() => match self.policy {
                FailurePolicy::Strict => {
                    tracing::error!(hash = %hash, error = %e, "Local ledger diverged from the authority chain");
                    Err(e)
                }
                FailurePolicy::Resync => {
                    tracing::warn!(hash = %hash, error = %e, "Quarantining proposal and requesting its predecessor");
                    let requested = block_data.header.prev_block_hash.clone();
                    self.quarantine_block(block_data);
                    if let Err(e) = self.protocol.send_request_to_random_peer(&requested).await {
                        tracing::warn!(hash = %requested, error = %e, "Resync request failed");
                    }
                    Ok(ValidationOutcome::Quarantined { hash, requested })
                }
            },
            Err(
                e @ (ChainError::Validation(_)
                | ChainError::InvalidBlock(_)
                | ChainError::InvalidTransaction(_)
                | ChainError::CryptoError(_)),
            ) => {
                tracing::warn!(hash = %hash, error = %e, "Rejected malformed proposal");
                Ok(ValidationOutcome::Rejected {
                    hash,
                    reason: e.to_string(),
                })
            }
            Err(e) => Err(e),
        }
    }

    fn process(&self, block_data: &BlockData) -> Result<ValidationOutcome> {
        block_data.validate_fields()?;
        block_data.verify_hash()?;

        if self.ledger.blocks.get_by_hash(&block_data.hash)?.is_some() {
            tracing::debug!(hash = %block_data.hash, "Proposal already applied");
            return Ok(ValidationOutcome::Duplicate {
                hash: block_data.hash.clone(),
            });
        }

        let state = self
            .ledger
            .chain_state
            .get_by_chain_id(self.chain_id)?
            .ok_or(ChainError::ChainNotInitialized(self.chain_id))?;
        let prev = self
            .ledger
            .blocks
            .get_by_hash(&state.latest_hash)?
            .ok_or_else(|| ChainError::DatabaseError(format!("Tip block {} is missing", state.latest_hash)))?;

        let header = &block_data.header;
        block_data.verify_trans_root()?;
        if !miner::is_hash_solved(header.difficulty, &block_data.hash) {
            return Err(ChainError::InvalidBlock(format!(
                "Hash {} does not satisfy difficulty {}",
                block_data.hash, header.difficulty
            )));
        }

        if !prev
            .validator
            .verify(&block_data.header_signature_bytes, header)
        {
            return Err(ChainError::ResyncRequired(format!(
                "Block {} is not signed by validator {}",
                block_data.hash, prev.validator.id
            )));
        }
        validate_chain_continuity(&prev, header)?;

        let authority = prev.validator.address()?;
        for block_tx in &block_data.transactions {
            let tx = block_tx.transaction();
            block_tx
                .signed_transaction
                .validate(self.chain_id, tx.from == authority)?;
        }

        let txn = self.ledger.begin()?;
        let latest_token_id =
            apply_block_transactions(&self.ledger, &block_data.transactions, state.latest_token_id)
                .map_err(|e| match e {
                    ChainError::InsufficientBalance(msg) | ChainError::InvalidTransaction(msg) => {
                        ChainError::ResyncRequired(format!("Transactions do not apply locally: {}", msg))
                    }
                    other => other,
                })?;

        let state_root = self.ledger.accounts.hash_state()?;
        if state_root != header.state_root {
            return Err(ChainError::ResyncRequired(format!(
                "State root mismatch: local {}, block {}",
                state_root, header.state_root
            )));
        }
        let tokens_root = self.ledger.tokens.hash_state()?;
        if tokens_root != header.tokens_root {
            return Err(ChainError::ResyncRequired(format!(
                "Tokens root mismatch: local {}, block {}",
                tokens_root, header.tokens_root
            )));
        }
        if latest_token_id != header.latest_token_id {
            return Err(ChainError::ResyncRequired(format!(
                "Latest token id mismatch: local {}, block {}",
                latest_token_id, header.latest_token_id
            )));
        }

        self.ledger.blocks.upsert(block_data)?;
        self.ledger.chain_state.upsert_by_chain_id(&BlockchainState {
            chain_id: self.chain_id,
            latest_block_number: header.number,
            latest_hash: block_data.hash.clone(),
            latest_token_id,
            account_hash_state: state_root,
            token_hash_state: tokens_root,
        })?;
        txn.commit()?;

        Ok(ValidationOutcome::Applied {
            number: header.number,
            hash: block_data.hash.clone(),
        })
    }

    fn quarantine_block(&self, block_data: BlockData) {
        let mut quarantine = self.quarantine.lock();
        if quarantine.len() >= MAX_QUARANTINED && !quarantine.contains_key(&block_data.hash) {
            if let Some(lowest) = quarantine
                .values()
                .min_by_key(|b| b.header.number)
                .map(|b| b.hash.clone())
            {
                quarantine.remove(&lowest);
            }
        }
        quarantine.insert(block_data.hash.clone(), block_data);
    }

    fn take_quarantined_child(&self, parent_hash: &str) -> Option<BlockData> {
        let mut quarantine = self.quarantine.lock();
        let child = quarantine
            .values()
            .find(|b| b.header.prev_block_hash == parent_hash)
            .map(|b| b.hash.clone())?;
        quarantine.remove(&child)
    }

    pub fn quarantined(&self) -> Vec<String> {
        let mut hashes: Vec<String> = self.quarantine.lock().keys().cloned().collect();
        hashes.sort();
        hashes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::Validator;
    use crate::crypto::KeyPair;
    use crate::mempool::PendingPool;
    use crate::network::memory::InMemoryNetwork;
    use crate::network::protocol::DEFAULT_RESPONSE_TIMEOUT;
    use crate::network::{PeerId, PeerSet};
    use crate::mempool::MempoolTransaction;
    use crate::proposer::BlockProposer;
    use crate::test_support::{authority_chain, coin_transfer, follower_of, TestChain, CHAIN_ID};
    use crate::transaction::Transaction;
    use tempfile::TempDir;

    struct Harness {
        _dir: TempDir,
        _network: InMemoryNetwork,
        chain: TestChain,
        pool: PendingPool,
        proposer: BlockProposer,
        follower: Ledger,
        service: PoaValidationService,
    }

    fn harness(policy: FailurePolicy) -> Harness {
        let dir = TempDir::new().unwrap();
        let chain = authority_chain();
        let follower = follower_of(&chain, dir.path());
        let pool = PendingPool::new();
        let proposer = BlockProposer::new(
            CHAIN_ID,
            1,
            10,
            chain.ledger.clone(),
            chain.coinbase.clone(),
            pool.clone(),
            KeyedMutex::new(),
            None,
        );
        let network = InMemoryNetwork::new();
        let protocol = BlockDataDtoProtocol::new(
            network.join(PeerId::new("follower")),
            PeerSet::new(),
            DEFAULT_RESPONSE_TIMEOUT,
        );
        let service = PoaValidationService::new(
            CHAIN_ID,
            follower.clone(),
            Arc::new(protocol),
            KeyedMutex::new(),
            policy,
            Duration::from_millis(20),
        );
        Harness {
            _dir: dir,
            _network: network,
            chain,
            pool,
            proposer,
            follower,
            service,
        }
    }

    impl Harness {
        async fn next_block(&self, value: u64) -> BlockData {
            self.pool
                .insert(coin_transfer(&self.chain.coinbase, KeyPair::generate().address(), value));
            self.proposer
                .propose(&CancellationToken::new())
                .await
                .unwrap()
                .unwrap()
        }

        fn follower_tip(&self) -> BlockchainState {
            self.follower.chain_state.get_by_chain_id(CHAIN_ID).unwrap().unwrap()
        }
    }

    #[tokio::test]
    async fn test_follower_applies_authority_block() {
        let result = tokio::time::timeout(Duration::from_secs(10), async {
            let h = harness(FailurePolicy::Strict);
            let block = h.next_block(100).await;

            let outcome = h.service.validate_and_apply(block.clone()).await.unwrap();
            assert_eq!(
                outcome,
                ValidationOutcome::Applied {
                    number: 1,
                    hash: block.hash.clone()
                }
            );
            let tip = h.follower_tip();
            assert_eq!(tip.latest_hash, block.hash);
            assert_eq!(tip.account_hash_state, h.chain.ledger.accounts.hash_state().unwrap());
            assert_eq!(tip.token_hash_state, h.chain.ledger.tokens.hash_state().unwrap());

            let again = h.service.validate_and_apply(block.clone()).await.unwrap();
            assert_eq!(again, ValidationOutcome::Duplicate { hash: block.hash });
        })
        .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_tampered_block_rejected_without_state_change() {
        let result = tokio::time::timeout(Duration::from_secs(10), async {
            let h = harness(FailurePolicy::Strict);
            let mut block = h.next_block(100).await;
            block.header.mining_reward = 1_000;
            let before = h.follower.accounts.hash_state().unwrap();

            let outcome = h.service.validate_and_apply(block).await.unwrap();
            assert!(matches!(outcome, ValidationOutcome::Rejected { .. }));
            assert_eq!(h.follower.accounts.hash_state().unwrap(), before);
            assert_eq!(h.follower_tip().latest_block_number, 0);
        })
        .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_foreign_signature_is_divergence() {
        let result = tokio::time::timeout(Duration::from_secs(10), async {
            let h = harness(FailurePolicy::Strict);
            let mut block = h.next_block(100).await;
            let impostor = KeyPair::generate();
            block.header_signature_bytes = Validator::sign(&impostor, &block.header).unwrap();

            let outcome = h.service.validate_and_apply(block).await;
            assert!(matches!(outcome, Err(ChainError::ResyncRequired(_))));
            assert_eq!(h.follower_tip().latest_block_number, 0);
        })
        .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_strict_policy_surfaces_gap() {
        let result = tokio::time::timeout(Duration::from_secs(10), async {
            let h = harness(FailurePolicy::Strict);
            let _first = h.next_block(100).await;
            let second = h.next_block(200).await;
            let before = h.follower.accounts.hash_state().unwrap();

            let outcome = h.service.validate_and_apply(second).await;
            assert!(matches!(outcome, Err(ChainError::ResyncRequired(_))));
            assert_eq!(h.follower.accounts.hash_state().unwrap(), before);
            assert_eq!(h.follower_tip().latest_block_number, 0);
        })
        .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_resync_policy_quarantines_then_catches_up() {
        let result = tokio::time::timeout(Duration::from_secs(10), async {
            let h = harness(FailurePolicy::Resync);
            let first = h.next_block(100).await;
            let second = h.next_block(200).await;

            let outcome = h.service.validate_and_apply(second.clone()).await.unwrap();
            assert_eq!(
                outcome,
                ValidationOutcome::Quarantined {
                    hash: second.hash.clone(),
                    requested: first.hash.clone()
                }
            );
            assert_eq!(h.service.quarantined(), vec![second.hash.clone()]);

            let outcome = h.service.validate_and_apply(first.clone()).await.unwrap();
            assert!(matches!(outcome, ValidationOutcome::Applied { number: 1, .. }));
            assert!(h.service.quarantined().is_empty());

            let tip = h.follower_tip();
            assert_eq!(tip.latest_block_number, 2);
            assert_eq!(tip.latest_hash, second.hash);
            assert_eq!(tip.account_hash_state, h.chain.ledger.accounts.hash_state().unwrap());
        })
        .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_repeated_trailing_transaction_rejected() {
        let result = tokio::time::timeout(Duration::from_secs(10), async {
            let h = harness(FailurePolicy::Strict);
            let coinbase = h.chain.coinbase.address();
            h.pool
                .insert(coin_transfer(&h.chain.coinbase, KeyPair::generate().address(), 10));
            h.pool
                .insert(coin_transfer(&h.chain.coinbase, KeyPair::generate().address(), 20));
            let mint = Transaction::new_token(CHAIN_ID, 1, coinbase, coinbase, 5, "ipfs://comic/5", 0)
                .sign(&h.chain.coinbase)
                .unwrap();
            h.pool.insert(MempoolTransaction::new(mint).unwrap());
            let mut block = h
                .proposer
                .propose(&CancellationToken::new())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(block.transactions.len(), 3);

            let last = block.transactions[2].clone();
            block.transactions.push(last);
            let outcome = h.service.validate_and_apply(block.clone()).await.unwrap();
            assert!(matches!(outcome, ValidationOutcome::Rejected { .. }));
            assert_eq!(h.follower_tip().latest_block_number, 0);
            assert!(h.follower.blocks.get_by_hash(&block.hash).unwrap().is_none());
        })
        .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_known_hash_with_altered_body_rejected() {
        let result = tokio::time::timeout(Duration::from_secs(10), async {
            let h = harness(FailurePolicy::Strict);
            let block = h.next_block(100).await;
            let applied = h.service.validate_and_apply(block.clone()).await.unwrap();
            assert!(matches!(applied, ValidationOutcome::Applied { .. }));

            let mut altered = block.clone();
            altered.header.mining_reward = 7;
            let outcome = h.service.validate_and_apply(altered).await.unwrap();
            assert!(matches!(outcome, ValidationOutcome::Rejected { .. }));
            let stored = h.follower.blocks.get_by_hash(&block.hash).unwrap().unwrap();
            assert_eq!(stored, block);
        })
        .await;
        assert!(result.is_ok());
    }
}
