//! Authority self-mining: turns pending transactions into signed blocks.

use crate::blockchain::{
    apply_coin_transfer, apply_token_transfer, token_nonce_accepted, Block, BlockData,
    BlockHeader, BlockchainState, Validator,
};
use crate::crypto::{Address, KeyPair};
use crate::error::{ChainError, Result};
use crate::lock::{KeyedMutex, VALIDATOR_SERVICE_LOCK};
use crate::mempool::{MempoolTransaction, PendingPool};
use crate::miner;
use crate::network::BlockDataDtoProtocol;
use crate::repository::Ledger;
use crate::transaction::{BlockTransaction, TransactionType};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A block body whose roots were computed against the current tip.
struct Draft {
    prev: BlockData,
    base_token_id: u64,
    header: BlockHeader,
    transactions: Vec<BlockTransaction>,
    accepted: Vec<MempoolTransaction>,
}

pub struct BlockProposer {
    chain_id: u16,
    difficulty: u16,
    max_transactions: usize,
    ledger: Ledger,
    authority: KeyPair,
    pool: PendingPool,
    locks: KeyedMutex,
    protocol: Option<Arc<BlockDataDtoProtocol>>,
}

impl BlockProposer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain_id: u16,
        difficulty: u16,
        max_transactions: usize,
        ledger: Ledger,
        authority: KeyPair,
        pool: PendingPool,
        locks: KeyedMutex,
        protocol: Option<Arc<BlockDataDtoProtocol>>,
    ) -> Self {
        BlockProposer {
            chain_id,
            difficulty,
            max_transactions,
            ledger,
            authority,
            pool,
            locks,
            protocol,
        }
    }

    /// Proposes a block every `interval` while transactions are pending.
    pub async fn run(&self, interval: Duration, cancel: CancellationToken) -> Result<()> {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }
            match self.propose(&cancel).await {
                Ok(_) => {}
                Err(ChainError::Cancelled) => return Ok(()),
                Err(e) => tracing::error!(error = %e, "Block proposal failed"),
            }
        }
    }

    /// Drains the pool into one block. `Ok(None)` when nothing was includable.
    ///
    /// Candidates that made it into the draft go back to the pool when mining
    /// or committing fails.
    pub async fn propose(&self, cancel: &CancellationToken) -> Result<Option<BlockData>> {
        if self.pool.is_empty() {
            return Ok(None);
        }
        let _guard = self.locks.acquire(VALIDATOR_SERVICE_LOCK).await;
        let candidates = self.pool.drain(self.max_transactions);

        let draft = match self.draft(&candidates) {
            Ok(Some(draft)) => draft,
            Ok(None) => return Ok(None),
            Err(e) => {
                self.pool.restore(candidates);
                return Err(e);
            }
        };
        let block_data = match self.seal_and_commit(&draft, cancel).await {
            Ok(block_data) => block_data,
            Err(e) => {
                tracing::warn!(
                    number = draft.header.number,
                    returned = draft.accepted.len(),
                    error = %e,
                    "Block not committed, returning transactions to the pool"
                );
                self.pool.restore(draft.accepted);
                return Err(e);
            }
        };
        tracing::info!(
            number = block_data.header.number,
            hash = %block_data.hash,
            transactions = block_data.transactions.len(),
            "Block proposed"
        );

        if let Some(protocol) = &self.protocol {
            let delivered = protocol.broadcast_response(&block_data).await;
            tracing::debug!(delivered, hash = %block_data.hash, "Block pushed to peers");
        }
        Ok(Some(block_data))
    }

    /// Applies the candidates inside a storage transaction to learn the roots,
    /// then rolls back. Nothing is visible to readers afterwards.
    fn draft(&self, candidates: &[MempoolTransaction]) -> Result<Option<Draft>> {
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
        if prev.validator.public_key_bytes != self.authority.public_key_bytes() {
            return Err(ChainError::InvalidBlock(
                "This node's key is not the chain's validator".to_string(),
            ));
        }
        let authority_address = self.authority.address();
        let timestamp = chrono::Utc::now().timestamp_millis().max(0) as u64;

        let txn = self.ledger.begin()?;
        let mut latest_token_id = state.latest_token_id;
        let mut transactions = Vec::new();
        let mut accepted = Vec::new();
        for candidate in candidates {
            let block_tx = candidate
                .signed_transaction
                .clone()
                .into_block_transaction(timestamp, 0, 0);
            match self.include(&candidate.id, &block_tx, authority_address, &mut latest_token_id) {
                Ok(()) => {
                    transactions.push(block_tx);
                    accepted.push(candidate.clone());
                }
                Err(e) => tracing::warn!(id = %candidate.id, error = %e, "Dropping pending transaction"),
            }
        }
        if transactions.is_empty() {
            return Ok(None);
        }

        let header = BlockHeader {
            number: prev.header.number + 1,
            prev_block_hash: prev.hash.clone(),
            timestamp,
            beneficiary: authority_address,
            difficulty: self.difficulty,
            mining_reward: 0,
            state_root: self.ledger.accounts.hash_state()?,
            trans_root: String::new(),
            nonce: 0,
            latest_token_id,
            tokens_root: self.ledger.tokens.hash_state()?,
        };
        txn.discard();

        Ok(Some(Draft {
            prev,
            base_token_id: state.latest_token_id,
            header,
            transactions,
            accepted,
        }))
    }

    /// Mines and signs the draft, then re-applies it and commits.
    async fn seal_and_commit(&self, draft: &Draft, cancel: &CancellationToken) -> Result<BlockData> {
        let mut block = Block::new(draft.header.clone(), draft.transactions.clone())?;
        block.header.nonce =
            miner::mine_async(block.header.clone(), self.difficulty, cancel.clone()).await?;
        let signature = Validator::sign(&self.authority, &block.header)?;
        let block_data = block.into_block_data(signature, draft.prev.validator.clone())?;
        let header = &block_data.header;

        let authority_address = self.authority.address();
        let txn = self.ledger.begin()?;
        let mut latest_token_id = draft.base_token_id;
        for block_tx in &block_data.transactions {
            let id = block_tx.signed_transaction.hash_hex()?;
            self.include(&id, block_tx, authority_address, &mut latest_token_id)?;
        }
        if self.ledger.accounts.hash_state()? != header.state_root
            || self.ledger.tokens.hash_state()? != header.tokens_root
            || latest_token_id != header.latest_token_id
        {
            return Err(ChainError::DatabaseError(format!(
                "Ledger changed while block {} was being mined",
                header.number
            )));
        }

        self.ledger.blocks.upsert(&block_data)?;
        self.ledger.chain_state.upsert_by_chain_id(&BlockchainState {
            chain_id: self.chain_id,
            latest_block_number: header.number,
            latest_hash: block_data.hash.clone(),
            latest_token_id,
            account_hash_state: header.state_root.clone(),
            token_hash_state: header.tokens_root.clone(),
        })?;
        txn.commit()?;
        Ok(block_data)
    }

    /// Checks one transaction against the ledger and applies it.
    fn include(
        &self,
        id: &str,
        block_tx: &BlockTransaction,
        authority: Address,
        latest_token_id: &mut u64,
    ) -> Result<()> {
        let tx = block_tx.transaction();
        block_tx
            .signed_transaction
            .validate(self.chain_id, tx.from == authority)?;
        if self.ledger.blocks.contains_transaction(&tx.from, id)? {
            return Err(ChainError::InvalidTransaction(format!(
                "Transaction {} is already confirmed",
                id
            )));
        }

        match tx.tx_type {
            TransactionType::Coin => apply_coin_transfer(&self.ledger.accounts, tx),
            TransactionType::Token => {
                let stored = self.ledger.tokens.get_by_id(tx.token_id)?;
                match &stored {
                    Some(token) if token.owner != tx.from => {
                        return Err(ChainError::InvalidTransaction(format!(
                            "Token {} is owned by {}, not {}",
                            tx.token_id, token.owner, tx.from
                        )));
                    }
                    None if !(tx.is_self_transfer() && tx.from == authority) => {
                        return Err(ChainError::InvalidTransaction(format!(
                            "Token {} does not exist and only the authority mints",
                            tx.token_id
                        )));
                    }
                    _ => {}
                }
                if !token_nonce_accepted(stored.as_ref(), tx.token_nonce) {
                    return Err(ChainError::InvalidTransaction(format!(
                        "Token {} nonce {} is not newer than the stored one",
                        tx.token_id, tx.token_nonce
                    )));
                }
                if apply_token_transfer(&self.ledger.tokens, tx)? && tx.token_id > *latest_token_id {
                    *latest_token_id = tx.token_id;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{authority_chain, coin_transfer, TestChain, CHAIN_ID, SUPPLY};
    use crate::transaction::Transaction;

    fn proposer(chain: &TestChain, key: KeyPair, pool: &PendingPool) -> BlockProposer {
        proposer_at(chain, key, pool, 1)
    }

    fn proposer_at(chain: &TestChain, key: KeyPair, pool: &PendingPool, difficulty: u16) -> BlockProposer {
        BlockProposer::new(
            CHAIN_ID,
            difficulty,
            10,
            chain.ledger.clone(),
            key,
            pool.clone(),
            KeyedMutex::new(),
            None,
        )
    }

    #[tokio::test]
    async fn test_empty_pool_proposes_nothing() {
        let result = tokio::time::timeout(Duration::from_secs(10), async {
            let chain = authority_chain();
            let pool = PendingPool::new();
            let proposer = proposer(&chain, chain.coinbase.clone(), &pool);
            assert!(proposer.propose(&CancellationToken::new()).await.unwrap().is_none());
        })
        .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_proposed_block_extends_tip() {
        let result = tokio::time::timeout(Duration::from_secs(10), async {
            let chain = authority_chain();
            let pool = PendingPool::new();
            let recipient = KeyPair::generate().address();
            pool.insert(coin_transfer(&chain.coinbase, recipient, 100));

            let block = proposer(&chain, chain.coinbase.clone(), &pool)
                .propose(&CancellationToken::new())
                .await
                .unwrap()
                .unwrap();

            assert_eq!(block.header.number, 1);
            assert_eq!(block.header.prev_block_hash, chain.genesis.hash);
            assert!(miner::is_hash_solved(1, &block.hash));
            assert!(chain
                .genesis
                .validator
                .verify(&block.header_signature_bytes, &block.header));
            block.verify_trans_root().unwrap();

            let state = chain.ledger.chain_state.get_by_chain_id(CHAIN_ID).unwrap().unwrap();
            assert_eq!(state.latest_hash, block.hash);
            assert_eq!(state.account_hash_state, chain.ledger.accounts.hash_state().unwrap());

            let sender = chain
                .ledger
                .accounts
                .get_by_address(&chain.coinbase.address())
                .unwrap()
                .unwrap();
            assert_eq!((sender.balance, sender.nonce), (SUPPLY - 100, 1));
            let receiver = chain.ledger.accounts.get_by_address(&recipient).unwrap().unwrap();
            assert_eq!((receiver.balance, receiver.nonce), (100, 1));
            assert!(pool.is_empty());
        })
        .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_unfunded_transaction_is_dropped() {
        let result = tokio::time::timeout(Duration::from_secs(10), async {
            let chain = authority_chain();
            let pool = PendingPool::new();
            let pauper = KeyPair::generate();
            pool.insert(coin_transfer(&pauper, KeyPair::generate().address(), 1));

            let proposed = proposer(&chain, chain.coinbase.clone(), &pool)
                .propose(&CancellationToken::new())
                .await
                .unwrap();
            assert!(proposed.is_none());
            let state = chain.ledger.chain_state.get_by_chain_id(CHAIN_ID).unwrap().unwrap();
            assert_eq!(state.latest_hash, chain.genesis.hash);
            assert!(chain.ledger.accounts.get_by_address(&pauper.address()).unwrap().is_none());
        })
        .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_authority_mint_then_foreign_transfer_rejected() {
        let result = tokio::time::timeout(Duration::from_secs(10), async {
            let chain = authority_chain();
            let pool = PendingPool::new();
            let proposer = proposer(&chain, chain.coinbase.clone(), &pool);
            let coinbase = chain.coinbase.address();

            let mint = Transaction::new_token(CHAIN_ID, 1, coinbase, coinbase, 5, "ipfs://comic/5", 0)
                .sign(&chain.coinbase)
                .unwrap();
            pool.insert(MempoolTransaction::new(mint).unwrap());
            let block = proposer.propose(&CancellationToken::new()).await.unwrap().unwrap();
            assert_eq!(block.header.latest_token_id, 5);
            assert_eq!(chain.ledger.tokens.get_by_id(5).unwrap().unwrap().owner, coinbase);

            let thief = KeyPair::generate();
            let steal = Transaction::new_token(CHAIN_ID, 0, thief.address(), KeyPair::generate().address(), 5, "", 1)
                .sign(&thief)
                .unwrap();
            pool.insert(MempoolTransaction::new(steal).unwrap());
            assert!(proposer.propose(&CancellationToken::new()).await.unwrap().is_none());
            assert_eq!(chain.ledger.tokens.get_by_id(5).unwrap().unwrap().owner, coinbase);
        })
        .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_foreign_key_cannot_propose() {
        let result = tokio::time::timeout(Duration::from_secs(10), async {
            let chain = authority_chain();
            let pool = PendingPool::new();
            pool.insert(coin_transfer(&chain.coinbase, KeyPair::generate().address(), 1));
            let outcome = proposer(&chain, KeyPair::generate(), &pool)
                .propose(&CancellationToken::new())
                .await;
            assert!(matches!(outcome, Err(ChainError::InvalidBlock(_))));
            assert_eq!(pool.len(), 1);
        })
        .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_mining_hides_draft_and_cancel_restores_pool() {
        let result = tokio::time::timeout(Duration::from_secs(10), async {
            let chain = authority_chain();
            let pool = PendingPool::new();
            let recipient = KeyPair::generate().address();
            pool.insert(coin_transfer(&chain.coinbase, recipient, 100));

            // Difficulty 64 is never solved, so the search runs until cancelled.
            let proposer = Arc::new(proposer_at(&chain, chain.coinbase.clone(), &pool, 64));
            let cancel = CancellationToken::new();
            let mining = {
                let proposer = proposer.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move { proposer.propose(&cancel).await })
            };
            tokio::time::sleep(Duration::from_millis(200)).await;

            assert!(!chain.ledger.storage().in_transaction());
            assert!(chain.ledger.accounts.get_by_address(&recipient).unwrap().is_none());
            let state = chain.ledger.chain_state.get_by_chain_id(CHAIN_ID).unwrap().unwrap();
            assert_eq!(state.latest_block_number, 0);

            cancel.cancel();
            let outcome = mining.await.unwrap();
            assert!(matches!(outcome, Err(ChainError::Cancelled)));
            assert_eq!(pool.len(), 1);
            assert!(chain.ledger.accounts.get_by_address(&recipient).unwrap().is_none());
        })
        .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_confirmed_transaction_is_not_included_twice() {
        let result = tokio::time::timeout(Duration::from_secs(10), async {
            let chain = authority_chain();
            let pool = PendingPool::new();
            let proposer = proposer(&chain, chain.coinbase.clone(), &pool);
            let recipient = KeyPair::generate().address();
            let transfer = coin_transfer(&chain.coinbase, recipient, 100);

            pool.insert(transfer.clone());
            assert!(proposer.propose(&CancellationToken::new()).await.unwrap().is_some());

            pool.insert(transfer);
            assert!(proposer.propose(&CancellationToken::new()).await.unwrap().is_none());
            let receiver = chain.ledger.accounts.get_by_address(&recipient).unwrap().unwrap();
            assert_eq!(receiver.balance, 100);
            let state = chain.ledger.chain_state.get_by_chain_id(CHAIN_ID).unwrap().unwrap();
            assert_eq!(state.latest_block_number, 1);
        })
        .await;
        assert!(result.is_ok());
    }
}
