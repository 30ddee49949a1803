//! Genesis bootstrap: creates block 0 on the authority node, or imports it
//! from the JSON artifact on every other node.

use crate::blockchain::{
    Account, Block, BlockData, BlockHeader, BlockchainState, Token, Validator, ZERO_HASH,
};
use crate::crypto::{KeyPair, KeyProvider};
use crate::error::{ChainError, Result, ValidationErrors};
use crate::miner;
use crate::repository::Ledger;
use crate::transaction::{BlockTransaction, Transaction, TransactionType};
use std::fs;
use std::path::Path;
use tokio_util::sync::CancellationToken;

/// Id of the token minted in block 0.
pub const GENESIS_TOKEN_ID: u64 = 0;

pub struct GenesisService {
    ledger: Ledger,
    chain_id: u16,
    difficulty: u16,
    initial_supply: u64,
    validator_id: String,
    token_metadata_uri: String,
}

impl GenesisService {
    pub fn new(
        ledger: Ledger,
        chain_id: u16,
        difficulty: u16,
        initial_supply: u64,
        validator_id: impl Into<String>,
        token_metadata_uri: impl Into<String>,
    ) -> Self {
        GenesisService {
            ledger,
            chain_id,
            difficulty,
            initial_supply,
            validator_id: validator_id.into(),
            token_metadata_uri: token_metadata_uri.into(),
        }
    }

    pub fn is_initialized(&self) -> Result<bool> {
        Ok(self.ledger.chain_state.get_by_chain_id(self.chain_id)?.is_some())
    }

    fn ensure_uninitialized(&self) -> Result<()> {
        if self.is_initialized()? {
            return Err(ChainError::InvalidBlock(format!(
                "Blockchain {} is already initialized",
                self.chain_id
            )));
        }
        Ok(())
    }

    /// Seeds the ledger, mines and signs block 0 with the coinbase key, and
    /// persists it as the chain tip.
    pub fn create(&self, coinbase: &KeyPair, cancel: &CancellationToken) -> Result<BlockData> {
        self.ensure_uninitialized()?;
        let coinbase_address = coinbase.address();
        let timestamp = chrono::Utc::now().timestamp_millis().max(0) as u64;

        let coin_tx = Transaction::new_coin(
            self.chain_id,
            0,
            coinbase_address,
            coinbase_address,
            self.initial_supply,
        )
        .sign(coinbase)?;
        let token_tx = Transaction::new_token(
            self.chain_id,
            0,
            coinbase_address,
            coinbase_address,
            GENESIS_TOKEN_ID,
            self.token_metadata_uri.clone(),
            0,
        )
        .sign(coinbase)?;
        coin_tx.validate(self.chain_id, true)?;
        token_tx.validate(self.chain_id, true)?;
        let transactions = vec![
            coin_tx.into_block_transaction(timestamp, 0, 0),
            token_tx.into_block_transaction(timestamp, 0, 0),
        ];

        let txn = self.ledger.begin()?;
        let header = self.seed_ledger(&transactions, coinbase_address, timestamp)?;

        let mut block = Block::new(header, transactions)?;
        block.header.nonce = miner::mine(&block.header, self.difficulty, cancel)?;

        let validator = Validator::from_keypair(self.validator_id.clone(), coinbase);
        let signature = Validator::sign(coinbase, &block.header)?;
        let block_data = block.into_block_data(signature, validator)?;

        self.persist(&block_data)?;
        txn.commit()?;

        tracing::info!(
            hash = %block_data.hash,
            coinbase = %coinbase_address,
            supply = self.initial_supply,
            "Genesis block created"
        );
        Ok(block_data)
    }

    /// Seeds a fresh node from a genesis artifact after checking it end to end.
    pub fn import_artifact(&self, path: impl AsRef<Path>) -> Result<BlockData> {
        self.ensure_uninitialized()?;
        let block_data = read_artifact(path)?;
        self.verify_genesis(&block_data)?;

        let txn = self.ledger.begin()?;
        let header = self.seed_ledger(
            &block_data.transactions,
            block_data.header.beneficiary,
            block_data.header.timestamp,
        )?;
        if header.state_root != block_data.header.state_root
            || header.tokens_root != block_data.header.tokens_root
        {
            return Err(ChainError::InvalidBlock(format!(
                "Genesis roots do not match the seeded ledger: state {} vs {}, tokens {} vs {}",
                header.state_root,
                block_data.header.state_root,
                header.tokens_root,
                block_data.header.tokens_root
            )));
        }
        self.persist(&block_data)?;
        txn.commit()?;

        tracing::info!(hash = %block_data.hash, "Genesis block imported");
        Ok(block_data)
    }

    fn verify_genesis(&self, block_data: &BlockData) -> Result<()> {
        block_data.validate_fields()?;
        let header = &block_data.header;
        let mut errs = ValidationErrors::new();
        if header.number != 0 {
            errs.add("header.number", "genesis block must be number 0");
        }
        if header.prev_block_hash != ZERO_HASH {
            errs.add("header.prev_block_hash", "genesis block must point at the zero hash");
        }
        if header.difficulty != self.difficulty {
            errs.add("header.difficulty", format!("expected {}", self.difficulty));
        }
        errs.into_result()?;

        block_data.verify_hash()?;
        block_data.verify_trans_root()?;
        if !miner::is_hash_solved(header.difficulty, &block_data.hash) {
            return Err(ChainError::InvalidBlock(
                "Genesis hash does not satisfy the difficulty".to_string(),
            ));
        }
        if !block_data
            .validator
            .verify(&block_data.header_signature_bytes, header)
        {
            return Err(ChainError::InvalidBlock(
                "Genesis header signature does not match its validator".to_string(),
            ));
        }
        for block_tx in &block_data.transactions {
            block_tx.signed_transaction.validate(self.chain_id, true)?;
            if block_tx.transaction().from != header.beneficiary {
                return Err(ChainError::InvalidBlock(format!(
                    "Genesis transaction from {} is not from the coinbase {}",
                    block_tx.transaction().from,
                    header.beneficiary
                )));
            }
        }
        Ok(())
    }

    /// Credits the coinbase and mints the genesis tokens straight into the
    /// ledger, then returns a header carrying the resulting roots.
    fn seed_ledger(
        &self,
        transactions: &[BlockTransaction],
        coinbase: crate::crypto::Address,
        timestamp: u64,
    ) -> Result<BlockHeader> {
        let mut account = Account::new(coinbase);
        let mut latest_token_id = 0;
        for block_tx in transactions {
            let tx = block_tx.transaction();
            match tx.tx_type {
                TransactionType::Coin => {
                    account.balance = account.balance.checked_add(tx.value).ok_or_else(|| {
                        ChainError::InvalidBlock("Genesis supply overflows".to_string())
                    })?;
                }
                TransactionType::Token => {
                    self.ledger.tokens.upsert(&Token {
                        id: tx.token_id,
                        owner: tx.to,
                        metadata_uri: tx.token_metadata_uri.clone(),
                        nonce: tx.token_nonce,
                    })?;
                    latest_token_id = latest_token_id.max(tx.token_id);
                }
            }
        }
        self.ledger.accounts.upsert(&account)?;

        Ok(BlockHeader {
            number: 0,
            prev_block_hash: ZERO_HASH.to_string(),
            timestamp,
            beneficiary: coinbase,
            difficulty: self.difficulty,
            mining_reward: 0,
            state_root: self.ledger.accounts.hash_state()?,
            trans_root: String::new(),
            nonce: 0,
            latest_token_id,
            tokens_root: self.ledger.tokens.hash_state()?,
        })
    }

    fn persist(&self, block_data: &BlockData) -> Result<()> {
        self.ledger.blocks.upsert(block_data)?;
        self.ledger.chain_state.upsert_by_chain_id(&BlockchainState {
            chain_id: self.chain_id,
            latest_block_number: block_data.header.number,
            latest_hash: block_data.hash.clone(),
            latest_token_id: block_data.header.latest_token_id,
            account_hash_state: block_data.header.state_root.clone(),
            token_hash_state: block_data.header.tokens_root.clone(),
        })
    }
}

/// Pretty JSON; the only JSON persisted by the node.
pub fn write_artifact(block_data: &BlockData, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_vec_pretty(block_data)?)?;
    Ok(())
}

pub fn read_artifact(path: impl AsRef<Path>) -> Result<BlockData> {
    let bytes = fs::read(path.as_ref())?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Loads the coinbase key through `provider`, creating a plaintext key file
/// when `create_if_missing` is set and nothing exists yet.
pub fn load_coinbase_key(
    path: impl AsRef<Path>,
    provider: &dyn KeyProvider,
    password: &str,
    create_if_missing: bool,
) -> Result<KeyPair> {
    let path = path.as_ref();
    if !path.exists() {
        if !create_if_missing {
            return Err(ChainError::Config(format!(
                "Coinbase key file {} does not exist",
                path.display()
            )));
        }
        let keypair = KeyPair::generate();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, hex::encode(keypair.secret_key.secret_bytes()))?;
        tracing::warn!(path = %path.display(), address = %keypair.address(), "Generated new coinbase key");
        return Ok(keypair);
    }
    let keystore = fs::read(path)?;
    Ok(KeyPair::from_secret_key(provider.decrypt(&keystore, password)?))
}
