//! Typed repositories over a shared [`Storage`].
//!
//! Every repository prefixes its keys so they can share one backend, and one
//! storage transaction therefore covers all of them at once.

use crate::blockchain::{
    account_hash_state, token_hash_state, token_nonce_accepted, Account, BlockData,
    BlockchainState, Token,
};
use crate::codec;
use crate::crypto::Address;
use crate::error::Result;
use crate::storage::{Storage, StorageTransaction};
use crate::transaction::BlockTransaction;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

const ACCOUNT_PREFIX: &[u8] = b"account/";
const TOKEN_PREFIX: &[u8] = b"token/";
const BLOCK_DATA_PREFIX: &[u8] = b"blockdata/";
const CHAIN_STATE_PREFIX: &[u8] = b"chainstate/";

fn key(prefix: &[u8], id: &[u8]) -> Vec<u8> {
    let mut k = Vec::with_capacity(prefix.len() + id.len());
    k.extend_from_slice(prefix);
    k.extend_from_slice(id);
    k
}

fn load<T: DeserializeOwned>(storage: &dyn Storage, key: &[u8]) -> Result<Option<T>> {
    storage
        .get(key)?
        .map(|bytes| codec::from_cbor(&bytes))
        .transpose()
}

fn store<T: Serialize>(storage: &dyn Storage, key: &[u8], value: &T) -> Result<()> {
    storage.set(key, &codec::to_cbor(value)?)
}

fn load_all<T: DeserializeOwned>(storage: &dyn Storage, prefix: &[u8]) -> Result<Vec<T>> {
    storage
        .iterate(prefix)?
        .into_iter()
        .map(|(_, bytes)| codec::from_cbor(&bytes))
        .collect()
}

#[derive(Clone)]
pub struct AccountRepository {
    storage: Arc<dyn Storage>,
}

impl AccountRepository {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        AccountRepository { storage }
    }

    pub fn upsert(&self, account: &Account) -> Result<()> {
        store(&*self.storage, &key(ACCOUNT_PREFIX, account.address.as_bytes()), account)
    }

    pub fn get_by_address(&self, address: &Address) -> Result<Option<Account>> {
        load(&*self.storage, &key(ACCOUNT_PREFIX, address.as_bytes()))
    }

    /// Ascending by address.
    pub fn list_all(&self) -> Result<Vec<Account>> {
        load_all(&*self.storage, ACCOUNT_PREFIX)
    }

    pub fn delete_by_address(&self, address: &Address) -> Result<()> {
        self.storage.delete(&key(ACCOUNT_PREFIX, address.as_bytes()))
    }

    /// The value a block header carries as `state_root`.
    pub fn hash_state(&self) -> Result<String> {
        account_hash_state(&self.list_all()?)
    }

    pub fn open_transaction(&self) -> Result<()> {
        self.storage.open_transaction()
    }

    pub fn commit_transaction(&self) -> Result<()> {
        self.storage.commit_transaction()
    }

    pub fn discard_transaction(&self) {
        self.storage.discard_transaction()
    }
}

#[derive(Clone)]
pub struct TokenRepository {
    storage: Arc<dyn Storage>,
}

impl TokenRepository {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        TokenRepository { storage }
    }

    // Big-endian ids keep the key order numeric.
    fn token_key(id: u64) -> Vec<u8> {
        key(TOKEN_PREFIX, &id.to_be_bytes())
    }

    pub fn upsert(&self, token: &Token) -> Result<()> {
        store(&*self.storage, &Self::token_key(token.id), token)
    }

    pub fn get_by_id(&self, id: u64) -> Result<Option<Token>> {
        load(&*self.storage, &Self::token_key(id))
    }

    /// Writes `token` only when its nonce is newer than the stored one.
    /// Returns whether the write happened.
    pub fn upsert_if_nonce_accepted(&self, token: &Token) -> Result<bool> {
        let stored = self.get_by_id(token.id)?;
        if !token_nonce_accepted(stored.as_ref(), token.nonce) {
            return Ok(false);
        }
        self.upsert(token)?;
        Ok(true)
    }

    pub fn list_all(&self) -> Result<Vec<Token>> {
        load_all(&*self.storage, TOKEN_PREFIX)
    }

    pub fn delete_by_id(&self, id: u64) -> Result<()> {
        self.storage.delete(&Self::token_key(id))
    }

    /// The value a block header carries as `tokens_root`.
    pub fn hash_state(&self) -> Result<String> {
        token_hash_state(&self.list_all()?)
    }
}

#[derive(Clone)]
pub struct BlockDataRepository {
    storage: Arc<dyn Storage>,
}

impl BlockDataRepository {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        BlockDataRepository { storage }
    }

    pub fn upsert(&self, block_data: &BlockData) -> Result<()> {
        store(&*self.storage, &key(BLOCK_DATA_PREFIX, block_data.hash.as_bytes()), block_data)
    }

    pub fn get_by_hash(&self, hash: &str) -> Result<Option<BlockData>> {
        load(&*self.storage, &key(BLOCK_DATA_PREFIX, hash.as_bytes()))
    }

    /// Ordered by block number.
    pub fn list_all(&self) -> Result<Vec<BlockData>> {
        let mut blocks: Vec<BlockData> = load_all(&*self.storage, BLOCK_DATA_PREFIX)?;
        blocks.sort_by_key(|b| b.header.number);
        Ok(blocks)
    }

    pub fn delete_by_hash(&self, hash: &str) -> Result<()> {
        self.storage.delete(&key(BLOCK_DATA_PREFIX, hash.as_bytes()))
    }

    /// Every confirmed transaction sent or received by `address`, oldest first.
    pub fn list_transactions_by_address(&self, address: &Address) -> Result<Vec<BlockTransaction>> {
        Ok(self
            .list_all()?
            .into_iter()
            .flat_map(|block| block.transactions)
            .filter(|tx| {
                let inner = tx.transaction();
                inner.from == *address || inner.to == *address
            })
            .collect())
    }

    /// Whether a confirmed transaction sent by `from` carries the stamped digest `id`.
    pub fn contains_transaction(&self, from: &Address, id: &str) -> Result<bool> {
        for tx in self.list_transactions_by_address(from)? {
            if tx.transaction().from == *from && tx.signed_transaction.hash_hex()? == id {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// The block containing a transaction stamped with `timestamp`.
    pub fn get_by_transaction_timestamp(&self, timestamp: u64) -> Result<Option<BlockData>> {
        Ok(self
            .list_all()?
            .into_iter()
            .find(|block| block.transactions.iter().any(|tx| tx.timestamp == timestamp)))
    }

    pub fn open_transaction(&self) -> Result<()> {
        self.storage.open_transaction()
    }

    pub fn commit_transaction(&self) -> Result<()> {
        self.storage.commit_transaction()
    }

    pub fn discard_transaction(&self) {
        self.storage.discard_transaction()
    }
}

#[derive(Clone)]
pub struct BlockchainStateRepository {
    storage: Arc<dyn Storage>,
}

impl BlockchainStateRepository {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        BlockchainStateRepository { storage }
    }

    pub fn get_by_chain_id(&self, chain_id: u16) -> Result<Option<BlockchainState>> {
        load(&*self.storage, &key(CHAIN_STATE_PREFIX, &chain_id.to_be_bytes()))
    }

    pub fn upsert_by_chain_id(&self, state: &BlockchainState) -> Result<()> {
        store(
            &*self.storage,
            &key(CHAIN_STATE_PREFIX, &state.chain_id.to_be_bytes()),
            state,
        )
    }
}

/// All repositories of one node over the same storage.
#[derive(Clone)]
pub struct Ledger {
    storage: Arc<dyn Storage>,
    pub accounts: AccountRepository,
    pub tokens: TokenRepository,
    pub blocks: BlockDataRepository,
    pub chain_state: BlockchainStateRepository,
}

impl Ledger {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Ledger {
            accounts: AccountRepository::new(storage.clone()),
            tokens: TokenRepository::new(storage.clone()),
            blocks: BlockDataRepository::new(storage.clone()),
            chain_state: BlockchainStateRepository::new(storage.clone()),
            storage,
        }
    }

    /// Opens one transaction spanning every repository.
    pub fn begin(&self) -> Result<StorageTransaction> {
        StorageTransaction::open(self.storage.clone())
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// The block the chain tip points at, if the chain exists.
    pub fn latest_block(&self, chain_id: u16) -> Result<Option<BlockData>> {
        match self.chain_state.get_by_chain_id(chain_id)? {
            Some(state) => self.blocks.get_by_hash(&state.latest_hash),
            None => Ok(None),
        }
    }
}
