use crate::codec;
use crate::crypto::{sha256_hex, Address};
use crate::error::{ChainError, Result, ValidationErrors};
use crate::merkle::{Hashable, MerkleTree};
use crate::transaction::BlockTransaction;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::validator::Validator;

/// Hash of "no block": the `prev_block_hash` of block 0.
pub const ZERO_HASH: &str = "0x0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub number: u64,
    pub prev_block_hash: String,
    pub timestamp: u64,
    pub beneficiary: Address,
    pub difficulty: u16,
    pub mining_reward: u64,
    pub state_root: String,
    pub trans_root: String,
    pub nonce: u64,
    pub latest_token_id: u64,
    pub tokens_root: String,
}

impl BlockHeader {
    /// `0x`-prefixed SHA-256 of the canonical JSON header. This is the block hash.
    pub fn hash(&self) -> Result<String> {
        let data = codec::to_canonical_json(self)?;
        Ok(sha256_hex(&data))
    }
}

/// Header plus the in-memory Merkle tree over its transactions.
#[derive(Debug, Clone)]
pub struct Block {
    pub header: BlockHeader,
    pub merkle_tree: MerkleTree<BlockTransaction>,
}

impl Block {
    /// Builds the Merkle tree and stamps its root into `header.trans_root`.
    pub fn new(mut header: BlockHeader, transactions: Vec<BlockTransaction>) -> Result<Self> {
        let merkle_tree = MerkleTree::new(transactions)?;
        header.trans_root = merkle_tree.root_hex();
        Ok(Block {
            header,
            merkle_tree,
        })
    }

    pub fn hash(&self) -> Result<String> {
        self.header.hash()
    }

    pub fn transactions(&self) -> &[BlockTransaction] {
        self.merkle_tree.values()
    }

    pub fn into_block_data(
        self,
        header_signature_bytes: Vec<u8>,
        validator: Validator,
    ) -> Result<BlockData> {
        Ok(BlockData {
            hash: self.header.hash()?,
            header: self.header,
            header_signature_bytes,
            transactions: self.merkle_tree.into_values(),
            validator,
        })
    }
}

/// Persisted and wire form of a block. Keyed by `hash`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockData {
    pub hash: String,
    pub header: BlockHeader,
    #[serde(with = "serde_bytes")]
    pub header_signature_bytes: Vec<u8>,
    pub transactions: Vec<BlockTransaction>,
    pub validator: Validator,
}

impl BlockData {
    /// Structural checks, reported together before any state is touched.
    pub fn validate_fields(&self) -> Result<()> {
        let mut errs = ValidationErrors::new();
        if self.hash.is_empty() {
            errs.add("hash", "missing value");
        }
        if self.header.prev_block_hash.is_empty() {
            errs.add("header.prev_block_hash", "missing value");
        }
        if self.header.state_root.is_empty() {
            errs.add("header.state_root", "missing value");
        }
        if self.header.trans_root.is_empty() {
            errs.add("header.trans_root", "missing value");
        }
        if self.header.tokens_root.is_empty() {
            errs.add("header.tokens_root", "missing value");
        }
        if self.header_signature_bytes.is_empty() {
            errs.add("header_signature_bytes", "missing value");
        }
        if self.transactions.is_empty() {
            errs.add("transactions", "block has no transactions");
        }
        if self.validator.public_key_bytes.is_empty() {
            errs.add("validator.public_key_bytes", "missing value");
        }
        errs.into_result()
    }

    /// The stored hash must be the hash of the stored header.
    pub fn verify_hash(&self) -> Result<()> {
        let computed = self.header.hash()?;
        if computed != self.hash {
            return Err(ChainError::InvalidBlock(format!(
                "Block hash mismatch. Expected {}, but got {}.",
                computed, self.hash
            )));
        }
        Ok(())
    }

    /// Checks the Merkle root and that no transaction appears twice.
    pub fn verify_trans_root(&self) -> Result<()> {
        let mut seen = HashSet::with_capacity(self.transactions.len());
        for tx in &self.transactions {
            if !seen.insert(tx.hash()?) {
                return Err(ChainError::InvalidBlock(format!(
                    "Block {} repeats transaction from {}",
                    self.hash,
                    tx.transaction().from
                )));
            }
        }
        let tree = MerkleTree::new(self.transactions.clone())?;
        if tree.root_hex() != self.header.trans_root {
            return Err(ChainError::InvalidBlock(format!(
                "Merkle root mismatch. Expected {}, but got {}.",
                tree.root_hex(),
                self.header.trans_root
            )));
        }
        Ok(())
    }

    pub fn to_block(&self) -> Result<Block> {
        Ok(Block {
            header: self.header.clone(),
            merkle_tree: MerkleTree::new(self.transactions.clone())?,
        })
    }
}

/// The chain tip pointer. One row per chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockchainState {
    pub chain_id: u16,
    pub latest_block_number: u64,
    pub latest_hash: String,
    pub latest_token_id: u64,
    pub account_hash_state: String,
    pub token_hash_state: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::transaction::Transaction;

    fn sample_block(keypair: &KeyPair) -> Block {
        let tx = Transaction::new_coin(1, 0, keypair.address(), keypair.address(), 10)
            .sign(keypair)
            .unwrap()
            .into_block_transaction(1, 0, 0);
        let header = BlockHeader {
            number: 0,
            prev_block_hash: ZERO_HASH.to_string(),
            timestamp: 1,
            beneficiary: keypair.address(),
            difficulty: 1,
            mining_reward: 0,
            state_root: "0xabc".into(),
            trans_root: String::new(),
            nonce: 0,
            latest_token_id: 0,
            tokens_root: "0xdef".into(),
        };
        Block::new(header, vec![tx]).unwrap()
    }

    #[test]
    fn test_block_new_stamps_trans_root() {
        let keypair = KeyPair::generate();
        let block = sample_block(&keypair);
        assert_eq!(block.header.trans_root, block.merkle_tree.root_hex());
    }

    #[test]
    fn test_header_hash_changes_with_nonce() {
        let keypair = KeyPair::generate();
        let mut header = sample_block(&keypair).header;
        let before = header.hash().unwrap();
        header.nonce += 1;
        assert_ne!(before, header.hash().unwrap());
        assert_eq!(before.len(), 66);
    }

    #[test]
    fn test_block_data_checks() {
        let keypair = KeyPair::generate();
        let validator = Validator::from_keypair("authority", &keypair);
        let block = sample_block(&keypair);
        let signature = Validator::sign(&keypair, &block.header).unwrap();
        let mut data = block.into_block_data(signature, validator).unwrap();

        assert!(data.validate_fields().is_ok());
        assert!(data.verify_hash().is_ok());
        assert!(data.verify_trans_root().is_ok());

        data.header.trans_root = "0x00".into();
        assert!(data.verify_trans_root().is_err());
        assert!(data.verify_hash().is_err());
    }

    #[test]
    fn test_validate_fields_reports_every_missing_field() {
        let keypair = KeyPair::generate();
        let mut data = sample_block(&keypair)
            .into_block_data(vec![], Validator::from_keypair("a", &keypair))
            .unwrap();
        data.hash.clear();
        data.transactions.clear();
        match data.validate_fields() {
            Err(ChainError::Validation(errs)) => {
                assert_eq!(errs.get("hash"), Some("missing value"));
                assert_eq!(errs.get("header_signature_bytes"), Some("missing value"));
                assert!(errs.get("transactions").is_some());
            }
            other => panic!("expected validation errors, got {:?}", other),
        }
    }
}
