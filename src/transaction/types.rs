/// Transaction types for ComicCoin
use crate::codec::{self, hex32};
use crate::crypto::{keccak256, Address, KeyPair};
use crate::error::Result;
use crate::merkle::Hashable;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Prepended to the transaction hash before signing so a ComicCoin signature can
/// never be replayed as a raw Ethereum-style message signature.
pub const COMICCOIN_SIGNED_MESSAGE_STAMP: &[u8] = b"\x19Comic Coin Signed Message:\n32";

/// Added to the recovery id carried in `v`, making signatures non-transferable
/// to networks using a different offset (Ethereum uses 27).
pub const COMICCOIN_RECOVERY_IDENTIFIER: u64 = 29;

/// Maximum `data` payload carried by a transaction.
pub const MAX_TRANSACTION_DATA_SIZE: usize = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    Coin,
    Token,
}

/// An unsigned transfer of coins or of a token.
///
/// Field order is part of the signing pre-image: the JSON encoding of this
/// struct is what gets hashed, so fields must never be reordered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub chain_id: u16,
    pub nonce: u64,
    pub from: Address,
    pub to: Address,
    pub value: u64,
    pub tip: u64,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
    #[serde(rename = "type")]
    pub tx_type: TransactionType,
    pub token_id: u64,
    pub token_metadata_uri: String,
    pub token_nonce: u64,
}

impl Transaction {
    pub fn new_coin(chain_id: u16, nonce: u64, from: Address, to: Address, value: u64) -> Self {
        Transaction {
            chain_id,
            nonce,
            from,
            to,
            value,
            tip: 0,
            data: Vec::new(),
            tx_type: TransactionType::Coin,
            token_id: 0,
            token_metadata_uri: String::new(),
            token_nonce: 0,
        }
    }

    pub fn new_token(
        chain_id: u16,
        nonce: u64,
        from: Address,
        to: Address,
        token_id: u64,
        token_metadata_uri: impl Into<String>,
        token_nonce: u64,
    ) -> Self {
        Transaction {
            chain_id,
            nonce,
            from,
            to,
            value: 0,
            tip: 0,
            data: Vec::new(),
            tx_type: TransactionType::Token,
            token_id,
            token_metadata_uri: token_metadata_uri.into(),
            token_nonce,
        }
    }

    /// `from == to`: a coinbase credit for coins, a mint for tokens.
    pub fn is_self_transfer(&self) -> bool {
        self.from == self.to
    }

    /// keccak256 over the canonical JSON encoding.
    pub fn hash(&self) -> Result<[u8; 32]> {
        let data = codec::to_canonical_json(self)?;
        Ok(keccak256(&[&data]))
    }

    /// The digest that actually gets signed: `keccak256(stamp || keccak256(json(tx)))`.
    pub fn hash_with_stamp(&self) -> Result<[u8; 32]> {
        let tx_hash = self.hash()?;
        Ok(keccak256(&[COMICCOIN_SIGNED_MESSAGE_STAMP, &tx_hash]))
    }

    pub fn sign(&self, keypair: &KeyPair) -> Result<SignedTransaction> {
        let digest = self.hash_with_stamp()?;
        let signature = keypair.sign_digest(&digest);

        let mut r = [0u8; 32];
        let mut s = [0u8; 32];
        r.copy_from_slice(&signature[..32]);
        s.copy_from_slice(&signature[32..64]);
        let v = signature[64] as u64 + COMICCOIN_RECOVERY_IDENTIFIER;

        Ok(SignedTransaction {
            transaction: self.clone(),
            v,
            r,
            s,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTransaction {
    #[serde(flatten)]
    pub transaction: Transaction,
    pub v: u64,
    #[serde(with = "hex32")]
    pub r: [u8; 32],
    #[serde(with = "hex32")]
    pub s: [u8; 32],
}

impl SignedTransaction {
    /// Stable identifier: the stamped signing digest as `0x` hex.
    pub fn hash_hex(&self) -> Result<String> {
        Ok(format!(
            "0x{}",
            hex::encode(self.transaction.hash_with_stamp()?)
        ))
    }

    pub fn into_block_transaction(
        self,
        timestamp: u64,
        gas_price: u64,
        gas_units: u64,
    ) -> BlockTransaction {
        BlockTransaction {
            signed_transaction: self,
            timestamp,
            gas_price,
            gas_units,
        }
    }
}

/// A signed transaction as stored inside a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockTransaction {
    #[serde(flatten)]
    pub signed_transaction: SignedTransaction,
    pub timestamp: u64,
    pub gas_price: u64,
    pub gas_units: u64,
}

impl BlockTransaction {
    pub fn transaction(&self) -> &Transaction {
        &self.signed_transaction.transaction
    }

    fn json_digest(&self) -> Result<[u8; 32]> {
        let data = codec::to_canonical_json(self)?;
        Ok(Sha256::digest(data).into())
    }
}

impl Hashable for BlockTransaction {
    fn hash(&self) -> Result<[u8; 32]> {
        self.json_digest()
    }

    fn equals(&self, other: &Self) -> Result<bool> {
        Ok(self.json_digest()? == other.json_digest()?)
    }
}
