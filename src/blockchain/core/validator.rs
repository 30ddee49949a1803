use crate::codec;
use crate::crypto::{keccak256, recover_public_key, Address, KeyPair};
use crate::error::{ChainError, Result};
use secp256k1::PublicKey;
use serde::{Deserialize, Serialize};

use super::chain::BlockHeader;

/// The single Proof-of-Authority signer of a chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    pub id: String,
    /// Uncompressed SEC1 public key.
    #[serde(with = "serde_bytes")]
    pub public_key_bytes: Vec<u8>,
}

fn header_digest(header: &BlockHeader) -> Result<[u8; 32]> {
    let data = codec::to_canonical_json(header)?;
    Ok(keccak256(&[&data]))
}

impl Validator {
    pub fn from_keypair(id: impl Into<String>, keypair: &KeyPair) -> Self {
        Validator {
            id: id.into(),
            public_key_bytes: keypair.public_key_bytes(),
        }
    }

    pub fn address(&self) -> Result<Address> {
        let public_key = PublicKey::from_slice(&self.public_key_bytes).map_err(|e| {
            ChainError::CryptoError(format!("Invalid validator public key: {}", e))
        })?;
        Ok(Address::from_public_key(&public_key))
    }

    /// 65-byte `r || s || v` signature over keccak256 of the canonical header.
    pub fn sign(keypair: &KeyPair, header: &BlockHeader) -> Result<Vec<u8>> {
        let digest = header_digest(header)?;
        Ok(keypair.sign_digest(&digest).to_vec())
    }

    /// True when `signature` was produced over exactly `header` by this validator's key.
    pub fn verify(&self, signature: &[u8], header: &BlockHeader) -> bool {
        let digest = match header_digest(header) {
            Ok(d) => d,
            Err(_) => return false,
        };
        match recover_public_key(&digest, signature) {
            Ok(public_key) => public_key.serialize_uncompressed()[..] == self.public_key_bytes[..],
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::ZERO_HASH;

    fn header() -> BlockHeader {
        BlockHeader {
            number: 3,
            prev_block_hash: ZERO_HASH.to_string(),
            timestamp: 42,
            beneficiary: Address::ZERO,
            difficulty: 2,
            mining_reward: 0,
            state_root: "0x01".into(),
            trans_root: "0x02".into(),
            nonce: 9,
            latest_token_id: 0,
            tokens_root: "0x03".into(),
        }
    }

    #[test]
    fn test_sign_and_verify_header() {
        let keypair = KeyPair::generate();
        let validator = Validator::from_keypair("authority", &keypair);
        let signature = Validator::sign(&keypair, &header()).unwrap();
        assert_eq!(signature.len(), 65);
        assert!(validator.verify(&signature, &header()));
        assert_eq!(validator.address().unwrap(), keypair.address());
    }

    #[test]
    fn test_verify_rejects_other_key_and_other_header() {
        let keypair = KeyPair::generate();
        let impostor = KeyPair::generate();
        let validator = Validator::from_keypair("authority", &keypair);

        let forged = Validator::sign(&impostor, &header()).unwrap();
        assert!(!validator.verify(&forged, &header()));

        let signature = Validator::sign(&keypair, &header()).unwrap();
        let mut altered = header();
        altered.nonce += 1;
        assert!(!validator.verify(&signature, &altered));
        assert!(!validator.verify(&signature[..10], &header()));
    }
}
