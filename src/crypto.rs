//! Cryptographic primitives for ComicCoin

use crate::error::ChainError;
use once_cell::sync::Lazy;
use rand::rngs::OsRng;
use secp256k1::{
    constants::SECRET_KEY_SIZE,
    ecdsa::{RecoverableSignature, RecoveryId},
    All, Message, PublicKey, Secp256k1, SecretKey,
};
use serde::{de::Error as _, Deserialize, Deserializer, Serialize, Serializer};
use sha2::Sha256;
use sha3::{Digest, Keccak256};
use std::fmt;
use std::str::FromStr;

/// A thread-safe, lazily initialized Secp256k1 context.
static SECP256K1_CONTEXT: Lazy<Secp256k1<All>> = Lazy::new(Secp256k1::new);

/// Length of a recoverable signature: `r || s || recovery id`.
pub const RECOVERABLE_SIGNATURE_SIZE: usize = 65;

pub const ADDRESS_SIZE: usize = 20;

/// Account address: last 20 bytes of keccak256 over the uncompressed public key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(pub [u8; ADDRESS_SIZE]);

impl Address {
    pub const ZERO: Address = Address([0u8; ADDRESS_SIZE]);

    pub fn from_public_key(public_key: &PublicKey) -> Self {
        let uncompressed = public_key.serialize_uncompressed();
        let digest = keccak256(&[&uncompressed[1..]]);
        let mut out = [0u8; ADDRESS_SIZE];
        out.copy_from_slice(&digest[12..]);
        Address(out)
    }

    pub fn from_hex(hex_str: &str) -> Result<Self, ChainError> {
        let bytes = hex::decode(hex_str.trim_start_matches("0x"))
            .map_err(|e| ChainError::CryptoError(format!("Invalid hex address: {}", e)))?;
        if bytes.len() != ADDRESS_SIZE {
            return Err(ChainError::CryptoError(format!(
                "Address must be {} bytes, got {}",
                ADDRESS_SIZE,
                bytes.len()
            )));
        }
        let mut out = [0u8; ADDRESS_SIZE];
        out.copy_from_slice(&bytes);
        Ok(Address(out))
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.to_hex())
    }
}

impl FromStr for Address {
    type Err = ChainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Address::from_hex(s)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Address::from_hex(&s).map_err(D::Error::custom)
    }
}

/// keccak256 over the concatenation of `parts`.
pub fn keccak256(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// SHA-256 rendered as a `0x`-prefixed, 64-hex-character string.
pub fn sha256_hex(data: &[u8]) -> String {
    format!("0x{}", hex::encode(Sha256::digest(data)))
}

#[derive(Debug, Clone)]
pub struct KeyPair {
    pub secret_key: SecretKey,
    pub public_key: PublicKey,
}

impl KeyPair {
    /// Generates a new random KeyPair using the OS random number generator.
    pub fn generate() -> Self {
        let secret_key = SecretKey::new(&mut OsRng);
        Self::from_secret_key(secret_key)
    }

    pub fn from_secret_key(secret_key: SecretKey) -> Self {
        let public_key = PublicKey::from_secret_key(&SECP256K1_CONTEXT, &secret_key);
        KeyPair {
            secret_key,
            public_key,
        }
    }

    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, ChainError> {
        let secret_key = SecretKey::from_slice(bytes).map_err(|e| {
            if bytes.len() != SECRET_KEY_SIZE {
                ChainError::CryptoError(format!(
                    "Secret key must be {} bytes, got {}",
                    SECRET_KEY_SIZE,
                    bytes.len()
                ))
            } else {
                ChainError::CryptoError(format!("Invalid secret key bytes: {}", e))
            }
        })?;
        Ok(Self::from_secret_key(secret_key))
    }

    pub fn address(&self) -> Address {
        Address::from_public_key(&self.public_key)
    }

    /// Uncompressed SEC1 public key (65 bytes), the form recorded in a `Validator`.
    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.public_key.serialize_uncompressed().to_vec()
    }

    /// Signs a 32-byte digest; returns `r || s || v` with `v ∈ {0, 1}`.
    pub fn sign_digest(&self, digest: &[u8; 32]) -> [u8; RECOVERABLE_SIGNATURE_SIZE] {
        let message = Message::from_digest(*digest);
        let signature = SECP256K1_CONTEXT.sign_ecdsa_recoverable(&message, &self.secret_key);
        let (recovery_id, compact) = signature.serialize_compact();

        let mut out = [0u8; RECOVERABLE_SIGNATURE_SIZE];
        out[..64].copy_from_slice(&compact);
        out[64] = recovery_id.to_i32() as u8;
        out
    }
}

/// Recovers the signer's public key from a digest and a 65-byte `r || s || v` signature.
pub fn recover_public_key(digest: &[u8; 32], signature: &[u8]) -> Result<PublicKey, ChainError> {
    if signature.len() != RECOVERABLE_SIGNATURE_SIZE {
        return Err(ChainError::CryptoError(format!(
            "Signature must be exactly {} bytes, got {}",
            RECOVERABLE_SIGNATURE_SIZE,
            signature.len()
        )));
    }
    let recovery_id = RecoveryId::from_i32(signature[64] as i32)
        .map_err(|e| ChainError::CryptoError(format!("Invalid recovery id: {}", e)))?;
    let signature = RecoverableSignature::from_compact(&signature[..64], recovery_id)
        .map_err(|e| ChainError::CryptoError(format!("Invalid signature: {}", e)))?;

    let message = Message::from_digest(*digest);
    SECP256K1_CONTEXT
        .recover_ecdsa(&message, &signature)
        .map_err(|_| ChainError::CryptoError("Public key recovery failed".to_string()))
}

/// Checks that `r` and `s` are both in `[1, n-1]` for the secp256k1 group order.
pub fn validate_signature_values(r: &[u8; 32], s: &[u8; 32]) -> Result<(), ChainError> {
    if r.iter().all(|b| *b == 0) || s.iter().all(|b| *b == 0) {
        return Err(ChainError::CryptoError(
            "Signature values must be non-zero".to_string(),
        ));
    }
    let mut compact = [0u8; 64];
    compact[..32].copy_from_slice(r);
    compact[32..].copy_from_slice(s);
    secp256k1::ecdsa::Signature::from_compact(&compact)
        .map(|_| ())
        .map_err(|_| ChainError::CryptoError("Signature values out of range".to_string()))
}

/// Source of private keys. Keystore encryption lives outside this crate.
pub trait KeyProvider: Send + Sync {
    fn decrypt(&self, keystore: &[u8], password: &str) -> Result<SecretKey, ChainError>;
}

/// Reads a hex-encoded secret key; the password is ignored. Meant for devnets and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlaintextKeyProvider;

impl KeyProvider for PlaintextKeyProvider {
    fn decrypt(&self, keystore: &[u8], _password: &str) -> Result<SecretKey, ChainError> {
        let text = std::str::from_utf8(keystore)
            .map_err(|e| ChainError::CryptoError(format!("Keystore is not UTF-8: {}", e)))?;
        let bytes = hex::decode(text.trim().trim_start_matches("0x"))
            .map_err(|e| ChainError::CryptoError(format!("Keystore is not hex: {}", e)))?;
        Ok(KeyPair::from_secret_bytes(&bytes)?.secret_key)
    }
}
