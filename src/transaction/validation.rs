/// Signature checks and stateless validation for signed transactions
use crate::crypto::{recover_public_key, validate_signature_values, Address};
use crate::error::{ChainError, Result};
use crate::transaction::types::{
    SignedTransaction, TransactionType, COMICCOIN_RECOVERY_IDENTIFIER, MAX_TRANSACTION_DATA_SIZE,
};

/// Rejects a `(v, r, s)` triple whose recovery id or ECDSA scalars are out of range.
pub fn verify_signature(v: u64, r: &[u8; 32], s: &[u8; 32]) -> Result<()> {
    let recovery_id = v.checked_sub(COMICCOIN_RECOVERY_IDENTIFIER).ok_or_else(|| {
        ChainError::CryptoError(format!("Invalid recovery id: v = {}", v))
    })?;
    if recovery_id != 0 && recovery_id != 1 {
        return Err(ChainError::CryptoError(format!(
            "Invalid recovery id: v = {}",
            v
        )));
    }
    validate_signature_values(r, s)
}

impl SignedTransaction {
    /// Recovers the signer address from `(v, r, s)` over the stamped digest.
    pub fn from_address(&self) -> Result<Address> {
        verify_signature(self.v, &self.r, &self.s)?;

        let digest = self.transaction.hash_with_stamp()?;
        let mut signature = [0u8; 65];
        signature[..32].copy_from_slice(&self.r);
        signature[32..64].copy_from_slice(&self.s);
        signature[64] = (self.v - COMICCOIN_RECOVERY_IDENTIFIER) as u8;

        let public_key = recover_public_key(&digest, &signature)?;
        Ok(Address::from_public_key(&public_key))
    }

    /// Stateless validation.
    ///
    /// `is_authority` allows the self-to-self transfers used for coinbase credits
    /// and token mints; nobody else may send to themselves.
    pub fn validate(&self, chain_id: u16, is_authority: bool) -> Result<()> {
        let tx = &self.transaction;
        if tx.chain_id != chain_id {
            return Err(ChainError::InvalidTransaction(format!(
                "Invalid chain id, got {} expected {}",
                tx.chain_id, chain_id
            )));
        }

        if !is_authority && tx.is_self_transfer() {
            return Err(ChainError::InvalidTransaction(format!(
                "Sending to yourself is not allowed, from {} to {}",
                tx.from, tx.to
            )));
        }

        if tx.data.len() > MAX_TRANSACTION_DATA_SIZE {
            return Err(ChainError::InvalidTransaction(format!(
                "Transaction data too large: {} bytes (max: {})",
                tx.data.len(),
                MAX_TRANSACTION_DATA_SIZE
            )));
        }

        if tx.tx_type == TransactionType::Token && tx.token_metadata_uri.is_empty() && tx.is_self_transfer() {
            return Err(ChainError::InvalidTransaction(
                "Token mint requires a metadata URI".to_string(),
            ));
        }

        let signer = self.from_address()?;
        if signer != tx.from {
            return Err(ChainError::InvalidTransaction(format!(
                "Signature address {} does not match from address {}",
                signer, tx.from
            )));
        }

        Ok(())
    }
}
