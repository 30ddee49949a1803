use crate::error::{ChainError, Result};
use crate::repository::{AccountRepository, Ledger, TokenRepository};
use crate::transaction::{BlockTransaction, Transaction, TransactionType};

use super::chain::{BlockData, BlockHeader};
use super::state::{Account, Token};

/// `header` must extend `prev`: next number, and linked by hash.
pub fn validate_chain_continuity(prev: &BlockData, header: &BlockHeader) -> Result<()> {
    if header.prev_block_hash != prev.hash {
        return Err(ChainError::ResyncRequired(format!(
            "Previous hash mismatch: block {} points at {}, local tip is {}",
            header.number, header.prev_block_hash, prev.hash
        )));
    }
    if header.number != prev.header.number + 1 {
        return Err(ChainError::ResyncRequired(format!(
            "Block number mismatch: expected {}, got {}",
            prev.header.number + 1,
            header.number
        )));
    }
    Ok(())
}

/// Applies a block's transactions to the ledger in order and returns the new
/// `latest_token_id`. The caller owns the surrounding storage transaction.
pub fn apply_block_transactions(
    ledger: &Ledger,
    transactions: &[BlockTransaction],
    latest_token_id: u64,
) -> Result<u64> {
    let mut latest_token_id = latest_token_id;
    for block_tx in transactions {
        let tx = block_tx.transaction();
        match tx.tx_type {
            TransactionType::Coin => apply_coin_transfer(&ledger.accounts, tx)?,
            TransactionType::Token => {
                let minted = apply_token_transfer(&ledger.tokens, tx)?;
                if minted && tx.token_id > latest_token_id {
                    latest_token_id = tx.token_id;
                }
            }
        }
    }
    Ok(latest_token_id)
}

/// Sender and receiver nonces both advance by one per transfer. Nothing is
/// written unless both sides can be updated.
pub fn apply_coin_transfer(accounts: &AccountRepository, tx: &Transaction) -> Result<()> {
    let mut sender = accounts.get_by_address(&tx.from)?.ok_or_else(|| {
        ChainError::InsufficientBalance(format!("Sender account {} does not exist", tx.from))
    })?;
    sender.balance = sender.balance.checked_sub(tx.value).ok_or_else(|| {
        ChainError::InsufficientBalance(format!(
            "Account {} has {} but transfer needs {}",
            tx.from, sender.balance, tx.value
        ))
    })?;
    sender.nonce += 1;

    // A self-transfer credits the already debited sender.
    let mut receiver = if tx.is_self_transfer() {
        sender.clone()
    } else {
        accounts
            .get_by_address(&tx.to)?
            .unwrap_or_else(|| Account::new(tx.to))
    };
    receiver.balance = receiver.balance.checked_add(tx.value).ok_or_else(|| {
        ChainError::InvalidTransaction(format!("Balance overflow for account {}", tx.to))
    })?;
    receiver.nonce += 1;

    if !tx.is_self_transfer() {
        accounts.upsert(&sender)?;
    }
    accounts.upsert(&receiver)
}

/// Returns true when the transaction created a token that did not exist before.
pub fn apply_token_transfer(tokens: &TokenRepository, tx: &Transaction) -> Result<bool> {
    let existing = tokens.get_by_id(tx.token_id)?;
    let metadata_uri = match (&existing, tx.token_metadata_uri.is_empty()) {
        (Some(token), true) => token.metadata_uri.clone(),
        _ => tx.token_metadata_uri.clone(),
    };
    let candidate = Token {
        id: tx.token_id,
        owner: tx.to,
        metadata_uri,
        nonce: tx.token_nonce,
    };
    let applied = tokens.upsert_if_nonce_accepted(&candidate)?;
    if !applied {
        tracing::debug!(
            token_id = tx.token_id,
            token_nonce = tx.token_nonce,
            "Token update skipped, nonce not newer than stored"
        );
    }
    Ok(applied && existing.is_none())
}
