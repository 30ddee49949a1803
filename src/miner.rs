//! Proof-of-work nonce search.
//!
//! A header is solved when its hash string starts with `difficulty + 2`
//! characters of [`ZERO_HASH`] (the `0x` prefix plus `difficulty` zeros).

use crate::blockchain::{BlockHeader, ZERO_HASH};
use crate::error::{ChainError, Result};
use tokio_util::sync::CancellationToken;

const PROGRESS_INTERVAL: u64 = 1_000_000;

pub fn is_hash_solved(difficulty: u16, hash: &str) -> bool {
    if hash.len() != ZERO_HASH.len() || !hash.starts_with("0x") {
        return false;
    }
    let prefix_len = difficulty as usize + 2;
    if prefix_len > ZERO_HASH.len() {
        return false;
    }
    hash.as_bytes()[..prefix_len] == ZERO_HASH.as_bytes()[..prefix_len]
}

/// Searches nonces from 0 upward until the header hash is solved.
///
/// `cancel` is checked on every iteration; a cancelled search returns
/// `ChainError::Cancelled`.
pub fn mine(header: &BlockHeader, difficulty: u16, cancel: &CancellationToken) -> Result<u64> {
    let mut candidate = header.clone();
    candidate.nonce = 0;
    loop {
        if cancel.is_cancelled() {
            tracing::info!(number = candidate.number, nonce = candidate.nonce, "Mining cancelled");
            return Err(ChainError::Cancelled);
        }

        let hash = candidate.hash()?;
        if hash != ZERO_HASH && is_hash_solved(difficulty, &hash) {
            tracing::debug!(number = candidate.number, nonce = candidate.nonce, hash = %hash, "Block mined");
            return Ok(candidate.nonce);
        }

        if candidate.nonce > 0 && candidate.nonce % PROGRESS_INTERVAL == 0 {
            tracing::info!(number = candidate.number, attempts = candidate.nonce, difficulty, "Mining in progress");
        }
        candidate.nonce = candidate
            .nonce
            .checked_add(1)
            .ok_or_else(|| ChainError::InvalidBlock("Nonce space exhausted".to_string()))?;
    }
}

/// Runs [`mine`] on the blocking pool so async callers stay responsive.
pub async fn mine_async(header: BlockHeader, difficulty: u16, cancel: CancellationToken) -> Result<u64> {
    tokio::task::spawn_blocking(move || mine(&header, difficulty, &cancel))
        .await
        .map_err(|e| ChainError::InvalidBlock(format!("Mining task failed: {}", e)))?
}
