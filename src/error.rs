//! Error types for the ComicCoin node

use std::collections::BTreeMap;
use std::fmt;

/// Field → message map for malformed input, produced before any state is touched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationErrors(pub BTreeMap<String, String>);

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.0.insert(field.into(), message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.0.get(field).map(String::as_str)
    }

    /// `Ok(())` when nothing was recorded, otherwise the map wrapped in `ChainError::Validation`.
    pub fn into_result(self) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(ChainError::Validation(self))
        }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut first = true;
        for (field, message) in &self.0 {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", field, message)?;
            first = false;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ChainError {
    #[error("Validation failed: {0}")]
    Validation(ValidationErrors),
    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),
    #[error("Invalid block: {0}")]
    InvalidBlock(String),
    #[error("Cryptographic error: {0}")]
    CryptoError(String),
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Codec error: {0}")]
    Codec(String),
    #[error("Network error: {0}")]
    NetworkError(String),
    #[error("No peers connected")]
    NoPeersConnected,
    #[error("Timed out waiting for {0}")]
    Timeout(String),
    #[error("Operation cancelled")]
    Cancelled,
    #[error("Blockchain not initialized for chain {0}")]
    ChainNotInitialized(u16),
    #[error("Local state diverged from network consensus, resync required: {0}")]
    ResyncRequired(String),
    #[error("Insufficient balance: {0}")]
    InsufficientBalance(String),
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ChainError {
    /// Consensus disagreement: bad authority signature, broken continuity, or root mismatch.
    pub fn is_consensus_divergence(&self) -> bool {
        matches!(self, ChainError::ResyncRequired(_))
    }

    /// Errors a polling caller should swallow and retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ChainError::NoPeersConnected | ChainError::Timeout(_) | ChainError::NetworkError(_)
        )
    }
}

impl From<std::io::Error> for ChainError {
    fn from(err: std::io::Error) -> Self {
        ChainError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for ChainError {
    fn from(err: serde_json::Error) -> Self {
        ChainError::Codec(format!("json: {}", err))
    }
}

impl From<rusqlite::Error> for ChainError {
    fn from(err: rusqlite::Error) -> Self {
        ChainError::DatabaseError(err.to_string())
    }
}

/// Convenience alias used across the crate
pub type Result<T> = std::result::Result<T, ChainError>;
