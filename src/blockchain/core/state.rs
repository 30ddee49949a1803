use crate::codec;
use crate::crypto::{sha256_hex, Address};
use crate::error::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub address: Address,
    pub balance: u64,
    pub nonce: u64,
}

impl Account {
    pub fn new(address: Address) -> Self {
        Account {
            address,
            balance: 0,
            nonce: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.balance > 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub id: u64,
    pub owner: Address,
    pub metadata_uri: String,
    pub nonce: u64,
}

impl Token {
    /// Burned tokens are owned by the zero address and drop out of `tokens_root`.
    pub fn is_active(&self) -> bool {
        !self.owner.is_zero()
    }
}

/// Monotonic update rule for token nonces: a token moves only forward.
pub fn token_nonce_accepted(stored: Option<&Token>, candidate_nonce: u64) -> bool {
    match stored {
        None => true,
        Some(token) => candidate_nonce > token.nonce,
    }
}

/// `stateRoot`: active accounts sorted by address, each encoded as the CBOR
/// array `[address, balance, nonce]`, concatenated and hashed.
///
/// The tuple encoding fixes field order independently of struct layout.
pub fn account_hash_state<'a, I>(accounts: I) -> Result<String>
where
    I: IntoIterator<Item = &'a Account>,
{
    let mut active: Vec<&Account> = accounts.into_iter().filter(|a| a.is_active()).collect();
    active.sort_by(|a, b| a.address.cmp(&b.address));

    let mut buffer = Vec::new();
    for account in active {
        buffer.extend(codec::to_cbor(&(
            serde_bytes::Bytes::new(account.address.as_bytes()),
            account.balance,
            account.nonce,
        ))?);
    }
    Ok(sha256_hex(&buffer))
}

/// `tokensRoot`: active tokens sorted by id, encoded as `[id, owner, metadata_uri, nonce]`.
pub fn token_hash_state<'a, I>(tokens: I) -> Result<String>
where
    I: IntoIterator<Item = &'a Token>,
{
    let mut active: Vec<&Token> = tokens.into_iter().filter(|t| t.is_active()).collect();
    active.sort_by_key(|t| t.id);

    let mut buffer = Vec::new();
    for token in active {
        buffer.extend(codec::to_cbor(&(
            token.id,
            serde_bytes::Bytes::new(token.owner.as_bytes()),
            token.metadata_uri.as_str(),
            token.nonce,
        ))?);
    }
    Ok(sha256_hex(&buffer))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(byte: u8, balance: u64, nonce: u64) -> Account {
        Account {
            address: Address([byte; 20]),
            balance,
            nonce,
        }
    }

    #[test]
    fn test_account_hash_ignores_insertion_order() {
        let a = vec![account(1, 10, 0), account(2, 20, 1), account(3, 30, 2)];
        let b = vec![a[2].clone(), a[0].clone(), a[1].clone()];
        assert_eq!(account_hash_state(&a).unwrap(), account_hash_state(&b).unwrap());
    }

    #[test]
    fn test_account_hash_skips_empty_accounts() {
        let with_empty = vec![account(1, 10, 0), account(9, 0, 4)];
        let without = vec![account(1, 10, 0)];
        assert_eq!(
            account_hash_state(&with_empty).unwrap(),
            account_hash_state(&without).unwrap()
        );
    }

    #[test]
    fn test_account_hash_tracks_balance_changes() {
        let before = vec![account(1, 10, 0), account(2, 20, 0)];
        let after = vec![account(1, 11, 0), account(2, 20, 0)];
        assert_ne!(account_hash_state(&before).unwrap(), account_hash_state(&after).unwrap());
    }

    #[test]
    fn test_token_hash_excludes_burned() {
        let live = Token {
            id: 0,
            owner: Address([4; 20]),
            metadata_uri: "ipfs://a".into(),
            nonce: 1,
        };
        let burned = Token {
            id: 1,
            owner: Address::ZERO,
            metadata_uri: "ipfs://b".into(),
            nonce: 3,
        };
        assert_eq!(
            token_hash_state(&[live.clone(), burned]).unwrap(),
            token_hash_state(&[live]).unwrap()
        );
    }

    #[test]
    fn test_token_nonce_comparator() {
        let token = Token {
            id: 7,
            owner: Address([1; 20]),
            metadata_uri: String::new(),
            nonce: 2,
        };
        assert!(token_nonce_accepted(None, 0));
        assert!(token_nonce_accepted(Some(&token), 3));
        assert!(!token_nonce_accepted(Some(&token), 2));
        assert!(!token_nonce_accepted(Some(&token), 1));
    }
}
