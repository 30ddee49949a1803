//! ComicCoin - consensus core of a hybrid PoW/PoA account-and-token blockchain node
//!
//! # Architecture
//!
//! The crate is organized into logical modules:
//!
//! ## Core Blockchain
//! - [`blockchain`] - Block headers, block data, accounts, tokens and ledger application
//! - [`transaction`] - Transaction types, signing and validation
//! - [`merkle`] - Merkle tree over block transactions
//! - [`mempool`] - Pending transaction relay and pool
//!
//! ## Consensus
//! - [`miner`] - Proof-of-work mining
//! - [`genesis`] - Genesis block creation and import
//! - [`validation`] - Proof-of-Authority validation of proposed blocks
//! - [`proposer`] - Authority block production
//! - [`lock`] - Keyed critical sections
//!
//! ## Cryptography
//! - [`crypto`] - secp256k1 keys, addresses and recoverable signatures (keccak256)
//!
//! ## State Management
//! - [`storage`] - Key-value storage backends (memory, SQLite) with transactions
//! - [`repository`] - Typed repositories over storage
//!
//! ## Networking
//! - [`network`] - Peer transport, framing, block data protocol and pub/sub
//! - [`sync`] - Block data serving and chain synchronization
//! - [`node`] - Service wiring for a running node
//!
//! ## Configuration & Utilities
//! - [`config`] - Configuration management
//! - [`error`] - Error types
//! - [`codec`] - CBOR and canonical JSON encoding

#![forbid(unsafe_code)]

// ============================================================================
// Core Blockchain
// ============================================================================
pub mod blockchain;
pub mod mempool;
pub mod merkle;
pub mod transaction;

// ============================================================================
// Consensus & Mining
// ============================================================================
pub mod genesis;
pub mod lock;
pub mod miner;
pub mod proposer;
pub mod validation;

// ============================================================================
// Cryptography
// ============================================================================
pub mod crypto;

// ============================================================================
// State Management
// ============================================================================
pub mod repository;
pub mod storage;

// ============================================================================
// Networking
// ============================================================================
pub mod network;
pub mod node;
pub mod sync;

// ============================================================================
// Configuration & Utilities
// ============================================================================
pub mod codec;
pub mod config;
pub mod error;
