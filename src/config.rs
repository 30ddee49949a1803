//! Configuration management for the ComicCoin node

use crate::error::ChainError;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub chain: ChainConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub genesis: GenesisConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub miner: MinerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    #[serde(default = "default_chain_id")]
    pub chain_id: u16,
    #[serde(default = "default_difficulty")]
    pub difficulty: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default)]
    pub bootstrap_peers: Vec<String>,
    #[serde(default = "default_block_data_rendezvous")]
    pub block_data_rendezvous: String,
    #[serde(default = "default_mempool_rendezvous")]
    pub mempool_rendezvous: String,
    #[serde(default = "default_response_timeout_secs")]
    pub response_timeout_secs: u64,
    #[serde(default = "default_discovery_interval_secs")]
    pub discovery_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GenesisConfig {
    #[serde(default = "default_artifact_path")]
    pub artifact_path: String,
    #[serde(default = "default_initial_supply")]
    pub initial_supply: u64,
    #[serde(default = "default_coinbase_key_path")]
    pub coinbase_key_path: String,
    #[serde(default = "default_validator_id")]
    pub validator_id: String,
    #[serde(default = "default_token_metadata_uri")]
    pub token_metadata_uri: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Surface divergence to the embedding application, which exits.
    #[default]
    Strict,
    /// Quarantine the proposal and request its predecessor from a peer.
    Resync,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValidationConfig {
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MinerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_block_interval_secs")]
    pub block_interval_secs: u64,
    #[serde(default = "default_max_transactions_per_block")]
    pub max_transactions_per_block: usize,
}

fn default_chain_id() -> u16 {
    1
}

fn default_difficulty() -> u16 {
    2
}

fn default_listen_addr() -> String {
    "0.0.0.0:26642".to_string()
}

fn default_block_data_rendezvous() -> String {
    "comiccoin/blockdatadto".to_string()
}

fn default_mempool_rendezvous() -> String {
    "comiccoin/mempool".to_string()
}

fn default_response_timeout_secs() -> u64 {
    45
}

fn default_discovery_interval_secs() -> u64 {
    10
}

fn default_database_path() -> String {
    "./data/comiccoin.db".to_string()
}

fn default_artifact_path() -> String {
    "./data/genesis.json".to_string()
}

fn default_initial_supply() -> u64 {
    5_000_000_000_000_000_000
}

fn default_coinbase_key_path() -> String {
    "./data/coinbase.key".to_string()
}

fn default_validator_id() -> String {
    "comiccoin-authority".to_string()
}

fn default_token_metadata_uri() -> String {
    "ipfs://comiccoin/genesis-token".to_string()
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_block_interval_secs() -> u64 {
    10
}

fn default_max_transactions_per_block() -> usize {
    100
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            chain_id: default_chain_id(),
            difficulty: default_difficulty(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            bootstrap_peers: Vec::new(),
            block_data_rendezvous: default_block_data_rendezvous(),
            mempool_rendezvous: default_mempool_rendezvous(),
            response_timeout_secs: default_response_timeout_secs(),
            discovery_interval_secs: default_discovery_interval_secs(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

impl Default for GenesisConfig {
    fn default() -> Self {
        Self {
            artifact_path: default_artifact_path(),
            initial_supply: default_initial_supply(),
            coinbase_key_path: default_coinbase_key_path(),
            validator_id: default_validator_id(),
            token_metadata_uri: default_token_metadata_uri(),
        }
    }
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::default(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for MinerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            block_interval_secs: default_block_interval_secs(),
            max_transactions_per_block: default_max_transactions_per_block(),
        }
    }
}

impl NetworkConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_interval_secs.max(1))
    }
}

impl ValidationConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

impl MinerConfig {
    pub fn block_interval(&self) -> Duration {
        Duration::from_secs(self.block_interval_secs.max(1))
    }
}

impl Config {
    /// Validate critical values
    pub fn validate(&self) -> Result<(), ChainError> {
        if self.chain.chain_id == 0 {
            return Err(ChainError::Config("chain.chain_id must be greater than 0".into()));
        }
        if self.chain.difficulty > 64 {
            return Err(ChainError::Config(format!(
                "chain.difficulty must be at most 64, got {}",
                self.chain.difficulty
            )));
        }
        if self.database.path.is_empty() {
            return Err(ChainError::Config("database.path must be set".into()));
        }
        if self.genesis.artifact_path.is_empty() {
            return Err(ChainError::Config("genesis.artifact_path must be set".into()));
        }
        if self.genesis.coinbase_key_path.is_empty() {
            return Err(ChainError::Config("genesis.coinbase_key_path must be set".into()));
        }
        if self.genesis.initial_supply == 0 {
            return Err(ChainError::Config("genesis.initial_supply must be greater than 0".into()));
        }
        if self.miner.max_transactions_per_block == 0 {
            return Err(ChainError::Config(
                "miner.max_transactions_per_block must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

pub fn parse_config(config_str: &str) -> Result<Config, ChainError> {
    let config: Config = toml::from_str(config_str)
        .map_err(|e| ChainError::Config(format!("Invalid configuration: {}", e)))?;
    config.validate()?;
    Ok(config)
}

/// Reads `path`; an absent file yields the defaults.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ChainError> {
    let path = path.as_ref();
    if !path.exists() {
        tracing::info!(path = %path.display(), "No configuration file, using defaults");
        let config = Config::default();
        config.validate()?;
        return Ok(config);
    }
    let config_str = fs::read_to_string(path)?;
    parse_config(&config_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_when_sections_missing() {
        let config = parse_config("").unwrap();
        assert_eq!(config.chain.chain_id, 1);
        assert_eq!(config.network.response_timeout(), Duration::from_secs(45));
        assert_eq!(config.network.block_data_rendezvous, "comiccoin/blockdatadto");
        assert_eq!(config.genesis.initial_supply, 5_000_000_000_000_000_000);
        assert_eq!(config.validation.failure_policy, FailurePolicy::Strict);
        assert!(!config.miner.enabled);
    }

    #[test]
    fn test_partial_sections_keep_defaults() {
        let config = parse_config(
            r#"
            [chain]
            difficulty = 3

            [validation]
            failure_policy = "resync"

            [database]
            path = ":memory:"
            "#,
        )
        .unwrap();
        assert_eq!(config.chain.chain_id, 1);
        assert_eq!(config.chain.difficulty, 3);
        assert_eq!(config.validation.failure_policy, FailurePolicy::Resync);
        assert_eq!(config.validation.poll_interval_ms, 500);
        assert_eq!(config.database.path, ":memory:");
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(matches!(parse_config("[chain]\nchain_id = 0"), Err(ChainError::Config(_))));
        assert!(matches!(parse_config("[chain]\ndifficulty = 65"), Err(ChainError::Config(_))));
        assert!(matches!(parse_config("[database]\npath = \"\""), Err(ChainError::Config(_))));
        assert!(parse_config("[validation]\nfailure_policy = \"panic\"").is_err());
    }

    #[test]
    fn test_load_config_from_file_and_missing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        assert_eq!(load_config(&path).unwrap().chain.difficulty, 2);

        std::fs::write(&path, "[network]\nbootstrap_peers = [\"127.0.0.1:26642\"]\n").unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.network.bootstrap_peers, vec!["127.0.0.1:26642".to_string()]);
    }
}
