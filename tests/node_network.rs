//! Integration tests for block propagation between running nodes

use comiccoin::config::Config;
use comiccoin::crypto::{KeyPair, PlaintextKeyProvider};
use comiccoin::genesis::load_coinbase_key;
use comiccoin::network::memory::InMemoryNetwork;
use comiccoin::network::PeerId;
use comiccoin::node::{Node, NodeRole};
use comiccoin::transaction::Transaction;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn node_config(dir: &TempDir, mining: bool) -> Config {
    let mut config = Config::default();
    config.chain.difficulty = 1;
    config.database.path = ":memory:".to_string();
    config.genesis.artifact_path = dir.path().join("genesis.json").to_string_lossy().into_owned();
    config.genesis.coinbase_key_path = dir.path().join("coinbase.key").to_string_lossy().into_owned();
    config.network.discovery_interval_secs = 1;
    config.validation.poll_interval_ms = 20;
    config.miner.enabled = mining;
    config.miner.block_interval_secs = 1;
    config
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_authority_block_reaches_follower() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let network = InMemoryNetwork::new();

    let authority = Arc::new(
        Node::with_transport(
            node_config(&dir, true),
            network.join(PeerId::new("authority")),
            CancellationToken::new(),
        )
        .await?,
    );
    assert_eq!(authority.role(), NodeRole::Authority);
    let follower = Arc::new(
        Node::with_transport(
            node_config(&dir, false),
            network.join(PeerId::new("follower")),
            CancellationToken::new(),
        )
        .await?,
    );
    assert_eq!(follower.role(), NodeRole::Follower);

    let running = follower.clone();
    let follower_task = tokio::spawn(async move { running.run().await });
    tokio::time::sleep(Duration::from_millis(200)).await;
    let running = authority.clone();
    let authority_task = tokio::spawn(async move { running.run().await });
    tokio::time::sleep(Duration::from_millis(300)).await;

    let coinbase = load_coinbase_key(
        dir.path().join("coinbase.key"),
        &PlaintextKeyProvider,
        "",
        false,
    )?;
    let recipient = KeyPair::generate().address();
    let transfer = Transaction::new_coin(1, 0, coinbase.address(), recipient, 100).sign(&coinbase)?;
    authority.submit_transaction(transfer).await?;

    let synced = tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            if let Ok(Some(state)) = follower.ledger().chain_state.get_by_chain_id(1) {
                if state.latest_block_number == 1 {
                    return state;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await?;

    let authority_state = authority
        .ledger()
        .chain_state
        .get_by_chain_id(1)?
        .ok_or("authority tip missing")?;
    assert_eq!(synced.latest_hash, authority_state.latest_hash);
    assert_eq!(synced.account_hash_state, authority_state.account_hash_state);
    let received = follower
        .ledger()
        .accounts
        .get_by_address(&recipient)?
        .ok_or("recipient missing")?;
    assert_eq!(received.balance, 100);

    authority.shutdown();
    follower.shutdown();
    authority_task.await??;
    follower_task.await??;
    Ok(())
}

#[tokio::test]
async fn test_follower_without_artifact_refuses_to_start() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let network = InMemoryNetwork::new();
    let result = Node::with_transport(
        node_config(&dir, false),
        network.join(PeerId::new("lonely")),
        CancellationToken::new(),
    )
    .await;
    assert!(result.is_err());
    Ok(())
}
