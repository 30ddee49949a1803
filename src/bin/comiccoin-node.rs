#![forbid(unsafe_code)]
//! ComicCoin node: runs the consensus services, or inspects local state.

use clap::{Parser, Subcommand};
use comiccoin::config::{load_config, Config};
use comiccoin::crypto::Address;
use comiccoin::node::Node;
use comiccoin::repository::Ledger;
use comiccoin::storage::open_storage;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, short, default_value = "config.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Runs the node until Ctrl-C (default)
    Run,
    /// Prints the chain tip
    Status,
    /// Prints the balance and nonce of an account
    Balance {
        /// 0x-prefixed 20-byte address
        address: String,
    },
}

fn open_ledger(config: &Config) -> Result<Ledger, Box<dyn std::error::Error>> {
    Ok(Ledger::new(open_storage(&config.database.path)?))
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let node = Node::init(config).await?;
    let cancel = node.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received Ctrl-C");
            cancel.cancel();
        }
    });
    node.run().await?;
    Ok(())
}

fn status(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let ledger = open_ledger(config)?;
    match ledger.chain_state.get_by_chain_id(config.chain.chain_id)? {
        Some(state) => {
            println!("chain id:        {}", state.chain_id);
            println!("latest block:    {}", state.latest_block_number);
            println!("latest hash:     {}", state.latest_hash);
            println!("latest token id: {}", state.latest_token_id);
            println!("accounts root:   {}", state.account_hash_state);
            println!("tokens root:     {}", state.token_hash_state);
        }
        None => println!("chain {} is not initialized", config.chain.chain_id),
    }
    Ok(())
}

fn balance(config: &Config, address: &str) -> Result<(), Box<dyn std::error::Error>> {
    let address = Address::from_hex(address)?;
    let ledger = open_ledger(config)?;
    match ledger.accounts.get_by_address(&address)? {
        Some(account) => println!("{} balance={} nonce={}", address, account.balance, account.nonce),
        None => println!("{} balance=0 nonce=0", address),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let result = match load_config(&cli.config) {
        Ok(config) => match cli.command.unwrap_or(Commands::Run) {
            Commands::Run => run(config).await,
            Commands::Status => status(&config),
            Commands::Balance { address } => balance(&config, &address),
        },
        Err(e) => Err(e.into()),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Node exited with an error");
            ExitCode::FAILURE
        }
    }
}
