use std::path::PathBuf;

use anyhow::Context;
use log::info;

use utxo_ledger::blockchain::{Ledger, LedgerError, StorageError};
use utxo_ledger::config::LedgerConfig;

// Resume the ledger, or create it for the configured genesis owner
fn open_ledger(config: &LedgerConfig) -> anyhow::Result<Ledger> {
    match Ledger::resume(config) {
        Ok(ledger) => {
            info!("Loaded ledger from {}", config.data_dir.display());
            Ok(ledger)
        }
        Err(LedgerError::StorageError(StorageError::NotFound(_))) => {
            info!(
                "No existing ledger found at {}, creating one for {}",
                config.data_dir.display(),
                config.genesis_owner
            );
            Ledger::init(config, &config.genesis_owner).context("failed to create ledger")
        }
        Err(err) => Err(err).context("failed to open ledger"),
    }
}

fn main() -> anyhow::Result<()> {
    // Initialize logger
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config_path = std::env::var_os("LEDGER_CONFIG").map(PathBuf::from);
    let config = LedgerConfig::load(config_path.as_deref()).context("failed to load configuration")?;

    let ledger = open_ledger(&config)?;

    let height = ledger.validate_chain().context("chain validation failed")?;
    info!("Validated {} blocks", height);

    for block in ledger.iterator() {
        let block = block?;
        info!(
            "Block {} prev={} nonce={} transactions={}",
            block.hash_hex(),
            hex::encode(&block.prev_hash),
            block.nonce,
            block.transactions.len()
        );
    }

    let balance = ledger.balance(&config.genesis_owner)?;
    info!("Balance of {}: {}", config.genesis_owner, balance);

    Ok(())
}
