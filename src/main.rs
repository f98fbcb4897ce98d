//! Bridge Oracle Service
//!
//! Runs the oracle for every bridge in the configuration file:
//! 1. Watches both sides of each bridge for transfer events
//! 2. Signs and collects attestations until the quorum is met
//! 3. Submits the finalize transaction on the destination chain
//! 4. Serves the health endpoint and the operator API

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use bridge_oracle::api::ApiServer;
use bridge_oracle::config::{Config, OracleMode};
use bridge_oracle::connector::ConnectorPool;
use bridge_oracle::crypto::CryptoService;
use bridge_oracle::service::OracleService;
use bridge_oracle::storage::OracleStore;

#[derive(Debug, Parser)]
#[command(name = "bridge-oracle", about = "Bridge validator and relay oracle")]
struct Args {
    /// Configuration file (defaults to $ORACLE_CONFIG_PATH or config/oracle.toml)
    #[arg(long, short)]
    config: Option<PathBuf>,
}

/// Loads the oracle key when this process signs or relays.
fn load_crypto(config: &Config) -> Result<Option<Arc<CryptoService>>> {
    let needs_key = config.oracle.mode == OracleMode::Operator || config.oracle.relay_enabled;
    if !needs_key {
        return Ok(None);
    }
    let crypto = CryptoService::new(config)?;

    if config.oracle.mode == OracleMode::Operator {
        let validator_id = config.oracle.validator_id.as_deref().unwrap_or_default();
        for bridge in &config.bridges {
            let Some(validator) = bridge.validator(validator_id) else {
                continue;
            };
            if !crypto.matches_validator(validator)? {
                anyhow::bail!(
                    "Key mismatch: validator {} of bridge {} does not match the configured private key",
                    validator_id,
                    bridge.id
                );
            }
        }
    }
    Ok(Some(Arc::new(crypto)))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    info!("Starting Bridge Oracle Service");

    let config = match args.config {
        Some(path) => Config::load_from(&path)?,
        None => Config::load()?,
    };
    info!(
        mode = ?config.oracle.mode,
        bridges = config.bridges.len(),
        "Configuration loaded successfully"
    );

    let store = OracleStore::open(&config.storage.path)
        .with_context(|| format!("Failed to open store at {}", config.storage.path.display()))?;
    let pool = ConnectorPool::from_config(&config)?;
    let crypto = load_crypto(&config)?;

    let service = Arc::new(OracleService::new(Arc::new(config), store, pool, crypto)?);
    let handles = service.spawn()?;
    info!(tasks = handles.len(), "All components initialized successfully");

    let api_server = ApiServer::new(service.clone());
    tokio::select! {
        result = api_server.run() => {
            if let Err(e) = &result {
                error!("API server stopped: {}", e);
            }
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
        }
    }

    service.store().flush().await?;
    info!("Bridge Oracle Service stopped");
    Ok(())
}
