use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod auth;
mod chain;
mod commit_reveal;
mod config;
mod machine;
mod orchestrator;
mod server;
mod store;

use chain::rpc::EvmClient;
use config::Config;
use orchestrator::Orchestrator;
use store::ArtifactStore;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run().await {
        error!("fatal: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cfg = Arc::new(Config::from_env()?);
    let store = Arc::new(ArtifactStore::new(&cfg.data_dir)?);
    let client = EvmClient::connect(&cfg).await?;
    let gamemaster = client.gamemaster();

    info!(
        chain_id = cfg.chain_id,
        contract = %cfg.contract_address,
        %gamemaster,
        data_dir = %cfg.data_dir.display(),
        tls = Config::tls_available(),
        "scriptgame gamemaster daemon starting"
    );

    Orchestrator::new(cfg, Arc::new(client), store, gamemaster)
        .run()
        .await
}
