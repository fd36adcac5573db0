mod abi;
mod config;
mod db;
mod event_decoder;
mod indexer;
mod listener;
mod normalize;
mod provider;
mod retry;
mod types;
mod ws_server;

use std::path::Path;
use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).compact().init();

    let cfg_path = std::env::args().nth(1).unwrap_or_else(|| "./config.yaml".to_string());
    let cfg = config::AppCfg::load(&cfg_path)?;

    let schema = std::fs::read_to_string(Path::new(&cfg.schema_path()))?;

    // deps
    let store = Arc::new(db::Store::connect(&cfg.postgres.dsn, schema.as_str()).await?);
    let chain = Arc::new(provider::ChainClient::connect(&cfg.chain).await?);

    let ws_bind = cfg.ws_bind();
    let indexer = Arc::new(indexer::Indexer::new(cfg, store, chain)?);

    tokio::spawn({
        let notifications = indexer.notifications();
        async move {
            if let Err(e) = ws_server::serve(&ws_bind, notifications).await {
                error!("WebSocket server terminated: {:?}", e);
            }
        }
    });

    let mut runner = tokio::spawn({
        let indexer = Arc::clone(&indexer);
        async move { indexer.run().await }
    });

    tokio::select! {
        result = &mut runner => {
            // The orchestrator never returns on its own unless it failed.
            result??;
            return Ok(());
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
            indexer.stop();
        }
    }

    runner.await??;

    Ok(())
}
