//! TinyKV server binary
//!
//! Resolves configuration, starts the storage engine, then serves it until a
//! termination signal arrives.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tinykv_storage::{Storage, StorageEngine};
use tinykv_server::startup::{self, ProcessSupervisor, ServiceHost, os_signals};
use tinykv_server::{Cli, Configuration};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let configuration = Configuration::from_cli(&cli).context("failed to load configuration")?;

    let logging_config = configuration.logging_config()?;
    let _logging_guard = startup::init_logging(&logging_config)?;

    info!(
        "Server started with conf {}",
        serde_json::to_string(&configuration)?
    );

    if let Err(e) = run(&configuration).await {
        error!("{:#}", e);
        return Err(e);
    }

    info!("Server stopped.");
    Ok(())
}

async fn run(configuration: &Configuration) -> anyhow::Result<()> {
    let engine = Arc::new(StorageEngine::from_config(configuration.storage_config()));
    engine
        .start()
        .await
        .context("failed to start storage engine")?;

    let served = serve(engine.clone(), configuration).await;

    // Storage goes down only after the host has drained
    if let Err(e) = engine.stop().await {
        warn!("Failed to stop storage engine: {}", e);
    }
    served
}

async fn serve(engine: Arc<StorageEngine>, configuration: &Configuration) -> anyhow::Result<()> {
    let host = ServiceHost::new(
        engine,
        &configuration.store_addr,
        configuration.transport_policy(),
    )?;
    let host = host.bind().await?;

    let supervisor = ProcessSupervisor::new(os_signals()?, host.stop_handle()).spawn();
    let result = host.serve().await;
    supervisor.abort();

    result.context("gRPC server failed")
}
