//! Standalone sync host: the playback engine behind a QUIC endpoint.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use unison_core::adapters::clock::SystemClock;
use unison_core::adapters::quic::server::SyncServer;
use unison_core::application::engine::SyncEngine;
use unison_core::config::SyncConfig;

const DEFAULT_BIND: &str = "0.0.0.0:4433";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match std::env::var("UNISON_CONFIG") {
        Ok(path) => SyncConfig::from_json_file(&path)?,
        Err(_) => SyncConfig::default(),
    };
    let bind = std::env::var("UNISON_BIND").unwrap_or_else(|_| DEFAULT_BIND.to_string());
    let addr: SocketAddr = bind
        .parse()
        .with_context(|| format!("invalid UNISON_BIND address {bind:?}"))?;

    let engine = SyncEngine::new(config, Arc::new(SystemClock));
    engine.start().await;

    let server = Arc::new(SyncServer::new(addr, Arc::clone(&engine))?);
    info!(%addr, "Sync host starting");

    let cancel = CancellationToken::new();
    let server_task = tokio::spawn(Arc::clone(&server).run(cancel.clone()));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    cancel.cancel();
    engine.shutdown().await;
    match server_task.await {
        Ok(Err(e)) => warn!("Server ended with error: {e}"),
        Err(e) => warn!("Server task failed: {e}"),
        Ok(Ok(())) => {}
    }
    Ok(())
}
