//! Standalone entry point: serves the control plane over HTTP.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use mcp_broker::{AppState, ConnectionRegistry, SettingsStore};

#[derive(Parser)]
#[command(name = "mcp-broker", version, about = "Broker for Model Context Protocol servers")]
struct Args {
    /// Address to bind the control plane to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind the control plane to
    #[arg(long, default_value_t = 8950)]
    port: u16,

    /// Directory holding mcp_settings.json (defaults to the per-user config dir)
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let root = args
        .data_dir
        .or_else(|| dirs::config_dir().map(|d| d.join("mcp-broker")))
        .context("no data directory available; pass --data-dir")?;
    let store = SettingsStore::new(&root);
    store
        .load()
        .with_context(|| format!("failed to initialize settings in {}", root.display()))?;

    let registry = Arc::new(ConnectionRegistry::new());
    let state = AppState::new(registry.clone(), store);
    let app = mcp_broker::router(state).layer(CorsLayer::permissive());

    let addr = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    log::info!("mcp-broker listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    registry.teardown().await;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    log::info!("shutdown requested");
}
