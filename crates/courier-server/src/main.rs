//! # courier-server
//!
//! Real-time messaging gateway.
//!
//! This binary provides:
//! - **Socket gateway** (`/ws`) authenticating each connection once at
//!   handshake and dispatching its events in order
//! - **Message router** persisting messages, receipts and reactions and
//!   fanning them out to conversation and user rooms
//! - **Presence and typing** engines with auto-expiring indicators
//! - **Membership and rate gates** that keep working through store outages
//! - **REST API** (axum) for health checks and instance info

mod api;
mod config;
mod error;
mod fanout;
mod gateway;
mod membership;
mod policy;
mod presence;
mod rate_limit;
mod rooms;
mod router;
mod session;
mod state;
mod typing;

use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use courier_store::{DocumentStore, MemoryStore, SqliteStore};

use crate::config::{ServerConfig, StoreBackend};
use crate::gateway::verifier_from_key;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,courier_server=debug")),
        )
        .init();

    info!("Starting Courier server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");
    if config.auth_issuer_pubkey == [0u8; 32] {
        warn!("AUTH_ISSUER_PUBKEY not set, every handshake will be rejected");
    }
    match &config.fanout_url {
        Some(url) => info!(
            url = %url,
            "FANOUT_URL set, but only local fan-out is built in; events reach this instance only"
        ),
        None => info!("Single-instance fan-out"),
    }

    // -----------------------------------------------------------------------
    // 3. Open the durable store
    // -----------------------------------------------------------------------
    let store: Arc<dyn DocumentStore> = match config.store_backend {
        StoreBackend::Sqlite => {
            let store = match &config.store_path {
                Some(path) => SqliteStore::open_at(path)?,
                None => SqliteStore::open_default()?,
            };
            Arc::new(store)
        }
        StoreBackend::Memory => {
            warn!("Using the in-memory store, nothing survives a restart");
            Arc::new(MemoryStore::new())
        }
    };

    let http_addr = config.http_addr;
    let verifier = verifier_from_key(config.auth_issuer_pubkey);
    let app_state = AppState::new(config, store, verifier);

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------

    // Drop expired rate windows once per window
    let rl = app_state.rate_limiter.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(rl.window());
        loop {
            interval.tick().await;
            rl.purge_expired().await;
        }
    });

    // -----------------------------------------------------------------------
    // 5. Run the HTTP + socket server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
