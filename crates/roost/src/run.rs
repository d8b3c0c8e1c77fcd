// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Top-level server runner — shared by `main` and integration tests.

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::state::Bridge;
use crate::store::EventStore;
use crate::transport::build_router;

/// Initialize tracing/logging from config.
///
/// Uses `try_init` so it's safe to call multiple times (e.g. from tests).
pub fn init_tracing(config: &Config) {
    use tracing_subscriber::fmt;

    let filter = if std::env::var("ROOST_LOG_LEVEL").is_err() && config.log_level == "info" {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level))
    } else {
        EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let result = match config.log_format.as_str() {
        "json" => fmt::fmt().with_env_filter(filter).json().try_init(),
        _ => fmt::fmt().with_env_filter(filter).try_init(),
    };
    drop(result);
}

/// Open the store, recover stale sessions, and bind the listener.
pub async fn prepare(config: Config) -> anyhow::Result<(Arc<Bridge>, TcpListener)> {
    let db_path = config.resolve_db_path()?;
    let store = EventStore::open(&db_path)?;

    // Sessions a previous process left active lost their subprocesses.
    let recovered = store.mark_stale_sessions_exited()?;
    if recovered > 0 {
        info!(recovered, "marked stale sessions as exited");
    }

    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("listening on {}", listener.local_addr()?);

    Ok((Arc::new(Bridge::new(config, store)), listener))
}

/// Serve until shutdown, then tear down live sessions.
pub async fn serve(bridge: Arc<Bridge>, listener: TcpListener) -> anyhow::Result<()> {
    spawn_signal_handler(Arc::clone(&bridge));

    let router = build_router(Arc::clone(&bridge));
    let shutdown = bridge.shutdown.clone();
    axum::serve(listener, router).with_graceful_shutdown(shutdown.cancelled_owned()).await?;

    // Live subprocesses die with the bridge; their sessions are recovered
    // as exited on the next start.
    let sessions = bridge.sessions.read().await;
    for handle in sessions.values() {
        handle.agent.kill();
        handle.stop.cancel();
    }
    info!(count = sessions.len(), "killed live agent sessions on shutdown");
    Ok(())
}

/// Run the bridge to completion.
pub async fn run(config: Config) -> anyhow::Result<()> {
    init_tracing(&config);
    let (bridge, listener) = prepare(config).await?;
    serve(bridge, listener).await
}

/// First SIGTERM/SIGINT: graceful shutdown. Second: force exit.
fn spawn_signal_handler(bridge: Arc<Bridge>) {
    tokio::spawn(async move {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
        let mut sigint =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()).ok();

        tokio::select! {
            _ = async {
                if let Some(ref mut s) = sigterm { s.recv().await } else { std::future::pending().await }
            } => {
                info!("received SIGTERM");
            }
            _ = async {
                if let Some(ref mut s) = sigint { s.recv().await } else { std::future::pending().await }
            } => {
                info!("received SIGINT");
            }
        }
        bridge.shutdown.cancel();

        tokio::select! {
            _ = async {
                if let Some(ref mut s) = sigterm { s.recv().await } else { std::future::pending().await }
            } => {
                error!("received SIGTERM again, forcing exit");
            }
            _ = async {
                if let Some(ref mut s) = sigint { s.recv().await } else { std::future::pending().await }
            } => {
                error!("received SIGINT again, forcing exit");
            }
        }
        std::process::exit(130);
    });
}
