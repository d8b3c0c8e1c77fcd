// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared test infrastructure: bridge builder and in-process server.

use std::path::Path;
use std::sync::Arc;

use crate::config::Config;
use crate::state::Bridge;
use crate::store::EventStore;
use crate::transport::build_router;

/// Builder for a [`Bridge`] with an in-memory store and test defaults.
pub struct BridgeBuilder {
    config: Config,
    db_path: Option<std::path::PathBuf>,
}

impl Default for BridgeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BridgeBuilder {
    pub fn new() -> Self {
        Self { config: Config::for_tests(), db_path: None }
    }

    /// Shell command used to spawn agents (e.g. a stub agent binary).
    pub fn agent_command(mut self, command: impl Into<String>) -> Self {
        self.config.agent_command = command.into();
        self
    }

    pub fn handshake_timeout_secs(mut self, secs: u64) -> Self {
        self.config.handshake_timeout_secs = secs;
        self
    }

    pub fn request_timeout_secs(mut self, secs: u64) -> Self {
        self.config.request_timeout_secs = secs;
        self
    }

    /// Back the store with a file instead of `:memory:`.
    pub fn db_path(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.db_path = Some(path.into());
        self
    }

    pub fn build(self) -> anyhow::Result<Arc<Bridge>> {
        let path = self.db_path.unwrap_or_else(|| ":memory:".into());
        let store = EventStore::open(Path::new(&path))?;
        Ok(Arc::new(Bridge::new(self.config, store)))
    }
}

/// Spawn the bridge's HTTP server on a random port for integration testing.
///
/// Returns the bound address and a join handle for the server task.
pub async fn spawn_http_server(
    bridge: Arc<Bridge>,
) -> anyhow::Result<(std::net::SocketAddr, tokio::task::JoinHandle<()>)> {
    let router = build_router(bridge);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    Ok((addr, handle))
}
