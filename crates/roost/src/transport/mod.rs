// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP/WebSocket server surface: the `/ws` JSON-RPC endpoint, a health
//! probe, and static UI assets for everything else.

pub mod msg;
pub mod ws;

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;

use crate::state::Bridge;

#[derive(Debug, Serialize)]
pub struct Health {
    pub status: &'static str,
    pub sessions: usize,
    pub ws_clients: usize,
    pub uptime_secs: u64,
}

/// `GET /api/v1/health` — liveness plus coarse counters.
pub async fn health(State(bridge): State<Arc<Bridge>>) -> Json<Health> {
    Json(Health {
        status: "running",
        sessions: bridge.sessions.read().await.len(),
        ws_clients: bridge.broker.client_count(),
        uptime_secs: bridge.started_at.elapsed().as_secs(),
    })
}

/// Build the axum `Router`: API routes first, static files as fallback.
pub fn build_router(bridge: Arc<Bridge>) -> Router {
    let static_dir = bridge.config.static_dir.clone();
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/api/v1/health", get(health))
        .fallback_service(ServeDir::new(static_dir))
        .layer(CorsLayer::permissive())
        .with_state(bridge)
}
