// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! WebSocket endpoint: one JSON-RPC message per text frame.
//!
//! Each connection registers an outbound queue with the broker; responses
//! and published notifications share it. Requests dispatch on their own
//! tasks so a slow `session/prompt` never blocks the read loop — a
//! `session/cancel` on the same socket must still get through.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::debug;

use crate::broker::ClientId;
use crate::error::{ErrorCode, RpcFailure};
use crate::rpc::{self, Inbound};
use crate::session;
use crate::state::Bridge;

use super::msg::{
    EventWire, GetParams, ListParams, NewParams, PendingWire, PromptParams, RespondParams,
    SessionIdParams, SessionSummary,
};

/// `GET /ws` — WebSocket upgrade.
pub async fn ws_handler(
    State(bridge): State<Arc<Bridge>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(bridge, socket))
}

/// Per-connection loop: pump the outbound queue and parse inbound frames.
async fn handle_connection(bridge: Arc<Bridge>, socket: WebSocket) {
    let (client_id, out_tx, mut out_rx) = bridge.broker.register_client();
    let (mut ws_tx, mut ws_rx) = socket.split();

    loop {
        tokio::select! {
            outbound = out_rx.recv() => {
                let Some(text) = outbound else { break };
                if ws_tx.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            inbound = ws_rx.next() => {
                let msg = match inbound {
                    Some(Ok(m)) => m,
                    Some(Err(_)) | None => break,
                };
                match msg {
                    Message::Text(text) => {
                        handle_text(&bridge, client_id, &out_tx, text.as_str());
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            _ = bridge.shutdown.cancelled() => break,
        }
    }

    bridge.broker.remove_client(client_id);
    bridge.registry.fail_client(client_id);
    debug!(client_id, "websocket closed");
}

fn handle_text(
    bridge: &Arc<Bridge>,
    client_id: ClientId,
    out_tx: &mpsc::UnboundedSender<String>,
    text: &str,
) {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => {
            send_frame(out_tx, rpc::err_response(None, &RpcFailure::from(ErrorCode::Parse)));
            return;
        }
    };

    match rpc::classify(&value) {
        Ok(Inbound::Request { id, method, params }) => {
            let bridge = Arc::clone(bridge);
            let out_tx = out_tx.clone();
            tokio::spawn(async move {
                let frame = match dispatch(&bridge, client_id, &method, params).await {
                    Ok(result) => rpc::ok_response(&id, result),
                    Err(failure) => rpc::err_response(Some(&id), &failure),
                };
                send_frame(&out_tx, frame);
            });
        }
        Ok(Inbound::Response { id, result }) => {
            // A raw reply from the client: the permission path.
            let bridge = Arc::clone(bridge);
            tokio::spawn(async move {
                session::respond_raw(&bridge, &id, result).await;
            });
        }
        Ok(Inbound::Notification { method, .. }) => {
            debug!(client_id, method, "ignoring client notification");
        }
        Err(code) => {
            send_frame(out_tx, rpc::err_response(None, &RpcFailure::from(code)));
        }
    }
}

/// Route one client request to the session core.
async fn dispatch(
    bridge: &Arc<Bridge>,
    client_id: ClientId,
    method: &str,
    params: Value,
) -> Result<Value, RpcFailure> {
    match method {
        "session/list" => {
            let params: ListParams = parse_params_or_default(params)?;
            let sessions = session::list(bridge, &params.filter()).await?;
            let sessions: Vec<SessionSummary> =
                sessions.into_iter().map(SessionSummary::from).collect();
            Ok(json!({ "sessions": sessions }))
        }
        "session/new" => {
            let params: NewParams = parse_params_or_default(params)?;
            let session_id =
                session::create(bridge, client_id, params.agent_type, params.cwd, params.title)
                    .await?;
            Ok(json!({ "sessionId": session_id }))
        }
        "session/get" | "session/sync" => {
            let params: GetParams = parse_params(params)?;
            let (row, events, pending) =
                session::get(bridge, client_id, &params.session_id, params.since).await?;
            let updates: Vec<EventWire> = events.into_iter().map(EventWire::from).collect();
            let pending: Vec<PendingWire> = pending.into_iter().map(PendingWire::from).collect();
            Ok(json!({
                "session": SessionSummary::from(row),
                "updates": updates,
                "pendingRequests": pending,
            }))
        }
        "session/prompt" => {
            let params: PromptParams = parse_params(params)?;
            session::prompt(bridge, client_id, &params.session_id, params.prompt).await
        }
        "session/respond" => {
            let params: RespondParams = parse_params(params)?;
            session::respond(bridge, &params.session_id, params.request_id, params.response).await
        }
        "session/cancel" => {
            let params: SessionIdParams = parse_params(params)?;
            session::cancel(bridge, &params.session_id).await
        }
        "session/archive" => {
            let params: SessionIdParams = parse_params(params)?;
            session::archive(bridge, &params.session_id).await
        }
        "ping" => Ok(json!({ "pong": true })),
        _ => Err(RpcFailure::new(ErrorCode::MethodNotFound, format!("unknown method: {method}"))),
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, RpcFailure> {
    serde_json::from_value(params)
        .map_err(|e| RpcFailure::new(ErrorCode::InvalidParams, e.to_string()))
}

/// For methods whose params object is optional.
fn parse_params_or_default<T>(params: Value) -> Result<T, RpcFailure>
where
    T: serde::de::DeserializeOwned + Default,
{
    if params.is_null() {
        return Ok(T::default());
    }
    parse_params(params)
}

fn send_frame(out_tx: &mpsc::UnboundedSender<String>, frame: Value) {
    if let Ok(text) = serde_json::to_string(&frame) {
        let _ = out_tx.send(text);
    }
}

#[cfg(test)]
#[path = "ws_tests.rs"]
mod tests;
