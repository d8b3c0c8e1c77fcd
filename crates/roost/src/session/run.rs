// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-session task: drives the handshake, drains the agent's frame stream,
//! and handles subprocess exit.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::agent::ExitCause;
use crate::error::{ErrorCode, RpcFailure};
use crate::registry::{RegistryError, RequestOutcome};
use crate::rpc::{self, Inbound, RpcId};
use crate::state::Bridge;

use super::{
    append_and_publish, maybe_resume_running, publish_status, Handshake, SessionHandle, Status,
};

/// Own the agent's frame stream for the life of the subprocess.
///
/// The handshake runs concurrently: its replies arrive on the same pipe this
/// loop drains, correlated through the registry's handshake table.
pub(crate) async fn session_task(
    bridge: Arc<Bridge>,
    handle: Arc<SessionHandle>,
    mut frames: tokio::sync::mpsc::Receiver<Value>,
    mut exited: oneshot::Receiver<ExitCause>,
) {
    tokio::spawn(run_handshake(Arc::clone(&bridge), Arc::clone(&handle)));

    let mut kill_requested = false;
    let cause = loop {
        tokio::select! {
            maybe = frames.recv() => match maybe {
                Some(frame) => handle_frame(&bridge, &handle, frame).await,
                None => break None,
            },
            cause = &mut exited => break Some(cause.unwrap_or(ExitCause::ProcessExit)),
            _ = bridge.shutdown.cancelled(), if !kill_requested => {
                handle.agent.kill();
                kill_requested = true;
            }
        }
    };

    // Frames decoded before EOF still count.
    while let Ok(frame) = frames.try_recv() {
        handle_frame(&bridge, &handle, frame).await;
    }

    let cause = match cause {
        Some(cause) => cause,
        None => exited.await.unwrap_or(ExitCause::ProcessExit),
    };
    on_exit(&bridge, &handle, cause).await;
}

/// The two-step handshake, run exactly once per session: `initialize`, then
/// `session/new`. One attempt; failure or timeout is fatal to the session.
async fn run_handshake(bridge: Arc<Bridge>, handle: Arc<SessionHandle>) {
    let deadline = tokio::time::Instant::now() + bridge.config.handshake_timeout();
    match handshake_steps(&bridge, &handle, deadline).await {
        Ok(agent_session_id) => {
            if handle.status() != Status::Initializing {
                // Raced with cancel or exit; leave the recorded state alone.
                return;
            }
            if let Err(err) = bridge.store.set_agent_session_id(&handle.id, &agent_session_id) {
                warn!(%err, session = handle.id, "failed to persist agent session id");
            }
            handle.set_status(Status::Running);
            if let Err(err) = bridge.store.set_status(&handle.id, Status::Running) {
                warn!(%err, session = handle.id, "failed to persist running status");
            }
            let _ = append_and_publish(
                &bridge,
                &handle,
                "status_changed",
                json!({ "sessionUpdate": "status_changed", "status": "running" }),
            )
            .await;
            publish_status(&bridge, &handle, Status::Running, None);
            handle.set_handshake(Handshake::Ready(agent_session_id.clone()));
            info!(session = handle.id, agent_session_id, "handshake complete");
        }
        Err(reason) => {
            if handle.status().is_terminal() || handle.status() == Status::Completed {
                return;
            }
            warn!(session = handle.id, reason, "handshake failed");
            if let Err(err) = bridge.store.set_error(&handle.id, reason) {
                warn!(%err, session = handle.id, "failed to persist error status");
            }
            handle.set_status(Status::Error);
            handle.set_handshake(Handshake::Failed);
            let _ = append_and_publish(
                &bridge,
                &handle,
                "status_changed",
                json!({
                    "sessionUpdate": "status_changed",
                    "status": "error",
                    "exitReason": reason,
                }),
            )
            .await;
            publish_status(&bridge, &handle, Status::Error, Some(reason));
            handle.agent.kill();
            bridge.registry.fail_session(&handle.id, RegistryError::SessionTerminated);
        }
    }
}

async fn handshake_steps(
    bridge: &Bridge,
    handle: &SessionHandle,
    deadline: tokio::time::Instant,
) -> Result<String, &'static str> {
    handshake_request(
        bridge,
        handle,
        "initialize",
        json!({ "protocolVersion": 1, "capabilities": {} }),
        deadline,
    )
    .await?;

    let reply = handshake_request(
        bridge,
        handle,
        "session/new",
        json!({ "cwd": handle.cwd, "mcpServers": [] }),
        deadline,
    )
    .await?;

    reply
        .get("sessionId")
        .and_then(Value::as_str)
        .map(ToOwned::to_owned)
        .ok_or("handshake_missing_session_id")
}

async fn handshake_request(
    bridge: &Bridge,
    handle: &SessionHandle,
    method: &str,
    params: Value,
    deadline: tokio::time::Instant,
) -> Result<Value, &'static str> {
    let (bridge_id, rx) = bridge.registry.register_handshake_wait(&handle.id);
    let frame = rpc::request(&RpcId::from(bridge_id), method, params);
    if handle.agent.send(frame).await.is_err() {
        bridge.registry.discard(bridge_id);
        return Err("io_error");
    }
    match tokio::time::timeout_at(deadline, rx).await {
        Ok(Ok(RequestOutcome::Reply(Ok(value)))) => Ok(value),
        Ok(Ok(RequestOutcome::Reply(Err(_)))) => Err("handshake_error"),
        Ok(Ok(RequestOutcome::Failed(_))) => Err("session_terminated"),
        Ok(Err(_)) => Err("session_terminated"),
        Err(_) => {
            bridge.registry.discard(bridge_id);
            Err("handshake_timeout")
        }
    }
}

async fn handle_frame(bridge: &Arc<Bridge>, handle: &Arc<SessionHandle>, frame: Value) {
    if handle.status().is_terminal() {
        return;
    }
    match rpc::classify(&frame) {
        Ok(Inbound::Response { id, result }) => {
            if !bridge.registry.resolve(&id, result) {
                debug!(session = handle.id, "unmatched agent reply");
            }
        }
        Ok(Inbound::Request { id, method, params }) => {
            handle_agent_request(bridge, handle, id, method, params).await;
        }
        Ok(Inbound::Notification { method, params }) => {
            if method == "session/update" {
                handle_update(bridge, handle, params).await;
            } else {
                debug!(session = handle.id, method, "ignoring agent notification");
            }
        }
        Err(_) => debug!(session = handle.id, "dropping unclassifiable agent frame"),
    }
}

/// `session/update`: append one event typed by the update's discriminator,
/// preserving the update object byte-for-byte as the payload.
async fn handle_update(bridge: &Arc<Bridge>, handle: &Arc<SessionHandle>, params: Value) {
    let Some(update) = params.get("update").filter(|u| u.is_object()).cloned() else {
        debug!(session = handle.id, "session/update without update object");
        return;
    };
    let update_type = update
        .get("sessionUpdate")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_owned();
    if let Err(err) = append_and_publish(bridge, handle, &update_type, update).await {
        warn!(%err, session = handle.id, "failed to append agent update");
    }
}

/// An agent request parks until a client responds; the session waits.
async fn handle_agent_request(
    bridge: &Arc<Bridge>,
    handle: &Arc<SessionHandle>,
    id: RpcId,
    method: String,
    params: Value,
) {
    if let Err(err) = bridge.store.add_pending(&handle.id, &id, &method, &params) {
        warn!(%err, session = handle.id, "failed to persist pending request");
    }
    bridge.registry.add_agent_request(&handle.id, id.clone(), &method);

    if handle.status() == Status::Running {
        handle.set_status(Status::Waiting);
        if let Err(err) = bridge.store.set_status(&handle.id, Status::Waiting) {
            warn!(%err, session = handle.id, "failed to persist waiting status");
        }
        publish_status(bridge, handle, Status::Waiting, None);
    }

    if !handle.archived() {
        bridge.broker.publish(
            &handle.id,
            "session/request",
            json!({ "sessionId": handle.id, "requestId": id, "request": params }),
        );
    }

    spawn_request_expiry(Arc::clone(bridge), Arc::clone(handle), id);
}

/// Deadline for a parked agent request: on expiry the agent gets a timeout
/// error reply and the pending record is dropped.
fn spawn_request_expiry(bridge: Arc<Bridge>, handle: Arc<SessionHandle>, id: RpcId) {
    let timeout = bridge.config.request_timeout();
    tokio::spawn(async move {
        tokio::select! {
            _ = handle.stop.cancelled() => {}
            _ = tokio::time::sleep(timeout) => {
                let Some(entry) = bridge.registry.take_agent_request(&handle.id, &id) else {
                    return;
                };
                let _ = bridge.store.delete_pending(&handle.id, &entry.id);
                let failure = RpcFailure::new(ErrorCode::Timeout, "request timed out");
                let _ = handle.agent.send(rpc::err_response(Some(&entry.id), &failure)).await;
                maybe_resume_running(&bridge, &handle).await;
            }
        }
    });
}

/// Subprocess exit: terminal for the session, resolves every waiter.
async fn on_exit(bridge: &Arc<Bridge>, handle: &Arc<SessionHandle>, cause: ExitCause) {
    handle.stop.cancel();

    if !handle.status().is_terminal() {
        let reason = cause.reason();
        if let Err(err) = bridge.store.set_exited(&handle.id, reason) {
            warn!(%err, session = handle.id, "failed to persist exited status");
        }
        handle.set_status(Status::Exited);
        let _ = append_and_publish(
            bridge,
            handle,
            "status_changed",
            json!({
                "sessionUpdate": "status_changed",
                "status": "exited",
                "exitReason": reason,
            }),
        )
        .await;
        publish_status(bridge, handle, Status::Exited, Some(reason));
    }

    handle.fail_handshake_if_pending();
    let parked = bridge.registry.fail_session(&handle.id, RegistryError::SessionTerminated);
    for request in parked {
        let _ = bridge.store.delete_pending(&handle.id, &request.id);
    }
    let _ = bridge.store.clear_pending(&handle.id);
    bridge.sessions.write().await.remove(&handle.id);
    info!(session = handle.id, cause = cause.reason(), "session closed");
}
