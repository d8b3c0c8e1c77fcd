// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session core: per-session state machine, client-facing operations, and
//! the glue between the store, the broker, and the agent subprocess.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::{self, AgentHandle};
use crate::broker::ClientId;
use crate::error::{ErrorCode, RpcFailure};
use crate::registry::{RegistryError, RequestOutcome};
use crate::rpc::{self, RpcErrorObject, RpcId};
use crate::state::Bridge;
use crate::store::{now_ms, EventRow, PendingRow, SessionFilter, SessionRow};

pub mod run;

/// Session status. `completed` (clean cancel) still owns a subprocess until
/// it exits; `error` and `exited` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Initializing,
    Running,
    Waiting,
    Completed,
    Error,
    Exited,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Waiting => "waiting",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Exited => "exited",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "initializing" => Some(Self::Initializing),
            "running" => Some(Self::Running),
            "waiting" => Some(Self::Waiting),
            "completed" => Some(Self::Completed),
            "error" => Some(Self::Error),
            "exited" => Some(Self::Exited),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error | Self::Exited)
    }
}

/// Handshake progress observed by `session/prompt` waiters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handshake {
    Pending,
    Ready(String),
    Failed,
}

/// A session with a live subprocess.
pub struct SessionHandle {
    pub id: String,
    pub cwd: String,
    pub agent: AgentHandle,
    status: parking_lot::RwLock<Status>,
    handshake: watch::Sender<Handshake>,
    archived: AtomicBool,
    /// Orders append+publish pairs so subscribers see events in seq order.
    append_lock: tokio::sync::Mutex<()>,
    /// Cancelled when the session closes; stops per-request timers.
    pub stop: CancellationToken,
}

impl SessionHandle {
    fn new(id: String, cwd: String, agent: AgentHandle) -> Arc<Self> {
        let (handshake, _) = watch::channel(Handshake::Pending);
        Arc::new(Self {
            id,
            cwd,
            agent,
            status: parking_lot::RwLock::new(Status::Initializing),
            handshake,
            archived: AtomicBool::new(false),
            append_lock: tokio::sync::Mutex::new(()),
            stop: CancellationToken::new(),
        })
    }

    pub fn status(&self) -> Status {
        *self.status.read()
    }

    pub fn set_status(&self, status: Status) {
        *self.status.write() = status;
    }

    pub fn archived(&self) -> bool {
        self.archived.load(Ordering::Acquire)
    }

    pub fn set_archived(&self) {
        self.archived.store(true, Ordering::Release);
    }

    pub fn handshake_rx(&self) -> watch::Receiver<Handshake> {
        self.handshake.subscribe()
    }

    pub fn agent_session_id(&self) -> Option<String> {
        match &*self.handshake.borrow() {
            Handshake::Ready(id) => Some(id.clone()),
            _ => None,
        }
    }

    pub(crate) fn set_handshake(&self, state: Handshake) {
        self.handshake.send_replace(state);
    }

    /// Resolve handshake waiters with failure, unless it already completed.
    pub(crate) fn fail_handshake_if_pending(&self) {
        self.handshake.send_if_modified(|state| {
            if *state == Handshake::Pending {
                *state = Handshake::Failed;
                true
            } else {
                false
            }
        });
    }
}

/// Bridge-assigned session id: epoch millis plus random suffix.
pub fn new_session_id() -> String {
    format!("{:x}-{:06x}", now_ms(), rand::random::<u32>() & 0xff_ffff)
}

/// Create a session: persist the row, spawn the agent, start the session
/// task, and subscribe the creator. Returns the new session id.
pub async fn create(
    bridge: &Arc<Bridge>,
    client: ClientId,
    agent_type: Option<String>,
    cwd: Option<String>,
    title: Option<String>,
) -> Result<String, RpcFailure> {
    let id = new_session_id();
    let cwd = bridge.config.resolve_cwd(cwd.as_deref());
    let cwd_text = cwd.to_string_lossy().into_owned();
    let agent_type = agent_type.unwrap_or_else(|| "agent".to_owned());
    let title = title.unwrap_or_else(|| format!("Session {id}"));

    bridge
        .store
        .create_session(&id, &agent_type, &cwd_text, &title)
        .map_err(|e| internal(&e))?;

    let io = match agent::spawn(&bridge.config.agent_command, &cwd, &[]) {
        Ok(io) => io,
        Err(err) => {
            warn!(%err, command = bridge.config.agent_command, "agent spawn failed");
            let _ = bridge.store.set_error(&id, "spawn_failed");
            return Err(RpcFailure::new(ErrorCode::SpawnFailed, "failed to spawn agent"));
        }
    };

    let handle = SessionHandle::new(id.clone(), cwd_text, io.handle);
    bridge.sessions.write().await.insert(id.clone(), Arc::clone(&handle));
    bridge.broker.subscribe(&id, client);
    tokio::spawn(run::session_task(Arc::clone(bridge), handle, io.frames, io.exited));

    info!(session = id, "session created");
    Ok(id)
}

pub async fn list(bridge: &Bridge, filter: &SessionFilter) -> Result<Vec<SessionRow>, RpcFailure> {
    bridge.store.list_sessions(filter).map_err(|e| internal(&e))
}

/// `session/get`: replay events since `since` and subscribe the caller
/// (archived sessions are readable but never re-subscribe).
pub async fn get(
    bridge: &Bridge,
    client: ClientId,
    session_id: &str,
    since: Option<u64>,
) -> Result<(SessionRow, Vec<EventRow>, Vec<PendingRow>), RpcFailure> {
    let row = bridge
        .store
        .get_session(session_id)
        .map_err(|e| internal(&e))?
        .ok_or_else(|| unknown_session(session_id))?;

    if !row.archived {
        bridge.broker.subscribe(session_id, client);
    }
    let events = bridge.store.list_events(session_id, since.unwrap_or(0)).map_err(|e| internal(&e))?;
    let pending = bridge.store.list_pending(session_id).map_err(|e| internal(&e))?;
    Ok((row, events, pending))
}

/// `session/prompt`: record the user turn, forward to the agent under a
/// fresh bridge id, and answer once the agent's prompt result arrives.
pub async fn prompt(
    bridge: &Arc<Bridge>,
    client: ClientId,
    session_id: &str,
    prompt: Vec<Value>,
) -> Result<Value, RpcFailure> {
    let handle = match bridge.live_session(session_id).await {
        Some(handle) => handle,
        None => return Err(gone_or_unknown(bridge, session_id)),
    };
    if handle.archived() {
        return Err(archived_session(session_id));
    }
    bridge.broker.subscribe(session_id, client);

    let agent_session_id = wait_for_handshake(bridge, &handle).await?;

    match handle.status() {
        Status::Running => {}
        Status::Waiting => {
            return Err(RpcFailure::new(
                ErrorCode::NotReady,
                "session is waiting on a pending request",
            ));
        }
        _ => {
            return Err(terminated_session("session is not running"));
        }
    }

    for block in &prompt {
        append_and_publish(
            bridge,
            &handle,
            "user_message_chunk",
            json!({ "sessionUpdate": "user_message_chunk", "content": block }),
        )
        .await
        .map_err(|e| internal(&e))?;
    }

    let (bridge_id, rx) = bridge.registry.register_client_wait(session_id, client);
    let frame = rpc::request(
        &RpcId::from(bridge_id),
        "session/prompt",
        json!({ "sessionId": agent_session_id, "prompt": prompt }),
    );
    if handle.agent.send(frame).await.is_err() {
        bridge.registry.discard(bridge_id);
        return Err(RpcFailure::new(ErrorCode::IoError, "agent pipe closed"));
    }

    match tokio::time::timeout(bridge.config.request_timeout(), rx).await {
        Ok(Ok(RequestOutcome::Reply(Ok(_result)))) => Ok(json!({ "success": true })),
        Ok(Ok(RequestOutcome::Reply(Err(err)))) => Err(RpcFailure::from(err)),
        Ok(Ok(RequestOutcome::Failed(err))) => {
            Err(RpcFailure::new(err.code(), "prompt interrupted"))
        }
        Ok(Err(_)) => Err(RpcFailure::new(ErrorCode::Internal, "prompt wait dropped")),
        Err(_) => {
            bridge.registry.discard(bridge_id);
            Err(RpcFailure::new(ErrorCode::Timeout, "agent did not answer the prompt"))
        }
    }
}

/// `session/respond`: forward a client's reply to a parked agent request,
/// echoing the agent's original id.
pub async fn respond(
    bridge: &Arc<Bridge>,
    session_id: &str,
    request_id: RpcId,
    response: Value,
) -> Result<Value, RpcFailure> {
    let handle = match bridge.live_session(session_id).await {
        Some(handle) => handle,
        None => return Err(gone_or_unknown(bridge, session_id)),
    };
    if handle.archived() {
        return Err(archived_session(session_id));
    }

    let entry = bridge
        .registry
        .take_agent_request(session_id, &request_id)
        .ok_or_else(|| RpcFailure::new(ErrorCode::NotFound, "no such pending request"))?;

    if let Err(err) = bridge.store.delete_pending(session_id, &entry.id) {
        warn!(%err, session = session_id, "failed to delete pending record");
    }

    let frame = rpc::ok_response(&entry.id, response);
    if handle.agent.send(frame).await.is_err() {
        return Err(RpcFailure::new(ErrorCode::IoError, "agent pipe closed"));
    }

    maybe_resume_running(bridge, &handle).await;
    Ok(json!({ "success": true }))
}

/// Raw JSON-RPC reply from a client (a response frame with no method):
/// correlate by the agent's id across sessions and forward verbatim.
pub async fn respond_raw(bridge: &Arc<Bridge>, id: &RpcId, reply: Result<Value, RpcErrorObject>) {
    let Some((session_id, entry)) = bridge.registry.take_agent_request_any_session(id) else {
        return;
    };
    let Some(handle) = bridge.live_session(&session_id).await else {
        return;
    };
    if let Err(err) = bridge.store.delete_pending(&session_id, &entry.id) {
        warn!(%err, session = session_id, "failed to delete pending record");
    }
    let frame = match reply {
        Ok(result) => rpc::ok_response(&entry.id, result),
        Err(err) => json!({ "jsonrpc": "2.0", "id": entry.id, "error": err }),
    };
    let _ = handle.agent.send(frame).await;
    maybe_resume_running(bridge, &handle).await;
}

/// `session/cancel`: point-in-time signal. The agent may emit a few more
/// events before honouring it; those still flow.
pub async fn cancel(bridge: &Arc<Bridge>, session_id: &str) -> Result<Value, RpcFailure> {
    let handle = match bridge.live_session(session_id).await {
        Some(handle) => handle,
        None => return Err(gone_or_unknown(bridge, session_id)),
    };
    if handle.archived() {
        return Err(archived_session(session_id));
    }

    if let Some(agent_session_id) = handle.agent_session_id() {
        let notif = rpc::notification("session/cancel", json!({ "sessionId": agent_session_id }));
        let _ = handle.agent.send(notif).await;
    }

    if !handle.status().is_terminal() && handle.status() != Status::Completed {
        handle.set_status(Status::Completed);
        if let Err(err) = bridge.store.set_status(session_id, Status::Completed) {
            warn!(%err, session = session_id, "failed to persist completed status");
        }
        publish_status(bridge, &handle, Status::Completed, None);
    }
    handle.fail_handshake_if_pending();

    let parked = bridge.registry.fail_session(session_id, RegistryError::SessionTerminated);
    for request in parked {
        let _ = bridge.store.delete_pending(session_id, &request.id);
    }
    let _ = bridge.store.clear_pending(session_id);

    Ok(json!({ "success": true }))
}

/// `session/archive`: soft-delete and silence all pushes for the session.
pub async fn archive(bridge: &Arc<Bridge>, session_id: &str) -> Result<Value, RpcFailure> {
    let found = bridge.store.archive(session_id).map_err(|e| internal(&e))?;
    if !found {
        return Err(unknown_session(session_id));
    }
    if let Some(handle) = bridge.live_session(session_id).await {
        handle.set_archived();
    }
    bridge.broker.unsubscribe_session(session_id);
    Ok(json!({ "success": true }))
}

/// Block until the handshake resolves, bounded by the handshake timeout.
async fn wait_for_handshake(
    bridge: &Bridge,
    handle: &SessionHandle,
) -> Result<String, RpcFailure> {
    let mut rx = handle.handshake_rx();
    let wait = async {
        loop {
            let state = rx.borrow_and_update().clone();
            match state {
                Handshake::Ready(id) => return Ok(id),
                Handshake::Failed => {
                    return Err(terminated_session("session failed before handshake completed"));
                }
                Handshake::Pending => {}
            }
            if rx.changed().await.is_err() {
                return Err(terminated_session("session closed"));
            }
        }
    };
    match tokio::time::timeout(bridge.config.handshake_timeout(), wait).await {
        Ok(result) => result,
        Err(_) => Err(RpcFailure::new(ErrorCode::Timeout, "handshake did not complete in time")),
    }
}

/// Append an event and fan it out, holding the session's append lock so
/// publish order always matches seq order.
pub(crate) async fn append_and_publish(
    bridge: &Bridge,
    handle: &SessionHandle,
    update_type: &str,
    payload: Value,
) -> anyhow::Result<u64> {
    let _guard = handle.append_lock.lock().await;
    let seq = bridge.store.append_event(&handle.id, update_type, &payload)?;
    if !handle.archived() {
        bridge.broker.publish(
            &handle.id,
            "session/updated",
            json!({
                "sessionId": handle.id,
                "updates": [{ "seq": seq, "updateType": update_type, "payload": payload }],
            }),
        );
    }
    Ok(seq)
}

/// Push a `session/status_changed` notification unless the session is
/// archived.
pub(crate) fn publish_status(
    bridge: &Bridge,
    handle: &SessionHandle,
    status: Status,
    exit_reason: Option<&str>,
) {
    if handle.archived() {
        return;
    }
    let mut params = json!({ "sessionId": handle.id, "status": status.as_str() });
    if let Some(reason) = exit_reason {
        params["exitReason"] = json!(reason);
    }
    bridge.broker.publish(&handle.id, "session/status_changed", params);
}

/// Return to `running` once the last parked agent request is resolved.
pub(crate) async fn maybe_resume_running(bridge: &Bridge, handle: &SessionHandle) {
    if bridge.registry.agent_request_count(&handle.id) == 0 && handle.status() == Status::Waiting {
        handle.set_status(Status::Running);
        if let Err(err) = bridge.store.set_status(&handle.id, Status::Running) {
            warn!(%err, session = handle.id, "failed to persist running status");
        }
        publish_status(bridge, handle, Status::Running, None);
    }
}

fn internal(err: &anyhow::Error) -> RpcFailure {
    warn!(%err, "internal error");
    RpcFailure::new(ErrorCode::Internal, "internal error")
}

fn unknown_session(session_id: &str) -> RpcFailure {
    RpcFailure::new(ErrorCode::NotFound, format!("unknown session: {session_id}"))
}

/// Archived sessions are read-only forever.
fn archived_session(session_id: &str) -> RpcFailure {
    RpcFailure::new(ErrorCode::NotFound, format!("session is archived: {session_id}"))
}

/// A known session that can no longer be operated on. The method tables
/// pin these errors to the invalid-params code; the kind keeps the cause.
fn terminated_session(message: &str) -> RpcFailure {
    RpcFailure::kinded(
        ErrorCode::InvalidParams.json_rpc_code(),
        ErrorCode::SessionTerminated,
        message,
    )
}

/// A session without a live subprocess is either terminal or unknown.
fn gone_or_unknown(bridge: &Bridge, session_id: &str) -> RpcFailure {
    match bridge.store.get_session(session_id) {
        Ok(Some(_)) => terminated_session("session is no longer active"),
        _ => unknown_session(session_id),
    }
}

#[cfg(test)]
#[path = "../session_tests.rs"]
mod tests;
