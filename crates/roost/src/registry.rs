// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-memory request correlation.
//!
//! Three tables, each scoped by the id space of its producer:
//! 1. client requests awaiting an agent reply, keyed by a fresh bridge id —
//!    never by the client's own id, so two clients reusing the same numeric
//!    id can never collide;
//! 2. agent requests awaiting a client response, keyed by the agent's id
//!    preserved verbatim for the reply path;
//! 3. handshake-internal requests, scoped to one session and purged with it.
//!
//! No entry outlives its session: termination sweeps resolve every waiter.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::ErrorCode;
use crate::rpc::{RpcErrorObject, RpcId};

/// Why a waiter was resolved without an agent reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    Timeout,
    SessionTerminated,
    ClientGone,
}

impl RegistryError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Timeout => ErrorCode::Timeout,
            Self::SessionTerminated => ErrorCode::SessionTerminated,
            Self::ClientGone => ErrorCode::ClientGone,
        }
    }
}

/// What a waiting request eventually receives.
#[derive(Debug)]
pub enum RequestOutcome {
    /// The agent replied (result or error object, relayed as-is).
    Reply(Result<Value, RpcErrorObject>),
    /// Resolved by the bridge: deadline, termination, or disconnect.
    Failed(RegistryError),
}

/// An agent request parked until a client responds.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    /// The agent's id, echoed exactly on the reply.
    pub id: RpcId,
    pub kind: String,
}

struct ClientWait {
    session_id: String,
    client_id: u64,
    tx: oneshot::Sender<RequestOutcome>,
}

struct HandshakeWait {
    session_id: String,
    tx: oneshot::Sender<RequestOutcome>,
}

#[derive(Default)]
struct Tables {
    client: HashMap<u64, ClientWait>,
    handshake: HashMap<u64, HandshakeWait>,
    agent: HashMap<String, Vec<AgentRequest>>,
}

#[derive(Default)]
pub struct RequestRegistry {
    next_bridge_id: AtomicU64,
    inner: Mutex<Tables>,
}

impl RequestRegistry {
    pub fn new() -> Self {
        Self { next_bridge_id: AtomicU64::new(1), inner: Mutex::default() }
    }

    fn next_id(&self) -> u64 {
        self.next_bridge_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Park a client request; the returned bridge id goes to the agent.
    pub fn register_client_wait(
        &self,
        session_id: &str,
        client_id: u64,
    ) -> (u64, oneshot::Receiver<RequestOutcome>) {
        let bridge_id = self.next_id();
        let (tx, rx) = oneshot::channel();
        self.inner.lock().client.insert(
            bridge_id,
            ClientWait { session_id: session_id.to_owned(), client_id, tx },
        );
        (bridge_id, rx)
    }

    /// Park a handshake-internal request.
    pub fn register_handshake_wait(
        &self,
        session_id: &str,
    ) -> (u64, oneshot::Receiver<RequestOutcome>) {
        let bridge_id = self.next_id();
        let (tx, rx) = oneshot::channel();
        self.inner
            .lock()
            .handshake
            .insert(bridge_id, HandshakeWait { session_id: session_id.to_owned(), tx });
        (bridge_id, rx)
    }

    /// Route an agent reply to whichever table holds the bridge id.
    pub fn resolve(&self, id: &RpcId, reply: Result<Value, RpcErrorObject>) -> bool {
        let RpcId::Num(n) = id else {
            return false;
        };
        let Ok(bridge_id) = u64::try_from(*n) else {
            return false;
        };
        let mut tables = self.inner.lock();
        if let Some(wait) = tables.handshake.remove(&bridge_id) {
            return wait.tx.send(RequestOutcome::Reply(reply)).is_ok();
        }
        if let Some(wait) = tables.client.remove(&bridge_id) {
            return wait.tx.send(RequestOutcome::Reply(reply)).is_ok();
        }
        false
    }

    /// Drop an entry whose holder gave up (e.g. its own deadline fired).
    pub fn discard(&self, bridge_id: u64) {
        let mut tables = self.inner.lock();
        tables.client.remove(&bridge_id);
        tables.handshake.remove(&bridge_id);
    }

    pub fn add_agent_request(&self, session_id: &str, id: RpcId, kind: &str) {
        self.inner
            .lock()
            .agent
            .entry(session_id.to_owned())
            .or_default()
            .push(AgentRequest { id, kind: kind.to_owned() });
    }

    /// Remove and return the parked agent request matching `id`, preferring
    /// an exact id match, then a numeric-string coercion match.
    pub fn take_agent_request(&self, session_id: &str, id: &RpcId) -> Option<AgentRequest> {
        let mut tables = self.inner.lock();
        let requests = tables.agent.get_mut(session_id)?;
        let position = requests
            .iter()
            .position(|r| r.id == *id)
            .or_else(|| requests.iter().position(|r| r.id.matches(id)))?;
        let request = requests.remove(position);
        if requests.is_empty() {
            tables.agent.remove(session_id);
        }
        Some(request)
    }

    /// Reply path for raw JSON-RPC responses (no `sessionId` in the frame):
    /// scan every session for a matching agent id.
    pub fn take_agent_request_any_session(&self, id: &RpcId) -> Option<(String, AgentRequest)> {
        let sessions: Vec<String> = self.inner.lock().agent.keys().cloned().collect();
        for session_id in sessions {
            if let Some(request) = self.take_agent_request(&session_id, id) {
                return Some((session_id, request));
            }
        }
        None
    }

    pub fn agent_request_count(&self, session_id: &str) -> usize {
        self.inner.lock().agent.get(session_id).map(Vec::len).unwrap_or(0)
    }

    /// Resolve every waiter tied to `session_id` and return the agent
    /// requests that were still parked, so the caller can clean up their
    /// persisted records.
    pub fn fail_session(&self, session_id: &str, error: RegistryError) -> Vec<AgentRequest> {
        let mut tables = self.inner.lock();
        let client: Vec<u64> = tables
            .client
            .iter()
            .filter(|(_, w)| w.session_id == session_id)
            .map(|(&id, _)| id)
            .collect();
        for id in client {
            if let Some(wait) = tables.client.remove(&id) {
                let _ = wait.tx.send(RequestOutcome::Failed(error));
            }
        }
        let handshake: Vec<u64> = tables
            .handshake
            .iter()
            .filter(|(_, w)| w.session_id == session_id)
            .map(|(&id, _)| id)
            .collect();
        for id in handshake {
            if let Some(wait) = tables.handshake.remove(&id) {
                let _ = wait.tx.send(RequestOutcome::Failed(error));
            }
        }
        tables.agent.remove(session_id).unwrap_or_default()
    }

    /// Resolve every client-originated wait held by a disconnected client.
    pub fn fail_client(&self, client_id: u64) {
        let mut tables = self.inner.lock();
        let ids: Vec<u64> = tables
            .client
            .iter()
            .filter(|(_, w)| w.client_id == client_id)
            .map(|(&id, _)| id)
            .collect();
        for id in ids {
            if let Some(wait) = tables.client.remove(&id) {
                let _ = wait.tx.send(RequestOutcome::Failed(RegistryError::ClientGone));
            }
        }
    }
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
