// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Pub/sub between sessions and WebSocket clients.
//!
//! A session maps to a *set* of subscribed clients — a session never has a
//! distinguished current client, so two tabs watching the same session both
//! receive every event. Subscription is implicit (`session/new`,
//! `session/get`, `session/prompt`) and ends with the connection.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::rpc;

pub type ClientId = u64;

#[derive(Default)]
struct Inner {
    clients: HashMap<ClientId, mpsc::UnboundedSender<String>>,
    subs: HashMap<String, HashSet<ClientId>>,
}

#[derive(Default)]
pub struct Broker {
    next_client_id: AtomicU64,
    inner: Mutex<Inner>,
}

impl Broker {
    pub fn new() -> Self {
        Self { next_client_id: AtomicU64::new(1), inner: Mutex::default() }
    }

    /// Register a connection. The sender is the connection's outbound queue
    /// (shared by responses and notifications); the receiver is drained by
    /// its write task.
    pub fn register_client(
        &self,
    ) -> (ClientId, mpsc::UnboundedSender<String>, mpsc::UnboundedReceiver<String>) {
        let id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().clients.insert(id, tx.clone());
        (id, tx, rx)
    }

    /// Drop a disconnected client from every subscription set.
    pub fn remove_client(&self, client: ClientId) {
        let mut inner = self.inner.lock();
        inner.clients.remove(&client);
        for subs in inner.subs.values_mut() {
            subs.remove(&client);
        }
        inner.subs.retain(|_, subs| !subs.is_empty());
    }

    pub fn subscribe(&self, session_id: &str, client: ClientId) {
        self.inner.lock().subs.entry(session_id.to_owned()).or_default().insert(client);
    }

    /// Drop every subscription for a session (archival).
    pub fn unsubscribe_session(&self, session_id: &str) {
        self.inner.lock().subs.remove(session_id);
    }

    /// Best-effort broadcast of one notification to the session's
    /// subscribers. Serialized once; send failures drop the subscriber but
    /// never fail the publish.
    pub fn publish(&self, session_id: &str, method: &str, params: Value) {
        let frame = rpc::notification(method, params);
        let Ok(text) = serde_json::to_string(&frame) else {
            return;
        };

        let mut inner = self.inner.lock();
        let Some(subs) = inner.subs.get(session_id) else {
            return;
        };
        let mut dead = Vec::new();
        for &client in subs {
            let delivered = inner
                .clients
                .get(&client)
                .map(|tx| tx.send(text.clone()).is_ok())
                .unwrap_or(false);
            if !delivered {
                dead.push(client);
            }
        }
        for client in dead {
            debug!(client, session_id, "dropping dead subscriber");
            inner.clients.remove(&client);
            for subs in inner.subs.values_mut() {
                subs.remove(&client);
            }
        }
        inner.subs.retain(|_, subs| !subs.is_empty());
    }

    pub fn client_count(&self) -> usize {
        self.inner.lock().clients.len()
    }

    pub fn subscriber_count(&self, session_id: &str) -> usize {
        self.inner.lock().subs.get(session_id).map(HashSet::len).unwrap_or(0)
    }
}

#[cfg(test)]
#[path = "broker_tests.rs"]
mod tests;
