// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::broker::Broker;
use crate::config::Config;
use crate::registry::RequestRegistry;
use crate::session::SessionHandle;
use crate::store::EventStore;

/// Shared bridge state handed to every transport handler and session task.
pub struct Bridge {
    pub config: Config,
    pub store: EventStore,
    pub broker: Broker,
    pub registry: RequestRegistry,
    /// Sessions with a live subprocess. Terminal sessions live only in the
    /// store.
    pub sessions: RwLock<HashMap<String, Arc<SessionHandle>>>,
    pub shutdown: CancellationToken,
    pub started_at: Instant,
}

impl Bridge {
    pub fn new(config: Config, store: EventStore) -> Self {
        Self {
            config,
            store,
            broker: Broker::new(),
            registry: RequestRegistry::new(),
            sessions: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            started_at: Instant::now(),
        }
    }

    pub async fn live_session(&self, id: &str) -> Option<Arc<SessionHandle>> {
        self.sessions.read().await.get(id).cloned()
    }
}
