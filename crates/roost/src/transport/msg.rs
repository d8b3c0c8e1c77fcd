// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wire types for the browser-facing JSON-RPC surface.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::rpc::RpcId;
use crate::session::Status;
use crate::store::{EventRow, PendingRow, SessionFilter, SessionRow};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    pub agent_type: String,
    pub cwd: String,
    pub title: String,
    pub agent_session_id: Option<String>,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_reason: Option<String>,
    pub archived: bool,
    pub created_at: u64,
    pub updated_at: u64,
}

impl From<SessionRow> for SessionSummary {
    fn from(row: SessionRow) -> Self {
        Self {
            session_id: row.id,
            agent_type: row.agent_type,
            cwd: row.cwd,
            title: row.title,
            agent_session_id: row.agent_session_id,
            status: row.status.as_str().to_owned(),
            exit_reason: row.exit_reason,
            archived: row.archived,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// One replayed or pushed event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventWire {
    pub seq: u64,
    pub update_type: String,
    pub payload: Value,
    pub created_at: u64,
}

impl From<EventRow> for EventWire {
    fn from(row: EventRow) -> Self {
        Self {
            seq: row.seq,
            update_type: row.update_type,
            payload: row.payload,
            created_at: row.created_at,
        }
    }
}

/// A pending agent request awaiting a client reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingWire {
    pub request_id: RpcId,
    pub kind: String,
    pub request: Value,
    pub created_at: u64,
}

impl From<PendingRow> for PendingWire {
    fn from(row: PendingRow) -> Self {
        Self {
            request_id: row.request_id,
            kind: row.kind,
            request: row.payload,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListParams {
    #[serde(default)]
    pub archived: Option<bool>,
    #[serde(default)]
    pub status: Option<Vec<String>>,
}

impl ListParams {
    /// Unknown status names simply match nothing, like the source.
    pub fn filter(&self) -> SessionFilter {
        SessionFilter {
            archived: self.archived,
            status: self
                .status
                .as_ref()
                .map(|names| names.iter().filter_map(|s| Status::parse(s)).collect()),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewParams {
    #[serde(default)]
    pub agent_type: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetParams {
    pub session_id: String,
    #[serde(default)]
    pub since: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptParams {
    pub session_id: String,
    pub prompt: Vec<Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RespondParams {
    pub session_id: String,
    pub request_id: RpcId,
    pub response: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionIdParams {
    pub session_id: String,
}
