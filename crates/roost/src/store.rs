// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Durable store for sessions, their ordered event logs, and open
//! permission requests.
//!
//! One SQLite connection in WAL mode behind a mutex. The connection lock
//! plus single-statement seq allocation give per-session append
//! serialization; the composite primary keys enforce `(session_id, seq)`
//! and `(session_id, request_id)` uniqueness in the store itself.

use std::path::Path;

use anyhow::Context;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use crate::rpc::RpcId;
use crate::session::Status;

pub struct EventStore {
    conn: Mutex<Connection>,
}

/// A session row as persisted.
#[derive(Debug, Clone)]
pub struct SessionRow {
    pub id: String,
    pub agent_type: String,
    pub cwd: String,
    pub title: String,
    pub agent_session_id: Option<String>,
    pub status: Status,
    pub exit_reason: Option<String>,
    pub archived: bool,
    pub created_at: u64,
    pub updated_at: u64,
}

/// One immutable record in a session's ordered log.
#[derive(Debug, Clone)]
pub struct EventRow {
    pub session_id: String,
    pub seq: u64,
    pub update_type: String,
    pub payload: Value,
    pub created_at: u64,
}

/// A live agent request awaiting a client reply.
#[derive(Debug, Clone)]
pub struct PendingRow {
    pub session_id: String,
    pub request_id: RpcId,
    pub kind: String,
    pub payload: Value,
    pub created_at: u64,
}

/// Filters for [`EventStore::list_sessions`].
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub archived: Option<bool>,
    pub status: Option<Vec<Status>>,
}

impl EventStore {
    /// Open (creating if needed) the store at `path`. `:memory:` works for
    /// tests.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create store directory {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("open store at {}", path.display()))?;
        // journal_mode answers with the resulting mode, so read it back.
        let _mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .context("enable WAL")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                agent_type TEXT NOT NULL,
                cwd TEXT NOT NULL,
                title TEXT NOT NULL,
                agent_session_id TEXT,
                status TEXT NOT NULL,
                exit_reason TEXT,
                archived INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS events (
                session_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                update_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (session_id, seq)
            );
            CREATE TABLE IF NOT EXISTS pending_requests (
                session_id TEXT NOT NULL,
                request_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (session_id, request_id)
            );",
        )
        .context("create schema")?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn create_session(
        &self,
        id: &str,
        agent_type: &str,
        cwd: &str,
        title: &str,
    ) -> anyhow::Result<()> {
        let now = now_ms();
        self.conn.lock().execute(
            "INSERT INTO sessions (id, agent_type, cwd, title, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![id, agent_type, cwd, title, Status::Initializing.as_str(), now as i64],
        )?;
        Ok(())
    }

    pub fn set_status(&self, id: &str, status: Status) -> anyhow::Result<()> {
        self.conn.lock().execute(
            "UPDATE sessions SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, status.as_str(), now_ms() as i64],
        )?;
        Ok(())
    }

    /// Record the agent's own session id. Once set it is immutable; a second
    /// call is a no-op.
    pub fn set_agent_session_id(&self, id: &str, agent_session_id: &str) -> anyhow::Result<()> {
        self.conn.lock().execute(
            "UPDATE sessions SET agent_session_id = ?2, updated_at = ?3
             WHERE id = ?1 AND agent_session_id IS NULL",
            params![id, agent_session_id, now_ms() as i64],
        )?;
        Ok(())
    }

    pub fn set_title(&self, id: &str, title: &str) -> anyhow::Result<()> {
        self.conn.lock().execute(
            "UPDATE sessions SET title = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, title, now_ms() as i64],
        )?;
        Ok(())
    }

    pub fn set_exited(&self, id: &str, reason: &str) -> anyhow::Result<()> {
        self.set_terminal(id, Status::Exited, reason)
    }

    pub fn set_error(&self, id: &str, reason: &str) -> anyhow::Result<()> {
        self.set_terminal(id, Status::Error, reason)
    }

    fn set_terminal(&self, id: &str, status: Status, reason: &str) -> anyhow::Result<()> {
        self.conn.lock().execute(
            "UPDATE sessions SET status = ?2, exit_reason = ?3, updated_at = ?4 WHERE id = ?1",
            params![id, status.as_str(), reason, now_ms() as i64],
        )?;
        Ok(())
    }

    /// Soft-delete. Returns false if the session does not exist.
    pub fn archive(&self, id: &str) -> anyhow::Result<bool> {
        let changed = self.conn.lock().execute(
            "UPDATE sessions SET archived = 1, updated_at = ?2 WHERE id = ?1",
            params![id, now_ms() as i64],
        )?;
        Ok(changed > 0)
    }

    /// Allocate the next seq for the session and insert the event, atomically
    /// with respect to other appends on the same session.
    pub fn append_event(
        &self,
        session_id: &str,
        update_type: &str,
        payload: &Value,
    ) -> anyhow::Result<u64> {
        let payload = serde_json::to_string(payload)?;
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let seq: i64 = tx.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM events WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT INTO events (session_id, seq, update_type, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![session_id, seq, update_type, payload, now_ms() as i64],
        )?;
        tx.commit()?;
        Ok(seq as u64)
    }

    pub fn get_session(&self, id: &str) -> anyhow::Result<Option<SessionRow>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT id, agent_type, cwd, title, agent_session_id, status, exit_reason,
                        archived, created_at, updated_at
                 FROM sessions WHERE id = ?1",
                params![id],
                row_to_session,
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_sessions(&self, filter: &SessionFilter) -> anyhow::Result<Vec<SessionRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, agent_type, cwd, title, agent_session_id, status, exit_reason,
                    archived, created_at, updated_at
             FROM sessions ORDER BY created_at DESC, id DESC",
        )?;
        let rows = stmt
            .query_map([], row_to_session)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .filter(|s| filter.archived.map(|a| s.archived == a).unwrap_or(true))
            .filter(|s| {
                filter.status.as_ref().map(|wanted| wanted.contains(&s.status)).unwrap_or(true)
            })
            .collect())
    }

    /// Events with `seq > since_seq`, in seq order.
    pub fn list_events(&self, session_id: &str, since_seq: u64) -> anyhow::Result<Vec<EventRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT session_id, seq, update_type, payload, created_at
             FROM events WHERE session_id = ?1 AND seq > ?2 ORDER BY seq",
        )?;
        let rows = stmt
            .query_map(params![session_id, since_seq as i64], row_to_event)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn last_seq(&self, session_id: &str) -> anyhow::Result<u64> {
        let seq: i64 = self.conn.lock().query_row(
            "SELECT COALESCE(MAX(seq), 0) FROM events WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;
        Ok(seq as u64)
    }

    pub fn add_pending(
        &self,
        session_id: &str,
        request_id: &RpcId,
        kind: &str,
        payload: &Value,
    ) -> anyhow::Result<()> {
        let request_id = serde_json::to_string(request_id)?;
        let payload = serde_json::to_string(payload)?;
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO pending_requests
                 (session_id, request_id, kind, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![session_id, request_id, kind, payload, now_ms() as i64],
        )?;
        Ok(())
    }

    pub fn delete_pending(&self, session_id: &str, request_id: &RpcId) -> anyhow::Result<bool> {
        let request_id = serde_json::to_string(request_id)?;
        let changed = self.conn.lock().execute(
            "DELETE FROM pending_requests WHERE session_id = ?1 AND request_id = ?2",
            params![session_id, request_id],
        )?;
        Ok(changed > 0)
    }

    pub fn clear_pending(&self, session_id: &str) -> anyhow::Result<u64> {
        let changed = self
            .conn
            .lock()
            .execute("DELETE FROM pending_requests WHERE session_id = ?1", params![session_id])?;
        Ok(changed as u64)
    }

    pub fn list_pending(&self, session_id: &str) -> anyhow::Result<Vec<PendingRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT session_id, request_id, kind, payload, created_at
             FROM pending_requests WHERE session_id = ?1 ORDER BY created_at",
        )?;
        let rows = stmt
            .query_map(params![session_id], row_to_pending)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Startup recovery: sessions a previous process left active lost their
    /// subprocess with it, so mark them exited. Returns how many changed.
    pub fn mark_stale_sessions_exited(&self) -> anyhow::Result<u64> {
        let changed = self.conn.lock().execute(
            "UPDATE sessions SET status = ?1, exit_reason = ?2, updated_at = ?3
             WHERE status IN (?4, ?5, ?6)",
            params![
                Status::Exited.as_str(),
                "process_exit",
                now_ms() as i64,
                Status::Initializing.as_str(),
                Status::Running.as_str(),
                Status::Waiting.as_str(),
            ],
        )?;
        Ok(changed as u64)
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRow> {
    let status: String = row.get(5)?;
    let status = Status::parse(&status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            5,
            rusqlite::types::Type::Text,
            format!("unknown status: {status}").into(),
        )
    })?;
    Ok(SessionRow {
        id: row.get(0)?,
        agent_type: row.get(1)?,
        cwd: row.get(2)?,
        title: row.get(3)?,
        agent_session_id: row.get(4)?,
        status,
        exit_reason: row.get(6)?,
        archived: row.get::<_, i64>(7)? != 0,
        created_at: row.get::<_, i64>(8)? as u64,
        updated_at: row.get::<_, i64>(9)? as u64,
    })
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<EventRow> {
    let payload: String = row.get(3)?;
    let payload = serde_json::from_str(&payload).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(EventRow {
        session_id: row.get(0)?,
        seq: row.get::<_, i64>(1)? as u64,
        update_type: row.get(2)?,
        payload,
        created_at: row.get::<_, i64>(4)? as u64,
    })
}

fn row_to_pending(row: &rusqlite::Row<'_>) -> rusqlite::Result<PendingRow> {
    let request_id: String = row.get(1)?;
    let request_id = serde_json::from_str(&request_id).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let payload: String = row.get(3)?;
    let payload = serde_json::from_str(&payload).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(PendingRow {
        session_id: row.get(0)?,
        request_id,
        kind: row.get(2)?,
        payload,
        created_at: row.get::<_, i64>(4)? as u64,
    })
}

/// Current UTC time in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
