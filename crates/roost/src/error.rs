// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::fmt;

use serde::{Deserialize, Serialize};

/// Error kinds surfaced to clients and recorded on sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    Parse,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    NotFound,
    NotReady,
    Timeout,
    SpawnFailed,
    IoError,
    SessionTerminated,
    ClientGone,
    Internal,
}

impl ErrorCode {
    /// JSON-RPC 2.0 numeric code. The `-327xx` range follows the standard;
    /// the `-320xx` range is server-defined. Unknown-session, not-ready,
    /// and parameter errors all answer with the invalid-params code; the
    /// kind in `error.data` keeps them distinguishable.
    pub fn json_rpc_code(&self) -> i64 {
        match self {
            Self::Parse => -32700,
            Self::InvalidRequest => -32600,
            Self::MethodNotFound => -32601,
            Self::InvalidParams => -32602,
            Self::NotFound => -32602,
            Self::NotReady => -32602,
            Self::Timeout => -32002,
            Self::SpawnFailed => -32603,
            Self::IoError => -32004,
            Self::SessionTerminated => -32005,
            Self::ClientGone => -32006,
            Self::Internal => -32603,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Parse => "parse",
            Self::InvalidRequest => "invalid_request",
            Self::MethodNotFound => "method_not_found",
            Self::InvalidParams => "invalid_params",
            Self::NotFound => "not_found",
            Self::NotReady => "not_ready",
            Self::Timeout => "timeout",
            Self::SpawnFailed => "spawn_failed",
            Self::IoError => "io_error",
            Self::SessionTerminated => "session_terminated",
            Self::ClientGone => "client_gone",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::error::Error for ErrorCode {}

/// A failure carried back to a JSON-RPC caller: either a typed bridge error
/// or an error object relayed verbatim from the agent.
#[derive(Debug, Clone)]
pub struct RpcFailure {
    pub code: i64,
    pub message: String,
    pub kind: Option<ErrorCode>,
}

impl RpcFailure {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code: code.json_rpc_code(), message: message.into(), kind: Some(code) }
    }

    /// Relay an agent error object without reinterpreting it.
    pub fn relayed(code: i64, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), kind: None }
    }

    /// A kind pinned to a specific wire code, for methods whose error code
    /// is fixed regardless of the cause.
    pub fn kinded(code: i64, kind: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), kind: Some(kind) }
    }
}

impl From<ErrorCode> for RpcFailure {
    fn from(code: ErrorCode) -> Self {
        Self::new(code, code.as_str())
    }
}

impl fmt::Display for RpcFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

impl std::error::Error for RpcFailure {}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
