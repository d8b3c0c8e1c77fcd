// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! JSON-RPC 2.0 framing shared by the browser and agent sides.
//!
//! Request ids are numbers or strings and must be echoed back with their
//! original type, so [`RpcId`] carries both forms without coercion.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{ErrorCode, RpcFailure};

/// A JSON-RPC request id, preserved exactly as the peer sent it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcId {
    Num(i64),
    Str(String),
}

impl RpcId {
    /// Stable map key that keeps `42` and `"42"` distinct.
    pub fn key(&self) -> String {
        match self {
            Self::Num(n) => format!("n:{n}"),
            Self::Str(s) => format!("s:{s}"),
        }
    }

    /// Loose equality for correlating a client-supplied id with the agent's:
    /// a numeric-looking string matches the equivalent number.
    pub fn matches(&self, other: &RpcId) -> bool {
        if self == other {
            return true;
        }
        match (self, other) {
            (Self::Num(n), Self::Str(s)) | (Self::Str(s), Self::Num(n)) => {
                s.parse::<i64>().map(|p| p == *n).unwrap_or(false)
            }
            _ => false,
        }
    }
}

impl From<u64> for RpcId {
    fn from(n: u64) -> Self {
        Self::Num(n as i64)
    }
}

/// Error object from a peer's JSON-RPC error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl From<RpcErrorObject> for RpcFailure {
    fn from(err: RpcErrorObject) -> Self {
        RpcFailure::relayed(err.code, err.message)
    }
}

/// A classified inbound JSON-RPC message.
#[derive(Debug, Clone)]
pub enum Inbound {
    Request { id: RpcId, method: String, params: Value },
    Notification { method: String, params: Value },
    Response { id: RpcId, result: Result<Value, RpcErrorObject> },
}

/// Classify a parsed JSON value as a request, notification, or response.
///
/// Messages with an `id` and a `result`/`error` but no `method` are replies
/// (the permission path). Anything else malformed is an error.
pub fn classify(value: &Value) -> Result<Inbound, ErrorCode> {
    let obj = value.as_object().ok_or(ErrorCode::InvalidRequest)?;
    let id = match obj.get("id") {
        None | Some(Value::Null) => None,
        Some(v) => {
            Some(serde_json::from_value::<RpcId>(v.clone()).map_err(|_| ErrorCode::InvalidRequest)?)
        }
    };
    let method = obj.get("method").and_then(Value::as_str);

    match (id, method) {
        (Some(id), Some(method)) => Ok(Inbound::Request {
            id,
            method: method.to_owned(),
            params: obj.get("params").cloned().unwrap_or(Value::Null),
        }),
        (None, Some(method)) => Ok(Inbound::Notification {
            method: method.to_owned(),
            params: obj.get("params").cloned().unwrap_or(Value::Null),
        }),
        (Some(id), None) => {
            if let Some(err) = obj.get("error") {
                let err: RpcErrorObject =
                    serde_json::from_value(err.clone()).map_err(|_| ErrorCode::InvalidRequest)?;
                Ok(Inbound::Response { id, result: Err(err) })
            } else if let Some(result) = obj.get("result") {
                Ok(Inbound::Response { id, result: Ok(result.clone()) })
            } else {
                Err(ErrorCode::InvalidRequest)
            }
        }
        (None, None) => Err(ErrorCode::InvalidRequest),
    }
}

/// Build an outgoing request frame.
pub fn request(id: &RpcId, method: &str, params: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params })
}

/// Build an outgoing notification frame.
pub fn notification(method: &str, params: Value) -> Value {
    json!({ "jsonrpc": "2.0", "method": method, "params": params })
}

/// Build a success response echoing the peer's id.
pub fn ok_response(id: &RpcId, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

/// Build an error response. `id` is `None` when the request id is unknown
/// (e.g. a parse error), which JSON-RPC encodes as `null`.
pub fn err_response(id: Option<&RpcId>, failure: &RpcFailure) -> Value {
    let mut error = json!({ "code": failure.code, "message": failure.message });
    if let Some(kind) = failure.kind {
        error["data"] = json!({ "kind": kind.as_str() });
    }
    json!({ "jsonrpc": "2.0", "id": id, "error": error })
}

#[cfg(test)]
#[path = "rpc_tests.rs"]
mod tests;
