// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Scripted agent-protocol peer for integration tests.
//!
//! Speaks newline-delimited JSON-RPC on stdio. The first text block of a
//! prompt selects a script: `permission` brokers a permission request,
//! `die` exits without replying, `slow` never replies, `drip` streams
//! chunks slowly, anything else echoes one stubbed chunk.

use std::collections::HashMap;
use std::io::{BufRead, Write};

use serde_json::{json, Value};

fn main() {
    let stdin = std::io::stdin();
    let mut next_session = 0u64;
    let mut next_request = 1000i64;
    // Permission request id -> (prompt id, session id) awaiting its outcome.
    let mut open_permissions: HashMap<i64, (Value, String)> = HashMap::new();

    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        let Ok(msg) = serde_json::from_str::<Value>(&line) else {
            continue;
        };

        let id = msg.get("id").cloned().filter(|v| !v.is_null());
        let method = msg.get("method").and_then(Value::as_str).unwrap_or_default();

        match (id, method) {
            (Some(id), "initialize") => {
                reply(&id, json!({ "protocolVersion": 1, "agentCapabilities": {} }));
            }
            (Some(id), "session/new") => {
                next_session += 1;
                reply(&id, json!({ "sessionId": format!("stub-{next_session}") }));
            }
            (Some(id), "session/prompt") => {
                let params = msg.get("params").cloned().unwrap_or(Value::Null);
                let session = params
                    .get("sessionId")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned();
                let text = params["prompt"][0]["text"].as_str().unwrap_or_default().to_owned();
                match text.as_str() {
                    "die" => std::process::exit(1),
                    "slow" => {}
                    "permission" => {
                        next_request += 1;
                        open_permissions.insert(next_request, (id, session.clone()));
                        request(
                            next_request,
                            "session/request_permission",
                            json!({
                                "sessionId": session,
                                "toolCall": { "toolCallId": "tool-1", "title": "touch a file" },
                                "options": [
                                    { "optionId": "allow", "kind": "allow_once" },
                                    { "optionId": "deny", "kind": "reject_once" },
                                ],
                            }),
                        );
                    }
                    "drip" => {
                        for i in 1..=5 {
                            chunk(&session, &format!("drip-{i}"));
                            std::thread::sleep(std::time::Duration::from_millis(120));
                        }
                        reply(&id, json!({ "stopReason": "end_turn" }));
                    }
                    _ => {
                        chunk(&session, "stubbed response");
                        reply(&id, json!({ "stopReason": "end_turn" }));
                    }
                }
            }
            (Some(id), "") => {
                // A response: resolve an open permission request.
                let Some(perm_id) = id.as_i64() else { continue };
                let Some((prompt_id, session)) = open_permissions.remove(&perm_id) else {
                    continue;
                };
                let outcome = &msg["result"]["outcome"];
                let selected = outcome["outcome"] == "selected";
                let option = outcome["optionId"].as_str().unwrap_or_default();
                if selected && option == "allow" {
                    chunk(&session, "permission granted");
                    reply(&prompt_id, json!({ "stopReason": "end_turn" }));
                } else if selected {
                    chunk(&session, "permission denied");
                    reply(&prompt_id, json!({ "stopReason": "refusal" }));
                } else {
                    reply(&prompt_id, json!({ "stopReason": "cancelled" }));
                }
            }
            (Some(id), other) => {
                emit(json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": { "code": -32601, "message": format!("unknown method: {other}") },
                }));
            }
            (None, _) => {
                // Notifications (session/cancel) need no reply.
            }
        }
    }
}

fn reply(id: &Value, result: Value) {
    emit(json!({ "jsonrpc": "2.0", "id": id, "result": result }));
}

fn request(id: i64, method: &str, params: Value) {
    emit(json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params }));
}

fn chunk(session: &str, text: &str) {
    emit(json!({
        "jsonrpc": "2.0",
        "method": "session/update",
        "params": {
            "sessionId": session,
            "update": {
                "sessionUpdate": "agent_message_chunk",
                "content": { "type": "text", "text": text },
            },
        },
    }));
}

fn emit(frame: Value) {
    let Ok(text) = serde_json::to_string(&frame) else { return };
    let mut stdout = std::io::stdout().lock();
    let _ = writeln!(stdout, "{text}");
    let _ = stdout.flush();
}
