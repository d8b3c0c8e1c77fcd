// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end smoke tests that spawn the real `roost` binary and exercise
//! the health endpoint and the WebSocket JSON-RPC surface.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::Message;

use roost_specs::{http_get, RoostProcess};

const TIMEOUT: Duration = Duration::from_secs(15);

async fn ws_request(
    tx: &mut (impl SinkExt<Message> + Unpin),
    value: &Value,
) -> anyhow::Result<()> {
    let text = serde_json::to_string(value)?;
    tx.send(Message::Text(text.into())).await.map_err(|_| anyhow::anyhow!("ws send failed"))
}

async fn ws_response(
    rx: &mut (impl StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin),
    id: i64,
) -> anyhow::Result<Value> {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .ok_or_else(|| anyhow::anyhow!("ws response timeout"))?;
        let msg = tokio::time::timeout(remaining, rx.next())
            .await
            .map_err(|_| anyhow::anyhow!("ws response timeout"))?
            .ok_or_else(|| anyhow::anyhow!("ws closed"))??;
        if let Message::Text(text) = msg {
            let frame: Value = serde_json::from_str(&text)?;
            if frame["id"] == json!(id) {
                return Ok(frame);
            }
        }
    }
}

#[tokio::test]
async fn http_health() -> anyhow::Result<()> {
    let roost = RoostProcess::start()?;
    roost.wait_healthy(TIMEOUT).await?;

    let body = http_get(roost.port(), "/api/v1/health").await?;
    assert!(body.contains("\"status\":\"running\""), "body: {body}");
    Ok(())
}

#[tokio::test]
async fn ws_session_lifecycle() -> anyhow::Result<()> {
    let roost = RoostProcess::start()?;
    roost.wait_healthy(TIMEOUT).await?;

    let (stream, _) = tokio_tungstenite::connect_async(roost.ws_url()).await?;
    let (mut tx, mut rx) = stream.split();

    // Empty list on a fresh store.
    ws_request(&mut tx, &json!({"jsonrpc": "2.0", "id": 1, "method": "session/list"})).await?;
    let resp = ws_response(&mut rx, 1).await?;
    assert_eq!(resp["result"]["sessions"], json!([]));

    // Create, prompt, replay.
    ws_request(
        &mut tx,
        &json!({
            "jsonrpc": "2.0",
            "id": 2,
            "method": "session/new",
            "params": { "title": "smoke" },
        }),
    )
    .await?;
    let resp = ws_response(&mut rx, 2).await?;
    let sid = resp["result"]["sessionId"]
        .as_str()
        .map(ToOwned::to_owned)
        .ok_or_else(|| anyhow::anyhow!("no sessionId: {resp}"))?;

    ws_request(
        &mut tx,
        &json!({
            "jsonrpc": "2.0",
            "id": 3,
            "method": "session/prompt",
            "params": {
                "sessionId": sid,
                "prompt": [{ "type": "text", "text": "hello" }],
            },
        }),
    )
    .await?;
    let resp = ws_response(&mut rx, 3).await?;
    assert_eq!(resp["result"]["success"], json!(true), "response: {resp}");

    ws_request(
        &mut tx,
        &json!({
            "jsonrpc": "2.0",
            "id": 4,
            "method": "session/get",
            "params": { "sessionId": sid },
        }),
    )
    .await?;
    let resp = ws_response(&mut rx, 4).await?;
    assert_eq!(resp["result"]["session"]["title"], "smoke");
    assert_eq!(resp["result"]["session"]["status"], "running");
    let updates = resp["result"]["updates"]
        .as_array()
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("no updates"))?;
    assert!(
        updates.iter().any(|u| u["updateType"] == "agent_message_chunk"),
        "updates: {updates:?}"
    );
    Ok(())
}

#[tokio::test]
async fn sessions_survive_a_restart_as_exited() -> anyhow::Result<()> {
    // A session left behind by a dead bridge must replay after restart,
    // marked exited (no resume).
    let roost = RoostProcess::start()?;
    roost.wait_healthy(TIMEOUT).await?;

    let (stream, _) = tokio_tungstenite::connect_async(roost.ws_url()).await?;
    let (mut tx, mut rx) = stream.split();
    ws_request(
        &mut tx,
        &json!({"jsonrpc": "2.0", "id": 1, "method": "session/new", "params": {}}),
    )
    .await?;
    let resp = ws_response(&mut rx, 1).await?;
    assert!(resp["result"]["sessionId"].is_string());
    drop((tx, rx));

    // Second process over the same store: port differs, db_path persists.
    // RoostProcess removes the db on drop, so restart within its lifetime.
    let port2 = roost_specs::free_port()?;
    let mut child = std::process::Command::new(roost_specs::roost_binary())
        .env("PORT", port2.to_string())
        .env("HOST", "127.0.0.1")
        .env("AGENT_COMMAND", roost_specs::stub_agent_binary())
        .env("ROOST_DB_PATH", roost.db_path())
        .env("ROOST_LOG_LEVEL", "warn")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()?;

    let deadline = tokio::time::Instant::now() + TIMEOUT;
    let listed = loop {
        if tokio::time::Instant::now() > deadline {
            let _ = child.kill();
            anyhow::bail!("second roost never answered");
        }
        if let Ok(body) = http_get(port2, "/api/v1/health").await {
            if body.contains("running") {
                break true;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    };
    assert!(listed);

    let (stream, _) =
        tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port2}/ws")).await?;
    let (mut tx, mut rx) = stream.split();
    ws_request(&mut tx, &json!({"jsonrpc": "2.0", "id": 1, "method": "session/list"})).await?;
    let resp = ws_response(&mut rx, 1).await?;
    let sessions = resp["result"]["sessions"]
        .as_array()
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("no sessions"))?;
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0]["status"], "exited");

    let _ = child.kill();
    let _ = child.wait();
    Ok(())
}
