// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test harness for end-to-end binary smoke tests.
//!
//! Spawns the real `roost` binary with a stub agent and exercises it over
//! HTTP and WebSocket.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Resolve a compiled binary in the workspace target directory.
fn workspace_binary(name: &str) -> PathBuf {
    let manifest = Path::new(env!("CARGO_MANIFEST_DIR"));
    // tests/specs → tests → workspace root
    let workspace = manifest.parent().and_then(|p| p.parent()).unwrap_or(manifest);
    workspace.join("target").join("debug").join(name)
}

pub fn roost_binary() -> PathBuf {
    workspace_binary("roost")
}

pub fn stub_agent_binary() -> PathBuf {
    workspace_binary("stub-agent")
}

/// Find a free TCP port by binding to :0 then releasing.
pub fn free_port() -> anyhow::Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

/// Make one HTTP/1.1 GET request, returning the response body.
pub async fn http_get(port: u16, path: &str) -> anyhow::Result<String> {
    let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port)).await?;
    let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;

    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await?;
    let response = String::from_utf8(buf)?;
    let body = response.split_once("\r\n\r\n").map(|(_, b)| b).unwrap_or("").to_owned();
    Ok(body)
}

/// A running `roost` process that is killed on drop.
pub struct RoostProcess {
    child: Child,
    port: u16,
    db_path: PathBuf,
}

static NEXT_DB: AtomicU64 = AtomicU64::new(0);

impl RoostProcess {
    /// Start `roost` on a free port against a throwaway store and the stub
    /// agent.
    pub fn start() -> anyhow::Result<Self> {
        let port = free_port()?;
        let n = NEXT_DB.fetch_add(1, Ordering::Relaxed);
        let db_path = std::env::temp_dir()
            .join(format!("roost-specs-{}-{n}.db", std::process::id()));

        let child = Command::new(roost_binary())
            .env("PORT", port.to_string())
            .env("HOST", "127.0.0.1")
            .env("AGENT_COMMAND", stub_agent_binary())
            .env("ROOST_DB_PATH", &db_path)
            .env("ROOST_LOG_LEVEL", "warn")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        Ok(Self { child, port, db_path })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn ws_url(&self) -> String {
        format!("ws://127.0.0.1:{}/ws", self.port)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Poll the health endpoint until the server answers.
    pub async fn wait_healthy(&self, timeout: Duration) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("roost never became healthy on port {}", self.port);
            }
            if let Ok(body) = http_get(self.port, "/api/v1/health").await {
                if body.contains("running") {
                    return Ok(());
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

impl Drop for RoostProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        let _ = std::fs::remove_file(&self.db_path);
    }
}
