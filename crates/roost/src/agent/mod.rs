// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Agent subprocess I/O: spawn, newline-delimited JSON frames on the pipes,
//! and a single exit signal.
//!
//! The command is run through `sh -c` so PATH resolution and version
//! managers behave as they would in the operator's shell. The command string
//! comes from startup configuration, never from per-request input.

pub mod framing;

use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use self::framing::FrameDecoder;

/// Why the subprocess is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCause {
    ProcessExit,
    IoError,
}

impl ExitCause {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::ProcessExit => "process_exit",
            Self::IoError => "io_error",
        }
    }
}

/// Write half of an agent process. Cheap to clone; sends are serialized
/// through the writer task, so any producer may call [`AgentHandle::send`].
#[derive(Debug, Clone)]
pub struct AgentHandle {
    writer_tx: mpsc::Sender<Value>,
    pid: Option<i32>,
}

impl AgentHandle {
    /// Serialize `frame` compactly, append a newline, write and flush.
    pub async fn send(&self, frame: Value) -> Result<(), SendError> {
        self.writer_tx.send(frame).await.map_err(|_| SendError)
    }

    /// Terminate the process group.
    pub fn kill(&self) {
        if let Some(pid) = self.pid {
            group_kill(pid);
        }
    }

    /// Handle wired to nothing; every send fails. Test-only.
    #[cfg(test)]
    pub(crate) fn disconnected() -> Self {
        let (writer_tx, _) = mpsc::channel(1);
        Self { writer_tx, pid: None }
    }
}

/// The writer task is gone; the process is dead or dying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendError;

/// A spawned agent: write handle, frame stream, and one-shot exit signal.
pub struct AgentIo {
    pub handle: AgentHandle,
    pub frames: mpsc::Receiver<Value>,
    pub exited: oneshot::Receiver<ExitCause>,
}

/// Spawn `command` via the shell with piped stdio in its own process group.
pub fn spawn(command: &str, cwd: &Path, env: &[(String, String)]) -> std::io::Result<AgentIo> {
    let mut cmd = tokio::process::Command::new("sh");
    cmd.args(["-c", command])
        .current_dir(cwd)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);
    for (key, value) in env {
        cmd.env(key, value);
    }

    let mut child = cmd.spawn()?;
    let stdin = child.stdin.take().ok_or_else(|| std::io::Error::other("child has no stdin"))?;
    let stdout = child.stdout.take().ok_or_else(|| std::io::Error::other("child has no stdout"))?;
    let stderr = child.stderr.take();
    let pid = child.id().and_then(|p| i32::try_from(p).ok());

    let io_failed = Arc::new(AtomicBool::new(false));
    let (writer_tx, writer_rx) = mpsc::channel::<Value>(64);
    let (frames_tx, frames_rx) = mpsc::channel::<Value>(256);
    let (exit_tx, exit_rx) = oneshot::channel::<ExitCause>();

    spawn_writer(stdin, writer_rx, Arc::clone(&io_failed), pid);
    spawn_reader(stdout, frames_tx, Arc::clone(&io_failed), pid);
    if let Some(stderr) = stderr {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if !line.trim().is_empty() {
                    debug!(line, "agent stderr");
                }
            }
        });
    }

    // Exit supervisor: reports exactly once, whatever the cause.
    {
        let io_failed = Arc::clone(&io_failed);
        tokio::spawn(async move {
            let status = child.wait().await;
            debug!(?status, "agent process exited");
            let cause = if io_failed.load(Ordering::Acquire) {
                ExitCause::IoError
            } else {
                ExitCause::ProcessExit
            };
            let _ = exit_tx.send(cause);
        });
    }

    let handle = AgentHandle { writer_tx, pid };
    Ok(AgentIo { handle, frames: frames_rx, exited: exit_rx })
}

fn spawn_writer(
    mut stdin: tokio::process::ChildStdin,
    mut rx: mpsc::Receiver<Value>,
    io_failed: Arc<AtomicBool>,
    pid: Option<i32>,
) {
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let Ok(mut line) = serde_json::to_string(&frame) else {
                continue;
            };
            line.push('\n');
            let write = async {
                stdin.write_all(line.as_bytes()).await?;
                stdin.flush().await
            };
            if let Err(err) = write.await {
                warn!(%err, "agent stdin write failed");
                io_failed.store(true, Ordering::Release);
                if let Some(pid) = pid {
                    group_kill(pid);
                }
                break;
            }
        }
    });
}

fn spawn_reader(
    mut stdout: tokio::process::ChildStdout,
    frames_tx: mpsc::Sender<Value>,
    io_failed: Arc<AtomicBool>,
    pid: Option<i32>,
) {
    tokio::spawn(async move {
        let mut decoder = FrameDecoder::new();
        let mut chunk = [0u8; 8192];
        loop {
            match stdout.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => {
                    for frame in decoder.feed(&chunk[..n]) {
                        if frames_tx.send(frame).await.is_err() {
                            return;
                        }
                    }
                }
                Err(err) => {
                    warn!(%err, "agent stdout read failed");
                    io_failed.store(true, Ordering::Release);
                    if let Some(pid) = pid {
                        group_kill(pid);
                    }
                    break;
                }
            }
        }
    });
}

/// SIGKILL the process group rooted at `pid`.
fn group_kill(pid: i32) {
    let _ = kill(Pid::from_raw(-pid), Signal::SIGKILL);
}
