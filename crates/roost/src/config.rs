// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// WebSocket bridge for agent-protocol subprocesses.
#[derive(Debug, Clone, Parser)]
#[command(name = "roost", version, about)]
pub struct Config {
    /// Port for the HTTP/WebSocket listener.
    #[arg(long, env = "PORT", default_value_t = 3001)]
    pub port: u16,

    /// Host address to bind to.
    #[arg(long, env = "HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Shell command that starts an agent subprocess (run via `sh -c`).
    #[arg(long, env = "AGENT_COMMAND", default_value = "claude-code-acp")]
    pub agent_command: String,

    /// Working directory for sessions that do not specify one.
    #[arg(long, env = "DEFAULT_CWD")]
    pub default_cwd: Option<PathBuf>,

    /// Directory of static UI assets served under `/`.
    #[arg(long, env = "STATIC_DIR", default_value = "static")]
    pub static_dir: PathBuf,

    /// Path to the SQLite store. Defaults to `~/.acp-client/roost.db`.
    #[arg(long, env = "ROOST_DB_PATH")]
    pub db_path: Option<PathBuf>,

    /// Seconds to wait for the agent handshake before failing a session.
    #[arg(long, env = "ROOST_HANDSHAKE_TIMEOUT_SECS", default_value_t = 60)]
    pub handshake_timeout_secs: u64,

    /// Seconds before an in-flight agent request times out.
    #[arg(long, env = "ROOST_REQUEST_TIMEOUT_SECS", default_value_t = 300)]
    pub request_timeout_secs: u64,

    /// Log format (json or text).
    #[arg(long, env = "ROOST_LOG_FORMAT", default_value = "text")]
    pub log_format: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "ROOST_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Working directory for a new session: the request's `cwd`, then
    /// `DEFAULT_CWD`, then the user's home directory.
    pub fn resolve_cwd(&self, requested: Option<&str>) -> PathBuf {
        if let Some(cwd) = requested {
            return PathBuf::from(cwd);
        }
        if let Some(ref cwd) = self.default_cwd {
            return cwd.clone();
        }
        home_dir().unwrap_or_else(|| PathBuf::from("."))
    }

    /// Store path: `--db-path` override, else `<home>/.acp-client/roost.db`.
    pub fn resolve_db_path(&self) -> anyhow::Result<PathBuf> {
        if let Some(ref path) = self.db_path {
            return Ok(path.clone());
        }
        let home = home_dir().ok_or_else(|| anyhow::anyhow!("could not determine home directory"))?;
        Ok(home.join(".acp-client").join("roost.db"))
    }

    /// Default configuration without consulting argv or the environment.
    /// Used by tests and the builder in `test_support`.
    pub fn for_tests() -> Self {
        Self {
            port: 0,
            host: "127.0.0.1".to_owned(),
            agent_command: "false".to_owned(),
            default_cwd: None,
            static_dir: PathBuf::from("static"),
            db_path: None,
            handshake_timeout_secs: 60,
            request_timeout_secs: 300,
            log_format: "text".to_owned(),
            log_level: "info".to_owned(),
        }
    }
}

fn home_dir() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|dirs| dirs.home_dir().to_path_buf())
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
