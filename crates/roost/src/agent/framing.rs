// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Newline-delimited JSON frame decoding for the agent's output pipe.
//!
//! A frame is one line terminated by `\n`. Partial trailing data is retained
//! across feeds. A carriage return before the newline is left in place — the
//! JSON parser treats it as trailing whitespace, never as a delimiter.

use serde_json::Value;
use tracing::warn;

/// Incremental line-oriented JSON decoder.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes and return the frames completed by it.
    ///
    /// Empty lines are skipped. Lines that fail to parse are dropped and
    /// logged; they never interrupt the stream.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Value> {
        self.buf.extend_from_slice(data);

        let mut frames = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buf[start..].iter().position(|&b| b == b'\n') {
            let line = &self.buf[start..start + offset];
            start += offset + 1;
            if line.is_empty() {
                continue;
            }
            match serde_json::from_slice::<Value>(line) {
                Ok(value) => frames.push(value),
                Err(err) => {
                    warn!(%err, len = line.len(), "dropping unparseable agent line");
                }
            }
        }
        self.buf.drain(..start);
        frames
    }

    /// Bytes of the current partial line, if any.
    pub fn pending(&self) -> &[u8] {
        &self.buf
    }
}

#[cfg(test)]
#[path = "framing_tests.rs"]
mod tests;
