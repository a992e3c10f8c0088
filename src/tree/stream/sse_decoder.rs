//! Incremental decoder for `text/event-stream` completion bodies.

use serde_json::Value;
use tracing::debug;

/// Sentinel payload that terminates a completion stream.
pub const DONE_SENTINEL: &str = "[DONE]";

/// One logical unit decoded from the stream.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SseFrame {
    /// A piece of assistant text.
    Delta(String),
    /// End-of-stream sentinel.
    Done,
    /// The provider reported an error inside the stream.
    Error {
        /// Provider message.
        message: String,
        /// Provider error code or type, e.g. `rate_limit_exceeded`.
        code: Option<String>,
    },
}

/// Buffers raw body bytes and yields frames once whole lines are available.
///
/// A line split across two chunks (or a multi-byte character split across two
/// chunks) is held back until the rest arrives. Lines that are not valid UTF-8 or
/// whose payload is not valid JSON are skipped without ending the stream.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    skipped: usize,
}

impl SseDecoder {
    /// Create an empty decoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk and collect every frame it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            if let Some(frame) = self.decode_line(&line[..newline]) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Flush a trailing line that was not newline-terminated.
    pub fn finish(&mut self) -> Vec<SseFrame> {
        if self.buffer.is_empty() {
            return Vec::new();
        }
        let line = std::mem::take(&mut self.buffer);
        self.decode_line(&line).into_iter().collect()
    }

    /// Number of malformed units skipped so far.
    #[must_use]
    pub const fn skipped(&self) -> usize {
        self.skipped
    }

    fn decode_line(&mut self, raw: &[u8]) -> Option<SseFrame> {
        let Ok(line) = std::str::from_utf8(raw) else {
            self.skipped += 1;
            debug!("Skipping non UTF-8 stream line ({} bytes)", raw.len());
            return None;
        };
        let line = line.trim_end_matches('\r').trim();
        if line.is_empty() || line.starts_with(':') {
            return None;
        }

        let payload = line.strip_prefix("data:")?.trim_start();
        if payload == DONE_SENTINEL {
            return Some(SseFrame::Done);
        }

        let value: Value = match serde_json::from_str(payload) {
            Ok(value) => value,
            Err(err) => {
                self.skipped += 1;
                debug!("Skipping malformed stream frame: {err}");
                return None;
            }
        };

        if let Some(content) = value
            .pointer("/choices/0/delta/content")
            .and_then(Value::as_str)
        {
            return (!content.is_empty()).then(|| SseFrame::Delta(content.to_string()));
        }

        value.get("error").map(|error| {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .or_else(|| error.as_str())
                .unwrap_or("provider error");
            let code = error
                .get("code")
                .and_then(Value::as_str)
                .or_else(|| error.get("type").and_then(Value::as_str))
                .map(str::to_string);
            SseFrame::Error {
                message: message.to_string(),
                code,
            }
        })
    }
}
