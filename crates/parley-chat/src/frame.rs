//! Incremental decoder for the streamed response channel.
//!
//! The channel carries newline-delimited frames of the form
//! `data: {json}` separated by blank lines, terminated by `data: [DONE]`
//! or by the channel closing. Text chunks can split a frame anywhere, so
//! the decoder buffers the trailing partial line between calls.

use serde::Deserialize;
use tracing::debug;

use parley_core::types::SourceRef;

/// Prefix every frame line carries.
pub const DATA_PREFIX: &str = "data:";

/// Payload marking the end of the stream.
pub const END_SENTINEL: &str = "[DONE]";

/// One decoded frame.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Text delta to append to the draft.
    Chunk { content: String },
    /// Full source list; replaces any previous list.
    Sources { sources: Vec<SourceRef> },
    /// Server-side failure reported in-band.
    Error { message: String },
}

/// Splits arbitrary text chunks into frames.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: String,
    saw_end: bool,
    dropped: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every frame completed by it, in order.
    pub fn feed(&mut self, chunk: &str) -> Vec<Frame> {
        self.buffer.push_str(chunk);
        let Some(last_newline) = self.buffer.rfind('\n') else {
            return Vec::new();
        };
        let complete: String = self.buffer.drain(..=last_newline).collect();
        complete
            .split('\n')
            .filter_map(|line| self.decode_line(line))
            .collect()
    }

    /// Decode whatever remains after the channel closed.
    pub fn flush(&mut self) -> Vec<Frame> {
        let rest = std::mem::take(&mut self.buffer);
        self.decode_line(&rest).into_iter().collect()
    }

    /// Whether the end sentinel has been seen.
    pub fn saw_end(&self) -> bool {
        self.saw_end
    }

    /// Number of malformed frame payloads skipped so far.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// Bytes held back waiting for a newline.
    pub fn pending(&self) -> &str {
        &self.buffer
    }

    fn decode_line(&mut self, line: &str) -> Option<Frame> {
        let line = line.trim_end_matches('\r');
        let payload = line.strip_prefix(DATA_PREFIX)?.trim();
        if payload.is_empty() {
            return None;
        }
        if payload == END_SENTINEL {
            self.saw_end = true;
            return None;
        }
        match serde_json::from_str::<Frame>(payload) {
            Ok(frame) => Some(frame),
            Err(e) => {
                self.dropped += 1;
                debug!(error = %e, payload_len = payload.len(), "Skipping malformed frame");
                None
            }
        }
    }
}
