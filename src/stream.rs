//! Chunk protocol shared by every provider adapter.
//!
//! Adapters are producers of an ordered sequence of [`StreamChunk`]s written
//! into a [`ChunkSink`]; the orchestrator is the single consumer. A chunk
//! may carry only citations or usage with an empty text delta.
//!
//! [`SseDecoder`] turns arbitrary byte chunks from the transport into
//! complete `data:` payloads, so decoding never depends on where the network
//! happened to split the body.

use memchr::memchr;
use tokio::sync::mpsc;

use crate::types::Usage;

/// The payload line that closes an OpenAI-style event stream.
pub const DONE_SENTINEL: &str = "[DONE]";

/// One incremental unit delivered during streaming.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamChunk {
    pub text: String,
    pub citations: Option<Vec<String>>,
    pub usage: Option<Usage>,
    /// Provider-specific metadata, forwarded untouched.
    pub extra: Option<serde_json::Value>,
}

impl StreamChunk {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn citations(citations: Vec<String>) -> Self {
        Self {
            citations: Some(citations),
            ..Self::default()
        }
    }

    pub fn usage(usage: Usage) -> Self {
        Self {
            usage: Some(usage),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
            && self.citations.is_none()
            && self.usage.is_none()
            && self.extra.is_none()
    }
}

/// Write half of the chunk channel handed to an adapter.
#[derive(Debug, Clone)]
pub struct ChunkSink {
    tx: mpsc::UnboundedSender<StreamChunk>,
}

impl ChunkSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<StreamChunk>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Returns false once the consumer has gone away.
    pub fn send(&self, chunk: StreamChunk) -> bool {
        if chunk.is_empty() {
            return true;
        }
        self.tx.send(chunk).is_ok()
    }

    pub fn text(&self, delta: &str) -> bool {
        if delta.is_empty() {
            return true;
        }
        self.send(StreamChunk::text(delta))
    }

    pub fn citations(&self, citations: Vec<String>) -> bool {
        self.send(StreamChunk::citations(citations))
    }

    pub fn usage(&self, usage: Usage) -> bool {
        self.send(StreamChunk::usage(usage))
    }
}

/// A decoded `data:` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    Data(String),
    Done,
}

/// Incremental line splitter for `text/event-stream` bodies.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes and drain every complete `data:` payload.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some(newline_pos) = memchr(b'\n', &self.buffer) {
            let line: Vec<u8> = self.buffer.drain(..=newline_pos).collect();
            if let Some(event) = parse_line(&line[..newline_pos]) {
                events.push(event);
            }
        }
        events
    }

    /// Flush a trailing line that was not newline-terminated.
    pub fn finish(&mut self) -> Option<SseEvent> {
        let rest = std::mem::take(&mut self.buffer);
        parse_line(&rest)
    }
}

fn parse_line(raw: &[u8]) -> Option<SseEvent> {
    let line = String::from_utf8_lossy(raw);
    let line = line.trim_end_matches('\r');
    let payload = line.strip_prefix("data:")?.trim_start();
    if payload.trim() == DONE_SENTINEL {
        return Some(SseEvent::Done);
    }
    if payload.trim().is_empty() {
        return None;
    }
    Some(SseEvent::Data(payload.to_string()))
}
