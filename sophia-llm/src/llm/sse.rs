//! Incremental decoder for server-sent event streams.

use bytes::BytesMut;

/// A decoded `data:` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    /// JSON (or other) payload of a `data:` line
    Data(String),
    /// The `[DONE]` sentinel
    Done,
}

/// Buffers raw bytes and yields complete `data:` lines.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: BytesMut,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes, returning every event completed by it.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line = self.buffer.split_to(pos + 1);
            let line = String::from_utf8_lossy(&line);
            if let Some(event) = parse_line(&line) {
                events.push(event);
            }
        }

        events
    }

    /// Flush a trailing line that arrived without a newline.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if self.buffer.is_empty() {
            return None;
        }
        let rest = self.buffer.split();
        parse_line(&String::from_utf8_lossy(&rest))
    }
}

fn parse_line(line: &str) -> Option<SseEvent> {
    let data = line.trim_end_matches(['\r', '\n']).strip_prefix("data:")?;
    let data = data.trim();
    if data.is_empty() {
        None
    } else if data == "[DONE]" {
        Some(SseEvent::Done)
    } else {
        Some(SseEvent::Data(data.to_string()))
    }
}
