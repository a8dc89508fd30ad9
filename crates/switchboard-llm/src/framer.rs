//! Incremental decoding of `data:`-framed streaming responses.
//!
//! OpenAI-compatible and Wenxin endpoints stream lines like:
//!
//! ```text
//! data: {"choices":[{"delta":{"content":"Hel"}}]}
//!
//! data: {"choices":[{"delta":{"content":"lo"}}]}
//!
//! data: [DONE]
//! ```
//!
//! Network deliveries do not respect line or even UTF-8 boundaries, so the
//! framer carries leftovers between pushes: trailing bytes of an incomplete
//! code point, the unterminated tail of the current line, and the text of a
//! complete line whose JSON did not parse. The last is prepended to the next
//! line before parsing again.

use futures_core::Stream;
use tokio_stream::StreamExt;

use crate::{ChunkFn, CompletionResult};

/// The sentinel line that ends a stream successfully.
const DONE_SENTINEL: &str = "[DONE]";

/// One decoded unit of a framed stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Event(serde_json::Value),
    Done,
}

/// Whether the read loop should keep pulling from the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

#[derive(Debug, Default)]
pub struct StreamFramer {
    /// Bytes of a code point split across deliveries.
    utf8_tail: Vec<u8>,
    /// Text after the last newline seen so far.
    line_buf: String,
    /// A line that failed to parse, awaiting its continuation.
    pending: String,
    done: bool,
}

impl StreamFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` once the `[DONE]` sentinel has been seen.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feed raw bytes from the network.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> Vec<Frame> {
        self.utf8_tail.extend_from_slice(bytes);
        // An incomplete code point at the end stays buffered; invalid bytes are replaced.
        let valid = match std::str::from_utf8(&self.utf8_tail) {
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            _ => self.utf8_tail.len(),
        };
        let rest = self.utf8_tail.split_off(valid);
        let text = String::from_utf8_lossy(&self.utf8_tail).into_owned();
        self.utf8_tail = rest;
        self.push_str(&text)
    }

    /// Feed already-decoded text. Only newline-terminated lines are decoded;
    /// the rest waits for the next push or [`StreamFramer::finish`].
    pub fn push_str(&mut self, chunk: &str) -> Vec<Frame> {
        let mut frames = Vec::new();
        if self.done {
            return frames;
        }

        self.line_buf.push_str(chunk);
        let Some(last_newline) = self.line_buf.rfind('\n') else {
            return frames;
        };
        let tail = self.line_buf.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.line_buf, tail);

        for raw in complete.split('\n') {
            if self.decode_line(raw, &mut frames) {
                break;
            }
        }
        frames
    }

    /// Decode whatever is left once the body has ended without a final newline.
    pub fn finish(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        let rest = std::mem::take(&mut self.line_buf);
        if !self.done {
            self.decode_line(&rest, &mut frames);
        }
        if !self.pending.is_empty() {
            tracing::debug!(len = self.pending.len(), "stream ended with an unparsed fragment");
            self.pending.clear();
        }
        frames
    }

    /// Returns `true` when the line was the `[DONE]` sentinel.
    fn decode_line(&mut self, raw: &str, frames: &mut Vec<Frame>) -> bool {
        let line = strip_data_prefix(raw.trim());
        if line.is_empty() {
            return false;
        }
        if line == DONE_SENTINEL {
            self.done = true;
            self.line_buf.clear();
            frames.push(Frame::Done);
            return true;
        }

        if self.pending.is_empty() {
            match serde_json::from_str::<serde_json::Value>(line) {
                Ok(value) => frames.push(Frame::Event(value)),
                Err(_) => self.pending = line.to_string(),
            }
            return false;
        }

        let merged = std::mem::take(&mut self.pending) + line;
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&merged) {
            frames.push(Frame::Event(value));
        } else if let Ok(value) = serde_json::from_str::<serde_json::Value>(line) {
            tracing::warn!(fragment_len = merged.len() - line.len(), "discarding unparseable stream fragment");
            frames.push(Frame::Event(value));
        } else {
            tracing::trace!(len = merged.len(), "stream line incomplete, waiting for more");
            self.pending = merged;
        }
        false
    }
}

fn strip_data_prefix(line: &str) -> &str {
    match line.strip_prefix("data:") {
        Some(rest) => rest.trim_start(),
        None => line,
    }
}

// ---------------------------------------------------------------------------
// Accumulator
// ---------------------------------------------------------------------------

/// Collects accepted deltas and the running token count for one completion call.
pub struct Accumulator<'c, 'f> {
    content: String,
    total_tokens: u64,
    on_chunk: Option<&'c mut ChunkFn<'f>>,
    cancelled: bool,
}

impl<'c, 'f> Accumulator<'c, 'f> {
    pub fn new(on_chunk: Option<&'c mut ChunkFn<'f>>) -> Self {
        Self {
            content: String::new(),
            total_tokens: 0,
            on_chunk,
            cancelled: false,
        }
    }

    /// Offer a delta to the caller. Empty deltas are ignored.
    ///
    /// Returns [`Flow::Stop`] when the callback rejects the delta; the
    /// rejected text is not appended and `tokens` is not counted.
    pub fn offer(&mut self, delta: &str, tokens: TokenUpdate) -> Flow {
        if self.cancelled {
            return Flow::Stop;
        }
        if delta.is_empty() {
            return Flow::Continue;
        }
        if let Some(cb) = self.on_chunk.as_deref_mut() {
            if !cb(delta) {
                self.cancelled = true;
                return Flow::Stop;
            }
        }
        self.content.push_str(delta);
        self.total_tokens = match tokens {
            TokenUpdate::Add(n) => self.total_tokens.saturating_add(n),
            TokenUpdate::Observed(n) => self.total_tokens.max(n),
        };
        Flow::Continue
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn finish(self) -> CompletionResult {
        CompletionResult {
            content: self.content,
            total_tokens: self.total_tokens,
        }
    }
}

/// How a delta moves the running token count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenUpdate {
    /// Add to the running total.
    Add(u64),
    /// A provider-reported running total; the count never decreases.
    Observed(u64),
}

// ---------------------------------------------------------------------------
// Read loop
// ---------------------------------------------------------------------------

/// Pull `body` through a [`StreamFramer`] until `[DONE]`, end of body, or
/// `on_event` returns [`Flow::Stop`].
///
/// Returning early drops `body`, which closes the underlying connection.
pub async fn drain_events<S, B, E, F>(body: S, mut on_event: F) -> std::result::Result<(), E>
where
    S: Stream<Item = std::result::Result<B, E>>,
    B: AsRef<[u8]>,
    F: FnMut(serde_json::Value) -> Flow,
{
    tokio::pin!(body);
    let mut framer = StreamFramer::new();

    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        for frame in framer.push_bytes(chunk.as_ref()) {
            match frame {
                Frame::Done => {
                    tracing::debug!("stream finished with [DONE]");
                    return Ok(());
                }
                Frame::Event(value) => {
                    if on_event(value) == Flow::Stop {
                        tracing::debug!("stream stopped, closing connection");
                        return Ok(());
                    }
                }
            }
        }
    }

    for frame in framer.finish() {
        if let Frame::Event(value) = frame {
            if on_event(value) == Flow::Stop {
                break;
            }
        }
    }
    tracing::debug!("stream body ended");
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
