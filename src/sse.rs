//! Server-sent event decoding for upstream streams
//!
//! Providers split events across network chunks and pack several events into one chunk, and
//! some terminate lines with `\r\n`. [`SseEventStream`] buffers raw body bytes and yields whole,
//! parsed [`SseEvent`]s, so stream accumulators never see partial JSON.

use crate::errors::ProviderError;
use bytes::{Bytes, BytesMut};
use futures_util::Stream;
use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Upper bound on a single buffered event.
pub const MAX_EVENT_BYTES: usize = 1024 * 1024;

/// One parsed server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Parse one event block. Comment-only blocks (keepalives) carry no data and yield `None`.
fn parse_event(block: &str) -> Option<SseEvent> {
    let mut event = None;
    let mut data: Vec<&str> = Vec::new();
    for line in block.lines() {
        if line.starts_with(':') {
            continue;
        }
        let (field, value) = line.split_once(':').unwrap_or((line, ""));
        let value = value.strip_prefix(' ').unwrap_or(value);
        match field {
            "event" => event = Some(value.to_string()),
            "data" => data.push(value),
            _ => {}
        }
    }
    (!data.is_empty()).then(|| SseEvent {
        event,
        data: data.join("\n"),
    })
}

/// Parse every event in `raw`. Accepts both `\n` and `\r\n` line endings.
pub fn parse_events(raw: &[u8]) -> Vec<SseEvent> {
    String::from_utf8_lossy(raw)
        .replace("\r\n", "\n")
        .split("\n\n")
        .filter_map(parse_event)
        .collect()
}

/// Find the end of the first complete event: `(index past the delimiter)`.
fn event_end(buf: &[u8]) -> Option<usize> {
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|i| i + 2);
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4);
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// Decodes an upstream body stream into whole events.
///
/// Transport errors surface as [`ProviderError::Connection`]. An event that grows past the size
/// limit without terminating surfaces as [`ProviderError::ProviderServer`]. Either ends the
/// stream.
pub struct SseEventStream<S> {
    inner: S,
    buffer: BytesMut,
    max_event_bytes: usize,
    done: bool,
}

impl<S> SseEventStream<S> {
    pub fn new(inner: S) -> Self {
        Self::with_limit(inner, MAX_EVENT_BYTES)
    }

    pub fn with_limit(inner: S, max_event_bytes: usize) -> Self {
        Self {
            inner,
            buffer: BytesMut::new(),
            max_event_bytes,
            done: false,
        }
    }
}

impl<S, E> Stream for SseEventStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: fmt::Display,
{
    type Item = Result<SseEvent, ProviderError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;

        loop {
            if let Some(end) = event_end(&this.buffer) {
                let block = this.buffer.split_to(end);
                match parse_event(&String::from_utf8_lossy(&block).replace("\r\n", "\n")) {
                    Some(event) => return Poll::Ready(Some(Ok(event))),
                    None => continue,
                }
            }
            if this.done {
                return Poll::Ready(None);
            }
            if this.buffer.len() > this.max_event_bytes {
                this.done = true;
                return Poll::Ready(Some(Err(ProviderError::ProviderServer {
                    status: 200,
                    message: format!("stream event exceeds {} bytes", this.max_event_bytes),
                })));
            }

            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => this.buffer.extend_from_slice(&chunk),
                Poll::Ready(Some(Err(e))) => {
                    this.done = true;
                    return Poll::Ready(Some(Err(ProviderError::Connection(format!(
                        "stream interrupted: {e}"
                    )))));
                }
                Poll::Ready(None) => {
                    // A final event may lack its blank line.
                    this.done = true;
                    let rest = this.buffer.split();
                    let last = parse_event(&String::from_utf8_lossy(&rest).replace("\r\n", "\n"));
                    return Poll::Ready(last.map(Ok));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
