//! SSE (Server-Sent Events) decoding for upstream completion streams
//!
//! Providers split records across network reads at arbitrary byte offsets, so the decoder
//! accumulates bytes until a whole line is available and only dispatches a record once its
//! terminating blank line has arrived. Lines end with `\n` or `\r\n`.
//!
//! A record containing a line that is not valid UTF-8 is dropped at the next blank line and
//! decoding carries on with the following record.

use bytes::{Buf, Bytes, BytesMut};
use futures_util::Stream;
use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};
use tracing::{trace, warn};

/// One logical record decoded from the upstream stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamEvent {
    /// A dispatched record carrying at least one `data:` line. Multiple data lines are joined
    /// with `\n`. The `[DONE]` sentinel arrives here like any other payload.
    Message {
        event: Option<String>,
        data: String,
        id: Option<String>,
    },
    /// A `retry:` field asking the client to change its reconnection delay (milliseconds).
    ReconnectInterval(u64),
}

impl UpstreamEvent {
    /// Convenience constructor for an unnamed message record.
    pub fn message(data: impl Into<String>) -> Self {
        UpstreamEvent::Message {
            event: None,
            data: data.into(),
            id: None,
        }
    }
}

/// The fields of the record currently being assembled.
#[derive(Debug, Default)]
struct PendingRecord {
    event: Option<String>,
    data: Option<String>,
    id: Option<String>,
    malformed: bool,
}

/// Incremental SSE decoder. Feed it byte chunks as they arrive; each call returns the records
/// completed by that chunk (zero, one or several).
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: BytesMut,
    pending: PendingRecord,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume a chunk and return every record it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<UpstreamEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line = self.buffer.split_to(pos + 1);
            line.truncate(pos);
            if line.last() == Some(&b'\r') {
                line.truncate(pos - 1);
            }
            self.process_line(&line, &mut events);
        }

        events
    }

    /// Flush at end of input. An unterminated last line is processed, and a record that has
    /// data but never saw its blank line is dispatched anyway.
    pub fn finish(&mut self) -> Vec<UpstreamEvent> {
        let mut events = Vec::new();
        if !self.buffer.is_empty() {
            let mut line = self.buffer.split();
            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }
            self.process_line(&line, &mut events);
        }
        self.dispatch(&mut events);
        events
    }

    fn process_line(&mut self, line: &[u8], events: &mut Vec<UpstreamEvent>) {
        if line.is_empty() {
            self.dispatch(events);
            return;
        }

        let Ok(line) = std::str::from_utf8(line) else {
            self.pending.malformed = true;
            return;
        };

        // Comment line, commonly used as a keep-alive.
        if line.starts_with(':') {
            return;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.pending.event = Some(value.to_owned()),
            "data" => match self.pending.data.as_mut() {
                Some(data) => {
                    data.push('\n');
                    data.push_str(value);
                }
                None => self.pending.data = Some(value.to_owned()),
            },
            "id" => self.pending.id = Some(value.to_owned()),
            "retry" => match value.parse() {
                Ok(millis) => events.push(UpstreamEvent::ReconnectInterval(millis)),
                Err(_) => trace!("Ignoring non-numeric retry field: {}", value),
            },
            other => trace!("Ignoring unknown SSE field: {}", other),
        }
    }

    fn dispatch(&mut self, events: &mut Vec<UpstreamEvent>) {
        let record = std::mem::take(&mut self.pending);
        if record.malformed {
            warn!("Skipping malformed SSE record");
            return;
        }
        if let Some(data) = record.data {
            events.push(UpstreamEvent::Message {
                event: record.event,
                data,
                id: record.id,
            });
        }
    }
}

/// A stream wrapper decoding a raw byte stream into [`UpstreamEvent`]s.
pub struct SseEventStream<S> {
    inner: S,
    decoder: SseDecoder,
    ready: VecDeque<UpstreamEvent>,
    exhausted: bool,
}

impl<S> SseEventStream<S> {
    /// Wrap an existing byte stream with SSE decoding.
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            decoder: SseDecoder::new(),
            ready: VecDeque::new(),
            exhausted: false,
        }
    }
}

impl<S, B, E> Stream for SseEventStream<S>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: Buf,
{
    type Item = Result<UpstreamEvent, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;

        loop {
            if let Some(event) = this.ready.pop_front() {
                return Poll::Ready(Some(Ok(event)));
            }
            if this.exhausted {
                return Poll::Ready(None);
            }

            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(mut chunk))) => {
                    let bytes: Bytes = chunk.copy_to_bytes(chunk.remaining());
                    this.ready.extend(this.decoder.feed(&bytes));
                }
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(Some(Err(e)));
                }
                Poll::Ready(None) => {
                    this.exhausted = true;
                    this.ready.extend(this.decoder.finish());
                }
                Poll::Pending => {
                    return Poll::Pending;
                }
            }
        }
    }
}
