//! HTTP framing for the recommendation stream
//!
//! Turns the provider's raw SSE byte stream into the outbound body: decode, demultiplex, encode
//! each forwarded fragment with the configured [`Framing`]. The body ends exactly once:
//! - cleanly on the `[DONE]` sentinel or when the upstream byte source runs dry,
//! - cleanly when the request's cancellation token fires (server shutdown),
//! - with an error item on a fragment decode failure, upstream read failure or read timeout.
//!
//! Dropping the body (client disconnect) drops the upstream stream with it, which aborts the
//! upstream request.
use crate::demux::{Demuxed, SlotDemultiplexer};
use crate::errors::StreamError;
use crate::sse::SseEventStream;
use crate::wire::{FRAMING_HEADER, Framing, SLOT_COUNT_HEADER};
use axum::body::Body;
use axum::http::{HeaderName, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt};
use std::fmt::Display;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Per-request knobs for [`encode_stream`].
#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub framing: Framing,
    /// Maximum wait for the next upstream read. Any bytes reset it, comments included. `None`
    /// waits forever.
    pub read_timeout: Option<Duration>,
    pub cancel: CancellationToken,
}

type UpstreamReads = BoxStream<'static, Result<Bytes, StreamError>>;

struct EncoderState {
    events: SseEventStream<UpstreamReads>,
    demux: SlotDemultiplexer,
    options: StreamOptions,
    closed: bool,
}

/// Build the outbound byte stream from an upstream SSE byte stream.
pub fn encode_stream<S, E>(
    upstream: S,
    options: StreamOptions,
) -> impl Stream<Item = Result<Bytes, StreamError>> + Send + 'static
where
    S: Stream<Item = Result<Bytes, E>> + Unpin + Send + 'static,
    E: Display + Send + 'static,
{
    let reads = bounded_reads(upstream, options.read_timeout);
    let state = EncoderState {
        events: SseEventStream::new(reads),
        demux: SlotDemultiplexer::new(),
        options,
        closed: false,
    };

    futures_util::stream::unfold(state, |mut state| async move {
        if state.closed {
            return None;
        }

        loop {
            let next = tokio::select! {
                biased;
                _ = state.options.cancel.cancelled() => {
                    info!("Recommendation stream cancelled");
                    return None;
                }
                next = state.events.next() => next.transpose(),
            };

            let event = match next {
                Ok(Some(event)) => event,
                Ok(None) => {
                    debug!("Upstream byte stream exhausted");
                    return None;
                }
                Err(e) => {
                    warn!("Recommendation stream failed: {}", e);
                    state.closed = true;
                    return Some((Err(e), state));
                }
            };

            match state.demux.process(&event) {
                Ok(Demuxed::Forward(fragment)) => match state.options.framing.encode(&fragment) {
                    Ok(bytes) => return Some((Ok(bytes), state)),
                    Err(e) => {
                        state.closed = true;
                        return Some((Err(StreamError::Fragment(e)), state));
                    }
                },
                Ok(Demuxed::Suppressed | Demuxed::Skipped) => continue,
                Ok(Demuxed::Done) => return None,
                Err(e) => {
                    warn!("Recommendation stream failed: {}", e);
                    state.closed = true;
                    return Some((Err(e), state));
                }
            }
        }
    })
}

/// Map upstream read errors and bound the wait between two reads.
fn bounded_reads<S, E>(upstream: S, read_timeout: Option<Duration>) -> UpstreamReads
where
    S: Stream<Item = Result<Bytes, E>> + Unpin + Send + 'static,
    E: Display + Send + 'static,
{
    let reads = upstream.map(|read| read.map_err(|e| StreamError::Upstream(e.to_string())));
    match read_timeout {
        Some(limit) => tokio_stream::StreamExt::timeout(reads, limit)
            .map(move |read| read.unwrap_or_else(|_| Err(StreamError::Timeout(limit))))
            .boxed(),
        None => reads.boxed(),
    }
}

/// Wrap an outbound byte stream in a streaming HTTP response.
///
/// The payload is not `data:`-prefixed SSE, but the SSE headers keep intermediaries from
/// buffering it.
pub fn streaming_response<S>(body: S, framing: Framing, slots: usize) -> Response
where
    S: Stream<Item = Result<Bytes, StreamError>> + Send + 'static,
{
    let headers = [
        (
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/event-stream"),
        ),
        (header::CACHE_CONTROL, HeaderValue::from_static("no-cache")),
        (header::CONNECTION, HeaderValue::from_static("keep-alive")),
        (
            HeaderName::from_static(FRAMING_HEADER),
            HeaderValue::from_static(framing.as_str()),
        ),
        (HeaderName::from_static(SLOT_COUNT_HEADER), HeaderValue::from(slots)),
    ];
    (StatusCode::OK, headers, Body::from_stream(body)).into_response()
}

/// A streaming response that closes immediately. Used when there is nothing to generate or
/// the completion provider could not be reached.
pub fn empty_response(framing: Framing, slots: usize) -> Response {
    streaming_response(
        futures_util::stream::empty::<Result<Bytes, StreamError>>(),
        framing,
        slots,
    )
}
