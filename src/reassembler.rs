//! Client-side reassembly of the recommendation stream into per-slot text buffers
//!
//! With [`Framing::NdJson`] partial lines are carried over to the next read, so reads may end
//! anywhere. With [`Framing::Concatenated`] each read is repaired and parsed on its own: a read
//! that ends inside an object fails to parse and is dropped.
use crate::errors::ReassemblyError;
use crate::wire::{CompletionFragment, Framing};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde::Serialize;
use std::fmt::Display;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    /// Request issued, nothing received yet.
    #[default]
    Pending,
    /// Bytes are arriving and being folded into the buffers.
    Streaming,
    /// The transport reported end of stream.
    Completed,
    /// Reassembly was aborted by a fatal error.
    Failed,
}

impl StreamState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamState::Completed | StreamState::Failed)
    }
}

/// Append-only text buffers, one per prompt slot, sized up front.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(transparent)]
pub struct SlotBuffers(Vec<String>);

impl SlotBuffers {
    pub fn new(slots: usize) -> Self {
        Self(vec![String::new(); slots])
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.0.get(index).map(String::as_str)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    fn append(&mut self, index: usize, text: &str) -> Result<(), ReassemblyError> {
        let slots = self.0.len();
        let slot = self
            .0
            .get_mut(index)
            .ok_or(ReassemblyError::SlotOutOfRange { index, slots })?;
        slot.push_str(text);
        Ok(())
    }
}

#[derive(Debug)]
pub struct Reassembler {
    framing: Framing,
    buffers: SlotBuffers,
    state: StreamState,
    partial: Vec<u8>,
}

impl Reassembler {
    pub fn new(framing: Framing, slots: usize) -> Self {
        Self {
            framing,
            buffers: SlotBuffers::new(slots),
            state: StreamState::Pending,
            partial: Vec::new(),
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn buffers(&self) -> &SlotBuffers {
        &self.buffers
    }

    /// Fold one read into the buffers.
    ///
    /// Unparseable input is logged and dropped. A fragment for a slot outside the requested
    /// range aborts reassembly.
    pub fn apply_chunk(&mut self, chunk: &[u8]) -> Result<(), ReassemblyError> {
        if self.state.is_terminal() {
            debug!("Ignoring {} bytes received after the stream ended", chunk.len());
            return Ok(());
        }
        self.state = StreamState::Streaming;

        let fragments = match self.framing {
            Framing::Concatenated => parse_concatenated(chunk),
            Framing::NdJson => self.parse_ndjson(chunk),
        };

        for fragment in fragments {
            if let Err(e) = self.fold(fragment) {
                self.state = StreamState::Failed;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Mark the stream as ended by the transport. Residual bytes are not parsed.
    pub fn finish(&mut self) {
        if !self.partial.is_empty() {
            debug!(
                "Discarding {} trailing bytes without a line terminator",
                self.partial.len()
            );
            self.partial.clear();
        }
        if self.state != StreamState::Failed {
            self.state = StreamState::Completed;
        }
    }

    /// Drive reassembly from a response body until it ends, fails or `cancel` fires.
    ///
    /// `on_progress` is called after every read and once more when the stream ends. On
    /// cancellation the loop stops without touching the state; the caller owns the cleanup.
    pub async fn consume<S, E>(
        &mut self,
        body: S,
        cancel: &CancellationToken,
        mut on_progress: impl FnMut(&Reassembler),
    ) -> Result<(), ReassemblyError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: Display,
    {
        futures_util::pin_mut!(body);
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Reassembly cancelled");
                    return Ok(());
                }
                next = body.next() => next,
            };

            match next {
                Some(Ok(chunk)) => {
                    let applied = self.apply_chunk(&chunk);
                    on_progress(self);
                    applied?;
                }
                Some(Err(e)) => {
                    self.state = StreamState::Failed;
                    on_progress(self);
                    return Err(ReassemblyError::Transport(e.to_string()));
                }
                None => {
                    self.finish();
                    on_progress(self);
                    return Ok(());
                }
            }
        }
    }

    fn fold(&mut self, fragment: CompletionFragment) -> Result<(), ReassemblyError> {
        if fragment.index >= self.buffers.len() {
            return Err(ReassemblyError::SlotOutOfRange {
                index: fragment.index,
                slots: self.buffers.len(),
            });
        }
        // Fragments made only of escaped newline sequences are dropped, but kept fragments
        // are appended verbatim.
        if fragment.text.replace("\\n", "").is_empty() {
            return Ok(());
        }
        self.buffers.append(fragment.index, &fragment.text)
    }

    fn parse_ndjson(&mut self, chunk: &[u8]) -> Vec<CompletionFragment> {
        self.partial.extend_from_slice(chunk);
        let Some(last_newline) = self.partial.iter().rposition(|b| *b == b'\n') else {
            return Vec::new();
        };
        let rest = self.partial.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.partial, rest);

        complete
            .split(|b| *b == b'\n')
            .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
            .filter(|line| !line.is_empty())
            .filter_map(|line| match serde_json::from_slice(line) {
                Ok(fragment) => Some(fragment),
                Err(e) => {
                    warn!(
                        "Dropping unparseable fragment {:?}: {}",
                        String::from_utf8_lossy(line),
                        e
                    );
                    None
                }
            })
            .collect()
    }
}

/// Repair a read of back-to-back JSON objects into an array and parse it.
fn parse_concatenated(chunk: &[u8]) -> Vec<CompletionFragment> {
    let text = String::from_utf8_lossy(chunk);
    let repaired = format!("[{}]", text.replace("}{", "},{"));
    match serde_json::from_str(&repaired) {
        Ok(fragments) => fragments,
        Err(e) => {
            warn!("Dropping unparseable chunk {:?}: {}", text, e);
            Vec::new()
        }
    }
}
