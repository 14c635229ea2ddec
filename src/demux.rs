//! Server-side bridge between decoded upstream events and the outbound wire format
//!
//! Completion providers tend to open every generation with a few newline-only fragments. Until
//! the first fragment with real text shows up (on any slot), fragments are decoded but held
//! back. After that every fragment is forwarded, newline-only ones included.
use crate::errors::StreamError;
use crate::sse::UpstreamEvent;
use crate::wire::CompletionFragment;
use serde::Deserialize;
use tracing::{debug, trace};

/// Payload sent by the provider to signal there is no more data.
pub const DONE_SENTINEL: &str = "[DONE]";

/// The subset of a streamed completion chunk the pipeline cares about.
#[derive(Debug, Deserialize)]
struct CompletionChunk {
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    text: String,
    index: usize,
}

/// Per-request pipeline state. One instance per recommendation request, never shared.
#[derive(Debug, Default, Clone)]
pub struct PipelineContext {
    seen_content: bool,
    forwarded: usize,
    suppressed: usize,
}

impl PipelineContext {
    /// Whether a fragment with real text has been seen on any slot yet.
    pub fn seen_content(&self) -> bool {
        self.seen_content
    }

    pub fn forwarded(&self) -> usize {
        self.forwarded
    }

    pub fn suppressed(&self) -> usize {
        self.suppressed
    }
}

/// What the demultiplexer decided to do with one upstream event.
#[derive(Debug, PartialEq, Eq)]
pub enum Demuxed {
    /// Write this fragment onto the outbound stream.
    Forward(CompletionFragment),
    /// Leading newline preamble; decoded but not forwarded.
    Suppressed,
    /// Not a message record (e.g. a reconnect hint); nothing to do.
    Skipped,
    /// The provider sent the sentinel. Close the outbound stream.
    Done,
}

#[derive(Debug, Default)]
pub struct SlotDemultiplexer {
    context: PipelineContext,
    finished: bool,
}

impl SlotDemultiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn context(&self) -> &PipelineContext {
        &self.context
    }

    /// True once the sentinel has been seen. Later events are ignored.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn process(&mut self, event: &UpstreamEvent) -> Result<Demuxed, StreamError> {
        if self.finished {
            return Ok(Demuxed::Done);
        }

        let data = match event {
            UpstreamEvent::Message { data, .. } => data,
            UpstreamEvent::ReconnectInterval(_) => return Ok(Demuxed::Skipped),
        };

        if data == DONE_SENTINEL {
            debug!(
                forwarded = self.context.forwarded,
                suppressed = self.context.suppressed,
                "Upstream completion stream finished"
            );
            self.finished = true;
            return Ok(Demuxed::Done);
        }

        let chunk: CompletionChunk = serde_json::from_str(data)?;
        let choice = chunk
            .choices
            .into_iter()
            .next()
            .ok_or(StreamError::EmptyChoices)?;

        if !is_preamble(&choice.text) {
            self.context.seen_content = true;
        }

        if !self.context.seen_content {
            trace!(slot = choice.index, "Suppressing leading newline fragment");
            self.context.suppressed += 1;
            return Ok(Demuxed::Suppressed);
        }

        self.context.forwarded += 1;
        Ok(Demuxed::Forward(CompletionFragment {
            text: choice.text,
            index: choice.index,
        }))
    }
}

/// A fragment made only of newlines (or nothing at all) is part of the leading preamble.
fn is_preamble(text: &str) -> bool {
    text.chars().all(|c| c == '\n')
}
