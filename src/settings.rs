//! Tunables for the recommendation pipeline, shared between the CLI and the library.
use crate::wire::Framing;
use bon::Builder;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Generation parameters sent with every completion request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Builder)]
pub struct CompletionSettings {
    #[builder(into, default = "text-davinci-003".to_string())]
    pub model: String,
    #[builder(default = 2500)]
    pub max_tokens: u32,
    #[builder(default = 0.7)]
    pub temperature: f32,
    #[builder(default = 0.0)]
    pub frequency_penalty: f32,
    #[builder(default = 0.0)]
    pub presence_penalty: f32,
}

impl Default for CompletionSettings {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Parameters for the similarity search run for a question.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Builder)]
pub struct SearchSettings {
    #[builder(default = 0.75)]
    pub similarity_threshold: f32,
    #[builder(default = 5)]
    pub match_count: usize,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// How recommendation streams are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSettings {
    pub framing: Framing,
    /// Maximum wait for the next upstream record. `None` waits forever.
    pub read_timeout: Option<Duration>,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            framing: Framing::default(),
            read_timeout: Some(Duration::from_secs(30)),
        }
    }
}
