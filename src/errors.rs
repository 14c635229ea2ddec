//! Error types shared across the recommendation pipeline
//!
//! Three families live here:
//! - [`ProviderError`]: the `{message, source}` envelope returned at every external boundary
//!   (OpenAI, Supabase, the local catalog). Callers recover from it locally.
//! - [`StreamError`]: fatal server-side pipeline errors. They end the outbound body with an
//!   error instead of a clean close.
//! - [`ReassemblyError`]: fatal client-side errors that abort reassembly.
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Error envelope for a failed call to an external collaborator.
///
/// `call_site` identifies the failing call for diagnostics, e.g. `OpenAI:getEmbedding`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{call_site}: {message}")]
pub struct ProviderError {
    pub message: String,
    #[serde(rename = "source")]
    pub call_site: String,
}

impl ProviderError {
    pub fn new(call_site: impl Into<String>, message: impl ToString) -> Self {
        Self {
            message: message.to_string(),
            call_site: call_site.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("malformed completion fragment: {0}")]
    Fragment(#[from] serde_json::Error),

    #[error("completion fragment carried no choices")]
    EmptyChoices,

    #[error("upstream read failed: {0}")]
    Upstream(String),

    #[error("no upstream data received within {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, thiserror::Error)]
pub enum ReassemblyError {
    #[error("fragment for slot {index} but only {slots} slots were requested")]
    SlotOutOfRange { index: usize, slots: usize },

    #[error("recommendation stream failed: {0}")]
    Transport(String),

    #[error("recommendation request rejected with status {0}")]
    Status(StatusCode),

    #[error("could not build recommendation request: {0}")]
    Request(String),
}
