use crate::errors::ProviderError;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;

pub type Embedding = Vec<f32>;

/// Raw response body of a streamed completion request.
pub type ByteStream = BoxStream<'static, Result<Bytes, axum::Error>>;

/// Turns free text into a fixed-dimension vector.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync + std::fmt::Debug {
    /// Embed `text`. Queried once per user question.
    async fn embed(&self, text: &str) -> Result<Embedding, ProviderError>;

    /// Cheap reachability check.
    async fn ping(&self) -> bool {
        true
    }
}

/// Starts a streamed completion for several prompts at once.
#[async_trait]
pub trait CompletionProvider: Send + Sync + std::fmt::Debug {
    /// Returns the provider's SSE byte stream. Each event carries `choices[0] = {text, index}`,
    /// where `index` is the position of the prompt in `prompts`; the stream ends with the
    /// `[DONE]` sentinel.
    async fn stream_completions(&self, prompts: &[String]) -> Result<ByteStream, ProviderError>;
}
