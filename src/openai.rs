//! OpenAI-backed embedding and completion providers
use crate::client::HttpClient;
use crate::errors::ProviderError;
use crate::prompt::one_line;
use crate::settings::CompletionSettings;
use crate::traits::{ByteStream, CompletionProvider, Embedding, EmbeddingProvider};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request, header};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, instrument};
use url::Url;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1/";

const EMBEDDING_MODEL: &str = "text-embedding-ada-002";

/// Largest non-streamed response body we are willing to buffer.
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

const EMBEDDING_SOURCE: &str = "OpenAI:getEmbedding";
const COMPLETIONS_SOURCE: &str = "OpenAI:getCompletions";

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    input: &'a str,
    model: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Embedding,
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    prompt: &'a [String],
    stream: bool,
    max_tokens: u32,
    temperature: f32,
    frequency_penalty: f32,
    presence_penalty: f32,
}

#[derive(Clone)]
pub struct OpenAiClient<T: HttpClient> {
    http: T,
    base_url: Url,
    api_key: String,
    organization: Option<String>,
    completion: CompletionSettings,
}

impl<T: HttpClient> std::fmt::Debug for OpenAiClient<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiClient")
            .field("base_url", &self.base_url.as_str())
            .field("organization", &self.organization)
            .field("completion", &self.completion)
            .finish_non_exhaustive()
    }
}

impl<T: HttpClient> OpenAiClient<T> {
    pub fn new(
        http: T,
        base_url: Url,
        api_key: impl Into<String>,
        organization: Option<String>,
        completion: CompletionSettings,
    ) -> Self {
        Self {
            http,
            base_url,
            api_key: api_key.into(),
            organization,
            completion,
        }
    }

    fn build_request(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
        call_site: &str,
    ) -> Result<Request<Body>, ProviderError> {
        let url = self
            .base_url
            .join(path)
            .map_err(|e| ProviderError::new(call_site, e))?;

        let mut builder = Request::builder()
            .method(method)
            .uri(url.as_str())
            .header(header::AUTHORIZATION, format!("Bearer {}", self.api_key))
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(organization) = &self.organization {
            builder = builder.header("OpenAI-Organization", organization);
        }

        builder
            .body(body.map(Body::from).unwrap_or_else(Body::empty))
            .map_err(|e| ProviderError::new(call_site, e))
    }

    async fn send(
        &self,
        request: Request<Body>,
        call_site: &str,
    ) -> Result<axum::response::Response, ProviderError> {
        let response = self.http.request(request).await.map_err(|e| {
            error!("OpenAI request error: {}", e);
            ProviderError::new(call_site, e)
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = axum::body::to_bytes(response.into_body(), MAX_BODY_BYTES)
            .await
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_default();
        error!(status = %status, "OpenAI returned an error: {}", body);
        Err(ProviderError::new(
            call_site,
            format!("unexpected status {status}: {body}"),
        ))
    }
}

#[async_trait]
impl<T: HttpClient + 'static> EmbeddingProvider for OpenAiClient<T> {
    #[instrument(skip(self, text))]
    async fn embed(&self, text: &str) -> Result<Embedding, ProviderError> {
        let input = one_line(&text.replace('\n', ""));
        let body = serde_json::to_vec(&EmbeddingRequest {
            input: &input,
            model: EMBEDDING_MODEL,
        })
        .map_err(|e| ProviderError::new(EMBEDDING_SOURCE, e))?;

        let request =
            self.build_request(Method::POST, "embeddings", Some(body), EMBEDDING_SOURCE)?;
        let response = self.send(request, EMBEDDING_SOURCE).await?;

        let bytes = axum::body::to_bytes(response.into_body(), MAX_BODY_BYTES)
            .await
            .map_err(|e| ProviderError::new(EMBEDDING_SOURCE, e))?;
        let parsed: EmbeddingResponse = serde_json::from_slice(&bytes)
            .map_err(|e| ProviderError::new(EMBEDDING_SOURCE, e))?;

        let embedding = parsed
            .data
            .into_iter()
            .next()
            .map(|data| data.embedding)
            .ok_or_else(|| ProviderError::new(EMBEDDING_SOURCE, "response contained no embedding"))?;
        debug!("Received embedding with {} dimensions", embedding.len());
        Ok(embedding)
    }

    async fn ping(&self) -> bool {
        let request = match self.build_request(Method::GET, "models", None, "OpenAI:ping") {
            Ok(request) => request,
            Err(e) => {
                error!("OpenAI ping error: {}", e);
                return false;
            }
        };
        match self.http.request(request).await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                error!("OpenAI ping error: {}", e);
                false
            }
        }
    }
}

#[async_trait]
impl<T: HttpClient + 'static> CompletionProvider for OpenAiClient<T> {
    #[instrument(skip(self, prompts), fields(prompts = prompts.len()))]
    async fn stream_completions(&self, prompts: &[String]) -> Result<ByteStream, ProviderError> {
        let body = serde_json::to_vec(&CompletionRequest {
            model: &self.completion.model,
            prompt: prompts,
            stream: true,
            max_tokens: self.completion.max_tokens,
            temperature: self.completion.temperature,
            frequency_penalty: self.completion.frequency_penalty,
            presence_penalty: self.completion.presence_penalty,
        })
        .map_err(|e| ProviderError::new(COMPLETIONS_SOURCE, e))?;

        let request =
            self.build_request(Method::POST, "completions", Some(body), COMPLETIONS_SOURCE)?;
        let response = self.send(request, COMPLETIONS_SOURCE).await?;
        debug!("Completion stream opened");
        Ok(response.into_body().into_data_stream().boxed())
    }
}
