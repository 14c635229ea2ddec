//! ChatCierge - streamed hotel recommendations
//!
//! One completion request carries a prompt per hotel. The provider answers with a single SSE
//! stream whose fragments are tagged with the index of the prompt they belong to; the server
//! demultiplexes that stream into compact `{text, index}` frames and the client reassembles
//! them into one text buffer per hotel.

use axum::Router;
use axum::routing::{get, post};
use axum_prometheus::{
    GenericMetricLayer, Handle, PrometheusMetricLayerBuilder,
    metrics_exporter_prometheus::PrometheusHandle,
};
use bon::Builder;
use std::borrow::Cow;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

pub mod catalog;
pub mod client;
pub mod demux;
pub mod encoder;
pub mod errors;
pub mod feed;
pub mod handlers;
pub mod hotels;
pub mod models;
pub mod openai;
pub mod prompt;
pub mod reassembler;
pub mod settings;
pub mod sse;
pub mod supabase;
pub mod traits;
pub mod wire;

use settings::{SearchSettings, StreamSettings};
use traits::{CompletionProvider, EmbeddingProvider, HotelStore};

/// Everything a request handler needs
#[derive(Clone, Debug, Builder)]
pub struct AppState {
    pub embeddings: Arc<dyn EmbeddingProvider>,
    pub completions: Arc<dyn CompletionProvider>,
    pub store: Arc<dyn HotelStore>,
    #[builder(default)]
    pub stream: StreamSettings,
    #[builder(default)]
    pub search: SearchSettings,
    /// Cancelled on shutdown. Every open recommendation stream holds a child of it.
    #[builder(default)]
    pub shutdown: CancellationToken,
}

/// Build the main router
/// This creates routes for:
/// - `/api/recommendations` - Streams one recommendation per hotel
/// - `/api/hotels` - Returns the hotels matching a question
/// - `/api/health` - Reports whether the upstream services are reachable
#[instrument(skip(state))]
pub fn build_router(state: AppState) -> Router {
    info!("Building router");
    Router::new()
        .route("/api/recommendations", post(handlers::recommendations))
        .route("/api/hotels", post(handlers::hotels))
        .route("/api/health", get(handlers::health))
        .with_state(state)
}

/// Builds a router for the metrics endpoint.
#[instrument(skip(handle))]
pub fn build_metrics_router(handle: PrometheusHandle) -> Router {
    info!("Building metrics router");
    Router::new().route("/metrics", get(move || async move { handle.render() }))
}

type MetricsLayerAndHandle = (
    GenericMetricLayer<'static, PrometheusHandle, Handle>,
    PrometheusHandle,
);

/// Builds a layer and handle for prometheus metrics collection.
///
/// `prefix` is prepended to every metric name.
pub fn build_metrics_layer_and_handle(
    prefix: impl Into<Cow<'static, str>>,
) -> MetricsLayerAndHandle {
    info!("Building metrics layer");
    PrometheusMetricLayerBuilder::new()
        .with_prefix(prefix)
        .enable_response_body_size(true)
        .with_endpoint_label_type(axum_prometheus::EndpointLabel::Exact)
        .with_default_metrics()
        .build_pair()
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Catalog, CatalogEntry, CatalogFile};
    use crate::errors::ProviderError;
    use crate::models::{HealthResponse, Hotel, HotelRecord, HotelsResponse};
    use crate::openai::OpenAiClient;
    use crate::settings::CompletionSettings;
    use crate::test_utils::MockHttpClient;
    use crate::traits::{ByteStream, Embedding};
    use crate::wire::{FRAMING_HEADER, Framing, SLOT_COUNT_HEADER};
    use async_trait::async_trait;
    use axum::http::StatusCode;
    use axum_test::TestServer;
    use serde_json::json;

    #[derive(Debug)]
    struct FailingCompletions;

    #[async_trait]
    impl CompletionProvider for FailingCompletions {
        async fn stream_completions(&self, _prompts: &[String]) -> Result<ByteStream, ProviderError> {
            Err(ProviderError::new("OpenAI:getCompletions", "quota exceeded"))
        }
    }

    #[derive(Debug)]
    struct FixedEmbedding(Embedding);

    #[async_trait]
    impl EmbeddingProvider for FixedEmbedding {
        async fn embed(&self, _text: &str) -> Result<Embedding, ProviderError> {
            Ok(self.0.clone())
        }
    }

    fn catalog() -> Catalog {
        let entry = |id: i64, uuid: &str, name: &str, embedding: Vec<f32>| CatalogEntry {
            record: HotelRecord {
                id,
                uuid: uuid.to_string(),
                name: name.to_string(),
                description: "Close to the sea.".to_string(),
                city_name: "Nice".to_string(),
                local_image_url: None,
                fallback_image_url: None,
            },
            embedding,
        };
        Catalog::from_config(CatalogFile {
            hotels: vec![
                entry(1, "surf", "Surf Shack", vec![1.0, 0.0]),
                entry(2, "ski", "Ski Chalet", vec![0.0, 1.0]),
                entry(3, "spa", "Spa Resort", vec![0.9, 0.2]),
            ],
        })
    }

    fn completion_chunks() -> Vec<String> {
        [
            r#"{"choices":[{"text":"\n\n","index":0}]}"#,
            r#"{"choices":[{"text":"Gre","index":0}]}"#,
            r#"{"choices":[{"text":"Ni","index":1}]}"#,
            r#"{"choices":[{"text":"at","index":0}]}"#,
            r#"{"choices":[{"text":"ce","index":1}]}"#,
            "[DONE]",
        ]
        .iter()
        .map(|data| format!("data: {data}\n\n"))
        .collect()
    }

    fn state(completions: Arc<dyn CompletionProvider>) -> AppState {
        AppState::builder()
            .embeddings(Arc::new(FixedEmbedding(vec![1.0, 0.0])))
            .completions(completions)
            .store(Arc::new(catalog()))
            .build()
    }

    fn openai(mock: MockHttpClient) -> Arc<OpenAiClient<MockHttpClient>> {
        Arc::new(OpenAiClient::new(
            mock,
            openai::DEFAULT_BASE_URL.parse().unwrap(),
            "sk-test",
            None,
            CompletionSettings::default(),
        ))
    }

    #[tokio::test]
    async fn recommendations_stream_ndjson_frames() {
        let mock = MockHttpClient::new_streaming(StatusCode::OK, completion_chunks());
        let server = TestServer::new(build_router(state(openai(mock.clone())))).unwrap();

        let response = server
            .post("/api/recommendations")
            .json(&json!({"question": "Where can I surf?"}))
            .await;

        assert_eq!(response.status_code(), 200);
        assert_eq!(response.header("content-type"), "text/event-stream");
        assert_eq!(response.header(FRAMING_HEADER), "ndjson");
        assert_eq!(response.header(SLOT_COUNT_HEADER), "2");
        assert_eq!(
            response.text(),
            concat!(
                "{\"text\":\"Gre\",\"index\":0}\n",
                "{\"text\":\"Ni\",\"index\":1}\n",
                "{\"text\":\"at\",\"index\":0}\n",
                "{\"text\":\"ce\",\"index\":1}\n",
            )
        );

        // Surf Shack and Spa Resort pass the threshold, best match first.
        let request = &mock.get_requests()[0];
        let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
        let prompts = body["prompt"].as_array().unwrap();
        assert_eq!(prompts.len(), 2);
        assert!(prompts[0].as_str().unwrap().contains("Surf Shack."));
        assert!(prompts[1].as_str().unwrap().contains("Spa Resort."));
    }

    #[tokio::test]
    async fn recommendations_use_concatenated_framing_when_configured() {
        let mock = MockHttpClient::new_streaming(StatusCode::OK, completion_chunks());
        let mut state = state(openai(mock));
        state.stream.framing = Framing::Concatenated;
        let server = TestServer::new(build_router(state)).unwrap();

        let response = server
            .post("/api/recommendations")
            .json(&json!({"question": "Where can I surf?"}))
            .await;

        assert_eq!(response.header(FRAMING_HEADER), "concatenated");
        assert_eq!(
            response.text(),
            concat!(
                "{\"text\":\"Gre\",\"index\":0}",
                "{\"text\":\"Ni\",\"index\":1}",
                "{\"text\":\"at\",\"index\":0}",
                "{\"text\":\"ce\",\"index\":1}",
            )
        );
    }

    #[tokio::test]
    async fn explicit_hotels_fix_the_slot_order() {
        let mock = MockHttpClient::new_streaming(StatusCode::OK, completion_chunks());
        let server = TestServer::new(build_router(state(openai(mock.clone())))).unwrap();

        let response = server
            .post("/api/recommendations")
            .json(&json!({"question": "Anything?", "hotelUUIDs": ["ski", "unknown", "surf"]}))
            .await;
        assert_eq!(response.header(SLOT_COUNT_HEADER), "2");

        let body: serde_json::Value =
            serde_json::from_slice(&mock.get_requests()[0].body).unwrap();
        assert!(body["prompt"][0].as_str().unwrap().contains("Ski Chalet."));
        assert!(body["prompt"][1].as_str().unwrap().contains("Surf Shack."));
    }

    #[tokio::test]
    async fn blank_question_is_rejected() {
        let mock = MockHttpClient::new_streaming(StatusCode::OK, completion_chunks());
        let server = TestServer::new(build_router(state(openai(mock.clone())))).unwrap();

        let response = server
            .post("/api/recommendations")
            .json(&json!({"question": "   "}))
            .await;
        assert_eq!(response.status_code(), 400);
        assert!(mock.get_requests().is_empty());
    }

    #[tokio::test]
    async fn no_matching_hotels_gives_an_empty_stream() {
        let mock = MockHttpClient::new_streaming(StatusCode::OK, completion_chunks());
        let server = TestServer::new(build_router(state(openai(mock.clone())))).unwrap();

        let response = server
            .post("/api/recommendations")
            .json(&json!({"question": "q", "hotelUUIDs": []}))
            .await;
        assert_eq!(response.status_code(), 200);
        assert_eq!(response.header(SLOT_COUNT_HEADER), "0");
        assert_eq!(response.text(), "");
        assert!(mock.get_requests().is_empty());
    }

    #[tokio::test]
    async fn completion_failure_gives_an_empty_stream() {
        let server = TestServer::new(build_router(state(Arc::new(FailingCompletions)))).unwrap();

        let response = server
            .post("/api/recommendations")
            .json(&json!({"question": "Where can I surf?"}))
            .await;
        assert_eq!(response.status_code(), 200);
        assert_eq!(response.header(SLOT_COUNT_HEADER), "2");
        assert_eq!(response.text(), "");
    }

    #[tokio::test]
    async fn hotels_endpoint_lists_matches() {
        let server = TestServer::new(build_router(state(Arc::new(FailingCompletions)))).unwrap();

        let response = server
            .post("/api/hotels")
            .json(&json!({"question": "Where can I surf?"}))
            .await;
        assert_eq!(response.status_code(), 200);
        let body: HotelsResponse = response.json();
        assert!(body.success);
        let names: Vec<&str> = body.hotels.iter().map(|h: &Hotel| h.name.as_str()).collect();
        assert_eq!(names, vec!["Surf Shack", "Spa Resort"]);
    }

    #[tokio::test]
    async fn hotels_endpoint_resolves_explicit_uuids() {
        let server = TestServer::new(build_router(state(Arc::new(FailingCompletions)))).unwrap();

        let response = server
            .post("/api/hotels")
            .json(&json!({"question": "Anything?", "hotelUUIDs": ["ski", "unknown", "surf"]}))
            .await;
        let body: HotelsResponse = response.json();
        let names: Vec<&str> = body.hotels.iter().map(|h: &Hotel| h.name.as_str()).collect();
        assert_eq!(names, vec!["Ski Chalet", "Surf Shack"]);
    }

    #[tokio::test]
    async fn health_reports_both_services() {
        let server = TestServer::new(build_router(state(Arc::new(FailingCompletions)))).unwrap();

        let response = server.get("/api/health").await;
        assert_eq!(response.status_code(), 200);
        assert_eq!(
            response.json::<HealthResponse>(),
            HealthResponse {
                openai: true,
                store: true
            }
        );
    }

    #[tokio::test]
    async fn unknown_routes_are_not_found() {
        let server = TestServer::new(build_router(state(Arc::new(FailingCompletions)))).unwrap();
        let response = server.get("/api/time").await;
        assert_eq!(response.status_code(), 404);
    }

    #[tokio::test]
    async fn metrics_router_renders() {
        let (_layer, handle) = build_metrics_layer_and_handle("chatcierge_test");
        let server = TestServer::new(build_metrics_router(handle)).unwrap();
        let response = server.get("/metrics").await;
        assert_eq!(response.status_code(), 200);
    }
}
