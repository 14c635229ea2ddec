//! Integration tests for the recommendation stream
//!
//! These tests run the whole pipeline in process: a fake completion API, the recommendation
//! router and the reassembling client, all wired together through `tower::ServiceExt::oneshot`.

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use bytes::Bytes;
use chatcierge::catalog::{Catalog, CatalogEntry, CatalogFile};
use chatcierge::client::{BoxError, HttpClient};
use chatcierge::errors::ReassemblyError;
use chatcierge::feed::{HotelRecommendations, RecommendationFeed, RecommendationsClient};
use chatcierge::models::HotelRecord;
use chatcierge::openai::OpenAiClient;
use chatcierge::reassembler::StreamState;
use chatcierge::settings::{CompletionSettings, StreamSettings};
use chatcierge::wire::Framing;
use chatcierge::{AppState, build_router};
use rstest::rstest;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tower::util::ServiceExt; // for oneshot()

/// Sends requests straight into a router, whatever host the URI names.
#[derive(Debug, Clone)]
struct RouterClient(Router);

#[async_trait]
impl HttpClient for RouterClient {
    async fn request(&self, req: axum::extract::Request) -> Result<Response, BoxError> {
        Ok(self.0.clone().oneshot(req).await?)
    }
}

/// A fake completion API whose completion body is written in `parts`, one network read each.
fn fake_openai(status: StatusCode, parts: Vec<String>) -> RouterClient {
    let router = Router::new()
        .route(
            "/v1/embeddings",
            post(|| async { axum::Json(json!({"data": [{"embedding": [1.0, 0.0]}]})) }),
        )
        .route(
            "/v1/completions",
            post(move || {
                let parts = parts.clone();
                async move {
                    let body = futures_util::stream::iter(
                        parts
                            .into_iter()
                            .map(|part| Ok::<_, std::io::Error>(Bytes::from(part))),
                    );
                    (
                        status,
                        [("content-type", "text/event-stream")],
                        Body::from_stream(body),
                    )
                        .into_response()
                }
            }),
        );
    RouterClient(router)
}

/// A fake completion API that writes each prompt's hotel name into that prompt's slot. The
/// first question embeds next to the river, every later one next to the hills.
fn naming_openai(embeddings: Arc<AtomicUsize>) -> RouterClient {
    let router = Router::new()
        .route(
            "/v1/embeddings",
            post(move || {
                let first = embeddings.fetch_add(1, Ordering::SeqCst) == 0;
                let embedding = if first { [1.0, 0.0] } else { [0.0, 1.0] };
                async move { axum::Json(json!({"data": [{"embedding": embedding}]})) }
            }),
        )
        .route(
            "/v1/completions",
            post(|axum::Json(body): axum::Json<serde_json::Value>| async move {
                let names = ["River House", "Harbour Inn", "Hill Lodge"];
                let prompts = body["prompt"].as_array().cloned().unwrap_or_default();
                let mut events: String = prompts
                    .iter()
                    .enumerate()
                    .map(|(index, prompt)| {
                        let prompt = prompt.as_str().unwrap_or_default();
                        let name = names.iter().find(|name| prompt.contains(*name));
                        choice(name.unwrap_or(&"?"), index)
                    })
                    .collect();
                events.push_str(&sse_event("[DONE]"));
                ([("content-type", "text/event-stream")], events)
            }),
        );
    RouterClient(router)
}

fn sse_event(data: &str) -> String {
    format!("data: {data}\n\n")
}

fn choice(text: &str, index: usize) -> String {
    sse_event(&json!({"choices": [{"text": text, "index": index}]}).to_string())
}

/// Two interleaved completions behind a blank preamble, as the provider sends them.
fn two_slot_completion() -> String {
    [
        choice("\n\n", 0),
        choice("Gre", 0),
        choice("Ni", 1),
        choice("at", 0),
        choice("ce", 1),
        sse_event("[DONE]"),
    ]
    .concat()
}

fn split_at(text: &str, offsets: &[usize]) -> Vec<String> {
    let mut parts = Vec::new();
    let mut start = 0;
    for &offset in offsets {
        parts.push(text[start..offset].to_string());
        start = offset;
    }
    parts.push(text[start..].to_string());
    parts
}

fn catalog() -> Catalog {
    let entry = |id: i64, uuid: &str, name: &str, embedding: Vec<f32>| CatalogEntry {
        record: HotelRecord {
            id,
            uuid: uuid.to_string(),
            name: name.to_string(),
            description: "By the water.".to_string(),
            city_name: "Porto".to_string(),
            local_image_url: None,
            fallback_image_url: None,
        },
        embedding,
    };
    Catalog::from_config(CatalogFile {
        hotels: vec![
            entry(1, "river", "River House", vec![1.0, 0.0]),
            entry(2, "harbour", "Harbour Inn", vec![0.95, 0.1]),
            entry(3, "hills", "Hill Lodge", vec![0.0, 1.0]),
        ],
    })
}

fn feed(openai: RouterClient, framing: Framing) -> RecommendationFeed<RouterClient> {
    let openai = Arc::new(OpenAiClient::new(
        openai,
        "http://openai.test/v1/".parse().unwrap(),
        "sk-test",
        None,
        CompletionSettings::default(),
    ));
    let state = AppState::builder()
        .embeddings(openai.clone())
        .completions(openai)
        .store(Arc::new(catalog()))
        .stream(StreamSettings {
            framing,
            ..StreamSettings::default()
        })
        .build();
    let server = RouterClient(build_router(state));

    // The client is deliberately configured with the other framing: the response header wins.
    let fallback = match framing {
        Framing::NdJson => Framing::Concatenated,
        Framing::Concatenated => Framing::NdJson,
    };
    RecommendationFeed::new(RecommendationsClient::new(
        server,
        "http://chatcierge.test/".parse().unwrap(),
        fallback,
    ))
}

#[rstest]
#[case::ndjson(Framing::NdJson)]
#[case::concatenated(Framing::Concatenated)]
#[tokio::test]
async fn interleaved_completions_land_in_their_slots(#[case] framing: Framing) {
    let feed = feed(
        fake_openai(StatusCode::OK, vec![two_slot_completion()]),
        framing,
    );

    let result = feed.ask("Somewhere by the river?", None).await.unwrap();

    assert_eq!(result.slots.as_slice(), ["Great", "Nice"]);
    assert_eq!(result.state, StreamState::Completed);
    assert_eq!(feed.current(), result);
}

#[tokio::test]
async fn upstream_reads_may_split_anywhere() {
    let completion = two_slot_completion();
    // Inside a field name, inside the JSON, between the two newlines of a record terminator.
    let first_record_end = choice("\n\n", 0).len();
    let parts = split_at(&completion, &[3, 17, first_record_end - 1, first_record_end + 30]);
    let feed = feed(fake_openai(StatusCode::OK, parts), Framing::NdJson);

    let result = feed.ask("Somewhere by the river?", None).await.unwrap();
    assert_eq!(result.slots.as_slice(), ["Great", "Nice"]);
}

#[tokio::test]
async fn events_after_done_are_ignored() {
    let completion = [
        choice("Only", 0),
        sse_event("[DONE]"),
        choice("late", 0),
        choice("later", 1),
    ]
    .concat();
    let feed = feed(fake_openai(StatusCode::OK, vec![completion]), Framing::NdJson);

    let result = feed.ask("Somewhere by the river?", None).await.unwrap();
    assert_eq!(result.slots.as_slice(), ["Only", ""]);
}

#[tokio::test]
async fn each_question_starts_from_empty_buffers() {
    let feed = feed(
        fake_openai(StatusCode::OK, vec![two_slot_completion()]),
        Framing::NdJson,
    );

    let first = feed.ask("Somewhere by the river?", None).await.unwrap();
    let second = feed
        .ask("And the harbour?", Some(vec!["harbour".to_string(), "river".to_string()]))
        .await
        .unwrap();

    assert_eq!(first.slots.as_slice(), ["Great", "Nice"]);
    assert_eq!(second.slots.as_slice(), ["Great", "Nice"]);
    assert_eq!(second.generation, first.generation + 1);
}

#[tokio::test]
async fn completion_failure_yields_empty_recommendations() {
    let feed = feed(
        fake_openai(
            StatusCode::INTERNAL_SERVER_ERROR,
            vec![r#"{"error":"boom"}"#.to_string()],
        ),
        Framing::NdJson,
    );

    let result = feed.ask("Somewhere by the river?", None).await.unwrap();
    assert_eq!(result.state, StreamState::Completed);
    assert_eq!(result.slots.as_slice(), ["", ""]);
}

#[tokio::test]
async fn malformed_fragment_fails_the_stream() {
    let completion = [choice("Hi", 0), sse_event("{not json"), choice("there", 0)].concat();
    let feed = feed(fake_openai(StatusCode::OK, vec![completion]), Framing::NdJson);

    let err = feed.ask("Somewhere by the river?", None).await.unwrap_err();
    assert!(matches!(err, ReassemblyError::Transport(_)), "{err:?}");

    let current = feed.current();
    assert_eq!(current.state, StreamState::Failed);
    assert_eq!(current.slots.as_slice(), ["Hi", ""]);
}

#[tokio::test]
async fn fragment_for_unknown_slot_fails_the_stream() {
    let completion = [choice("Hi", 0), choice("stray", 7), sse_event("[DONE]")].concat();
    let feed = feed(fake_openai(StatusCode::OK, vec![completion]), Framing::NdJson);

    let err = feed.ask("Somewhere by the river?", None).await.unwrap_err();
    assert!(matches!(
        err,
        ReassemblyError::SlotOutOfRange { index: 7, slots: 2 }
    ));
    assert_eq!(feed.current().state, StreamState::Failed);
}

#[tokio::test]
async fn blank_question_is_rejected() {
    let feed = feed(
        fake_openai(StatusCode::OK, vec![two_slot_completion()]),
        Framing::NdJson,
    );

    let err = feed.ask("  ", None).await.unwrap_err();
    assert!(matches!(err, ReassemblyError::Status(StatusCode::BAD_REQUEST)));
}

fn labelled(result: &HotelRecommendations) -> Vec<(String, String)> {
    result
        .hotels
        .iter()
        .map(|hotel| hotel.name.clone())
        .zip(result.recommendations.slots.as_slice().iter().cloned())
        .collect()
}

#[tokio::test]
async fn recommend_embeds_the_question_once() {
    let embeddings = Arc::new(AtomicUsize::new(0));
    let feed = feed(naming_openai(embeddings.clone()), Framing::NdJson);

    let result = feed.recommend("Somewhere by the river?", None).await.unwrap();

    assert_eq!(embeddings.load(Ordering::SeqCst), 1);
    assert_eq!(
        labelled(&result),
        [
            ("River House".to_string(), "River House".to_string()),
            ("Harbour Inn".to_string(), "Harbour Inn".to_string()),
        ]
    );
}

#[tokio::test]
async fn recommend_labels_slots_past_an_unknown_uuid() {
    let embeddings = Arc::new(AtomicUsize::new(0));
    let feed = feed(naming_openai(embeddings.clone()), Framing::NdJson);
    let uuids = ["hills", "missing", "river"].map(String::from).to_vec();

    let result = feed.recommend("Anything?", Some(uuids)).await.unwrap();

    assert_eq!(embeddings.load(Ordering::SeqCst), 0);
    assert_eq!(
        labelled(&result),
        [
            ("Hill Lodge".to_string(), "Hill Lodge".to_string()),
            ("River House".to_string(), "River House".to_string()),
        ]
    );
}
