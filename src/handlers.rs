//! Axum handlers for the recommendation API
use crate::AppState;
use crate::encoder::{StreamOptions, empty_response, encode_stream, streaming_response};
use crate::hotels::{hotels_for_question, hotels_from_uuids};
use crate::models::{HealthResponse, Hotel, HotelsResponse, RecommendationParams};
use crate::prompt::create_prompts;
use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::{error, info, instrument};

/// Stream one recommendation per hotel.
///
/// The hotels are the ones named in `hotelUUIDs`, or else the best matches for the question.
/// Slot `i` of the stream belongs to hotel `i`. When there is nothing to recommend, or the
/// completion provider cannot be reached, the stream is empty.
#[instrument(skip(state, params))]
pub async fn recommendations(
    State(state): State<AppState>,
    Json(params): Json<RecommendationParams>,
) -> Response {
    let question = params.question.trim();
    if question.is_empty() {
        return (StatusCode::BAD_REQUEST, "question must not be empty").into_response();
    }

    let hotels = resolve_hotels(&state, question, params.hotel_uuids.as_deref()).await;

    let framing = state.stream.framing;
    let prompts = create_prompts(question, &hotels);
    let slots = prompts.len();
    if prompts.is_empty() {
        info!("No hotels to recommend");
        return empty_response(framing, 0);
    }

    let upstream = match state.completions.stream_completions(&prompts).await {
        Ok(upstream) => upstream,
        Err(e) => {
            error!(source = %e.call_site, "Failed to start completions: {}", e.message);
            return empty_response(framing, slots);
        }
    };

    info!("Streaming {} recommendations as {}", slots, framing);
    let body = encode_stream(
        upstream,
        StreamOptions {
            framing,
            read_timeout: state.stream.read_timeout,
            cancel: state.shutdown.child_token(),
        },
    );
    streaming_response(body, framing, slots)
}

/// The hotels a recommendation request with the same body would cover, without generating
/// anything.
#[instrument(skip(state, params))]
pub async fn hotels(
    State(state): State<AppState>,
    Json(params): Json<RecommendationParams>,
) -> Json<HotelsResponse> {
    let hotels = resolve_hotels(&state, params.question.trim(), params.hotel_uuids.as_deref()).await;
    Json(HotelsResponse {
        success: true,
        hotels,
    })
}

async fn resolve_hotels(state: &AppState, question: &str, uuids: Option<&[String]>) -> Vec<Hotel> {
    match uuids {
        Some(uuids) => hotels_from_uuids(state.store.as_ref(), uuids).await,
        None => {
            hotels_for_question(
                state.embeddings.as_ref(),
                state.store.as_ref(),
                question,
                &state.search,
            )
            .await
        }
    }
}

#[instrument(skip(state))]
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let (openai, store) = tokio::join!(state.embeddings.ping(), state.store.ping());
    Json(HealthResponse { openai, store })
}
