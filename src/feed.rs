//! Client side of the recommendation stream
//!
//! [`RecommendationsClient`] issues the HTTP requests. [`RecommendationFeed`] drives a
//! [`Reassembler`] over the response and publishes a [`Recommendations`] snapshot after every
//! read, so consumers can render partial text as it arrives.
//!
//! Only one request is live at a time: asking a new question cancels the previous stream and
//! resets the snapshot before the new request is sent. Every snapshot carries the generation of
//! the request it belongs to, and snapshots of a superseded generation are never published.
use crate::client::HttpClient;
use crate::errors::ReassemblyError;
use crate::models::{Hotel, HotelsResponse, RecommendationParams};
use crate::reassembler::{Reassembler, SlotBuffers, StreamState};
use crate::traits::ByteStream;
use crate::wire::{FRAMING_HEADER, Framing, SLOT_COUNT_HEADER};
use axum::body::Body;
use axum::http::{HeaderMap, Method, Request, header};
use futures_util::StreamExt;
use serde::Serialize;
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use url::Url;

const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// What a consumer sees of the current request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Recommendations {
    pub generation: u64,
    pub slots: SlotBuffers,
    pub state: StreamState,
}

/// Recommendations together with the hotels their slots belong to: slot `i` is about
/// `hotels[i]`.
#[derive(Debug, Clone, PartialEq)]
pub struct HotelRecommendations {
    pub hotels: Vec<Hotel>,
    pub recommendations: Recommendations,
}

impl Recommendations {
    fn pending(generation: u64, slots: usize) -> Self {
        Self {
            generation,
            slots: SlotBuffers::new(slots),
            state: StreamState::Pending,
        }
    }
}

/// An open recommendation stream.
pub struct OpenStream {
    pub framing: Framing,
    /// Slot count announced by the server, when it announced one.
    pub slots: Option<usize>,
    pub body: ByteStream,
}

impl std::fmt::Debug for OpenStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenStream")
            .field("framing", &self.framing)
            .field("slots", &self.slots)
            .finish_non_exhaustive()
    }
}

/// HTTP client for a recommendation server.
#[derive(Debug, Clone)]
pub struct RecommendationsClient<T: HttpClient> {
    http: T,
    base_url: Url,
    framing: Framing,
}

impl<T: HttpClient> RecommendationsClient<T> {
    /// `framing` is assumed for responses that do not announce their own.
    pub fn new(http: T, base_url: Url, framing: Framing) -> Self {
        Self {
            http,
            base_url,
            framing,
        }
    }

    fn post_json<B: Serialize>(&self, path: &str, body: &B) -> Result<Request<Body>, ReassemblyError> {
        let url = self
            .base_url
            .join(path)
            .map_err(|e| ReassemblyError::Request(e.to_string()))?;
        let body = serde_json::to_vec(body).map_err(|e| ReassemblyError::Request(e.to_string()))?;
        Request::builder()
            .method(Method::POST)
            .uri(url.as_str())
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .map_err(|e| ReassemblyError::Request(e.to_string()))
    }

    async fn send(&self, request: Request<Body>) -> Result<axum::response::Response, ReassemblyError> {
        let response = self
            .http
            .request(request)
            .await
            .map_err(|e| ReassemblyError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ReassemblyError::Status(response.status()));
        }
        Ok(response)
    }

    /// The hotels a recommendation stream for `question` would cover. `hotel_uuids` are
    /// looked up instead of searched for, and unknown ones are left out.
    #[instrument(skip(self))]
    pub async fn hotels(
        &self,
        question: &str,
        hotel_uuids: Option<Vec<String>>,
    ) -> Result<HotelsResponse, ReassemblyError> {
        let request = self.post_json(
            "api/hotels",
            &RecommendationParams {
                question: question.to_string(),
                hotel_uuids,
            },
        )?;
        let response = self.send(request).await?;
        let bytes = axum::body::to_bytes(response.into_body(), MAX_BODY_BYTES)
            .await
            .map_err(|e| ReassemblyError::Transport(e.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|e| ReassemblyError::Transport(e.to_string()))
    }

    /// Start a recommendation stream. Without `hotel_uuids` the server picks the hotels.
    #[instrument(skip(self))]
    pub async fn open(
        &self,
        question: &str,
        hotel_uuids: Option<Vec<String>>,
    ) -> Result<OpenStream, ReassemblyError> {
        let request = self.post_json(
            "api/recommendations",
            &RecommendationParams {
                question: question.to_string(),
                hotel_uuids,
            },
        )?;
        let response = self.send(request).await?;
        let framing = announced_framing(response.headers()).unwrap_or(self.framing);
        let slots = announced_slots(response.headers());
        debug!(?framing, ?slots, "Recommendation stream opened");
        Ok(OpenStream {
            framing,
            slots,
            body: response.into_body().into_data_stream().boxed(),
        })
    }
}

fn announced_framing(headers: &HeaderMap) -> Option<Framing> {
    let value = headers.get(FRAMING_HEADER)?.to_str().ok()?;
    match value.parse() {
        Ok(framing) => Some(framing),
        Err(_) => {
            warn!("Ignoring unknown framing {:?}", value);
            None
        }
    }
}

fn announced_slots(headers: &HeaderMap) -> Option<usize> {
    headers.get(SLOT_COUNT_HEADER)?.to_str().ok()?.trim().parse().ok()
}

/// Live view of the most recent recommendation request.
#[derive(Debug)]
pub struct RecommendationFeed<T: HttpClient> {
    client: RecommendationsClient<T>,
    sender: Arc<watch::Sender<Recommendations>>,
    generation: Arc<AtomicU64>,
    current: Mutex<CancellationToken>,
}

impl<T: HttpClient + Clone + 'static> RecommendationFeed<T> {
    pub fn new(client: RecommendationsClient<T>) -> Self {
        let (sender, _) = watch::channel(Recommendations::pending(0, 0));
        Self {
            client,
            sender: Arc::new(sender),
            generation: Arc::new(AtomicU64::new(0)),
            current: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Recommendations> {
        self.sender.subscribe()
    }

    /// Every snapshot published from now on, starting with the current one.
    pub fn updates(&self) -> WatchStream<Recommendations> {
        WatchStream::new(self.sender.subscribe())
    }

    pub fn current(&self) -> Recommendations {
        self.sender.borrow().clone()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Stop the live request, if any. Its snapshot keeps the text received so far.
    pub async fn cancel(&self) {
        self.current.lock().await.cancel();
    }

    /// Cancel the previous request and reset the snapshot for a new one of `slots` slots.
    async fn begin(&self, slots: usize) -> (u64, CancellationToken) {
        let mut current = self.current.lock().await;
        current.cancel();
        let token = CancellationToken::new();
        *current = token.clone();

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.sender
            .send_replace(Recommendations::pending(generation, slots));
        (generation, token)
    }

    /// Replace the live request with one that has already ended in `state`.
    async fn settle(&self, state: StreamState) -> Recommendations {
        let (generation, _) = self.begin(0).await;
        let settled = Recommendations {
            generation,
            slots: SlotBuffers::new(0),
            state,
        };
        publish(&self.sender, settled.clone());
        settled
    }

    /// Resolve the hotels first, then stream one recommendation for each of them.
    ///
    /// The question is embedded once, for the hotel lookup. The stream is then requested for
    /// exactly the resolved hotels, so every slot can be labelled with its hotel.
    pub async fn recommend(
        &self,
        question: &str,
        hotel_uuids: Option<Vec<String>>,
    ) -> Result<HotelRecommendations, ReassemblyError> {
        let hotels = match self.client.hotels(question, hotel_uuids).await {
            Ok(response) => response.hotels,
            Err(e) => {
                warn!("Failed to resolve hotels: {}", e);
                self.settle(StreamState::Failed).await;
                return Err(e);
            }
        };

        if hotels.is_empty() {
            info!("No hotels to recommend");
            let recommendations = self.settle(StreamState::Completed).await;
            return Ok(HotelRecommendations {
                hotels,
                recommendations,
            });
        }

        let uuids = hotels.iter().map(|hotel| hotel.uuid.clone()).collect();
        let recommendations = self.ask(question, Some(uuids)).await?;
        if recommendations.slots.len() != hotels.len() {
            warn!(
                hotels = hotels.len(),
                slots = recommendations.slots.len(),
                "Hotels changed between lookup and stream"
            );
        }
        Ok(HotelRecommendations {
            hotels,
            recommendations,
        })
    }

    /// Ask for recommendations and follow the stream to its end.
    ///
    /// `hotel_uuids` fixes the hotels and therefore the slot count up front. Without it the
    /// server picks the hotels and announces the count in the response headers.
    pub async fn ask(
        &self,
        question: &str,
        hotel_uuids: Option<Vec<String>>,
    ) -> Result<Recommendations, ReassemblyError> {
        let expected = hotel_uuids.as_ref().map(Vec::len).unwrap_or(0);
        let (generation, token) = self.begin(expected).await;
        run(
            self.client.clone(),
            Arc::clone(&self.sender),
            generation,
            token,
            question.to_string(),
            hotel_uuids,
        )
        .await
    }

    /// Like [`ask`](Self::ask), but the stream is followed on a background task. The request
    /// is cancelled before this returns, so no snapshot of the previous request is published
    /// after it.
    pub async fn start(
        &self,
        question: &str,
        hotel_uuids: Option<Vec<String>>,
    ) -> JoinHandle<Result<Recommendations, ReassemblyError>> {
        let expected = hotel_uuids.as_ref().map(Vec::len).unwrap_or(0);
        let (generation, token) = self.begin(expected).await;
        tokio::spawn(run(
            self.client.clone(),
            Arc::clone(&self.sender),
            generation,
            token,
            question.to_string(),
            hotel_uuids,
        ))
    }
}

/// Publish `snapshot` unless a newer request has taken over the channel.
fn publish(sender: &watch::Sender<Recommendations>, snapshot: Recommendations) {
    sender.send_if_modified(|current| {
        if current.generation != snapshot.generation || *current == snapshot {
            return false;
        }
        *current = snapshot;
        true
    });
}

#[instrument(skip(client, sender, cancel, hotel_uuids))]
async fn run<T: HttpClient>(
    client: RecommendationsClient<T>,
    sender: Arc<watch::Sender<Recommendations>>,
    generation: u64,
    cancel: CancellationToken,
    question: String,
    hotel_uuids: Option<Vec<String>>,
) -> Result<Recommendations, ReassemblyError> {
    let requested = hotel_uuids.as_ref().map(Vec::len);

    let opened = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            debug!("Request superseded before the stream opened");
            return Ok(Recommendations::pending(generation, requested.unwrap_or(0)));
        }
        opened = client.open(&question, hotel_uuids) => opened,
    };

    let stream = match opened {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Failed to open recommendation stream: {}", e);
            let failed = Recommendations {
                generation,
                slots: SlotBuffers::new(requested.unwrap_or(0)),
                state: StreamState::Failed,
            };
            publish(&sender, failed);
            return Err(e);
        }
    };

    let slots = match (requested, stream.slots) {
        (Some(requested), Some(announced)) if requested != announced => {
            // The server only streams the hotels it found.
            warn!(requested, announced, "Server did not find every requested hotel");
            announced
        }
        (_, Some(announced)) => announced,
        (Some(requested), None) => requested,
        (None, None) => 0,
    };

    let mut reassembler = Reassembler::new(stream.framing, slots);
    let snapshot = |reassembler: &Reassembler| Recommendations {
        generation,
        slots: reassembler.buffers().clone(),
        state: reassembler.state(),
    };
    publish(&sender, snapshot(&reassembler));

    let result = reassembler
        .consume(stream.body, &cancel, |reassembler| {
            publish(&sender, snapshot(reassembler));
        })
        .await;

    let last = snapshot(&reassembler);
    match &result {
        Ok(()) if cancel.is_cancelled() => debug!("Recommendation stream cancelled"),
        Ok(()) => info!("Received {} recommendations", slots),
        Err(e) => warn!("Recommendation stream failed: {}", e),
    }
    result.map(|()| last)
}
