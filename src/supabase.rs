//! Hotel store backed by Supabase's PostgREST API
//!
//! Similarity search goes through the `get_hotels_for_question` RPC, lookups through a plain
//! `hotels` select filtered on `uuid`.
use crate::client::HttpClient;
use crate::errors::ProviderError;
use crate::models::HotelRecord;
use crate::settings::SearchSettings;
use crate::traits::{HotelStore, LookupStore, SimilarityStore};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request, header};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, error, instrument};
use url::Url;

const MATCH_HOTELS_RPC: &str = "get_hotels_for_question";

const HOTEL_COLUMNS: &str =
    "id,uuid,name,description,city_name,local_image_url,fallback_image_url";

const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Serialize)]
struct MatchHotelsParams<'a> {
    question_embedding: &'a [f32],
    similarity_threshold: f32,
    match_count: usize,
}

#[derive(Clone)]
pub struct SupabaseStore<T: HttpClient> {
    http: T,
    base_url: Url,
    key: String,
}

impl<T: HttpClient> std::fmt::Debug for SupabaseStore<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupabaseStore")
            .field("base_url", &self.base_url.as_str())
            .finish_non_exhaustive()
    }
}

impl<T: HttpClient> SupabaseStore<T> {
    pub fn new(http: T, base_url: Url, key: impl Into<String>) -> Self {
        Self {
            http,
            base_url,
            key: key.into(),
        }
    }

    fn rest_url(&self, path: &str, call_site: &str) -> Result<Url, ProviderError> {
        self.base_url
            .join(&format!("rest/v1/{path}"))
            .map_err(|e| ProviderError::new(call_site, e))
    }

    fn build_request(
        &self,
        method: Method,
        url: &Url,
        body: Option<Vec<u8>>,
        call_site: &str,
    ) -> Result<Request<Body>, ProviderError> {
        Request::builder()
            .method(method)
            .uri(url.as_str())
            .header("apikey", &self.key)
            .header(header::AUTHORIZATION, format!("Bearer {}", self.key))
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::ACCEPT, "application/json")
            .body(body.map(Body::from).unwrap_or_else(Body::empty))
            .map_err(|e| ProviderError::new(call_site, e))
    }

    /// Send a request and decode a successful JSON response.
    async fn fetch_json<R: DeserializeOwned>(
        &self,
        request: Request<Body>,
        call_site: &str,
    ) -> Result<R, ProviderError> {
        let response = self.http.request(request).await.map_err(|e| {
            error!("Supabase {} error: {}", call_site, e);
            ProviderError::new(call_site, e)
        })?;

        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), MAX_BODY_BYTES)
            .await
            .map_err(|e| ProviderError::new(call_site, e))?;

        if !status.is_success() {
            let body = String::from_utf8_lossy(&bytes);
            error!(status = %status, "Supabase {} error: {}", call_site, body);
            return Err(ProviderError::new(
                call_site,
                format!("unexpected status {status}: {body}"),
            ));
        }

        serde_json::from_slice(&bytes).map_err(|e| ProviderError::new(call_site, e))
    }
}

#[async_trait]
impl<T: HttpClient + 'static> SimilarityStore for SupabaseStore<T> {
    #[instrument(skip(self, embedding))]
    async fn match_hotels(
        &self,
        embedding: &[f32],
        search: &SearchSettings,
    ) -> Result<Vec<HotelRecord>, ProviderError> {
        let call_site = format!("Supabase:executeRPC<{MATCH_HOTELS_RPC}>");
        let url = self.rest_url(&format!("rpc/{MATCH_HOTELS_RPC}"), &call_site)?;
        let body = serde_json::to_vec(&MatchHotelsParams {
            question_embedding: embedding,
            similarity_threshold: search.similarity_threshold,
            match_count: search.match_count,
        })
        .map_err(|e| ProviderError::new(&call_site, e))?;

        let request = self.build_request(Method::POST, &url, Some(body), &call_site)?;
        let rows: Vec<HotelRecord> = self.fetch_json(request, &call_site).await?;
        debug!("Similarity search returned {} hotels", rows.len());
        Ok(rows)
    }
}

#[async_trait]
impl<T: HttpClient + 'static> LookupStore for SupabaseStore<T> {
    #[instrument(skip(self), fields(count = uuids.len()))]
    async fn hotels_by_uuid(&self, uuids: &[String]) -> Result<Vec<HotelRecord>, ProviderError> {
        let call_site = "Supabase:executeQuery<getHotelsFromUUIDs>";
        if uuids.is_empty() {
            return Ok(Vec::new());
        }

        let mut url = self.rest_url("hotels", call_site)?;
        let quoted = uuids
            .iter()
            .map(|uuid| format!("\"{}\"", uuid.replace('"', "")))
            .collect::<Vec<_>>()
            .join(",");
        url.query_pairs_mut()
            .append_pair("select", HOTEL_COLUMNS)
            .append_pair("uuid", &format!("in.({quoted})"));

        let request = self.build_request(Method::GET, &url, None, call_site)?;
        self.fetch_json(request, call_site).await
    }
}

#[async_trait]
impl<T: HttpClient + 'static> HotelStore for SupabaseStore<T> {
    async fn ping(&self) -> bool {
        let call_site = "Supabase:ping";
        let request = self.rest_url("searchables", call_site).and_then(|mut url| {
            url.query_pairs_mut()
                .append_pair("select", "*")
                .append_pair("limit", "1");
            self.build_request(Method::GET, &url, None, call_site)
        });
        let request = match request {
            Ok(request) => request,
            Err(e) => {
                error!("Supabase ping error: {}", e);
                return false;
            }
        };
        match self.http.request(request).await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                error!("Supabase ping error: {}", e);
                false
            }
        }
    }
}
