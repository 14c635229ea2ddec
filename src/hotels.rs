//! Picking the hotels a recommendation request is about
//!
//! Both lookups degrade to an empty list when a collaborator fails: the caller then answers
//! with an empty result instead of an error.
use crate::models::Hotel;
use crate::settings::SearchSettings;
use crate::traits::{EmbeddingProvider, LookupStore, SimilarityStore};
use std::collections::HashMap;
use tracing::{debug, error, instrument};

/// The hotels best matching `question`, best match first.
#[instrument(skip(embeddings, store))]
pub async fn hotels_for_question<E, S>(
    embeddings: &E,
    store: &S,
    question: &str,
    search: &SearchSettings,
) -> Vec<Hotel>
where
    E: EmbeddingProvider + ?Sized,
    S: SimilarityStore + ?Sized,
{
    let embedding = match embeddings.embed(question).await {
        Ok(embedding) => embedding,
        Err(e) => {
            error!(source = %e.call_site, "Failed to embed question: {}", e.message);
            return Vec::new();
        }
    };

    match store.match_hotels(&embedding, search).await {
        Ok(records) => {
            debug!("Matched {} hotels", records.len());
            records.into_iter().map(Hotel::from).collect()
        }
        Err(e) => {
            error!(source = %e.call_site, "Failed to match hotels: {}", e.message);
            Vec::new()
        }
    }
}

/// The hotels with the given uuids, in the order the uuids were given. Unknown uuids are
/// skipped and a repeated uuid yields its hotel again.
#[instrument(skip(store), fields(count = uuids.len()))]
pub async fn hotels_from_uuids<S>(store: &S, uuids: &[String]) -> Vec<Hotel>
where
    S: LookupStore + ?Sized,
{
    let records = match store.hotels_by_uuid(uuids).await {
        Ok(records) => records,
        Err(e) => {
            error!(source = %e.call_site, "Failed to look up hotels: {}", e.message);
            return Vec::new();
        }
    };

    let by_uuid: HashMap<String, Hotel> = records
        .into_iter()
        .map(|record| (record.uuid.clone(), Hotel::from(record)))
        .collect();

    let hotels: Vec<Hotel> = uuids
        .iter()
        .filter_map(|uuid| by_uuid.get(uuid).cloned())
        .collect();
    if hotels.len() < uuids.len() {
        debug!("{} of {} requested hotels found", hotels.len(), uuids.len());
    }
    hotels
}
