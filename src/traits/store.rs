use crate::errors::ProviderError;
use crate::models::HotelRecord;
use crate::settings::SearchSettings;
use async_trait::async_trait;

#[async_trait]
pub trait SimilarityStore: Send + Sync {
    /// Up to `search.match_count` hotels whose similarity to `embedding` exceeds
    /// `search.similarity_threshold`, best match first.
    async fn match_hotels(
        &self,
        embedding: &[f32],
        search: &SearchSettings,
    ) -> Result<Vec<HotelRecord>, ProviderError>;
}

#[async_trait]
pub trait LookupStore: Send + Sync {
    /// The hotels with the given uuids, in no particular order. Unknown uuids are left out.
    async fn hotels_by_uuid(&self, uuids: &[String]) -> Result<Vec<HotelRecord>, ProviderError>;
}

/// A backend able to serve both kinds of hotel queries.
#[async_trait]
pub trait HotelStore: SimilarityStore + LookupStore + std::fmt::Debug {
    async fn ping(&self) -> bool {
        true
    }
}
