//! Request and response bodies for the HTTP API, and the hotel records flowing through it.
use serde::{Deserialize, Serialize};

/// A hotel row as stored by the similarity and lookup stores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HotelRecord {
    pub id: i64,
    pub uuid: String,
    pub name: String,
    pub description: String,
    pub city_name: String,
    #[serde(default)]
    pub local_image_url: Option<String>,
    #[serde(default)]
    pub fallback_image_url: Option<String>,
}

/// The hotel shape handed to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hotel {
    pub id: i64,
    pub uuid: String,
    pub name: String,
    pub description: String,
    pub city: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

impl From<HotelRecord> for Hotel {
    fn from(record: HotelRecord) -> Self {
        // Local images are hand picked, so they win over the fallback.
        let image_url = record
            .local_image_url
            .filter(|url| !url.is_empty())
            .or(record.fallback_image_url.filter(|url| !url.is_empty()));
        Hotel {
            id: record.id,
            uuid: record.uuid,
            name: record.name,
            description: record.description,
            city: record.city_name,
            image_url,
        }
    }
}

/// Body of `POST /api/recommendations` and `POST /api/hotels`. Without `hotelUUIDs` the server
/// picks the hotels for the question itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecommendationParams {
    pub question: String,
    #[serde(
        rename = "hotelUUIDs",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub hotel_uuids: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HotelsResponse {
    pub success: bool,
    pub hotels: Vec<Hotel>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthResponse {
    pub openai: bool,
    pub store: bool,
}
