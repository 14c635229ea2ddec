//! Seams to the external collaborators of the recommendation pipeline
//!
//! - **EmbeddingProvider** / **CompletionProvider**: the model API (OpenAI in production)
//! - **SimilarityStore** / **LookupStore**: where hotels live (Supabase or the local catalog)
//!
//! Every method reports failure with the [`ProviderError`](crate::errors::ProviderError)
//! envelope. Callers recover from it locally.

mod providers;
mod store;

pub use providers::{ByteStream, CompletionProvider, Embedding, EmbeddingProvider};
pub use store::{HotelStore, LookupStore, SimilarityStore};
