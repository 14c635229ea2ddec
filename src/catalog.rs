//! The catalog is a local hotel store read from a JSON file. Each hotel carries its own
//! embedding, so similarity search runs in process and no database is needed.
//!
//! When the file is watched, edits are picked up without a restart: the hotel map is updated in
//! place, so searches that are already running see either the old or the new row for a hotel,
//! never a missing one.
use crate::errors::ProviderError;
use crate::models::HotelRecord;
use crate::settings::SearchSettings;
use crate::traits::{HotelStore, LookupStore, SimilarityStore};
use anyhow::anyhow;
use async_trait::async_trait;
use dashmap::DashMap;
use notify::{Config as NotifyConfig, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::{
    cmp::Ordering,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument};

/// A hotel row together with the embedding of its description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    #[serde(flatten)]
    pub record: HotelRecord,
    pub embedding: Vec<f32>,
}

/// On-disk layout of the catalog.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogFile {
    pub hotels: Vec<CatalogEntry>,
}

/// The live-updating collection of hotels, keyed by uuid.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    pub(crate) hotels: Arc<DashMap<String, CatalogEntry>>,
}

#[async_trait]
pub trait CatalogStream {
    async fn receive(
        &self,
    ) -> Result<mpsc::Receiver<Result<Catalog, anyhow::Error>>, anyhow::Error>;
}

pub struct WatchedFile(pub PathBuf);

#[async_trait]
impl CatalogStream for WatchedFile {
    /// Watches the catalog file and yields a freshly loaded catalog on every modification.
    async fn receive(
        &self,
    ) -> Result<mpsc::Receiver<Result<Catalog, anyhow::Error>>, anyhow::Error> {
        let (catalog_tx, catalog_rx) = mpsc::channel(100);
        let (file_tx, mut file_rx) = mpsc::channel(100);

        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = file_tx.blocking_send(res);
            },
            NotifyConfig::default(),
        )?;

        watcher.watch(&self.0, RecursiveMode::NonRecursive)?;

        let path = self.0.clone();
        tokio::spawn(async move {
            // The watcher stops delivering events once dropped, so it lives as long as this task.
            let _watcher = watcher;
            while let Some(res) = file_rx.recv().await {
                let update = match res {
                    Ok(event) if event.kind.is_modify() => {
                        info!("Catalog file changed, reloading hotels...");
                        Catalog::from_file(&path).await
                    }
                    Ok(_) => continue,
                    Err(e) => Err(anyhow!("Watch error: {}", e)),
                };
                if catalog_tx.send(update).await.is_err() {
                    break; // Receiver dropped
                }
            }
        });

        Ok(catalog_rx)
    }
}

impl Catalog {
    pub async fn from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read catalog file {}: {}", path.display(), e))?;

        let file: CatalogFile = serde_json::from_str(&contents)
            .map_err(|e| anyhow!("Failed to parse catalog file {}: {}", path.display(), e))?;

        let catalog = Self::from_config(file);
        info!(
            "Loaded {} hotels from {}",
            catalog.hotels.len(),
            path.display()
        );
        Ok(catalog)
    }

    pub fn from_config(file: CatalogFile) -> Self {
        let hotels = Arc::new(DashMap::new());
        for entry in file.hotels {
            if entry.embedding.is_empty() {
                debug!("Hotel {} has no embedding, it will only be found by uuid", entry.record.uuid);
            }
            hotels.insert(entry.record.uuid.clone(), entry);
        }
        Catalog { hotels }
    }

    pub fn len(&self) -> usize {
        self.hotels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hotels.is_empty()
    }

    /// Applies every catalog received from `stream` to this catalog in the background.
    pub async fn receive_updates<W: CatalogStream + Send + 'static>(
        &self,
        stream: W,
    ) -> Result<(), anyhow::Error> {
        let hotels = Arc::clone(&self.hotels);

        let mut rx = stream.receive().await?;

        tokio::spawn(async move {
            while let Some(result) = rx.recv().await {
                match result {
                    Ok(update) => {
                        info!("Updating catalog to {} hotels", update.hotels.len());
                        // Remove first, then upsert: a hotel present in both versions is never
                        // absent from the map.
                        let current: Vec<String> =
                            hotels.iter().map(|entry| entry.key().clone()).collect();
                        for uuid in current {
                            if !update.hotels.contains_key(&uuid) {
                                hotels.remove(&uuid);
                            }
                        }
                        for entry in update.hotels.iter() {
                            hotels.insert(entry.key().clone(), entry.value().clone());
                        }
                    }
                    Err(e) => {
                        error!("Failed to reload catalog: {}", e);
                    }
                }
            }
        });

        Ok(())
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let (mut dot, mut norm_a, mut norm_b) = (0.0f32, 0.0f32, 0.0f32);
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return None;
    }
    Some(dot / (norm_a.sqrt() * norm_b.sqrt()))
}

#[async_trait]
impl SimilarityStore for Catalog {
    #[instrument(skip(self, embedding))]
    async fn match_hotels(
        &self,
        embedding: &[f32],
        search: &SearchSettings,
    ) -> Result<Vec<HotelRecord>, ProviderError> {
        let mut scored: Vec<(f32, HotelRecord)> = self
            .hotels
            .iter()
            .filter_map(|entry| {
                let score = cosine_similarity(embedding, &entry.embedding)?;
                (score > search.similarity_threshold).then(|| (score, entry.record.clone()))
            })
            .collect();

        scored.sort_by(|(a, _), (b, _)| b.partial_cmp(a).unwrap_or(Ordering::Equal));
        scored.truncate(search.match_count);
        debug!("{} hotels above the similarity threshold", scored.len());

        Ok(scored.into_iter().map(|(_, record)| record).collect())
    }
}

#[async_trait]
impl LookupStore for Catalog {
    async fn hotels_by_uuid(&self, uuids: &[String]) -> Result<Vec<HotelRecord>, ProviderError> {
        Ok(uuids
            .iter()
            .filter_map(|uuid| self.hotels.get(uuid).map(|entry| entry.record.clone()))
            .collect())
    }
}

#[async_trait]
impl HotelStore for Catalog {}
