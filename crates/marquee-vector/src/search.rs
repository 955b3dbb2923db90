//! Query engine: embed a query, search a collection, resolve the hits.
//!
//! Hits are resolved back through the catalog. Entries whose record has
//! disappeared from the catalog are stale: they are logged and dropped.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use marquee_core::catalog::MediaCatalog;
use marquee_core::error::MarqueeError;
use marquee_core::types::{MediaRecord, MediaType, Modality, QueryPhase};

use crate::embedding::DynTextEmbedder;
use crate::store::{QueryHit, VectorStore};
use crate::visual::{ImageRef, VisualEmbedder, VisualMethod};

/// A catalog record with its distance to the query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedItem {
    pub record: MediaRecord,
    /// Cosine distance, lower is closer.
    pub distance: f32,
}

impl RankedItem {
    pub fn similarity(&self) -> f32 {
        1.0 - self.distance
    }
}

/// Result of a visual search, with the embedding path that was used.
#[derive(Debug, Clone, PartialEq)]
pub struct VisualMatches {
    pub items: Vec<RankedItem>,
    pub method: VisualMethod,
}

/// Search over the text and visual collections.
///
/// Uses dynamic dispatch for the text embedder so that production code can
/// supply `OnnxTextEmbedder` while tests use `HashingEmbedder`.
pub struct QueryEngine {
    catalog: Arc<dyn MediaCatalog>,
    store: Arc<VectorStore>,
    text: Arc<dyn DynTextEmbedder>,
    visual: Option<Arc<VisualEmbedder>>,
    min_similarity: Option<f32>,
}

impl QueryEngine {
    pub fn new(
        catalog: Arc<dyn MediaCatalog>,
        store: Arc<VectorStore>,
        text: Arc<dyn DynTextEmbedder>,
        visual: Option<Arc<VisualEmbedder>>,
    ) -> Self {
        Self {
            catalog,
            store,
            text,
            visual,
            min_similarity: None,
        }
    }

    /// Drop hits whose cosine similarity is below `floor`.
    pub fn with_min_similarity(mut self, floor: Option<f32>) -> Self {
        self.min_similarity = floor;
        self
    }

    pub fn catalog(&self) -> &Arc<dyn MediaCatalog> {
        &self.catalog
    }

    pub fn store(&self) -> &Arc<VectorStore> {
        &self.store
    }

    pub fn text_embedder(&self) -> &Arc<dyn DynTextEmbedder> {
        &self.text
    }

    pub fn visual_embedder(&self) -> Option<&Arc<VisualEmbedder>> {
        self.visual.as_ref()
    }

    /// Nearest records to `query` in the text collection, closest first.
    ///
    /// An empty list is a valid answer meaning nothing indexed matched.
    pub async fn search_text(
        &self,
        query: &str,
        media_type: Option<MediaType>,
        k: usize,
    ) -> Result<Vec<RankedItem>, MarqueeError> {
        debug!(phase = ?QueryPhase::Embedding, modality = "text", "Query phase");
        let vector = self.text.embed_boxed(query).await?;

        debug!(phase = ?QueryPhase::Searching, modality = "text", k, "Query phase");
        let hits = self.store.query(Modality::Text, &vector, k, media_type)?;

        debug!(phase = ?QueryPhase::Resolving, hits = hits.len(), "Query phase");
        Ok(self.resolve(hits))
    }

    /// Nearest records to an image in the visual collection.
    ///
    /// Fails with [`MarqueeError::NoVisualSignal`] when the image cannot be
    /// read, and with [`MarqueeError::VisualSearchDisabled`] when no visual
    /// embedder is configured.
    pub async fn search_visual(
        &self,
        image: &ImageRef,
        media_type: Option<MediaType>,
        k: usize,
    ) -> Result<Vec<RankedItem>, MarqueeError> {
        self.search_visual_detailed(image, media_type, k)
            .await
            .map(|matches| matches.items)
    }

    /// Like [`QueryEngine::search_visual`] but also reports the embedding path.
    pub async fn search_visual_detailed(
        &self,
        image: &ImageRef,
        media_type: Option<MediaType>,
        k: usize,
    ) -> Result<VisualMatches, MarqueeError> {
        let embedder = self
            .visual
            .as_ref()
            .ok_or(MarqueeError::VisualSearchDisabled)?;

        debug!(phase = ?QueryPhase::Embedding, modality = "visual", "Query phase");
        let embedding = embedder.embed_detailed(image).await.ok_or_else(|| {
            warn!(image = %image.describe(), "No visual signal for query image");
            MarqueeError::NoVisualSignal(image.describe())
        })?;

        debug!(phase = ?QueryPhase::Searching, modality = "visual", k, "Query phase");
        let hits = self
            .store
            .query(Modality::Visual, &embedding.vector, k, media_type)?;

        debug!(phase = ?QueryPhase::Resolving, hits = hits.len(), "Query phase");
        Ok(VisualMatches {
            items: self.resolve(hits),
            method: embedding.method,
        })
    }

    /// Map store hits to catalog records, preserving rank order.
    fn resolve(&self, hits: Vec<QueryHit>) -> Vec<RankedItem> {
        let mut seen = HashSet::new();
        let mut items = Vec::with_capacity(hits.len());

        for hit in hits {
            if let Some(floor) = self.min_similarity {
                if hit.similarity() < floor {
                    continue;
                }
            }
            if !seen.insert(hit.record_id.clone()) {
                continue;
            }
            match self.catalog.get_item_by_id(&hit.record_id) {
                Some(record) => items.push(RankedItem {
                    record,
                    distance: hit.distance,
                }),
                None => warn!(
                    record_id = %hit.record_id,
                    title = %hit.metadata.title,
                    "Stale index entry, record not in catalog"
                ),
            }
        }
        items
    }
}
