//! `MediaRag`: the engine facade consumed by the application layer.
//!
//! Owns the query engine, the indexing pipeline and the response
//! synthesizer, all built from explicitly injected components.

use std::cmp::Ordering;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use marquee_core::catalog::MediaCatalog;
use marquee_core::config::{MarqueeConfig, SearchConfig};
use marquee_core::types::{IndexStats, MediaRecord, MediaType, Modality, QueryPhase};
use marquee_vector::embedding::DynTextEmbedder;
use marquee_vector::pipeline::{IndexReport, IndexingPipeline};
use marquee_vector::search::{QueryEngine, RankedItem};
use marquee_vector::store::VectorStore;
use marquee_vector::visual::{ImageRef, VisualEmbedder, VisualMethod, BASIC_FEATURES_ID};

use crate::error::ChatError;
use crate::llm::LanguageModel;
use crate::response::{ResponseSynthesizer, SynthesisStatus};

/// Answer to a text or image query.
#[derive(Debug, Clone, Serialize)]
pub struct RagAnswer {
    pub query_id: Uuid,
    pub text: String,
    /// Records used as context, closest first.
    pub items: Vec<RankedItem>,
    pub status: SynthesisStatus,
    /// `Done`, or `Degraded` when the model failed and context was returned.
    pub phase: QueryPhase,
}

/// Multi-modal retrieval-augmented assistant for movies and games.
pub struct MediaRag {
    engine: QueryEngine,
    pipeline: IndexingPipeline,
    synthesizer: ResponseSynthesizer,
    search: SearchConfig,
}

impl MediaRag {
    pub fn new(
        catalog: Arc<dyn MediaCatalog>,
        store: Arc<VectorStore>,
        text: Arc<dyn DynTextEmbedder>,
        visual: Option<Arc<VisualEmbedder>>,
        llm: Arc<dyn LanguageModel>,
        config: &MarqueeConfig,
    ) -> Self {
        let pipeline = IndexingPipeline::new(
            Arc::clone(&catalog),
            Arc::clone(&store),
            Arc::clone(&text),
            visual.clone(),
            config.embedding.batch_size,
        );
        let engine = QueryEngine::new(catalog, store, text, visual)
            .with_min_similarity(config.search.min_similarity);
        let synthesizer = ResponseSynthesizer::from_config(llm, &config.llm);

        Self {
            engine,
            pipeline,
            synthesizer,
            search: config.search.clone(),
        }
    }

    pub fn engine(&self) -> &QueryEngine {
        &self.engine
    }

    /// Index whatever the store is missing. Cheap when nothing is.
    pub async fn ensure_indexed(&self) -> Result<IndexReport, ChatError> {
        Ok(self.pipeline.run().await?)
    }

    /// Clear both collections and index the whole catalog again.
    pub async fn reset_and_reindex(&self) -> Result<IndexReport, ChatError> {
        info!("Resetting vector store and re-indexing");
        Ok(self.pipeline.reset_and_reindex().await?)
    }

    pub async fn search_text(
        &self,
        query: &str,
        media_type: Option<MediaType>,
        k: usize,
    ) -> Result<Vec<RankedItem>, ChatError> {
        Ok(self.engine.search_text(query, media_type, k).await?)
    }

    pub async fn search_visual(
        &self,
        image: &ImageRef,
        media_type: Option<MediaType>,
        k: usize,
    ) -> Result<Vec<RankedItem>, ChatError> {
        Ok(self.engine.search_visual(image, media_type, k).await?)
    }

    /// Retrieve records for `query` and answer it.
    pub async fn query_with_text(
        &self,
        query: &str,
        media_type: Option<MediaType>,
    ) -> Result<RagAnswer, ChatError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(ChatError::EmptyQuery);
        }

        let query_id = Uuid::new_v4();
        debug!(%query_id, ?media_type, "Text query");
        let items = self
            .engine
            .search_text(query, media_type, self.search.text_top_k)
            .await?;
        let records: Vec<MediaRecord> = items.iter().map(|i| i.record.clone()).collect();
        let synthesis = self
            .synthesizer
            .synthesize(query, &records, media_type)
            .await;

        Ok(finish(query_id, synthesis.text, items, synthesis.status))
    }

    /// Find records whose posters resemble `image` and describe them.
    ///
    /// Fails with [`ChatError::NoVisualSignal`] when the image cannot be read.
    pub async fn query_with_image(
        &self,
        image: &ImageRef,
        media_type: Option<MediaType>,
    ) -> Result<RagAnswer, ChatError> {
        let query_id = Uuid::new_v4();
        debug!(%query_id, image = %image.describe(), ?media_type, "Image query");

        let matches = match self
            .engine
            .search_visual_detailed(image, media_type, self.search.visual_top_k)
            .await
        {
            Ok(matches) => matches,
            Err(e) => {
                debug!(%query_id, phase = ?QueryPhase::Degraded, error = %e, "Image query failed");
                return Err(e.into());
            }
        };

        let method = match matches.method {
            VisualMethod::Model => self
                .engine
                .visual_embedder()
                .map(|v| v.model_id().to_string())
                .unwrap_or_else(|| BASIC_FEATURES_ID.to_string()),
            VisualMethod::BasicFeatures => BASIC_FEATURES_ID.to_string(),
        };
        let records: Vec<MediaRecord> = matches.items.iter().map(|i| i.record.clone()).collect();
        let synthesis = self
            .synthesizer
            .synthesize_visual(&records, media_type, &method)
            .await;

        Ok(finish(query_id, synthesis.text, matches.items, synthesis.status))
    }

    /// Records relevant to `query`, without synthesis.
    pub async fn get_relevant_context(
        &self,
        query: &str,
        media_type: Option<MediaType>,
    ) -> Result<Vec<MediaRecord>, ChatError> {
        let items = self
            .engine
            .search_text(query, media_type, self.search.context_top_k)
            .await?;
        Ok(items.into_iter().map(|i| i.record).collect())
    }

    /// Discuss one catalog record. The default question is
    /// "Tell me about {title}".
    pub async fn ask_about_item(
        &self,
        id: &str,
        question: Option<&str>,
    ) -> Result<RagAnswer, ChatError> {
        let record = self
            .engine
            .catalog()
            .get_item_by_id(id)
            .ok_or_else(|| ChatError::ItemNotFound(id.to_string()))?;

        let question = match question.map(str::trim).filter(|q| !q.is_empty()) {
            Some(q) => format!("{}: {}", record.title, q),
            None => format!("Tell me about {}", record.title),
        };

        let query_id = Uuid::new_v4();
        let mut items = self
            .engine
            .search_text(&question, Some(record.media_type), self.search.text_top_k)
            .await?;

        // The item under discussion always leads the context.
        match items.iter().position(|i| i.record.id == record.id) {
            Some(0) => {}
            Some(position) => {
                let item = items.remove(position);
                items.insert(0, item);
            }
            None => {
                let distance = self.text_distance(&question, &record).await?;
                items.insert(
                    0,
                    RankedItem {
                        record: record.clone(),
                        distance,
                    },
                );
                items.truncate(self.search.text_top_k.max(1));
            }
        }

        let records: Vec<MediaRecord> = items.iter().map(|i| i.record.clone()).collect();
        let synthesis = self
            .synthesizer
            .synthesize(&question, &records, Some(record.media_type))
            .await;

        Ok(finish(query_id, synthesis.text, items, synthesis.status))
    }

    /// Cosine distance between `query` and the record's canonical text.
    async fn text_distance(&self, query: &str, record: &MediaRecord) -> Result<f32, ChatError> {
        let texts = [query.to_string(), record.canonical_text()];
        let vectors = self.engine.text_embedder().embed_batch_boxed(&texts).await?;
        match vectors.as_slice() {
            [q, r] => Ok(1.0 - q.iter().zip(r).map(|(a, b)| a * b).sum::<f32>()),
            _ => Err(ChatError::Engine(format!(
                "Embedder returned {} vectors for 2 texts",
                vectors.len()
            ))),
        }
    }

    /// Top catalog records by `vote_average * popularity`.
    pub fn featured_items(&self, limit: usize, media_type: Option<MediaType>) -> Vec<MediaRecord> {
        let mut records: Vec<MediaRecord> = self
            .engine
            .catalog()
            .get_all_items()
            .into_iter()
            .filter(|r| media_type.map_or(true, |t| r.media_type == t))
            .collect();
        records.sort_by(|a, b| {
            b.featured_score()
                .partial_cmp(&a.featured_score())
                .unwrap_or(Ordering::Equal)
        });
        records.truncate(limit);
        records
    }

    /// Per-collection counts and model identifiers.
    pub fn get_index_stats(&self) -> Result<IndexStats, ChatError> {
        let store = self.engine.store();
        let visual = self.engine.visual_embedder();
        Ok(IndexStats {
            text_count: store.count(Modality::Text)?,
            visual_count: store.count(Modality::Visual)?,
            catalog_size: self.engine.catalog().len(),
            text_model: self.engine.text_embedder().model_id().to_string(),
            visual_model: visual.map(|v| v.model_id().to_string()),
            visual_fallback_only: visual.is_some_and(|v| v.uses_basic_features_only()),
            store_path: store.path().map(|p| p.display().to_string()),
            generated_at: Utc::now(),
        })
    }
}

fn finish(
    query_id: Uuid,
    text: String,
    items: Vec<RankedItem>,
    status: SynthesisStatus,
) -> RagAnswer {
    let phase = status.phase();
    debug!(%query_id, ?phase, items = items.len(), "Query finished");
    RagAnswer {
        query_id,
        text,
        items,
        status,
        phase,
    }
}
