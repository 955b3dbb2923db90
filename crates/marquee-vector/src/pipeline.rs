//! Idempotent indexing of the catalog into the vector store.
//!
//! A run compares the ids present in each collection against the catalog
//! and only embeds records that are not yet present. When nothing is
//! missing the run is a no-op and no embedding happens. Stale entries for
//! records no longer in the catalog are left alone; they never stand in
//! for a missing record.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use marquee_core::catalog::MediaCatalog;
use marquee_core::error::MarqueeError;
use marquee_core::types::{MediaRecord, Modality};

use crate::embedding::DynTextEmbedder;
use crate::store::{NewEntry, VectorStore};
use crate::visual::{ImageRef, VisualEmbedder};

/// Default number of records embedded per batch.
pub const DEFAULT_BATCH_SIZE: usize = 32;

/// Per-collection outcome of an indexing run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionReport {
    /// Records that belong in this collection.
    pub eligible: usize,
    /// Eligible records that were already present before the run.
    pub already_indexed: usize,
    pub added: usize,
    /// Records with no visual signal, retried on the next run.
    pub skipped: usize,
    /// Entries the store refused (invalid vectors).
    pub rejected: usize,
}

/// Outcome of [`IndexingPipeline::run`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexReport {
    pub text: CollectionReport,
    /// `None` when visual indexing is disabled.
    pub visual: Option<CollectionReport>,
}

impl IndexReport {
    /// Total entries added across both collections.
    pub fn added(&self) -> usize {
        self.text.added + self.visual.as_ref().map_or(0, |v| v.added)
    }
}

/// Keeps the vector store in sync with the catalog.
pub struct IndexingPipeline {
    catalog: Arc<dyn MediaCatalog>,
    store: Arc<VectorStore>,
    text: Arc<dyn DynTextEmbedder>,
    visual: Option<Arc<VisualEmbedder>>,
    batch_size: usize,
}

impl IndexingPipeline {
    pub fn new(
        catalog: Arc<dyn MediaCatalog>,
        store: Arc<VectorStore>,
        text: Arc<dyn DynTextEmbedder>,
        visual: Option<Arc<VisualEmbedder>>,
        batch_size: usize,
    ) -> Self {
        Self {
            catalog,
            store,
            text,
            visual,
            batch_size: batch_size.max(1),
        }
    }

    /// Index every catalog record missing from either collection.
    pub async fn run(&self) -> Result<IndexReport, MarqueeError> {
        let records = self.catalog.get_all_items();
        info!(catalog = records.len(), "Indexing pass started");

        let text = self.index_text(&records).await?;
        let visual = match &self.visual {
            Some(embedder) => Some(self.index_visual(embedder, &records).await?),
            None => None,
        };

        let report = IndexReport { text, visual };
        info!(
            text_added = report.text.added,
            visual_added = report.visual.as_ref().map_or(0, |v| v.added),
            visual_skipped = report.visual.as_ref().map_or(0, |v| v.skipped),
            "Indexing pass finished"
        );
        Ok(report)
    }

    /// Clear both collections and index the whole catalog again.
    pub async fn reset_and_reindex(&self) -> Result<IndexReport, MarqueeError> {
        self.store.reset()?;
        self.run().await
    }

    async fn index_text(&self, records: &[MediaRecord]) -> Result<CollectionReport, MarqueeError> {
        let mut report = CollectionReport {
            eligible: records.len(),
            ..Default::default()
        };

        let missing = self.missing(Modality::Text, records.iter())?;
        report.already_indexed = records.len() - missing.len();
        if missing.is_empty() {
            let count = self.store.count(Modality::Text)?;
            debug!(count, "Text collection up to date");
            return Ok(report);
        }
        info!(missing = missing.len(), "Embedding text for missing records");

        for (batch_index, batch) in missing.chunks(self.batch_size).enumerate() {
            let texts: Vec<String> = batch.iter().map(|r| r.canonical_text()).collect();
            let vectors = self.text.embed_batch_boxed(&texts).await?;
            if vectors.len() != batch.len() {
                return Err(MarqueeError::Embedding(format!(
                    "Embedder returned {} vectors for {} texts",
                    vectors.len(),
                    batch.len()
                )));
            }

            let entries = batch
                .iter()
                .zip(texts)
                .zip(vectors)
                .map(|((record, text), vector)| NewEntry {
                    record_id: record.id.clone(),
                    vector,
                    metadata: record.snapshot(),
                    document: text,
                })
                .collect();

            let applied = self.store.add_batch(Modality::Text, entries)?;
            report.added += applied.applied;
            report.rejected += applied.rejected.len();
            debug!(batch = batch_index, added = applied.applied, "Text batch indexed");
        }

        Ok(report)
    }

    async fn index_visual(
        &self,
        embedder: &Arc<VisualEmbedder>,
        records: &[MediaRecord],
    ) -> Result<CollectionReport, MarqueeError> {
        let eligible: Vec<&MediaRecord> =
            records.iter().filter(|r| r.is_visual_eligible()).collect();
        let mut report = CollectionReport {
            eligible: eligible.len(),
            ..Default::default()
        };

        let missing = self.missing(Modality::Visual, eligible.into_iter())?;
        report.already_indexed = report.eligible - missing.len();
        if missing.is_empty() {
            let count = self.store.count(Modality::Visual)?;
            debug!(count, "Visual collection up to date");
            return Ok(report);
        }
        info!(missing = missing.len(), "Embedding posters for missing records");

        for (batch_index, batch) in missing.chunks(self.batch_size).enumerate() {
            let mut tasks = JoinSet::new();
            for (position, record) in batch.iter().enumerate() {
                let Some(url) = record.poster_url() else {
                    continue;
                };
                let embedder = Arc::clone(embedder);
                let image = ImageRef::Url(url.to_string());
                tasks.spawn(async move { (position, embedder.embed(&image).await) });
            }

            let mut vectors: Vec<Option<Vec<f32>>> = vec![None; batch.len()];
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((position, vector)) => vectors[position] = vector,
                    Err(e) => warn!(error = %e, "Poster embedding task failed"),
                }
            }

            let mut entries = Vec::with_capacity(batch.len());
            for (record, vector) in batch.iter().zip(vectors) {
                match vector {
                    Some(vector) => entries.push(NewEntry {
                        record_id: record.id.clone(),
                        vector,
                        metadata: record.snapshot(),
                        document: record.visual_document(),
                    }),
                    None => {
                        debug!(record_id = %record.id, "No visual signal, will retry next run");
                        report.skipped += 1;
                    }
                }
            }

            let applied = self.store.add_batch(Modality::Visual, entries)?;
            report.added += applied.applied;
            report.rejected += applied.rejected.len();
            debug!(batch = batch_index, added = applied.applied, "Visual batch indexed");
        }

        if report.skipped > 0 {
            warn!(skipped = report.skipped, "Some posters could not be embedded");
        }
        Ok(report)
    }

    /// Records whose id is not yet in `modality`, in catalog order.
    fn missing<'a>(
        &self,
        modality: Modality,
        records: impl Iterator<Item = &'a MediaRecord>,
    ) -> Result<Vec<MediaRecord>, MarqueeError> {
        let present: HashSet<String> = self.store.record_ids(modality)?;
        Ok(records
            .filter(|r| !present.contains(&r.id))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use marquee_core::catalog::InMemoryCatalog;
    use marquee_core::config::VisualConfig;
    use marquee_core::types::{MediaMetadata, MediaType};

    use crate::embedding::{HashingEmbedder, TextEmbedder};
    use crate::visual::tests::png_bytes;

    /// Wraps the hashing embedder and counts embedded texts.
    struct CountingEmbedder {
        inner: HashingEmbedder,
        texts: AtomicUsize,
    }

    impl TextEmbedder for CountingEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, MarqueeError> {
            self.texts.fetch_add(1, Ordering::SeqCst);
            self.inner.embed(text).await
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, MarqueeError> {
            self.texts.fetch_add(texts.len(), Ordering::SeqCst);
            self.inner.embed_batch(texts).await
        }

        fn dimensions(&self) -> usize {
            TextEmbedder::dimensions(&self.inner)
        }

        fn model_id(&self) -> &str {
            "counting"
        }
    }

    fn record(id: &str, media_type: MediaType, poster: Option<String>) -> MediaRecord {
        MediaRecord {
            id: id.to_string(),
            title: format!("Title {}", id),
            media_type,
            description: format!("Description of {}", id),
            metadata: MediaMetadata {
                poster_url: poster,
                ..Default::default()
            },
            embedding_text: None,
        }
    }

    fn pipeline(
        records: Vec<MediaRecord>,
        store: Arc<VectorStore>,
        visual: Option<Arc<VisualEmbedder>>,
    ) -> (IndexingPipeline, Arc<CountingEmbedder>) {
        let embedder = Arc::new(CountingEmbedder {
            inner: HashingEmbedder::new(64),
            texts: AtomicUsize::new(0),
        });
        let pipeline = IndexingPipeline::new(
            Arc::new(InMemoryCatalog::new(records)),
            store,
            embedder.clone(),
            visual,
            2,
        );
        (pipeline, embedder)
    }

    #[tokio::test]
    async fn test_second_run_is_noop() {
        let store = Arc::new(VectorStore::in_memory().unwrap());
        let records: Vec<_> = (0..5)
            .map(|i| record(&i.to_string(), MediaType::Movie, None))
            .collect();
        let (pipeline, embedder) = pipeline(records, store.clone(), None);

        let first = pipeline.run().await.unwrap();
        assert_eq!(first.text.added, 5);
        assert_eq!(store.count(Modality::Text).unwrap(), 5);
        let embedded = embedder.texts.load(Ordering::SeqCst);
        assert_eq!(embedded, 5);

        let second = pipeline.run().await.unwrap();
        assert_eq!(second.added(), 0);
        assert_eq!(second.text.already_indexed, 5);
        assert_eq!(embedder.texts.load(Ordering::SeqCst), embedded);
        assert_eq!(store.count(Modality::Text).unwrap(), 5);
    }

    #[tokio::test]
    async fn test_only_missing_records_are_embedded() {
        let store = Arc::new(VectorStore::in_memory().unwrap());
        let (first, _) = pipeline(
            vec![record("a", MediaType::Movie, None)],
            store.clone(),
            None,
        );
        first.run().await.unwrap();

        let (second, embedder) = pipeline(
            vec![
                record("a", MediaType::Movie, None),
                record("b", MediaType::Game, None),
                record("c", MediaType::Game, None),
            ],
            store.clone(),
            None,
        );
        let report = second.run().await.unwrap();
        assert_eq!(report.text.already_indexed, 1);
        assert_eq!(report.text.added, 2);
        assert_eq!(embedder.texts.load(Ordering::SeqCst), 2);
        assert_eq!(store.count(Modality::Text).unwrap(), 3);
    }

    #[tokio::test]
    async fn test_stale_entries_do_not_hide_new_records() {
        let dir = tempfile::tempdir().unwrap();
        let poster = |name: &str, seed: u8| {
            let path = dir.path().join(format!("{}.png", name));
            std::fs::write(&path, png_bytes(12, 12, seed)).unwrap();
            Some(path.display().to_string())
        };
        let visual = || {
            Arc::new(
                VisualEmbedder::new(
                    None,
                    &VisualConfig {
                        canonical_size: 16,
                        ..VisualConfig::default()
                    },
                )
                .unwrap(),
            )
        };

        let store = Arc::new(VectorStore::in_memory().unwrap());
        let (first, _) = pipeline(
            vec![
                record("a", MediaType::Movie, poster("a", 1)),
                record("b", MediaType::Movie, poster("b", 2)),
            ],
            store.clone(),
            Some(visual()),
        );
        first.run().await.unwrap();

        // "b" leaves the catalog and "c" arrives: the collection still holds
        // two entries, but "c" must be embedded.
        let (second, embedder) = pipeline(
            vec![
                record("a", MediaType::Movie, poster("a", 1)),
                record("c", MediaType::Game, poster("c", 3)),
            ],
            store.clone(),
            Some(visual()),
        );
        let report = second.run().await.unwrap();
        assert_eq!(report.text.already_indexed, 1);
        assert_eq!(report.text.added, 1);
        assert_eq!(embedder.texts.load(Ordering::SeqCst), 1);
        let visual_report = report.visual.unwrap();
        assert_eq!(visual_report.already_indexed, 1);
        assert_eq!(visual_report.added, 1);

        for modality in Modality::ALL {
            let ids = store.record_ids(modality).unwrap();
            assert!(ids.contains("c"), "{} collection is missing c", modality);
        }

        // Once "c" is in, further runs embed nothing.
        let again = second.run().await.unwrap();
        assert_eq!(again.added(), 0);
        assert_eq!(embedder.texts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_visual_skips_unreadable_posters_and_retries() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.png");
        std::fs::write(&good, png_bytes(12, 12, 3)).unwrap();
        let broken = dir.path().join("broken.png");
        std::fs::write(&broken, b"not a png").unwrap();

        let records = vec![
            record("1", MediaType::Movie, Some(good.display().to_string())),
            record("2", MediaType::Movie, Some(broken.display().to_string())),
            record("3", MediaType::Game, None),
        ];

        let visual = Arc::new(
            VisualEmbedder::new(
                None,
                &VisualConfig {
                    canonical_size: 16,
                    ..VisualConfig::default()
                },
            )
            .unwrap(),
        );
        let store = Arc::new(VectorStore::in_memory().unwrap());
        let (pipeline, _) = pipeline(records, store.clone(), Some(visual));

        let report = pipeline.run().await.unwrap();
        let visual_report = report.visual.unwrap();
        assert_eq!(visual_report.eligible, 2);
        assert_eq!(visual_report.added, 1);
        assert_eq!(visual_report.skipped, 1);
        assert_eq!(store.count(Modality::Visual).unwrap(), 1);
        assert_eq!(store.count(Modality::Text).unwrap(), 3);

        // The poster is fixed on disk; the next run picks it up.
        std::fs::write(&broken, png_bytes(12, 12, 8)).unwrap();
        let report = pipeline.run().await.unwrap();
        let visual_report = report.visual.unwrap();
        assert_eq!(visual_report.already_indexed, 1);
        assert_eq!(visual_report.added, 1);
        assert_eq!(store.count(Modality::Visual).unwrap(), 2);
        assert_eq!(report.text.added, 0);
    }

    #[tokio::test]
    async fn test_reset_and_reindex() {
        let store = Arc::new(VectorStore::in_memory().unwrap());
        let (pipeline, embedder) = pipeline(
            vec![
                record("a", MediaType::Movie, None),
                record("b", MediaType::Game, None),
            ],
            store.clone(),
            None,
        );
        pipeline.run().await.unwrap();
        let report = pipeline.reset_and_reindex().await.unwrap();
        assert_eq!(report.text.added, 2);
        assert_eq!(embedder.texts.load(Ordering::SeqCst), 4);
        assert_eq!(store.count(Modality::Text).unwrap(), 2);
    }

    #[tokio::test]
    async fn test_documents_and_metadata() {
        let store = Arc::new(VectorStore::in_memory().unwrap());
        let mut alpha = record("7", MediaType::Movie, None);
        alpha.embedding_text = Some("precomputed text".to_string());
        let (pipeline, _) = pipeline(vec![alpha], store.clone(), None);
        pipeline.run().await.unwrap();

        let query = HashingEmbedder::new(64).embed_sync("precomputed text");
        let hits = store.query(Modality::Text, &query, 1, None).unwrap();
        assert_eq!(hits[0].record_id, "7");
        assert_eq!(hits[0].document, "precomputed text");
        assert_eq!(hits[0].metadata.title, "Title 7");
        assert!(hits[0].distance.abs() < 1e-5);
    }
}
