//! Marquee vector crate - text and visual embeddings, the dual-collection
//! vector store, the indexing pipeline, and the query engine.

pub mod embedding;
pub mod pipeline;
pub mod search;
pub mod store;
pub mod visual;

pub use embedding::{DynTextEmbedder, HashingEmbedder, OnnxTextEmbedder, TextEmbedder};
pub use pipeline::{CollectionReport, IndexReport, IndexingPipeline, DEFAULT_BATCH_SIZE};
pub use search::{QueryEngine, RankedItem, VisualMatches};
pub use store::{BatchReport, NewEntry, QueryHit, VectorStore};
pub use visual::{
    BasicFeatures, ImageRef, OnnxVisionModel, VisionModel, VisualEmbedder, VisualEmbedding,
    VisualMethod, BASIC_FEATURES_ID,
};
