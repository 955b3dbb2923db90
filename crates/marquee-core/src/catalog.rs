//! Media catalog port and the JSON-backed in-memory adapter.
//!
//! The catalog owns the universe of media records. The retrieval engine
//! only reads from it: by id when resolving search hits, and in full when
//! reconciling the vector store during indexing.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use tracing::{info, warn};

use crate::error::{MarqueeError, Result};
use crate::types::{MediaMetadata, MediaRecord, MediaType};

/// Read-only source of media records.
pub trait MediaCatalog: Send + Sync {
    /// Every record in catalog order.
    fn get_all_items(&self) -> Vec<MediaRecord>;

    /// Look up a single record. `None` for unknown ids.
    fn get_item_by_id(&self, id: &str) -> Option<MediaRecord>;

    /// Number of distinct records.
    fn len(&self) -> usize {
        self.get_all_items().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Catalog held entirely in memory, indexed by id.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCatalog {
    items: Vec<MediaRecord>,
    by_id: HashMap<String, usize>,
}

impl InMemoryCatalog {
    /// Build a catalog from records. Later duplicates of an id are dropped.
    pub fn new(records: impl IntoIterator<Item = MediaRecord>) -> Self {
        let mut catalog = Self::default();
        for record in records {
            catalog.insert(record);
        }
        catalog
    }

    /// Load one or more JSON files shaped as `{"movies": [...]}` and/or
    /// `{"games": [...]}`.
    pub fn from_json_files<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        let mut catalog = Self::default();
        for path in paths {
            let path = path.as_ref();
            let content = std::fs::read_to_string(path).map_err(|e| {
                MarqueeError::Catalog(format!("Failed to read {}: {}", path.display(), e))
            })?;
            let before = catalog.items.len();
            catalog.extend_from_json(&content)?;
            info!(
                path = %path.display(),
                loaded = catalog.items.len() - before,
                "Catalog file loaded"
            );
        }
        Ok(catalog)
    }

    /// Parse a single JSON document into a catalog.
    pub fn from_json_str(content: &str) -> Result<Self> {
        let mut catalog = Self::default();
        catalog.extend_from_json(content)?;
        Ok(catalog)
    }

    fn extend_from_json(&mut self, content: &str) -> Result<()> {
        let file: CatalogFile = serde_json::from_str(content)?;
        for raw in file.movies {
            let record = raw.into_record(MediaType::Movie)?;
            self.insert(record);
        }
        for raw in file.games {
            let record = raw.into_record(MediaType::Game)?;
            self.insert(record);
        }
        Ok(())
    }

    fn insert(&mut self, record: MediaRecord) {
        if self.by_id.contains_key(&record.id) {
            warn!(id = %record.id, "Duplicate catalog id ignored");
            return;
        }
        self.by_id.insert(record.id.clone(), self.items.len());
        self.items.push(record);
    }
}

impl MediaCatalog for InMemoryCatalog {
    fn get_all_items(&self) -> Vec<MediaRecord> {
        self.items.clone()
    }

    fn get_item_by_id(&self, id: &str) -> Option<MediaRecord> {
        self.by_id.get(id).map(|&idx| self.items[idx].clone())
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

// =============================================================================
// JSON wire format
// =============================================================================

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    movies: Vec<RawItem>,
    #[serde(default)]
    games: Vec<RawItem>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum GenreField {
    List(Vec<String>),
    Text(String),
}

impl GenreField {
    fn into_list(self) -> Vec<String> {
        match self {
            GenreField::List(list) => list,
            GenreField::Text(text) => text
                .split(',')
                .map(str::trim)
                .filter(|g| !g.is_empty())
                .map(String::from)
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawItem {
    id: serde_json::Value,
    title: String,
    #[serde(default, rename = "type")]
    media_type: Option<String>,
    #[serde(default, alias = "description")]
    overview: Option<String>,
    #[serde(default)]
    release_date: Option<String>,
    #[serde(default)]
    popularity: Option<f64>,
    #[serde(default)]
    vote_count: Option<f64>,
    #[serde(default)]
    vote_average: Option<f64>,
    #[serde(default)]
    original_language: Option<String>,
    #[serde(default, alias = "genres")]
    genre: Option<GenreField>,
    #[serde(default)]
    poster_url: Option<String>,
    #[serde(default)]
    content_for_embedding: Option<String>,
}

impl RawItem {
    fn into_record(self, section: MediaType) -> Result<MediaRecord> {
        let id = match self.id {
            serde_json::Value::String(s) => s,
            serde_json::Value::Number(n) => n.to_string(),
            other => {
                return Err(MarqueeError::Catalog(format!(
                    "Unsupported id {} for '{}'",
                    other, self.title
                )))
            }
        };

        let media_type = match self.media_type.as_deref() {
            Some(raw) => raw.parse()?,
            None => section,
        };

        Ok(MediaRecord {
            id,
            title: self.title,
            media_type,
            description: self.overview.unwrap_or_default(),
            metadata: MediaMetadata {
                release_date: self.release_date,
                genres: self.genre.map(GenreField::into_list).unwrap_or_default(),
                popularity: self.popularity.unwrap_or(0.0),
                vote_average: self.vote_average.unwrap_or(0.0),
                vote_count: self.vote_count.map(|c| c.max(0.0) as u64).unwrap_or(0),
                poster_url: self.poster_url,
                original_language: self.original_language,
            },
            embedding_text: self.content_for_embedding,
        })
    }
}
