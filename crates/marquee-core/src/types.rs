use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MarqueeError;

// =============================================================================
// Enums
// =============================================================================

/// The kind of catalog item.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    Movie,
    Game,
}

impl MediaType {
    /// Value stored in entry metadata and used by the type filter.
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Movie => "movie",
            MediaType::Game => "game",
        }
    }

    /// Plural noun used in user-facing messages.
    pub fn plural(&self) -> &'static str {
        match self {
            MediaType::Movie => "movies",
            MediaType::Game => "games",
        }
    }

    /// Capitalized label used when formatting context blocks.
    pub fn label(&self) -> &'static str {
        match self {
            MediaType::Movie => "Movie",
            MediaType::Game => "Game",
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MediaType {
    type Err = MarqueeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "movie" | "movies" | "film" | "films" => Ok(MediaType::Movie),
            "game" | "games" => Ok(MediaType::Game),
            other => Err(MarqueeError::Catalog(format!("unknown media type: {}", other))),
        }
    }
}

/// Embedding modality. Each modality owns exactly one vector collection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    Text,
    Visual,
}

impl Modality {
    pub const ALL: [Modality; 2] = [Modality::Text, Modality::Visual];

    /// Collection name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::Text => "text",
            Modality::Visual => "visual",
        }
    }

    /// Entry key for a record: `"{modality}_{record_id}"`.
    pub fn entry_key(&self, record_id: &str) -> String {
        format!("{}_{}", self.as_str(), record_id)
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a single RAG query.
///
/// `Done` and `Degraded` are terminal. `Degraded` means the caller still got
/// a usable answer (raw context after an LLM failure) or an explicit visual
/// error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryPhase {
    Embedding,
    Searching,
    Resolving,
    Synthesizing,
    Done,
    Degraded,
}

// =============================================================================
// Catalog records
// =============================================================================

/// Structured metadata attached to a catalog record.
///
/// Every field is optional in the source data; absent numbers default to
/// zero and absent strings to `None`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaMetadata {
    pub release_date: Option<String>,
    pub genres: Vec<String>,
    pub popularity: f64,
    pub vote_average: f64,
    pub vote_count: u64,
    pub poster_url: Option<String>,
    pub original_language: Option<String>,
}

/// A movie or game owned by the catalog. The engine only reads it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MediaRecord {
    pub id: String,
    pub title: String,
    #[serde(rename = "type")]
    pub media_type: MediaType,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub metadata: MediaMetadata,
    /// Precomputed canonical text for embedding.
    #[serde(default)]
    pub embedding_text: Option<String>,
}

impl MediaRecord {
    /// Canonical text representation used for text embedding.
    ///
    /// Uses the precomputed embedding text when present, otherwise composes
    /// one from the structured fields.
    pub fn canonical_text(&self) -> String {
        if let Some(text) = self.embedding_text.as_deref() {
            if !text.trim().is_empty() {
                return text.to_string();
            }
        }

        [
            format!("Title: {}", self.title),
            format!("Type: {}", self.media_type),
            format!("Genres: {}", self.metadata.genres.join(", ")),
            format!(
                "Release: {}",
                self.metadata.release_date.as_deref().unwrap_or("")
            ),
            format!("Rating: {}/10", self.metadata.vote_average),
            format!("Description: {}", self.description),
        ]
        .join(" | ")
    }

    /// Poster URL, if present and non-blank.
    pub fn poster_url(&self) -> Option<&str> {
        self.metadata
            .poster_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }

    /// Whether this record qualifies for the visual collection.
    pub fn is_visual_eligible(&self) -> bool {
        self.poster_url().is_some()
    }

    /// Release year parsed from `release_date` (`YYYY-MM-DD` or a leading year).
    pub fn release_year(&self) -> Option<i32> {
        let date = self.metadata.release_date.as_deref()?.trim();
        if let Ok(parsed) = NaiveDate::parse_from_str(date, "%Y-%m-%d") {
            return Some(parsed.year());
        }
        date.get(..4).and_then(|y| y.parse().ok())
    }

    /// Document string stored alongside the visual entry.
    pub fn visual_document(&self) -> String {
        format!("{} - {}", self.title, self.media_type)
    }

    /// Metadata snapshot stored with an index entry.
    pub fn snapshot(&self) -> EntryMetadata {
        EntryMetadata {
            id: self.id.clone(),
            title: self.title.clone(),
            media_type: self.media_type,
            release_date: self.metadata.release_date.clone(),
            genres: self.metadata.genres.clone(),
            vote_average: self.metadata.vote_average,
            popularity: self.metadata.popularity,
        }
    }

    /// Score used to rank featured items.
    pub fn featured_score(&self) -> f64 {
        self.metadata.vote_average * self.metadata.popularity
    }
}

/// Metadata snapshot persisted with each index entry.
///
/// `id` always equals the record id of the entry it belongs to.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub id: String,
    pub title: String,
    #[serde(rename = "type")]
    pub media_type: MediaType,
    #[serde(default)]
    pub release_date: Option<String>,
    #[serde(default)]
    pub genres: Vec<String>,
    #[serde(default)]
    pub vote_average: f64,
    #[serde(default)]
    pub popularity: f64,
}

// =============================================================================
// Stats
// =============================================================================

/// Snapshot of the index state exposed to the application layer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndexStats {
    pub text_count: usize,
    pub visual_count: usize,
    pub catalog_size: usize,
    pub text_model: String,
    /// `None` when visual search is disabled.
    pub visual_model: Option<String>,
    /// True when no vision model is loaded and only basic features are used.
    pub visual_fallback_only: bool,
    pub store_path: Option<String>,
    pub generated_at: DateTime<Utc>,
}
