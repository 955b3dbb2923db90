use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{MarqueeError, Result};

/// Top-level configuration for the Marquee engine.
///
/// Loaded from `~/.marquee/config.toml` by default. Each section maps to
/// one component of the retrieval engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarqueeConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub visual: VisualConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub llm: LlmConfig,
}

impl MarqueeConfig {
    /// Load configuration from a TOML file.
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: MarqueeConfig = toml::from_str(&content)?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Save the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Reject values that would make the engine misbehave at runtime.
    pub fn validate(&self) -> Result<()> {
        if self.embedding.batch_size == 0 {
            return Err(MarqueeError::Config(
                "embedding.batch_size must be greater than 0".to_string(),
            ));
        }
        if self.embedding.dimensions == 0 || self.visual.dimensions == 0 {
            return Err(MarqueeError::Config(
                "embedding dimensions must be greater than 0".to_string(),
            ));
        }
        if self.visual.histogram_bins == 0 || self.visual.canonical_size == 0 {
            return Err(MarqueeError::Config(
                "visual.histogram_bins and visual.canonical_size must be greater than 0"
                    .to_string(),
            ));
        }
        if self.visual.histogram_bins * 3 + 4 > self.visual.dimensions {
            return Err(MarqueeError::Config(format!(
                "visual.dimensions ({}) too small for {} histogram bins per channel",
                self.visual.dimensions, self.visual.histogram_bins
            )));
        }
        if self.visual.cache_capacity == 0 {
            return Err(MarqueeError::Config(
                "visual.cache_capacity must be greater than 0".to_string(),
            ));
        }
        if let Some(floor) = self.search.min_similarity {
            if !(-1.0..=1.0).contains(&floor) {
                return Err(MarqueeError::Config(format!(
                    "search.min_similarity must be within [-1, 1], got {}",
                    floor
                )));
            }
        }
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            return Err(MarqueeError::Config(format!(
                "llm.temperature must be within [0, 2], got {}",
                self.llm.temperature
            )));
        }
        if self.llm.timeout_secs == 0 || self.visual.fetch_timeout_secs == 0 {
            return Err(MarqueeError::Config(
                "network timeouts must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Vector store path: explicit `store.path`, else `<data_dir>/vectors.db`.
    pub fn store_path(&self) -> PathBuf {
        match self.store.path {
            Some(ref path) => expand_home(path),
            None => expand_home(&self.general.data_dir).join("vectors.db"),
        }
    }

    /// Catalog JSON files that are configured.
    pub fn catalog_paths(&self) -> Vec<PathBuf> {
        [&self.catalog.movies_path, &self.catalog.games_path]
            .into_iter()
            .flatten()
            .map(|p| expand_home(p))
            .collect()
    }
}

/// Expand a leading `~/` using `HOME`.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Data directory for the vector store.
    pub data_dir: String,
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: "~/.marquee/data".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Catalog source files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    pub movies_path: Option<String>,
    pub games_path: Option<String>,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            movies_path: Some("data/processed/movies.json".to_string()),
            games_path: Some("data/processed/games.json".to_string()),
        }
    }
}

/// Text embedding backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingBackend {
    /// Sentence-transformer ONNX export loaded with ONNX Runtime.
    Onnx,
    /// Deterministic feature-hashing embedder. No model files required.
    Hashing,
}

/// Text embedding configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub backend: EmbeddingBackend,
    /// Directory containing `model.onnx` and `tokenizer.json`.
    pub model_dir: String,
    /// Identifier reported in index stats.
    pub model_id: String,
    /// Output dimension of the hashing backend. The ONNX backend reads it
    /// from the model.
    pub dimensions: usize,
    /// Records embedded per batch during indexing.
    pub batch_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            backend: EmbeddingBackend::Onnx,
            model_dir: "~/.marquee/models/all-MiniLM-L6-v2".to_string(),
            model_id: "all-MiniLM-L6-v2".to_string(),
            dimensions: 384,
            batch_size: 32,
        }
    }
}

/// Visual embedding configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VisualConfig {
    /// Whether the visual collection is built and queried at all.
    pub enabled: bool,
    /// Directory containing a vision encoder `model.onnx`. When unset or
    /// unloadable, basic features are used.
    pub model_dir: Option<String>,
    pub model_id: String,
    /// Output dimension shared by the model and the fallback descriptor.
    pub dimensions: usize,
    /// Square input resolution of the vision model.
    pub input_size: u32,
    /// Square size images are resized to before computing basic features.
    pub canonical_size: u32,
    /// Histogram buckets per color channel for basic features.
    pub histogram_bins: usize,
    /// Timeout for downloading an image.
    pub fetch_timeout_secs: u64,
    /// Number of memoized image embeddings.
    pub cache_capacity: usize,
}

impl Default for VisualConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model_dir: None,
            model_id: "clip-vit-b-32".to_string(),
            dimensions: 512,
            input_size: 224,
            canonical_size: 224,
            histogram_bins: 32,
            fetch_timeout_secs: 10,
            cache_capacity: 256,
        }
    }
}

/// Vector store configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite file for both collections. Defaults to `<data_dir>/vectors.db`.
    pub path: Option<String>,
}

/// Search configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Results used to answer a text query.
    pub text_top_k: usize,
    /// Results used to answer an image query.
    pub visual_top_k: usize,
    /// Results returned by `get_relevant_context`.
    pub context_top_k: usize,
    /// Optional cosine similarity floor applied to hits.
    pub min_similarity: Option<f32>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            text_top_k: 5,
            visual_top_k: 5,
            context_top_k: 10,
            min_similarity: None,
        }
    }
}

/// Language model provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// API base URL.
    pub endpoint: String,
    pub model: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.cohere.ai".to_string(),
            model: "command-r".to_string(),
            api_key_env: "COHERE_API_KEY".to_string(),
            temperature: 0.8,
            max_tokens: 800,
            timeout_secs: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_default_config() {
        let config = MarqueeConfig::default();
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.embedding.backend, EmbeddingBackend::Onnx);
        assert_eq!(config.embedding.batch_size, 32);
        assert_eq!(config.visual.dimensions, 512);
        assert_eq!(config.search.text_top_k, 5);
        assert_eq!(config.search.context_top_k, 10);
        assert_eq!(config.llm.max_tokens, 800);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_partial_config() {
        let content = r#"
[general]
data_dir = "/srv/marquee"

[embedding]
backend = "hashing"
batch_size = 8

[search]
min_similarity = 0.3
"#;
        let file = create_temp_config(content);
        let config = MarqueeConfig::load(file.path()).unwrap();
        assert_eq!(config.general.data_dir, "/srv/marquee");
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.embedding.backend, EmbeddingBackend::Hashing);
        assert_eq!(config.embedding.batch_size, 8);
        assert_eq!(config.embedding.dimensions, 384);
        assert_eq!(config.search.min_similarity, Some(0.3));
        assert_eq!(config.store_path(), PathBuf::from("/srv/marquee/vectors.db"));
    }

    #[test]
    fn test_load_invalid_toml() {
        let file = create_temp_config("[general\nbroken");
        let result = MarqueeConfig::load(file.path());
        assert!(matches!(result, Err(MarqueeError::Config(_))));
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let result = MarqueeConfig::load(Path::new("/nonexistent/config.toml"));
        assert!(matches!(result, Err(MarqueeError::Io(_))));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = MarqueeConfig::default();
        config.visual.enabled = false;
        config.store.path = Some("/tmp/marquee.db".to_string());
        config.save(&path).unwrap();

        let loaded = MarqueeConfig::load(&path).unwrap();
        assert!(!loaded.visual.enabled);
        assert_eq!(loaded.store_path(), PathBuf::from("/tmp/marquee.db"));
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let mut config = MarqueeConfig::default();
        config.embedding.batch_size = 0;
        assert!(matches!(config.validate(), Err(MarqueeError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_small_visual_dimension() {
        let mut config = MarqueeConfig::default();
        config.visual.dimensions = 64;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_similarity_out_of_range() {
        let mut config = MarqueeConfig::default();
        config.search.min_similarity = Some(1.5);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_catalog_paths() {
        let mut config = MarqueeConfig::default();
        config.catalog.games_path = None;
        let paths = config.catalog_paths();
        assert_eq!(paths, vec![PathBuf::from("data/processed/movies.json")]);
    }
}
