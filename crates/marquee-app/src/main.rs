//! Marquee application binary - composition root.
//!
//! Ties together all Marquee crates into a single executable:
//! 1. Load configuration from TOML
//! 2. Load the movie/game catalog
//! 3. Open the vector store (SQLite write-through)
//! 4. Build the text and visual embedders and the language model client
//! 5. Run the requested command through the `MediaRag` facade

mod cli;

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use marquee_chat::{CohereClient, LanguageModel, MediaRag, OfflineModel, RagAnswer};
use marquee_core::catalog::{InMemoryCatalog, MediaCatalog};
use marquee_core::config::{expand_home, EmbeddingBackend, MarqueeConfig};
use marquee_core::error::MarqueeError;
use marquee_core::types::MediaRecord;
use marquee_vector::embedding::{DynTextEmbedder, HashingEmbedder, OnnxTextEmbedder};
use marquee_vector::store::VectorStore;
use marquee_vector::visual::{ImageRef, OnnxVisionModel, VisionModel, VisualEmbedder};

use cli::{CliArgs, Command};

fn build_text_embedder(config: &MarqueeConfig) -> Result<Arc<dyn DynTextEmbedder>, MarqueeError> {
    match config.embedding.backend {
        EmbeddingBackend::Onnx => {
            let dir = expand_home(&config.embedding.model_dir);
            let embedder = OnnxTextEmbedder::from_directory(&dir, &config.embedding.model_id)?;
            tracing::info!(model = %config.embedding.model_id, "ONNX text embedder loaded");
            Ok(Arc::new(embedder))
        }
        EmbeddingBackend::Hashing => {
            tracing::info!(
                dimensions = config.embedding.dimensions,
                "Using feature-hashing text embedder"
            );
            Ok(Arc::new(HashingEmbedder::new(config.embedding.dimensions)))
        }
    }
}

/// `None` when visual search is disabled. A vision model that fails to load
/// is not fatal: the embedder then runs on basic features only.
fn build_visual_embedder(
    config: &MarqueeConfig,
) -> Result<Option<Arc<VisualEmbedder>>, MarqueeError> {
    let visual = &config.visual;
    if !visual.enabled {
        tracing::info!("Visual search disabled");
        return Ok(None);
    }

    let model: Option<Arc<dyn VisionModel>> = match visual.model_dir {
        Some(ref dir) => match OnnxVisionModel::from_directory(
            &expand_home(dir),
            &visual.model_id,
            visual.input_size,
            visual.dimensions,
        ) {
            Ok(model) => Some(Arc::new(model)),
            Err(e) => {
                tracing::warn!(error = %e, "Vision model unavailable, falling back to basic features");
                None
            }
        },
        None => None,
    };

    Ok(Some(Arc::new(VisualEmbedder::new(model, visual)?)))
}

fn build_language_model(config: &MarqueeConfig) -> Arc<dyn LanguageModel> {
    match CohereClient::from_config(&config.llm) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            tracing::warn!(error = %e, "Language model unavailable, answers will list context only");
            Arc::new(OfflineModel::new(e.to_string()))
        }
    }
}

fn print_answer(answer: &RagAnswer) {
    println!("{}", answer.text);
    if !answer.items.is_empty() {
        println!();
        for item in &answer.items {
            println!(
                "  [{:.3}] {} ({}, id {})",
                item.similarity(),
                item.record.title,
                item.record.media_type.label(),
                item.record.id
            );
        }
    }
}

fn print_records(records: &[MediaRecord]) {
    for record in records {
        let year = record
            .release_year()
            .map_or_else(|| "-".to_string(), |y| y.to_string());
        println!(
            "{}\t{}\t{}\t{}\t{:.1}",
            record.id,
            record.media_type,
            record.title,
            year,
            record.metadata.vote_average
        );
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    // Config.
    let config_file = args.resolve_config_path();
    let mut config = if config_file.exists() {
        MarqueeConfig::load(&config_file)?
    } else {
        MarqueeConfig::default()
    };
    if let Some(dir) = args.resolve_data_dir() {
        config.general.data_dir = dir;
    }

    // Tracing.
    let filter = args.resolve_log_level(&config.general.log_level);
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&filter).unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("Starting Marquee v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        path = %config_file.display(),
        found = config_file.exists(),
        "Configuration resolved"
    );
    config.validate()?;

    // Catalog.
    let catalog: Arc<dyn MediaCatalog> =
        Arc::new(InMemoryCatalog::from_json_files(&config.catalog_paths())?);
    tracing::info!(records = catalog.len(), "Catalog loaded");

    // Vector store.
    let store_path = config.store_path();
    let store = Arc::new(VectorStore::open(&store_path)?);

    // Embedders and language model.
    let text = build_text_embedder(&config)?;
    let visual = build_visual_embedder(&config)?;
    let llm = build_language_model(&config);

    let rag = MediaRag::new(catalog, store, text, visual, llm, &config);

    match args.command {
        Command::Index => {
            let report = rag.ensure_indexed().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Reset => {
            let report = rag.reset_and_reindex().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Ask { query, media_type } => {
            rag.ensure_indexed().await?;
            let answer = rag.query_with_text(&query, media_type).await?;
            print_answer(&answer);
        }
        Command::Image { image, media_type } => {
            rag.ensure_indexed().await?;
            let answer = rag
                .query_with_image(&ImageRef::from(image.as_str()), media_type)
                .await?;
            print_answer(&answer);
        }
        Command::About { id, question } => {
            rag.ensure_indexed().await?;
            let answer = rag.ask_about_item(&id, question.as_deref()).await?;
            print_answer(&answer);
        }
        Command::Context { query, media_type } => {
            rag.ensure_indexed().await?;
            let records = rag.get_relevant_context(&query, media_type).await?;
            print_records(&records);
        }
        Command::Featured { limit, media_type } => {
            print_records(&rag.featured_items(limit, media_type));
        }
        Command::Stats => {
            println!("{}", serde_json::to_string_pretty(&rag.get_index_stats()?)?);
        }
    }

    Ok(())
}
