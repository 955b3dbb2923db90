//! CLI argument definitions for the Marquee application.
//!
//! Priority resolution: CLI args > env vars > config file > defaults.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use marquee_core::types::MediaType;

/// Marquee: ask questions about movies and games, by text or by poster.
#[derive(Parser, Debug)]
#[command(name = "marquee", version, about)]
pub struct CliArgs {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// Data directory for the vector store.
    #[arg(short = 'd', long = "data-dir", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short = 'l', long = "log-level", global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// Embed catalog records that are not yet indexed.
    Index,
    /// Drop both collections and rebuild them from the catalog.
    Reset,
    /// Answer a free-text question.
    Ask {
        query: String,
        /// Restrict results to `movie` or `game`.
        #[arg(short = 't', long = "type", value_parser = parse_media_type)]
        media_type: Option<MediaType>,
    },
    /// Find titles whose poster resembles an image (URL or file path).
    Image {
        image: String,
        #[arg(short = 't', long = "type", value_parser = parse_media_type)]
        media_type: Option<MediaType>,
    },
    /// Discuss one catalog record by id.
    About {
        id: String,
        /// Follow-up question about the record.
        #[arg(short = 'q', long = "question")]
        question: Option<String>,
    },
    /// Print the records retrieved for a query, without generation.
    Context {
        query: String,
        #[arg(short = 't', long = "type", value_parser = parse_media_type)]
        media_type: Option<MediaType>,
    },
    /// List the highest-scoring catalog records.
    Featured {
        #[arg(short = 'n', long = "limit", default_value_t = 10)]
        limit: usize,
        #[arg(short = 't', long = "type", value_parser = parse_media_type)]
        media_type: Option<MediaType>,
    },
    /// Print collection counts and model identifiers as JSON.
    Stats,
}

impl CliArgs {
    /// Resolve the configuration file path.
    ///
    /// Priority: --config flag > MARQUEE_CONFIG env var > ~/.marquee/config.toml.
    pub fn resolve_config_path(&self) -> PathBuf {
        if let Some(ref p) = self.config {
            return p.clone();
        }
        if let Ok(p) = std::env::var("MARQUEE_CONFIG") {
            return PathBuf::from(p);
        }
        default_config_path()
    }

    /// Resolve the data directory override, if any.
    pub fn resolve_data_dir(&self) -> Option<String> {
        self.data_dir
            .as_ref()
            .map(|p| p.to_string_lossy().to_string())
    }

    /// Resolve the log filter.
    ///
    /// Priority: --log-level flag > RUST_LOG env var > config file value.
    pub fn resolve_log_level(&self, config_level: &str) -> String {
        if let Some(ref level) = self.log_level {
            return level.clone();
        }
        if let Ok(filter) = std::env::var("RUST_LOG") {
            if !filter.trim().is_empty() {
                return filter;
            }
        }
        config_level.to_string()
    }
}

fn parse_media_type(s: &str) -> Result<MediaType, String> {
    s.parse::<MediaType>().map_err(|e| e.to_string())
}

fn default_config_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    if let Ok(home) = std::env::var("USERPROFILE") {
        return PathBuf::from(home).join(".marquee").join("config.toml");
    }
    #[cfg(not(target_os = "windows"))]
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".marquee").join("config.toml");
    }
    PathBuf::from("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ask_with_type() {
        let args = CliArgs::parse_from(["marquee", "ask", "space opera", "--type", "games"]);
        assert_eq!(
            args.command,
            Command::Ask {
                query: "space opera".to_string(),
                media_type: Some(MediaType::Game),
            }
        );
    }

    #[test]
    fn test_rejects_unknown_type() {
        let result = CliArgs::try_parse_from(["marquee", "context", "x", "--type", "book"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let args = CliArgs::parse_from([
            "marquee",
            "stats",
            "--config",
            "/tmp/m.toml",
            "--data-dir",
            "/tmp/data",
        ]);
        assert_eq!(args.command, Command::Stats);
        assert_eq!(args.resolve_config_path(), PathBuf::from("/tmp/m.toml"));
        assert_eq!(args.resolve_data_dir().as_deref(), Some("/tmp/data"));
    }

    #[test]
    fn test_featured_defaults() {
        let args = CliArgs::parse_from(["marquee", "featured"]);
        assert_eq!(
            args.command,
            Command::Featured {
                limit: 10,
                media_type: None,
            }
        );
    }

    #[test]
    fn test_log_level_flag_wins() {
        let args = CliArgs::parse_from(["marquee", "-l", "debug", "index"]);
        assert_eq!(args.resolve_log_level("warn"), "debug");
    }

    #[test]
    fn test_about_question() {
        let args = CliArgs::parse_from(["marquee", "about", "603", "-q", "who directed it?"]);
        assert_eq!(
            args.command,
            Command::About {
                id: "603".to_string(),
                question: Some("who directed it?".to_string()),
            }
        );
    }
}
