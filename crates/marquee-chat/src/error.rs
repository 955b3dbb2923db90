//! Error types for the conversational layer.

use marquee_core::error::MarqueeError;

/// Errors surfaced to the application layer.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("query cannot be empty")]
    EmptyQuery,
    #[error("no visual signal: {0}")]
    NoVisualSignal(String),
    #[error("visual search is disabled")]
    VisualSearchDisabled,
    #[error("item not found: {0}")]
    ItemNotFound(String),
    #[error("LLM error: {0}")]
    Llm(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("engine error: {0}")]
    Engine(String),
}

impl From<MarqueeError> for ChatError {
    fn from(err: MarqueeError) -> Self {
        match err {
            MarqueeError::NoVisualSignal(source) => ChatError::NoVisualSignal(source),
            MarqueeError::VisualSearchDisabled => ChatError::VisualSearchDisabled,
            MarqueeError::Config(msg) => ChatError::Config(msg),
            other => ChatError::Engine(other.to_string()),
        }
    }
}
