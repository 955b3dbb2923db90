use thiserror::Error;

/// Top-level error type for the Marquee retrieval engine.
///
/// Subsystem crates either return this type directly or define their own
/// error and implement `From<MarqueeError>` so that `?` works across crate
/// boundaries.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MarqueeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Embedding error: {0}")]
    Embedding(String),

    /// The image could not be fetched or decoded, so no visual embedding exists.
    #[error("No visual signal: {0}")]
    NoVisualSignal(String),

    #[error("Visual search is disabled")]
    VisualSearchDisabled,

    #[error("Invalid vector: {0}")]
    InvalidVector(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Search error: {0}")]
    Search(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<toml::de::Error> for MarqueeError {
    fn from(err: toml::de::Error) -> Self {
        MarqueeError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for MarqueeError {
    fn from(err: toml::ser::Error) -> Self {
        MarqueeError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for MarqueeError {
    fn from(err: serde_json::Error) -> Self {
        MarqueeError::Serialization(err.to_string())
    }
}

/// A specialized `Result` type for Marquee operations.
pub type Result<T> = std::result::Result<T, MarqueeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_all_variants() {
        let cases: Vec<(MarqueeError, &str)> = vec![
            (
                MarqueeError::Config("bad key".to_string()),
                "Configuration error: bad key",
            ),
            (
                MarqueeError::Catalog("missing file".to_string()),
                "Catalog error: missing file",
            ),
            (
                MarqueeError::Embedding("model not loaded".to_string()),
                "Embedding error: model not loaded",
            ),
            (
                MarqueeError::NoVisualSignal("connection refused".to_string()),
                "No visual signal: connection refused",
            ),
            (
                MarqueeError::VisualSearchDisabled,
                "Visual search is disabled",
            ),
            (
                MarqueeError::InvalidVector("zero norm".to_string()),
                "Invalid vector: zero norm",
            ),
            (
                MarqueeError::Storage("disk full".to_string()),
                "Storage error: disk full",
            ),
            (
                MarqueeError::Search("dimension mismatch".to_string()),
                "Search error: dimension mismatch",
            ),
            (
                MarqueeError::Serialization("invalid json".to_string()),
                "Serialization error: invalid json",
            ),
        ];

        for (error, expected) in cases {
            assert_eq!(error.to_string(), expected);
        }
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: MarqueeError = io_err.into();
        assert!(matches!(err, MarqueeError::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_error_from_toml_de() {
        let err: std::result::Result<toml::Value, _> = toml::from_str("invalid = [[[");
        let err: MarqueeError = err.unwrap_err().into();
        assert!(matches!(err, MarqueeError::Config(_)));
    }

    #[test]
    fn test_error_from_serde_json() {
        let err: std::result::Result<serde_json::Value, _> = serde_json::from_str("{ nope }");
        let err: MarqueeError = err.unwrap_err().into();
        assert!(matches!(err, MarqueeError::Serialization(_)));
    }

    #[test]
    fn test_result_type_with_question_mark() {
        fn inner() -> Result<String> {
            let io_result: std::result::Result<i32, std::io::Error> = Ok(42);
            let value = io_result?;
            Ok(value.to_string())
        }

        assert_eq!(inner().unwrap(), "42");
    }
}
