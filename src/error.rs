//! Error taxonomy for the knowledge engine
//!
//! Foreground calls (search, add_knowledge) surface these to their caller.
//! The background learning loop converts them into status fields instead.

use thiserror::Error;

/// Errors produced by the knowledge engine and its collaborators
#[derive(Debug, Error)]
pub enum KnowledgeError {
    /// The embedding backend could not produce a vector
    #[error("Embedding unavailable: {0}")]
    EmbeddingUnavailable(String),

    /// The persistent store could not be reached or failed a query
    #[error("Knowledge store unavailable: {0}")]
    StoreUnavailable(String),

    /// The shared cache could not be reached
    #[error("Cache unavailable: {0}")]
    CacheUnavailable(String),

    /// Content generation failed, timed out, or produced nothing
    #[error("Content generation failed: {0}")]
    ContentGeneration(String),

    /// Invalid configuration detected at startup
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// No knowledge entry with this id
    #[error("Knowledge entry not found: {0}")]
    NotFound(i64),

    /// Caller supplied input the engine refuses (empty content, empty query)
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl KnowledgeError {
    /// Stable machine-readable code for the error kind
    pub fn code(&self) -> &'static str {
        match self {
            Self::EmbeddingUnavailable(_) => "EMBEDDING_UNAVAILABLE",
            Self::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            Self::CacheUnavailable(_) => "CACHE_UNAVAILABLE",
            Self::ContentGeneration(_) => "CONTENT_GENERATION_FAILURE",
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::NotFound(_) => "NOT_FOUND",
            Self::InvalidInput(_) => "INVALID_INPUT",
        }
    }

    /// Whether the caller may reasonably retry the same call later
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::EmbeddingUnavailable(_)
                | Self::StoreUnavailable(_)
                | Self::CacheUnavailable(_)
                | Self::ContentGeneration(_)
        )
    }
}

impl From<rusqlite::Error> for KnowledgeError {
    fn from(e: rusqlite::Error) -> Self {
        KnowledgeError::StoreUnavailable(e.to_string())
    }
}

/// Result alias used across the library
pub type Result<T> = std::result::Result<T, KnowledgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(KnowledgeError::NotFound(3).code(), "NOT_FOUND");
        assert_eq!(
            KnowledgeError::Configuration("dim".into()).code(),
            "CONFIGURATION_ERROR"
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(KnowledgeError::StoreUnavailable("down".into()).is_transient());
        assert!(!KnowledgeError::Configuration("bad".into()).is_transient());
        assert!(!KnowledgeError::InvalidInput("empty".into()).is_transient());
    }

    #[test]
    fn test_sqlite_error_maps_to_store_unavailable() {
        let err: KnowledgeError = rusqlite::Error::InvalidQuery.into();
        assert!(matches!(err, KnowledgeError::StoreUnavailable(_)));
    }
}
