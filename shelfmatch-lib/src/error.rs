//! Error types for shelfmatch

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for shelfmatch operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in shelfmatch operations
#[derive(Error, Debug)]
pub enum Error {
    /// A vector's length differs from the store dimension
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// An all-zero vector can not be normalized
    #[error("degenerate embedding: vector has zero norm")]
    DegenerateEmbedding,

    /// Search was run against a store with no vectors
    #[error("vector store is empty")]
    EmptyStore,

    /// Catalog lookup for an id outside the catalog
    #[error("unknown product id: {0}")]
    UnknownId(u64),

    /// Persisted vectors and records disagree, or a file is malformed
    #[error("corrupt index: {0}")]
    CorruptIndex(String),

    /// The image directory contained no usable image files
    #[error("no images found in {}", .0.display())]
    NoImagesFound(PathBuf),

    /// Bad or undecodable query input
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// No persisted index is loaded
    #[error("index unavailable: {0}")]
    IndexUnavailable(String),

    /// An external provider failed (auth, network or response parsing)
    #[error("provider {provider} failed: {message}")]
    Provider { provider: String, message: String },

    /// The embedding capability failed
    #[error("embedding error: {0}")]
    Embedding(String),

    /// Another index rebuild holds the rebuild lock
    #[error("an index rebuild is already in progress")]
    RebuildInProgress,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Builds a provider error from anything displayable.
    pub fn provider(provider: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: message.to_string(),
        }
    }

    /// Returns `true` when the error means the system is degraded rather
    /// than the caller having asked for something invalid.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        matches!(
            self,
            Self::IndexUnavailable(_) | Self::CorruptIndex(_) | Self::Provider { .. }
        )
    }
}
