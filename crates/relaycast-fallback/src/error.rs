//! Error types for fallback generation.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised inside the fallback tiers. They never leave the generator.
#[derive(Debug, Error)]
pub enum FallbackError {
    /// The configured slate asset is missing or unreadable.
    #[error("Slate asset unavailable: {path}: {source}")]
    SlateUnavailable {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A rendered playlist failed validation.
    #[error("Invalid playlist: {0}")]
    InvalidPlaylist(String),

    /// Status sidecar serialization failed.
    #[error("Status serialization failed: {0}")]
    Status(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
