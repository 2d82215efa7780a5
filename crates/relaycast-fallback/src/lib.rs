//! Fallback content for the relaycast output directory.
//!
//! When no transcoder is producing output, viewers still get a valid
//! playlist: a pre-rendered slate if configured, otherwise a synthesized
//! empty segment, and as a last resort a finished playlist that references
//! no segment at all.

mod error;
mod generator;
pub mod playlist;
pub mod segment;

pub use error::FallbackError;
pub use generator::{FallbackConfig, FallbackGenerator, StatusFile};

/// Result type for fallback operations.
pub type FallbackResult<T> = Result<T, FallbackError>;
