//! Error types for the transport module.

use thiserror::Error;

/// Errors that can occur during relay transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The producer's codec cannot be consumed by the relay.
    #[error("Producer {producer_id} cannot be consumed ({mime_type})")]
    CapabilityMismatch {
        producer_id: String,
        mime_type: String,
    },

    /// The media engine could not create a bridging transport.
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    /// Every port slot is taken.
    #[error("No free port pair after {0} slots")]
    PortExhausted(u16),

    /// Unknown producer.
    #[error("Producer not found: {0}")]
    ProducerNotFound(String),

    /// Unknown transport.
    #[error("Transport not found: {0}")]
    TransportNotFound(String),

    /// Transport is not connected to a remote yet.
    #[error("Not connected")]
    NotConnected,

    /// Handle was already closed.
    #[error("Closed")]
    Closed,

    /// Invalid argument from a client.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Whether the error should be treated as a transient allocation failure.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Self::TransportUnavailable(_) | Self::PortExhausted(_) | Self::Io(_)
        )
    }
}
