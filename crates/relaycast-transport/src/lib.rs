//! Relay transport for relaycast.
//!
//! This crate defines the media engine interface the relay consumes, the
//! relay endpoints that bridge producers to transcoder ports, and a
//! plain-RTP engine implementation.

mod endpoint;
mod engine;
mod error;
mod ports;
mod retry;
pub mod sdp;
mod udp;

pub use endpoint::{default_capabilities, EndpointManager, RelayConfig, RelayEndpoint};
pub use engine::{
    Consumer, ConsumerEvent, MediaEngine, MediaEvent, RemoteAddr, Transport, TransportDirection,
    TransportEvent, TransportState,
};
pub use error::TransportError;
pub use ports::{PortAllocator, PortPair, PortRange};
pub use retry::RetryPolicy;
pub use udp::{build_pli, UdpRelayConfig, UdpRelayEngine};

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// First media port handed to the transcoder.
pub const DEFAULT_PORT_BASE: u16 = 20000;

/// Port slots before the allocation counter wraps.
pub const DEFAULT_PORT_CEILING: u16 = 100;

/// Allocation attempts, i.e. one retry.
pub const MAX_ALLOCATE_ATTEMPTS: u32 = 2;

/// Base retry delay in milliseconds.
pub const BASE_RETRY_DELAY_MS: u64 = 250;
