//! Typed messages for the relaycast composition controller.
//!
//! This crate defines the commands, events and state types exchanged between
//! the session gateway, the HTTP surface and the controller, plus the media
//! types they all share.

mod commands;
mod events;
mod state;
mod types;

pub use commands::ControllerCommand;
pub use events::{ControllerEvent, FallbackKind, FallbackTier};
pub use state::{CompositionStatus, DegradedReason, RestartPhase};
pub use types::{
    Cell, CodecCapability, CodecDescriptor, CompositionMetrics, Layout, MediaKind, OutputTarget,
    ProducerId, ProducerInfo, RtpCapabilities, SessionId,
};

/// Channel capacity for commands (gateway/HTTP → controller).
pub const COMMAND_CHANNEL_CAPACITY: usize = 64;

/// Channel capacity for events (controller → observers).
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Creates a bounded command channel.
pub fn command_channel() -> (
    tokio::sync::mpsc::Sender<ControllerCommand>,
    tokio::sync::mpsc::Receiver<ControllerCommand>,
) {
    tokio::sync::mpsc::channel(COMMAND_CHANNEL_CAPACITY)
}

/// Creates a bounded event channel.
pub fn event_channel() -> (
    crossbeam_channel::Sender<ControllerEvent>,
    crossbeam_channel::Receiver<ControllerEvent>,
) {
    crossbeam_channel::bounded(EVENT_CHANNEL_CAPACITY)
}
