//! Composition orchestration for relaycast.
//!
//! This crate owns the producer registry, the composition controller that
//! keeps exactly one transcoder in step with the registered producers, and
//! the session gateway that feeds the registry from signalling requests.

mod config;
mod cycle;
mod error;
mod gateway;
mod metrics;
mod orchestrator;
mod registry;
#[cfg(test)]
mod testing;

pub use config::ControllerConfig;
pub use error::{EngineError, GatewayError};
pub use gateway::{ConsumerInfo, GatewayResponse, GatewayResult, SessionGateway, TransportInfo};
pub use metrics::MetricsCollector;
pub use orchestrator::{CompositionController, ControllerDeps, ControllerHandle};
pub use registry::{ProducerRegistry, RegistryError, SharedRegistry};

use crossbeam_channel::Sender;
use relaycast_ipc::ControllerEvent;

/// Create a controller and its handle. The controller runs once
/// [`CompositionController::run`] is spawned.
pub fn create_controller(
    config: ControllerConfig,
    deps: ControllerDeps,
    event_tx: Sender<ControllerEvent>,
) -> (CompositionController, ControllerHandle) {
    CompositionController::new(config, deps, event_tx)
}
