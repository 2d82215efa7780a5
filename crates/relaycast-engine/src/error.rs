//! Error types for the engine crate.

use thiserror::Error;

use relaycast_ipc::ProducerId;
use relaycast_transport::TransportError;

use crate::registry::RegistryError;

/// Controller handle errors.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Composition controller is not running")]
    ControllerStopped,
}

/// Errors returned to signalling clients.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Unknown session: {0}")]
    UnknownSession(String),

    #[error("Unknown transport: {0}")]
    UnknownTransport(String),

    #[error("Unknown consumer: {0}")]
    UnknownConsumer(String),

    #[error("Producer {0} does not belong to this session")]
    NotOwner(ProducerId),

    #[error("Cannot consume producer {0} with the given capabilities")]
    CannotConsume(ProducerId),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}
