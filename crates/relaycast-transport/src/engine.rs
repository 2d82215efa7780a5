//! Media engine interface consumed by the relay.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use relaycast_ipc::{CodecDescriptor, MediaKind, ProducerId, ProducerInfo, RtpCapabilities};

use crate::TransportResult;

/// Direction of a transport relative to the media engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    /// Media flows from the engine to the remote.
    Send,

    /// Media flows from the remote into the engine.
    Receive,
}

/// Remote address a transport sends RTP/RTCP to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteAddr {
    pub ip: IpAddr,
    pub port: u16,
    /// RTCP port; `None` when RTCP is multiplexed on `port`.
    #[serde(default)]
    pub rtcp_port: Option<u16>,
}

impl RemoteAddr {
    pub fn rtp(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    pub fn rtcp(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.rtcp_port.unwrap_or(self.port))
    }
}

/// Connection state of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    New,
    Connected,
    Closed,
}

/// Lifecycle events of a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    StateChanged(TransportState),
    Closed,
}

/// Lifecycle events of a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerEvent {
    ProducerClosed,
    TransportClosed,
}

/// Engine-wide producer events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEvent {
    ProducerClosed { producer_id: ProducerId },
}

/// A bidirectional media transport created by the engine.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Unique transport id.
    fn id(&self) -> &str;

    fn direction(&self) -> TransportDirection;

    /// Local address media arrives on or leaves from.
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Point the transport at its remote.
    async fn connect(&self, remote: RemoteAddr) -> TransportResult<()>;

    /// Close the transport. Safe to call more than once.
    fn close(&self);

    fn is_closed(&self) -> bool;

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;
}

/// A local handle reading one producer's media.
#[async_trait]
pub trait Consumer: Send + Sync {
    fn id(&self) -> &str;

    fn producer_id(&self) -> &str;

    fn kind(&self) -> MediaKind;

    fn is_paused(&self) -> bool;

    async fn pause(&self) -> TransportResult<()>;

    async fn resume(&self) -> TransportResult<()>;

    /// Ask the producer for a key frame.
    async fn request_key_frame(&self) -> TransportResult<()>;

    /// Close the consumer. Safe to call more than once.
    fn close(&self);

    fn is_closed(&self) -> bool;

    fn subscribe(&self) -> broadcast::Receiver<ConsumerEvent>;
}

/// The media engine the relay and the gateway drive.
#[async_trait]
pub trait MediaEngine: Send + Sync + 'static {
    /// Codec capabilities of the engine.
    fn capabilities(&self) -> RtpCapabilities;

    async fn create_transport(
        &self,
        direction: TransportDirection,
    ) -> TransportResult<Arc<dyn Transport>>;

    /// Accept an inbound track on a receive transport.
    async fn produce(
        &self,
        transport: &Arc<dyn Transport>,
        session_id: &str,
        kind: MediaKind,
        codec: CodecDescriptor,
    ) -> TransportResult<ProducerInfo>;

    /// Whether `consume` would succeed for the given capabilities.
    fn can_consume(&self, producer_id: &str, capabilities: &RtpCapabilities) -> bool;

    async fn consume(
        &self,
        transport: &Arc<dyn Transport>,
        producer_id: &str,
        capabilities: &RtpCapabilities,
        paused: bool,
    ) -> TransportResult<Box<dyn Consumer>>;

    /// Close a producer and notify its consumers.
    async fn close_producer(&self, producer_id: &str);

    fn subscribe(&self) -> broadcast::Receiver<MediaEvent>;
}
