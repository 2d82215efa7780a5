//! Relay endpoints bridging one producer to one transcoder input.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

use relaycast_ipc::{CodecCapability, ProducerId, ProducerInfo, RtpCapabilities};

use crate::engine::{Consumer, ConsumerEvent, MediaEngine, RemoteAddr, Transport, TransportDirection};
use crate::error::TransportError;
use crate::ports::{PortAllocator, PortPair, PortRange};
use crate::retry::RetryPolicy;
use crate::TransportResult;

/// Relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Ports handed to the transcoder.
    pub ports: PortRange,

    /// Retry policy for transport allocation.
    pub retry: RetryPolicy,

    /// Address the transcoder listens on.
    pub transcoder_ip: IpAddr,

    /// Codecs the transcoder accepts as input.
    pub capabilities: RtpCapabilities,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            ports: PortRange::default(),
            retry: RetryPolicy::default(),
            transcoder_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            capabilities: default_capabilities(),
        }
    }
}

/// Codecs ffmpeg can read from an SDP input.
pub fn default_capabilities() -> RtpCapabilities {
    let codec = |mime: &str, clock_rate: u32, channels: Option<u16>| CodecCapability {
        mime_type: mime.to_string(),
        clock_rate,
        channels,
    };

    RtpCapabilities {
        codecs: vec![
            codec("audio/opus", 48000, Some(2)),
            codec("video/VP8", 90000, None),
            codec("video/VP9", 90000, None),
            codec("video/H264", 90000, None),
        ],
    }
}

/// A port-bound bridge between one producer and the transcoder.
pub struct RelayEndpoint {
    producer: ProducerInfo,
    ports: PortPair,
    consumer: Box<dyn Consumer>,
    transport: Arc<dyn Transport>,
    released: AtomicBool,
}

impl RelayEndpoint {
    pub fn producer(&self) -> &ProducerInfo {
        &self.producer
    }

    pub fn producer_id(&self) -> &ProducerId {
        &self.producer.id
    }

    pub fn ports(&self) -> PortPair {
        self.ports
    }

    pub fn consumer(&self) -> &dyn Consumer {
        self.consumer.as_ref()
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// False once released or once the producer or transport went away.
    pub fn is_alive(&self) -> bool {
        !self.released.load(Ordering::SeqCst)
            && !self.consumer.is_closed()
            && !self.transport.is_closed()
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Point the bridging transport at the transcoder's port pair.
    pub async fn connect(&self, ip: IpAddr) -> TransportResult<()> {
        self.transport
            .connect(RemoteAddr {
                ip,
                port: self.ports.media,
                rtcp_port: Some(self.ports.control),
            })
            .await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConsumerEvent> {
        self.consumer.subscribe()
    }
}

impl Drop for RelayEndpoint {
    // Ports go back with the manager; the engine side is closed here so an
    // abandoned endpoint never keeps forwarding.
    fn drop(&mut self) {
        if !self.released.load(Ordering::SeqCst) {
            self.consumer.close();
            self.transport.close();
        }
    }
}

impl std::fmt::Debug for RelayEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayEndpoint")
            .field("producer_id", &self.producer.id)
            .field("ports", &self.ports)
            .field("paused", &self.consumer.is_paused())
            .field("released", &self.is_released())
            .finish()
    }
}

/// Allocates and releases relay endpoints.
pub struct EndpointManager {
    engine: Arc<dyn MediaEngine>,
    capabilities: RtpCapabilities,
    ports: PortAllocator,
    retry: RetryPolicy,
    transcoder_ip: IpAddr,
}

impl EndpointManager {
    pub fn new(engine: Arc<dyn MediaEngine>, config: &RelayConfig) -> Self {
        Self {
            engine,
            capabilities: config.capabilities.clone(),
            ports: PortAllocator::new(&config.ports),
            retry: config.retry.clone(),
            transcoder_ip: config.transcoder_ip,
        }
    }

    /// Address endpoints connect to.
    pub fn transcoder_ip(&self) -> IpAddr {
        self.transcoder_ip
    }

    /// Whether the relay can consume the producer's codec.
    pub fn can_consume(&self, producer: &ProducerInfo) -> bool {
        self.engine.can_consume(&producer.id, &self.capabilities)
    }

    /// Allocate a paused endpoint for a producer.
    ///
    /// Capability is checked up front; transport failures are retried per
    /// the retry policy before surfacing as `TransportUnavailable`.
    #[instrument(name = "allocate_endpoint", skip(self, producer), fields(producer_id = %producer.id))]
    pub async fn allocate(&mut self, producer: &ProducerInfo) -> TransportResult<RelayEndpoint> {
        if !self.can_consume(producer) {
            return Err(TransportError::CapabilityMismatch {
                producer_id: producer.id.clone(),
                mime_type: producer.codec.mime_type.clone(),
            });
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_allocate(producer).await {
                Ok(endpoint) => {
                    info!(ports = ?endpoint.ports, "Relay endpoint allocated");
                    return Ok(endpoint);
                }
                Err(e) if e.is_unavailable() && self.retry.should_retry(attempt) => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(attempt, ?delay, "Endpoint allocation failed, retrying: {}", e);
                    tokio::time::sleep(delay).await;
                }
                Err(TransportError::PortExhausted(slots)) => {
                    return Err(TransportError::TransportUnavailable(format!(
                        "no free port pair after {slots} slots"
                    )));
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_allocate(&mut self, producer: &ProducerInfo) -> TransportResult<RelayEndpoint> {
        let ports = self.ports.allocate()?;

        let transport = match self.engine.create_transport(TransportDirection::Send).await {
            Ok(transport) => transport,
            Err(e) => {
                self.ports.release(ports);
                return Err(match e {
                    TransportError::TransportUnavailable(_) => e,
                    other => TransportError::TransportUnavailable(other.to_string()),
                });
            }
        };

        let consumer = match self
            .engine
            .consume(&transport, &producer.id, &self.capabilities, true)
            .await
        {
            Ok(consumer) => consumer,
            Err(e) => {
                transport.close();
                self.ports.release(ports);
                return Err(e);
            }
        };

        Ok(RelayEndpoint {
            producer: producer.clone(),
            ports,
            consumer,
            transport,
            released: AtomicBool::new(false),
        })
    }

    /// Close the endpoint and free its ports. Safe to call repeatedly.
    pub fn release(&mut self, endpoint: &RelayEndpoint) {
        if endpoint.released.swap(true, Ordering::SeqCst) {
            debug!(producer_id = %endpoint.producer.id, "Endpoint already released");
            return;
        }

        endpoint.consumer.close();
        endpoint.transport.close();
        self.ports.release(endpoint.ports);
        debug!(producer_id = %endpoint.producer.id, ports = ?endpoint.ports, "Relay endpoint released");
    }

    /// Number of port pairs held by live endpoints.
    pub fn ports_in_use(&self) -> usize {
        self.ports.in_use()
    }
}
