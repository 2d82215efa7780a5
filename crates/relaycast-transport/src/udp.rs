//! Plain-RTP media engine.
//!
//! Producers publish RTP over UDP to an ingest socket; consumers forward the
//! packets from a send socket to a connected remote (the transcoder) while
//! resumed. Key frames are requested with an RTCP PLI sent back to the
//! producer's source address.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use relaycast_ipc::{CodecDescriptor, MediaKind, ProducerInfo, RtpCapabilities};

use crate::endpoint::default_capabilities;
use crate::engine::{
    Consumer, ConsumerEvent, MediaEngine, MediaEvent, RemoteAddr, Transport, TransportDirection,
    TransportEvent, TransportState,
};
use crate::error::TransportError;
use crate::TransportResult;

/// Packets buffered per producer before slow consumers start lagging.
const PACKET_CHANNEL_CAPACITY: usize = 512;

/// Largest RTP datagram accepted on ingest.
const MAX_DATAGRAM: usize = 2048;

/// Sender SSRC used for RTCP feedback.
const FEEDBACK_SSRC: u32 = 1;

/// UDP relay engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UdpRelayConfig {
    /// Address sockets bind to.
    pub listen_ip: IpAddr,

    /// Address advertised to clients, defaults to `listen_ip`.
    pub announced_ip: Option<IpAddr>,

    /// Codecs producers may publish.
    pub capabilities: RtpCapabilities,
}

impl Default for UdpRelayConfig {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            announced_ip: None,
            capabilities: default_capabilities(),
        }
    }
}

struct ProducerEntry {
    info: ProducerInfo,
    packets: broadcast::Sender<Bytes>,
    socket: Arc<UdpSocket>,
    source: Mutex<Option<SocketAddr>>,
    feedback: Mutex<Option<SocketAddr>>,
    ssrc: AtomicU32,
    closed: watch::Sender<bool>,
}

impl ProducerEntry {
    fn close(&self) {
        self.closed.send_replace(true);
    }
}

/// UDP transport, either an ingest socket or a forwarding socket.
pub struct UdpTransport {
    id: String,
    direction: TransportDirection,
    socket: Arc<UdpSocket>,
    remote: Mutex<Option<RemoteAddr>>,
    producing: AtomicBool,
    events: broadcast::Sender<TransportEvent>,
    closed: watch::Sender<bool>,
}

impl UdpTransport {
    fn remote(&self) -> Option<RemoteAddr> {
        *self.remote.lock()
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn id(&self) -> &str {
        &self.id
    }

    fn direction(&self) -> TransportDirection {
        self.direction
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }

    async fn connect(&self, remote: RemoteAddr) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        *self.remote.lock() = Some(remote);
        debug!(transport_id = %self.id, remote = %remote.rtp(), "Transport connected");
        let _ = self.events.send(TransportEvent::Connected);
        let _ = self
            .events
            .send(TransportEvent::StateChanged(TransportState::Connected));
        Ok(())
    }

    fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        debug!(transport_id = %self.id, "Transport closed");
        let _ = self
            .events
            .send(TransportEvent::StateChanged(TransportState::Closed));
        let _ = self.events.send(TransportEvent::Closed);
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

/// Consumer forwarding one producer's packets through a send transport.
pub struct UdpConsumer {
    id: String,
    producer: Arc<ProducerEntry>,
    paused: Arc<AtomicBool>,
    events: broadcast::Sender<ConsumerEvent>,
    closed: watch::Sender<bool>,
}

#[async_trait]
impl Consumer for UdpConsumer {
    fn id(&self) -> &str {
        &self.id
    }

    fn producer_id(&self) -> &str {
        &self.producer.info.id
    }

    fn kind(&self) -> MediaKind {
        self.producer.info.kind
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    async fn pause(&self) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn resume(&self) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn request_key_frame(&self) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if self.producer.info.kind != MediaKind::Video {
            return Ok(());
        }

        let target = (*self.producer.feedback.lock()).or(*self.producer.source.lock());
        let Some(target) = target else {
            debug!(producer_id = %self.producer.info.id, "No RTP seen yet, skipping PLI");
            return Ok(());
        };

        let pli = build_pli(FEEDBACK_SSRC, self.producer.ssrc.load(Ordering::Relaxed));
        self.producer.socket.send_to(&pli, target).await?;
        trace!(producer_id = %self.producer.info.id, %target, "PLI sent");
        Ok(())
    }

    fn close(&self) {
        self.closed.send_replace(true);
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn subscribe(&self) -> broadcast::Receiver<ConsumerEvent> {
        self.events.subscribe()
    }
}

impl Drop for UdpConsumer {
    fn drop(&mut self) {
        self.closed.send_replace(true);
    }
}

struct Inner {
    producers: Mutex<HashMap<String, Arc<ProducerEntry>>>,
    transports: Mutex<HashMap<String, Arc<UdpTransport>>>,
    events: broadcast::Sender<MediaEvent>,
}

impl Inner {
    fn close_producer(&self, producer_id: &str) {
        let Some(entry) = self.producers.lock().remove(producer_id) else {
            return;
        };
        entry.close();
        info!(producer_id, "Producer closed");
        let _ = self.events.send(MediaEvent::ProducerClosed {
            producer_id: producer_id.to_string(),
        });
    }

    fn transport(&self, id: &str) -> TransportResult<Arc<UdpTransport>> {
        self.transports
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| TransportError::TransportNotFound(id.to_string()))
    }
}

/// Media engine relaying plain RTP over UDP.
pub struct UdpRelayEngine {
    config: UdpRelayConfig,
    inner: Arc<Inner>,
}

impl UdpRelayEngine {
    pub fn new(config: UdpRelayConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            config,
            inner: Arc::new(Inner {
                producers: Mutex::new(HashMap::new()),
                transports: Mutex::new(HashMap::new()),
                events,
            }),
        }
    }

    /// Address clients should send media to.
    pub fn announced_ip(&self) -> IpAddr {
        self.config.announced_ip.unwrap_or(self.config.listen_ip)
    }

    /// Number of live producers.
    pub fn producer_count(&self) -> usize {
        self.inner.producers.lock().len()
    }
}

#[async_trait]
impl MediaEngine for UdpRelayEngine {
    fn capabilities(&self) -> RtpCapabilities {
        self.config.capabilities.clone()
    }

    async fn create_transport(
        &self,
        direction: TransportDirection,
    ) -> TransportResult<Arc<dyn Transport>> {
        let socket = UdpSocket::bind(SocketAddr::new(self.config.listen_ip, 0))
            .await
            .map_err(|e| TransportError::TransportUnavailable(e.to_string()))?;

        let (events, _) = broadcast::channel(16);
        let (closed, _) = watch::channel(false);
        let transport = Arc::new(UdpTransport {
            id: Uuid::new_v4().to_string(),
            direction,
            socket: Arc::new(socket),
            remote: Mutex::new(None),
            producing: AtomicBool::new(false),
            events,
            closed,
        });

        let mut transports = self.inner.transports.lock();
        transports.retain(|_, t| !t.is_closed());
        transports.insert(transport.id.clone(), transport.clone());
        debug!(transport_id = %transport.id, ?direction, local = ?transport.local_addr(), "Transport created");

        Ok(transport)
    }

    async fn produce(
        &self,
        transport: &Arc<dyn Transport>,
        session_id: &str,
        kind: MediaKind,
        codec: CodecDescriptor,
    ) -> TransportResult<ProducerInfo> {
        let transport = self.inner.transport(transport.id())?;
        if transport.direction != TransportDirection::Receive {
            return Err(TransportError::InvalidArgument(
                "produce requires a receive transport".to_string(),
            ));
        }
        if transport.is_closed() {
            return Err(TransportError::Closed);
        }
        if codec.kind() != Some(kind) {
            return Err(TransportError::InvalidArgument(format!(
                "codec {} does not carry {}",
                codec.mime_type,
                kind.as_str()
            )));
        }
        if !self.config.capabilities.supports(&codec) {
            return Err(TransportError::InvalidArgument(format!(
                "unsupported codec {}",
                codec.mime_type
            )));
        }
        if transport.producing.swap(true, Ordering::SeqCst) {
            return Err(TransportError::InvalidArgument(
                "transport already carries a producer".to_string(),
            ));
        }

        let info = ProducerInfo {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            kind,
            codec,
        };

        let (packets, _) = broadcast::channel(PACKET_CHANNEL_CAPACITY);
        let (closed, _) = watch::channel(false);
        let entry = Arc::new(ProducerEntry {
            info: info.clone(),
            packets,
            socket: transport.socket.clone(),
            source: Mutex::new(None),
            feedback: Mutex::new(transport.remote().map(|r| r.rtcp())),
            ssrc: AtomicU32::new(0),
            closed,
        });

        self.inner
            .producers
            .lock()
            .insert(info.id.clone(), entry.clone());

        tokio::spawn(run_ingest(Arc::clone(&self.inner), entry, transport));

        info!(producer_id = %info.id, session_id, kind = kind.as_str(), "Producer created");
        Ok(info)
    }

    fn can_consume(&self, producer_id: &str, capabilities: &RtpCapabilities) -> bool {
        self.inner
            .producers
            .lock()
            .get(producer_id)
            .map(|entry| capabilities.supports(&entry.info.codec))
            .unwrap_or(false)
    }

    async fn consume(
        &self,
        transport: &Arc<dyn Transport>,
        producer_id: &str,
        capabilities: &RtpCapabilities,
        paused: bool,
    ) -> TransportResult<Box<dyn Consumer>> {
        let transport = self.inner.transport(transport.id())?;
        if transport.direction != TransportDirection::Send {
            return Err(TransportError::InvalidArgument(
                "consume requires a send transport".to_string(),
            ));
        }
        if transport.is_closed() {
            return Err(TransportError::Closed);
        }

        let producer = self
            .inner
            .producers
            .lock()
            .get(producer_id)
            .cloned()
            .ok_or_else(|| TransportError::ProducerNotFound(producer_id.to_string()))?;

        if !capabilities.supports(&producer.info.codec) {
            return Err(TransportError::CapabilityMismatch {
                producer_id: producer_id.to_string(),
                mime_type: producer.info.codec.mime_type.clone(),
            });
        }

        let (events, _) = broadcast::channel(8);
        let (closed, _) = watch::channel(false);
        let consumer = UdpConsumer {
            id: Uuid::new_v4().to_string(),
            producer: producer.clone(),
            paused: Arc::new(AtomicBool::new(paused)),
            events,
            closed,
        };

        tokio::spawn(run_forward(
            producer,
            transport,
            consumer.paused.clone(),
            consumer.events.clone(),
            consumer.closed.subscribe(),
        ));

        debug!(consumer_id = %consumer.id, producer_id, paused, "Consumer created");
        Ok(Box::new(consumer))
    }

    async fn close_producer(&self, producer_id: &str) {
        self.inner.close_producer(producer_id);
    }

    fn subscribe(&self) -> broadcast::Receiver<MediaEvent> {
        self.inner.events.subscribe()
    }
}

/// Reads RTP from a producer's ingest socket and fans it out.
async fn run_ingest(inner: Arc<Inner>, entry: Arc<ProducerEntry>, transport: Arc<UdpTransport>) {
    let mut producer_closed = entry.closed.subscribe();
    let mut transport_closed = transport.closed.subscribe();
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        if *producer_closed.borrow() || *transport_closed.borrow() {
            break;
        }

        tokio::select! {
            received = transport.socket.recv_from(&mut buf) => match received {
                Ok((len, from)) => {
                    if len < 12 || is_rtcp(&buf[..len]) {
                        continue;
                    }
                    *entry.source.lock() = Some(from);
                    entry.ssrc.store(
                        u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
                        Ordering::Relaxed,
                    );
                    let _ = entry.packets.send(Bytes::copy_from_slice(&buf[..len]));
                }
                Err(e) => {
                    warn!(producer_id = %entry.info.id, "Ingest receive failed: {}", e);
                    break;
                }
            },
            changed = producer_closed.changed() => if changed.is_err() { break },
            changed = transport_closed.changed() => if changed.is_err() { break },
        }
    }

    inner.close_producer(&entry.info.id);
    transport.close();
}

/// Forwards one producer's packets to the send transport's remote.
async fn run_forward(
    producer: Arc<ProducerEntry>,
    transport: Arc<UdpTransport>,
    paused: Arc<AtomicBool>,
    events: broadcast::Sender<ConsumerEvent>,
    mut consumer_closed: watch::Receiver<bool>,
) {
    let mut packets = producer.packets.subscribe();
    let mut producer_closed = producer.closed.subscribe();
    let mut transport_closed = transport.closed.subscribe();

    loop {
        if *consumer_closed.borrow() {
            break;
        }
        if *producer_closed.borrow() {
            let _ = events.send(ConsumerEvent::ProducerClosed);
            break;
        }
        if *transport_closed.borrow() {
            let _ = events.send(ConsumerEvent::TransportClosed);
            break;
        }

        tokio::select! {
            packet = packets.recv() => match packet {
                Ok(packet) => {
                    if paused.load(Ordering::SeqCst) {
                        continue;
                    }
                    let Some(remote) = transport.remote() else {
                        continue;
                    };
                    if let Err(e) = transport.socket.send_to(&packet, remote.rtp()).await {
                        trace!("Forward failed: {}", e);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(producer_id = %producer.info.id, skipped, "Consumer lagging");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    let _ = events.send(ConsumerEvent::ProducerClosed);
                    break;
                }
            },
            changed = producer_closed.changed() => if changed.is_err() { break },
            changed = transport_closed.changed() => if changed.is_err() { break },
            // Consumer dropped without close.
            changed = consumer_closed.changed() => if changed.is_err() { break },
        }
    }
}

/// RTCP packet types occupy 200..=206 in the second byte.
fn is_rtcp(packet: &[u8]) -> bool {
    packet.len() >= 2 && (200..=206).contains(&packet[1])
}

/// Build an RTCP Picture Loss Indication (RFC 4585).
pub fn build_pli(sender_ssrc: u32, media_ssrc: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(12);
    buf.put_u8(0x81); // V=2, P=0, FMT=1
    buf.put_u8(206); // PSFB
    buf.put_u16(2); // length in 32-bit words minus one
    buf.put_u32(sender_ssrc);
    buf.put_u32(media_ssrc);
    buf.freeze()
}
