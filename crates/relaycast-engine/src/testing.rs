//! In-memory media engine and controller harness for tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use relaycast_ipc::{
    CodecDescriptor, CompositionStatus, ControllerCommand, ControllerEvent, MediaKind, OutputTarget,
    ProducerId, ProducerInfo, RtpCapabilities,
};
use relaycast_transcoder::testing::MockSpawner;
use relaycast_transport::{
    default_capabilities, Consumer, ConsumerEvent, MediaEngine, MediaEvent, RelayConfig,
    RemoteAddr, Transport, TransportDirection, TransportError, TransportEvent, TransportResult,
};

use crate::config::ControllerConfig;
use crate::orchestrator::{CompositionController, ControllerDeps, ControllerHandle};
use crate::registry::{ProducerRegistry, SharedRegistry};

pub(crate) fn codec(mime: &str) -> CodecDescriptor {
    let audio = mime.starts_with("audio/");
    CodecDescriptor {
        mime_type: mime.to_string(),
        clock_rate: if audio { 48000 } else { 90000 },
        channels: audio.then_some(2),
        payload_type: if audio { 111 } else { 96 },
        parameters: BTreeMap::new(),
    }
}

/// Failures injected into endpoint operations. Each counter fails that
/// many upcoming calls.
#[derive(Default)]
struct Faults {
    connect: AtomicUsize,
    resume: AtomicUsize,
    key_frame: AtomicUsize,
    stall_resume: AtomicBool,
}

impl Faults {
    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

fn injected(operation: &str) -> TransportError {
    TransportError::TransportUnavailable(format!("injected {operation} failure"))
}

struct MockTransport {
    id: String,
    faults: Arc<Faults>,
    direction: TransportDirection,
    remote: Mutex<Option<RemoteAddr>>,
    closed: AtomicBool,
    events: broadcast::Sender<TransportEvent>,
}

#[async_trait]
impl Transport for MockTransport {
    fn id(&self) -> &str {
        &self.id
    }

    fn direction(&self) -> TransportDirection {
        self.direction
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0))
    }

    async fn connect(&self, remote: RemoteAddr) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if Faults::take(&self.faults.connect) {
            return Err(injected("connect"));
        }
        *self.remote.lock() = Some(remote);
        let _ = self.events.send(TransportEvent::Connected);
        Ok(())
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.events.send(TransportEvent::Closed);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

struct ConsumerState {
    id: String,
    producer_id: ProducerId,
    kind: MediaKind,
    paused: AtomicBool,
    closed: AtomicBool,
    key_frames: AtomicUsize,
    events: broadcast::Sender<ConsumerEvent>,
}

struct MockConsumer {
    state: Arc<ConsumerState>,
    faults: Arc<Faults>,
}

#[async_trait]
impl Consumer for MockConsumer {
    fn id(&self) -> &str {
        &self.state.id
    }

    fn producer_id(&self) -> &str {
        &self.state.producer_id
    }

    fn kind(&self) -> MediaKind {
        self.state.kind
    }

    fn is_paused(&self) -> bool {
        self.state.paused.load(Ordering::SeqCst)
    }

    async fn pause(&self) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.state.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn resume(&self) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if self.faults.stall_resume.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if Faults::take(&self.faults.resume) {
            return Err(injected("resume"));
        }
        self.state.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn request_key_frame(&self) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if Faults::take(&self.faults.key_frame) {
            return Err(injected("key frame"));
        }
        self.state.key_frames.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        self.state.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> broadcast::Receiver<ConsumerEvent> {
        self.state.events.subscribe()
    }
}

/// Media engine keeping everything in memory.
pub(crate) struct MockMediaEngine {
    producers: Mutex<HashMap<ProducerId, ProducerInfo>>,
    consumers: Mutex<Vec<Arc<ConsumerState>>>,
    rejected: Mutex<HashSet<String>>,
    transport_failures: AtomicUsize,
    faults: Arc<Faults>,
    transports_created: AtomicUsize,
    next_id: AtomicU64,
    events: broadcast::Sender<MediaEvent>,
}

impl MockMediaEngine {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            producers: Mutex::new(HashMap::new()),
            consumers: Mutex::new(Vec::new()),
            rejected: Mutex::new(HashSet::new()),
            transport_failures: AtomicUsize::new(0),
            faults: Arc::new(Faults::default()),
            transports_created: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            events,
        }
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{prefix}{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Create a producer without going through a transport.
    pub fn add_producer(&self, kind: MediaKind, mime: &str) -> ProducerInfo {
        let info = ProducerInfo {
            id: self.next_id("producer-"),
            session_id: "session-1".to_string(),
            kind,
            codec: codec(mime),
        };
        self.producers.lock().insert(info.id.clone(), info.clone());
        info
    }

    /// Make the relay refuse a mime type.
    pub fn reject_mime(&self, mime: &str) {
        self.rejected.lock().insert(mime.to_ascii_lowercase());
    }

    /// Fail the next `count` transport creations.
    pub fn fail_transports(&self, count: usize) {
        self.transport_failures.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` transport connects.
    pub fn fail_connects(&self, count: usize) {
        self.faults.connect.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` consumer resumes.
    pub fn fail_resumes(&self, count: usize) {
        self.faults.resume.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` key frame requests.
    pub fn fail_key_frames(&self, count: usize) {
        self.faults.key_frame.store(count, Ordering::SeqCst);
    }

    /// Make every resume hang until the caller gives up.
    pub fn stall_resumes(&self, stall: bool) {
        self.faults.stall_resume.store(stall, Ordering::SeqCst);
    }

    pub fn transports_created(&self) -> usize {
        self.transports_created.load(Ordering::SeqCst)
    }

    /// Consumers not closed yet.
    pub fn open_consumers(&self) -> usize {
        self.consumers
            .lock()
            .iter()
            .filter(|c| !c.closed.load(Ordering::SeqCst))
            .count()
    }

    /// Open consumers currently forwarding media.
    pub fn resumed_consumers(&self) -> usize {
        self.consumers
            .lock()
            .iter()
            .filter(|c| !c.closed.load(Ordering::SeqCst) && !c.paused.load(Ordering::SeqCst))
            .count()
    }

    /// Key frames requested across all consumers of a producer.
    pub fn key_frames(&self, producer_id: &str) -> usize {
        self.consumers
            .lock()
            .iter()
            .filter(|c| c.producer_id == producer_id)
            .map(|c| c.key_frames.load(Ordering::SeqCst))
            .sum()
    }

    fn close(&self, producer_id: &str) {
        if self.producers.lock().remove(producer_id).is_none() {
            return;
        }
        for consumer in self.consumers.lock().iter() {
            if consumer.producer_id == producer_id && !consumer.closed.swap(true, Ordering::SeqCst) {
                let _ = consumer.events.send(ConsumerEvent::ProducerClosed);
            }
        }
        let _ = self.events.send(MediaEvent::ProducerClosed {
            producer_id: producer_id.to_string(),
        });
    }
}

#[async_trait]
impl MediaEngine for MockMediaEngine {
    fn capabilities(&self) -> RtpCapabilities {
        default_capabilities()
    }

    async fn create_transport(
        &self,
        direction: TransportDirection,
    ) -> TransportResult<Arc<dyn Transport>> {
        let failing = self
            .transport_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TransportError::TransportUnavailable("mock engine refused".to_string()));
        }

        self.transports_created.fetch_add(1, Ordering::SeqCst);
        let (events, _) = broadcast::channel(8);
        Ok(Arc::new(MockTransport {
            id: self.next_id("transport-"),
            faults: self.faults.clone(),
            direction,
            remote: Mutex::new(None),
            closed: AtomicBool::new(false),
            events,
        }))
    }

    async fn produce(
        &self,
        transport: &Arc<dyn Transport>,
        session_id: &str,
        kind: MediaKind,
        codec: CodecDescriptor,
    ) -> TransportResult<ProducerInfo> {
        if transport.is_closed() {
            return Err(TransportError::Closed);
        }
        let info = ProducerInfo {
            id: self.next_id("producer-"),
            session_id: session_id.to_string(),
            kind,
            codec,
        };
        self.producers.lock().insert(info.id.clone(), info.clone());
        Ok(info)
    }

    fn can_consume(&self, producer_id: &str, capabilities: &RtpCapabilities) -> bool {
        let rejected = self.rejected.lock();
        self.producers.lock().get(producer_id).is_some_and(|p| {
            capabilities.supports(&p.codec) && !rejected.contains(&p.codec.mime_type.to_ascii_lowercase())
        })
    }

    async fn consume(
        &self,
        transport: &Arc<dyn Transport>,
        producer_id: &str,
        capabilities: &RtpCapabilities,
        paused: bool,
    ) -> TransportResult<Box<dyn Consumer>> {
        if transport.is_closed() {
            return Err(TransportError::Closed);
        }
        let producer = self
            .producers
            .lock()
            .get(producer_id)
            .cloned()
            .ok_or_else(|| TransportError::ProducerNotFound(producer_id.to_string()))?;
        if !self.can_consume(producer_id, capabilities) {
            return Err(TransportError::CapabilityMismatch {
                producer_id: producer_id.to_string(),
                mime_type: producer.codec.mime_type,
            });
        }

        let (events, _) = broadcast::channel(8);
        let state = Arc::new(ConsumerState {
            id: self.next_id("consumer-"),
            producer_id: producer_id.to_string(),
            kind: producer.kind,
            paused: AtomicBool::new(paused),
            closed: AtomicBool::new(false),
            key_frames: AtomicUsize::new(0),
            events,
        });
        self.consumers.lock().push(state.clone());
        Ok(Box::new(MockConsumer {
            state,
            faults: self.faults.clone(),
        }))
    }

    async fn close_producer(&self, producer_id: &str) {
        self.close(producer_id);
    }

    fn subscribe(&self) -> broadcast::Receiver<MediaEvent> {
        self.events.subscribe()
    }
}

/// Short timings so controller tests finish quickly.
pub(crate) fn test_config(root: &std::path::Path) -> ControllerConfig {
    let mut config = ControllerConfig {
        output: OutputTarget::new(root.join("hls")),
        confirm_delay_ms: 10,
        step_timeout_ms: 500,
        stable_live_ms: 60_000,
        metrics_interval_ms: 50,
        ..Default::default()
    };
    config.retry.base_delay_ms = 20;
    config.retry.max_delay_ms = 100;
    config.transcoder.work_dir = root.join("work");
    config.transcoder.start_timeout_ms = 300;
    config.transcoder.stop_grace_ms = 100;
    config.transcoder.kill_timeout_ms = 100;
    config
}

/// A running controller wired to the mocks.
pub(crate) struct Harness {
    pub engine: Arc<MockMediaEngine>,
    pub spawner: MockSpawner,
    pub registry: SharedRegistry,
    pub handle: ControllerHandle,
    pub events: crossbeam_channel::Receiver<ControllerEvent>,
    pub config: ControllerConfig,
    pub task: Option<JoinHandle<()>>,
    _dir: TempDir,
}

impl Harness {
    pub fn start(spawner: MockSpawner) -> Self {
        Self::start_with(spawner, |_| {})
    }

    pub fn start_with(spawner: MockSpawner, configure: impl FnOnce(&mut ControllerConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        configure(&mut config);

        let engine = Arc::new(MockMediaEngine::new());
        let registry = ProducerRegistry::shared();
        // Large enough that tests never drop events.
        let (event_tx, events) = crossbeam_channel::bounded(4096);
        let mut relay = RelayConfig::default();
        relay.retry.base_delay_ms = 10;

        let (controller, handle) = CompositionController::new(
            config.clone(),
            ControllerDeps {
                engine: engine.clone(),
                relay,
                spawner: Arc::new(spawner.clone()),
                registry: registry.clone(),
            },
            event_tx,
        );
        let task = tokio::spawn(controller.run());

        Self {
            engine,
            spawner,
            registry,
            handle,
            events,
            config,
            task: Some(task),
            _dir: dir,
        }
    }

    pub fn output(&self) -> &OutputTarget {
        &self.config.output
    }

    /// Register a producer and notify the controller.
    pub async fn add(&self, kind: MediaKind, mime: &str) -> ProducerId {
        let producer = self.engine.add_producer(kind, mime);
        let id = producer.id.clone();
        self.registry.write().register(producer).unwrap();
        self.handle.send(ControllerCommand::ProducersChanged).await.unwrap();
        id
    }

    /// Unregister and close a producer and notify the controller.
    pub async fn remove(&self, id: &str) {
        self.registry.write().unregister(id).unwrap();
        self.engine.close_producer(id).await;
        self.handle.send(ControllerCommand::ProducersChanged).await.unwrap();
    }

    pub async fn send(&self, command: ControllerCommand) {
        self.handle.send(command).await.unwrap();
    }

    /// Poll the status until `pred` holds.
    pub async fn wait_for(&self, what: &str, pred: impl Fn(&CompositionStatus) -> bool) -> CompositionStatus {
        self.wait_until(what, || pred(&self.handle.status())).await;
        self.handle.status()
    }

    /// Poll until `pred` holds, panicking after a few seconds.
    pub async fn wait_until(&self, what: &str, pred: impl Fn() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !pred() {
            if tokio::time::Instant::now() > deadline {
                panic!("timed out waiting for {what}; status {:?}", self.handle.status());
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Wait until no cycle runs and the status is stable for a while.
    pub async fn settle(&self) -> CompositionStatus {
        let mut last = self.handle.status();
        let mut stable = 0;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while stable < 10 {
            if tokio::time::Instant::now() > deadline {
                panic!("controller did not settle; status {last:?}");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            let current = self.handle.status();
            if current == last && !current.is_starting() {
                stable += 1;
            } else {
                stable = 0;
                last = current;
            }
        }
        last
    }

    /// Every event received so far.
    pub fn drain_events(&self) -> Vec<ControllerEvent> {
        self.events.try_iter().collect()
    }

    /// Send `Shutdown` and wait for the loop to exit.
    pub async fn shutdown(&mut self) {
        self.send(ControllerCommand::Shutdown).await;
        if let Some(task) = self.task.take() {
            tokio::time::timeout(Duration::from_secs(5), task)
                .await
                .unwrap()
                .unwrap();
        }
    }
}
