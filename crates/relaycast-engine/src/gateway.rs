//! Session gateway.
//!
//! Maps signalling requests onto the media engine and keeps the producer
//! registry in sync with it. Every registry mutation is followed by a
//! `ProducersChanged` notification to the controller.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use relaycast_ipc::{
    CodecDescriptor, ControllerCommand, MediaKind, ProducerId, ProducerInfo, RtpCapabilities,
    SessionId,
};
use relaycast_transport::{Consumer, MediaEngine, MediaEvent, RemoteAddr, Transport, TransportDirection};

use crate::error::GatewayError;
use crate::registry::{RegistryError, SharedRegistry};

/// Result type for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Reply shape for signalling clients: the payload, or `{ "error": "..." }`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GatewayResponse<T> {
    Error { error: String },
    Ok(T),
}

impl<T> From<GatewayResult<T>> for GatewayResponse<T> {
    fn from(result: GatewayResult<T>) -> Self {
        match result {
            Ok(value) => Self::Ok(value),
            Err(e) => Self::Error {
                error: e.to_string(),
            },
        }
    }
}

/// Transport details returned to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportInfo {
    pub id: String,
    pub direction: TransportDirection,
    pub local_addr: Option<SocketAddr>,
}

/// Consumer details returned to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerInfo {
    pub id: String,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub paused: bool,
}

#[derive(Default)]
struct Session {
    transports: HashMap<String, Arc<dyn Transport>>,
    producers: HashSet<ProducerId>,
    consumers: HashMap<String, Arc<dyn Consumer>>,
}

/// Signalling front of the relay.
pub struct SessionGateway {
    engine: Arc<dyn MediaEngine>,
    registry: SharedRegistry,
    controller: mpsc::Sender<ControllerCommand>,
    sessions: Mutex<HashMap<SessionId, Session>>,
}

impl SessionGateway {
    pub fn new(
        engine: Arc<dyn MediaEngine>,
        registry: SharedRegistry,
        controller: mpsc::Sender<ControllerCommand>,
    ) -> Self {
        Self {
            engine,
            registry,
            controller,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn open_session(&self) -> SessionId {
        let id = Uuid::new_v4().to_string();
        self.sessions.lock().insert(id.clone(), Session::default());
        debug!(session_id = %id, "Session opened");
        id
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Codecs the engine accepts from producers.
    pub fn capabilities(&self) -> RtpCapabilities {
        self.engine.capabilities()
    }

    pub async fn create_transport(
        &self,
        session_id: &str,
        direction: TransportDirection,
    ) -> GatewayResult<TransportInfo> {
        self.ensure_session(session_id)?;
        let transport = self.engine.create_transport(direction).await?;
        let info = TransportInfo {
            id: transport.id().to_string(),
            direction,
            local_addr: transport.local_addr(),
        };

        let mut sessions = self.sessions.lock();
        let Some(session) = sessions.get_mut(session_id) else {
            // Session closed while the transport was being created.
            transport.close();
            return Err(GatewayError::UnknownSession(session_id.to_string()));
        };
        session.transports.insert(info.id.clone(), transport);
        Ok(info)
    }

    pub async fn connect_transport(
        &self,
        session_id: &str,
        transport_id: &str,
        remote: RemoteAddr,
    ) -> GatewayResult<()> {
        let transport = self.transport(session_id, transport_id)?;
        transport.connect(remote).await?;
        Ok(())
    }

    /// Accept an inbound track and register it for composition.
    #[instrument(name = "gateway_produce", skip(self, codec), fields(mime = %codec.mime_type))]
    pub async fn produce(
        &self,
        session_id: &str,
        transport_id: &str,
        kind: MediaKind,
        codec: CodecDescriptor,
    ) -> GatewayResult<ProducerInfo> {
        let transport = self.transport(session_id, transport_id)?;
        let producer = self
            .engine
            .produce(&transport, session_id, kind, codec)
            .await?;

        let registered = self.registry.write().register(producer.clone());
        if let Err(e) = registered {
            self.engine.close_producer(&producer.id).await;
            return Err(e.into());
        }

        let owned = match self.sessions.lock().get_mut(session_id) {
            Some(session) => session.producers.insert(producer.id.clone()),
            None => false,
        };
        if !owned {
            let _ = self.registry.write().unregister(&producer.id);
            self.engine.close_producer(&producer.id).await;
            return Err(GatewayError::UnknownSession(session_id.to_string()));
        }

        info!(producer_id = %producer.id, kind = kind.as_str(), "Producer registered");
        self.notify().await;
        Ok(producer)
    }

    /// Create a paused consumer for a viewer.
    pub async fn consume(
        &self,
        session_id: &str,
        transport_id: &str,
        producer_id: &str,
        capabilities: &RtpCapabilities,
    ) -> GatewayResult<ConsumerInfo> {
        let transport = self.transport(session_id, transport_id)?;
        if !self.engine.can_consume(producer_id, capabilities) {
            return Err(GatewayError::CannotConsume(producer_id.to_string()));
        }

        let consumer: Arc<dyn Consumer> = Arc::from(
            self.engine
                .consume(&transport, producer_id, capabilities, true)
                .await?,
        );
        let info = ConsumerInfo {
            id: consumer.id().to_string(),
            producer_id: producer_id.to_string(),
            kind: consumer.kind(),
            paused: consumer.is_paused(),
        };

        let mut sessions = self.sessions.lock();
        let Some(session) = sessions.get_mut(session_id) else {
            consumer.close();
            return Err(GatewayError::UnknownSession(session_id.to_string()));
        };
        session.consumers.insert(info.id.clone(), consumer);
        Ok(info)
    }

    pub async fn resume_consumer(&self, session_id: &str, consumer_id: &str) -> GatewayResult<()> {
        let consumer = {
            let sessions = self.sessions.lock();
            let session = sessions
                .get(session_id)
                .ok_or_else(|| GatewayError::UnknownSession(session_id.to_string()))?;
            session
                .consumers
                .get(consumer_id)
                .cloned()
                .ok_or_else(|| GatewayError::UnknownConsumer(consumer_id.to_string()))?
        };
        consumer.resume().await?;
        Ok(())
    }

    /// Close a producer owned by the session.
    pub async fn close_producer(&self, session_id: &str, producer_id: &str) -> GatewayResult<()> {
        {
            let mut sessions = self.sessions.lock();
            let session = sessions
                .get_mut(session_id)
                .ok_or_else(|| GatewayError::UnknownSession(session_id.to_string()))?;
            if !session.producers.remove(producer_id) {
                return Err(GatewayError::NotOwner(producer_id.to_string()));
            }
        }

        let removed = self.unregister(producer_id);
        self.engine.close_producer(producer_id).await;
        if removed {
            self.notify().await;
        }
        Ok(())
    }

    /// Tear down everything a session created.
    #[instrument(name = "gateway_close_session", skip(self))]
    pub async fn close_session(&self, session_id: &str) -> GatewayResult<()> {
        let session = self
            .sessions
            .lock()
            .remove(session_id)
            .ok_or_else(|| GatewayError::UnknownSession(session_id.to_string()))?;

        for consumer in session.consumers.values() {
            consumer.close();
        }

        let mut removed = false;
        for producer_id in &session.producers {
            removed |= self.unregister(producer_id);
            self.engine.close_producer(producer_id).await;
        }

        for transport in session.transports.values() {
            transport.close();
        }

        info!(
            producers = session.producers.len(),
            consumers = session.consumers.len(),
            "Session closed"
        );
        if removed {
            self.notify().await;
        }
        Ok(())
    }

    /// Unregister producers the engine closes on its own, e.g. when an
    /// ingest transport dies.
    pub fn spawn_producer_watcher(self: &Arc<Self>) -> JoinHandle<()> {
        let mut events = self.engine.subscribe();
        let gateway: Weak<Self> = Arc::downgrade(self);

        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Producer watcher lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(gateway) = gateway.upgrade() else {
                    break;
                };

                let MediaEvent::ProducerClosed { producer_id } = event;
                for session in gateway.sessions.lock().values_mut() {
                    session.producers.remove(&producer_id);
                }
                if gateway.unregister(&producer_id) {
                    info!(producer_id = %producer_id, "Producer closed by engine");
                    gateway.notify().await;
                }
            }
            debug!("Producer watcher stopped");
        })
    }

    fn unregister(&self, producer_id: &str) -> bool {
        match self.registry.write().unregister(producer_id) {
            Ok(_) => true,
            Err(RegistryError::NotFound(_)) => false,
            Err(e) => {
                warn!("Failed to unregister producer: {}", e);
                false
            }
        }
    }

    async fn notify(&self) {
        if self
            .controller
            .send(ControllerCommand::ProducersChanged)
            .await
            .is_err()
        {
            warn!("Composition controller is gone, producer change not delivered");
        }
    }

    fn ensure_session(&self, session_id: &str) -> GatewayResult<()> {
        if self.sessions.lock().contains_key(session_id) {
            Ok(())
        } else {
            Err(GatewayError::UnknownSession(session_id.to_string()))
        }
    }

    fn transport(&self, session_id: &str, transport_id: &str) -> GatewayResult<Arc<dyn Transport>> {
        let sessions = self.sessions.lock();
        let session = sessions
            .get(session_id)
            .ok_or_else(|| GatewayError::UnknownSession(session_id.to_string()))?;
        session
            .transports
            .get(transport_id)
            .cloned()
            .ok_or_else(|| GatewayError::UnknownTransport(transport_id.to_string()))
    }
}
