//! Composition controller.
//!
//! One task owns all composition state. Restart cycles run as separate
//! tasks holding the endpoints and the supervisor; while one is in flight
//! further restart requests are coalesced, and its outcome is reconciled
//! against the registry once it hands the resources back.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::Sender;
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{MissedTickBehavior, Sleep};
use tracing::{debug, error, info, instrument, warn};

use relaycast_fallback::FallbackGenerator;
use relaycast_ipc::{
    CompositionMetrics, CompositionStatus, ControllerCommand, ControllerEvent, DegradedReason,
    FallbackKind, ProducerId, ProducerInfo, RestartPhase,
};
use relaycast_transcoder::{ProcessSpawner, SupervisorEvent, TranscodeSupervisor};
use relaycast_transport::{ConsumerEvent, EndpointManager, MediaEngine, RelayConfig};

use crate::config::ControllerConfig;
use crate::cycle::{run_cycle, CompositionResources, ControllerSignal, CycleContext, CycleOutcome, CycleReport};
use crate::error::EngineError;
use crate::metrics::MetricsCollector;
use crate::registry::SharedRegistry;

/// Epoch value that matches no cycle.
const NO_CYCLE: u64 = 0;

/// What the controller drives.
pub struct ControllerDeps {
    pub engine: Arc<dyn MediaEngine>,
    pub relay: RelayConfig,
    pub spawner: Arc<dyn ProcessSpawner>,
    pub registry: SharedRegistry,
}

/// Cloneable access to a running controller.
#[derive(Clone)]
pub struct ControllerHandle {
    commands: mpsc::Sender<ControllerCommand>,
    status: Arc<RwLock<CompositionStatus>>,
    metrics: Arc<MetricsCollector>,
}

impl ControllerHandle {
    /// Queue a command for the controller.
    pub async fn send(&self, command: ControllerCommand) -> Result<(), EngineError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| EngineError::ControllerStopped)
    }

    /// Raw command sender, e.g. for the session gateway.
    pub fn sender(&self) -> mpsc::Sender<ControllerCommand> {
        self.commands.clone()
    }

    pub fn status(&self) -> CompositionStatus {
        self.status.read().clone()
    }

    pub fn metrics(&self) -> CompositionMetrics {
        self.metrics.snapshot()
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

/// The composition controller.
pub struct CompositionController {
    config: ControllerConfig,
    registry: SharedRegistry,
    command_rx: mpsc::Receiver<ControllerCommand>,
    event_tx: Sender<ControllerEvent>,
    status: Arc<RwLock<CompositionStatus>>,
    metrics: Arc<MetricsCollector>,
    fallback: FallbackGenerator,

    // Taken by a running cycle.
    resources: Option<CompositionResources>,
    supervisor_events: mpsc::UnboundedReceiver<SupervisorEvent>,
    cycle: Option<JoinHandle<CycleReport>>,
    epoch: watch::Sender<u64>,
    signals_tx: mpsc::UnboundedSender<ControllerSignal>,
    signals_rx: mpsc::UnboundedReceiver<ControllerSignal>,
    generation: u64,

    excluded: HashMap<ProducerId, String>,
    composed: Vec<ProducerId>,
    // A process exit seen while its own cycle was still finishing.
    early_exit: Option<DegradedReason>,
    retry_at: Option<Pin<Box<Sleep>>>,
    consecutive_failures: u32,
    live_since: Option<Instant>,
    showing: Option<FallbackKind>,
    watchers: Vec<JoinHandle<()>>,

    // Needed to rebuild resources lost to a panicked cycle.
    engine: Arc<dyn MediaEngine>,
    relay: RelayConfig,
    spawner: Arc<dyn ProcessSpawner>,
}

impl CompositionController {
    /// Create a controller and the handle used to drive it.
    pub fn new(
        config: ControllerConfig,
        deps: ControllerDeps,
        event_tx: Sender<ControllerEvent>,
    ) -> (Self, ControllerHandle) {
        let (commands, command_rx) = relaycast_ipc::command_channel();
        let status = Arc::new(RwLock::new(CompositionStatus::Idle));
        let metrics = Arc::new(MetricsCollector::new());

        let (supervisor, supervisor_events) =
            TranscodeSupervisor::new(deps.spawner.clone(), config.transcoder.clone());
        let endpoints = EndpointManager::new(deps.engine.clone(), &deps.relay);
        let (epoch, _) = watch::channel(NO_CYCLE);
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();

        let handle = ControllerHandle {
            commands,
            status: Arc::clone(&status),
            metrics: Arc::clone(&metrics),
        };

        let controller = Self {
            fallback: FallbackGenerator::new(config.output.clone(), config.fallback.clone()),
            config,
            registry: deps.registry,
            command_rx,
            event_tx,
            status,
            metrics,
            resources: Some(CompositionResources::new(endpoints, supervisor)),
            supervisor_events,
            cycle: None,
            epoch,
            signals_tx,
            signals_rx,
            generation: 0,
            excluded: HashMap::new(),
            composed: Vec::new(),
            early_exit: None,
            retry_at: None,
            consecutive_failures: 0,
            live_since: None,
            showing: None,
            watchers: Vec::new(),
            engine: deps.engine,
            relay: deps.relay,
            spawner: deps.spawner,
        };

        (controller, handle)
    }

    /// Run the controller until `Shutdown` or until every handle is gone.
    #[instrument(name = "controller_run", skip(self))]
    pub async fn run(mut self) {
        info!("Composition controller starting");
        self.send_event(ControllerEvent::Ready);

        // Settles to idle content when nothing is registered yet.
        self.reconcile(false).await;

        let mut metrics_tick = tokio::time::interval(self.config.metrics_interval());
        metrics_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                command = self.command_rx.recv() => match command {
                    Some(command) => {
                        if !self.handle_command(command).await {
                            break;
                        }
                    }
                    None => {
                        info!("Command channel closed, shutting down");
                        self.shutdown().await;
                        break;
                    }
                },
                result = join_cycle(&mut self.cycle) => self.finish_cycle(result).await,
                Some(event) = self.supervisor_events.recv() => self.handle_supervisor_event(event).await,
                Some(signal) = self.signals_rx.recv() => self.handle_signal(signal).await,
                _ = wait_retry(&mut self.retry_at) => {
                    self.retry_at = None;
                    self.fire_retry().await;
                }
                _ = metrics_tick.tick() => {
                    if self.status.read().is_live() {
                        self.emit_metrics();
                    }
                }
            }
        }

        self.send_event(ControllerEvent::Shutdown);
        info!("Composition controller stopped");
    }

    /// Handle a command. Returns false if the controller should stop.
    async fn handle_command(&mut self, command: ControllerCommand) -> bool {
        debug!(?command, "Handling command");

        match command {
            ControllerCommand::ProducersChanged => {
                self.consecutive_failures = 0;
                self.request_restart(false).await;
            }
            ControllerCommand::Restart => {
                self.consecutive_failures = 0;
                self.request_restart(true).await;
            }
            ControllerCommand::ClearOutput => self.clear_output().await,
            ControllerCommand::GetState => self.send_state(),
            ControllerCommand::Shutdown => {
                self.shutdown().await;
                return false;
            }
        }

        true
    }

    async fn request_restart(&mut self, force: bool) {
        if self.cycle.is_some() {
            debug!(generation = self.generation, "Restart already in flight, coalescing");
            self.metrics.record_coalesced();
            return;
        }
        self.reconcile(force).await;
    }

    /// Compare the registry with the composition and restart if they differ.
    async fn reconcile(&mut self, force: bool) {
        if self.cycle.is_some() {
            return;
        }

        let producers = self.composable();
        if producers.is_empty() {
            self.go_idle().await;
            return;
        }

        let unchanged = producers.iter().map(|p| &p.id).eq(self.composed.iter());
        if !force && unchanged && self.status.read().is_live() {
            debug!("Composition unchanged");
            return;
        }

        self.begin_cycle(producers);
    }

    /// Registered producers that are not excluded, in registration order.
    fn composable(&mut self) -> Vec<ProducerInfo> {
        let snapshot = self.registry.read().snapshot();
        self.excluded
            .retain(|id, _| snapshot.iter().any(|p| &p.id == id));

        let mut composable = Vec::with_capacity(snapshot.len());
        for producer in snapshot {
            if self.excluded.contains_key(&producer.id) {
                continue;
            }
            let consumable = self
                .resources
                .as_ref()
                .map_or(true, |r| r.endpoints.can_consume(&producer));
            if !consumable {
                let reason = format!("codec {} is not accepted by the transcoder", producer.codec.mime_type);
                self.exclude(producer.id, reason);
                continue;
            }
            composable.push(producer);
        }
        composable
    }

    fn exclude(&mut self, producer_id: ProducerId, reason: String) {
        if self.excluded.contains_key(&producer_id) {
            return;
        }
        warn!(producer_id = %producer_id, "Excluding producer from composition: {}", reason);
        self.send_event(ControllerEvent::ProducerExcluded {
            producer_id: producer_id.clone(),
            reason: reason.clone(),
        });
        self.excluded.insert(producer_id, reason);
    }

    #[instrument(name = "begin_cycle", skip(self, producers), fields(producers = producers.len()))]
    fn begin_cycle(&mut self, producers: Vec<ProducerInfo>) {
        let Some(resources) = self.resources.take() else {
            error!("Composition resources missing, cannot restart");
            return;
        };

        self.retry_at = None;
        self.stop_watchers();
        self.early_exit = None;
        self.live_since = None;
        self.generation += 1;
        self.epoch.send_replace(self.generation);
        self.metrics.record_restart(self.generation);
        self.metrics.record_not_live();

        info!(generation = self.generation, "Starting restart cycle");
        self.transition_to(CompositionStatus::Starting {
            generation: self.generation,
            phase: RestartPhase::AllocateEndpoints,
        });

        let ctx = CycleContext {
            generation: self.generation,
            producers,
            output: self.config.output.clone(),
            work_dir: self.config.transcoder.work_dir.clone(),
            confirm_delay: self.config.confirm_delay(),
            step_timeout: self.config.step_timeout(),
            epoch: self.epoch.subscribe(),
            signals: self.signals_tx.clone(),
        };
        self.cycle = Some(tokio::spawn(run_cycle(ctx, resources)));
    }

    /// Take back the resources of a finished cycle. Returns the outcome
    /// when the cycle still belongs to the current generation.
    fn absorb(&mut self, result: Result<CycleReport, JoinError>) -> Option<(CycleOutcome, Vec<ProducerId>)> {
        let report = match result {
            Ok(report) => report,
            Err(e) => {
                error!(generation = self.generation, "Restart cycle aborted: {}", e);
                self.rebuild_resources();
                let attempted = self.composable().into_iter().map(|p| p.id).collect();
                return Some((
                    CycleOutcome::Failed {
                        reason: DegradedReason::FatalError {
                            message: format!("restart cycle aborted: {e}"),
                        },
                    },
                    attempted,
                ));
            }
        };

        self.metrics.set_active_endpoints(report.resources.len());
        self.resources = Some(report.resources);
        for (producer_id, reason) in report.excluded {
            self.exclude(producer_id, reason);
        }

        if report.generation != self.generation || *self.epoch.borrow() != self.generation {
            debug!(generation = report.generation, "Discarding superseded cycle");
            return None;
        }
        Some((report.outcome, report.attempted))
    }

    fn rebuild_resources(&mut self) {
        let (supervisor, events) =
            TranscodeSupervisor::new(self.spawner.clone(), self.config.transcoder.clone());
        self.supervisor_events = events;
        self.resources = Some(CompositionResources::new(
            EndpointManager::new(self.engine.clone(), &self.relay),
            supervisor,
        ));
        self.metrics.set_active_endpoints(0);
    }

    async fn finish_cycle(&mut self, result: Result<CycleReport, JoinError>) {
        let Some((outcome, attempted)) = self.absorb(result) else {
            return;
        };
        let early_exit = self.early_exit.take();

        match outcome {
            CycleOutcome::Live { layout, producers } => {
                self.composed = producers.clone();
                self.showing = None;
                self.live_since = Some(Instant::now());
                self.metrics.record_live(producers.len());
                self.transition_to(CompositionStatus::Live {
                    generation: self.generation,
                    layout,
                    producers,
                });

                if let Some(reason) = early_exit {
                    self.handle_abnormal(reason).await;
                } else {
                    // The new playlist no longer references older generations.
                    let pruned = self.fallback.prune_stale_generations(self.generation);
                    if pruned > 0 {
                        debug!(pruned, "Removed segments of previous generations");
                    }
                    self.watch_endpoints();
                }
            }
            CycleOutcome::Empty => self.go_idle().await,
            CycleOutcome::Failed { reason } => {
                self.metrics.record_start_failure();
                self.composed = attempted;
                self.degrade(reason).await;
            }
            CycleOutcome::Cancelled => {}
        }

        // Requests coalesced during the cycle are picked up here.
        let composable: Vec<ProducerId> = self.composable().into_iter().map(|p| p.id).collect();
        if composable != self.composed {
            debug!("Producer set changed during restart, reconciling");
            self.reconcile(false).await;
        }
    }

    async fn handle_supervisor_event(&mut self, event: SupervisorEvent) {
        match event {
            SupervisorEvent::Diagnostic { generation, line } => {
                debug!(target: "relaycast::transcoder", generation, "{}", line);
                self.send_event(ControllerEvent::Diagnostic { generation, line });
            }
            SupervisorEvent::Exited {
                generation,
                requested: true,
                ..
            } => {
                debug!(generation, "Transcoder exited on request");
            }
            SupervisorEvent::Exited {
                generation, exit, ..
            } => {
                let reason = DegradedReason::AbnormalExit {
                    code: exit.code,
                    signal: exit.signal,
                };
                self.process_lost(generation, reason).await;
            }
            SupervisorEvent::FatalError {
                generation,
                message,
            } => {
                self.process_lost(generation, DegradedReason::FatalError { message })
                    .await;
            }
        }
    }

    async fn process_lost(&mut self, generation: u64, reason: DegradedReason) {
        if generation != self.generation {
            debug!(generation, "Ignoring exit of a previous generation");
            return;
        }
        if self.cycle.is_some() {
            // The cycle either fails on its own or hands back a live
            // process that is already gone.
            self.early_exit = Some(reason);
            return;
        }
        if !self.status.read().is_live() {
            return;
        }
        self.handle_abnormal(reason).await;
    }

    async fn handle_signal(&mut self, signal: ControllerSignal) {
        match signal {
            ControllerSignal::Phase { generation, phase } => {
                let advance = {
                    let status = self.status.read();
                    matches!(
                        &*status,
                        CompositionStatus::Starting { generation: g, phase: p }
                            if *g == generation && *p != phase
                    )
                };
                if advance && self.cycle.is_some() {
                    self.transition_to(CompositionStatus::Starting { generation, phase });
                }
            }
            ControllerSignal::EndpointClosed {
                generation,
                producer_id,
            } => {
                if generation != self.generation
                    || self.cycle.is_some()
                    || !self.status.read().is_live()
                {
                    return;
                }
                if self.registry.read().contains(&producer_id) {
                    self.handle_abnormal(DegradedReason::EndpointLost { producer_id })
                        .await;
                } else {
                    debug!(producer_id = %producer_id, "Composed producer left");
                    self.reconcile(false).await;
                }
            }
        }
    }

    /// The running process or one of its inputs was lost while live.
    async fn handle_abnormal(&mut self, reason: DegradedReason) {
        warn!(generation = self.generation, "Composition lost: {}", reason.message());
        self.metrics.record_abnormal_exit();

        if self
            .live_since
            .is_some_and(|since| since.elapsed() >= self.config.stable_live())
        {
            self.consecutive_failures = 0;
        }

        self.stop_watchers();
        if let Some(resources) = self.resources.as_mut() {
            resources.supervisor.stop().await;
        }
        self.degrade(reason).await;
    }

    /// Show degraded content and park the endpoints.
    async fn degrade(&mut self, reason: DegradedReason) {
        self.stop_watchers();
        self.live_since = None;
        self.metrics.record_not_live();

        let held = match self.resources.as_ref() {
            Some(resources) => {
                resources.pause_all().await;
                resources.len()
            }
            None => 0,
        };
        self.show(FallbackKind::Degraded, Some(&reason));

        if held == 0 {
            // No endpoint survived, so there is nothing to be degraded from.
            warn!("No relay endpoint held, staying idle: {}", reason.message());
            self.transition_to(CompositionStatus::Idle);
            return;
        }

        let retryable = reason.is_retryable();
        self.transition_to(CompositionStatus::Degraded {
            generation: self.generation,
            reason,
        });
        if retryable {
            self.schedule_retry();
        }
    }

    fn schedule_retry(&mut self) {
        self.consecutive_failures += 1;
        let attempt = self.consecutive_failures;

        if self.registry.read().is_empty() {
            return;
        }
        if !self.config.retry.should_retry(attempt) {
            warn!(attempt, "Retry budget exhausted, waiting for a producer change or restart");
            return;
        }

        let delay = self.config.retry.delay_for_attempt(attempt);
        info!(attempt, ?delay, "Scheduling composition restart");
        self.metrics.record_retry_scheduled();
        self.retry_at = Some(Box::pin(tokio::time::sleep(delay)));
    }

    async fn fire_retry(&mut self) {
        if self.cycle.is_none() && self.status.read().is_degraded() {
            info!("Retrying composition");
            self.reconcile(true).await;
        }
    }

    /// Release everything and show idle content.
    async fn go_idle(&mut self) {
        self.retry_at = None;
        self.consecutive_failures = 0;
        self.stop_watchers();
        self.release_all().await;

        if self.showing != Some(FallbackKind::Idle) {
            self.show(FallbackKind::Idle, None);
        }
        if !self.status.read().is_idle() {
            info!("No composable producers, going idle");
            self.transition_to(CompositionStatus::Idle);
        }
    }

    async fn release_all(&mut self) {
        if let Some(resources) = self.resources.as_mut() {
            resources.supervisor.stop().await;
            resources.release_all();
        }
        self.composed.clear();
        self.live_since = None;
        self.metrics.record_not_live();
        self.metrics.set_active_endpoints(0);
    }

    /// Wait for an in-flight cycle to unwind and take its resources back.
    async fn cancel_cycle(&mut self) {
        let Some(handle) = self.cycle.take() else {
            return;
        };
        info!(generation = self.generation, "Cancelling restart cycle");
        self.epoch.send_replace(NO_CYCLE);
        let result = handle.await;
        self.absorb(result);
        self.early_exit = None;
    }

    #[instrument(name = "clear_output", skip(self))]
    async fn clear_output(&mut self) {
        info!("Clearing output");
        self.cancel_cycle().await;
        self.retry_at = None;
        self.stop_watchers();

        let held = match self.resources.as_mut() {
            Some(resources) => {
                resources.supervisor.stop().await;
                resources.pause_all().await;
                resources.len()
            }
            None => 0,
        };
        self.composed.clear();
        self.live_since = None;
        self.metrics.record_not_live();

        match self.fallback.clear_output() {
            Ok(removed) => debug!(removed, "Output directory cleared"),
            Err(e) => warn!("Failed to clear output directory: {}", e),
        }
        self.show(FallbackKind::Idle, None);

        if held == 0 {
            self.transition_to(CompositionStatus::Idle);
        } else {
            self.transition_to(CompositionStatus::Degraded {
                generation: self.generation,
                reason: DegradedReason::OutputCleared,
            });
        }
    }

    #[instrument(name = "controller_shutdown", skip(self))]
    async fn shutdown(&mut self) {
        info!("Shutting down composition");
        self.cancel_cycle().await;
        self.retry_at = None;
        self.stop_watchers();
        self.release_all().await;
        self.show(FallbackKind::Idle, None);
        if !self.status.read().is_idle() {
            self.transition_to(CompositionStatus::Idle);
        }
    }

    /// Watch live endpoints for producers or transports going away.
    fn watch_endpoints(&mut self) {
        self.stop_watchers();
        let Some(resources) = self.resources.as_ref() else {
            return;
        };

        for endpoint in resources.active.values() {
            let mut events = endpoint.subscribe();
            let signals = self.signals_tx.clone();
            let generation = self.generation;
            let producer_id = endpoint.producer_id().clone();
            let alive = endpoint.is_alive();

            self.watchers.push(tokio::spawn(async move {
                if alive {
                    loop {
                        match events.recv().await {
                            Ok(ConsumerEvent::ProducerClosed | ConsumerEvent::TransportClosed)
                            | Err(broadcast::error::RecvError::Closed) => break,
                            Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        }
                    }
                }
                let _ = signals.send(ControllerSignal::EndpointClosed {
                    generation,
                    producer_id,
                });
            }));
        }
    }

    fn stop_watchers(&mut self) {
        for watcher in self.watchers.drain(..) {
            watcher.abort();
        }
    }

    fn show(&mut self, kind: FallbackKind, reason: Option<&DegradedReason>) {
        let tier = match reason {
            Some(reason) => self.fallback.show_degraded(reason),
            None => self.fallback.show_idle(),
        };
        self.showing = Some(kind);
        self.metrics.record_fallback_write();
        self.send_event(ControllerEvent::FallbackWritten { kind, tier });
    }

    fn send_state(&self) {
        let state = self.status.read().clone();
        self.send_event(ControllerEvent::StateChanged {
            previous: Box::new(state.clone()),
            current: Box::new(state),
        });
    }

    fn emit_metrics(&self) {
        self.send_event(ControllerEvent::Metrics(self.metrics.snapshot()));
    }

    fn transition_to(&self, new_state: CompositionStatus) {
        let previous = {
            let mut state = self.status.write();
            let prev = state.clone();
            *state = new_state.clone();
            prev
        };

        debug!(
            previous = %previous.name(),
            current = %new_state.name(),
            "State transition"
        );

        self.send_event(ControllerEvent::StateChanged {
            previous: Box::new(previous),
            current: Box::new(new_state),
        });
    }

    fn send_event(&self, event: ControllerEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            warn!("Failed to send event: {}", e);
        }
    }
}

impl Drop for CompositionController {
    fn drop(&mut self) {
        self.stop_watchers();
        if let Some(cycle) = self.cycle.take() {
            cycle.abort();
        }
    }
}

async fn join_cycle(cycle: &mut Option<JoinHandle<CycleReport>>) -> Result<CycleReport, JoinError> {
    match cycle.as_mut() {
        Some(handle) => {
            let result = handle.await;
            *cycle = None;
            result
        }
        None => std::future::pending().await,
    }
}

async fn wait_retry(retry_at: &mut Option<Pin<Box<Sleep>>>) {
    match retry_at.as_mut() {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}
