//! One composition restart cycle.
//!
//! A cycle takes ownership of the endpoints and the supervisor, walks the
//! restart phases in order and hands everything back with its outcome.
//! After every suspension point it re-checks the shared epoch; a newer
//! epoch means the cycle was superseded and must unwind.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, instrument, warn};

use relaycast_ipc::{DegradedReason, Layout, MediaKind, OutputTarget, ProducerId, ProducerInfo, RestartPhase};
use relaycast_transcoder::{select_layout, InputSpec, SpawnRequest, TranscodeSupervisor};
use relaycast_transport::{sdp, EndpointManager, RelayEndpoint, TransportError};

/// Resources a cycle needs exclusive access to.
pub(crate) struct CompositionResources {
    pub(crate) endpoints: EndpointManager,
    pub(crate) active: HashMap<ProducerId, RelayEndpoint>,
    pub(crate) supervisor: TranscodeSupervisor,
}

impl CompositionResources {
    pub fn new(endpoints: EndpointManager, supervisor: TranscodeSupervisor) -> Self {
        Self {
            endpoints,
            active: HashMap::new(),
            supervisor,
        }
    }

    /// Number of held relay endpoints.
    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub(crate) fn release(&mut self, producer_id: &str) {
        if let Some(endpoint) = self.active.remove(producer_id) {
            self.endpoints.release(&endpoint);
        }
    }

    pub(crate) fn release_all(&mut self) {
        for (_, endpoint) in self.active.drain() {
            self.endpoints.release(&endpoint);
        }
    }

    /// Pause every consumer, ignoring consumers that already went away.
    pub(crate) async fn pause_all(&self) {
        for endpoint in self.active.values() {
            if let Err(e) = endpoint.consumer().pause().await {
                debug!(producer_id = %endpoint.producer_id(), "Pause failed: {}", e);
            }
        }
    }
}

/// Signals from cycles and endpoint watchers back to the controller loop.
#[derive(Debug)]
pub(crate) enum ControllerSignal {
    Phase {
        generation: u64,
        phase: RestartPhase,
    },
    EndpointClosed {
        generation: u64,
        producer_id: ProducerId,
    },
}

/// Inputs of one cycle.
pub(crate) struct CycleContext {
    pub generation: u64,
    pub producers: Vec<ProducerInfo>,
    pub output: OutputTarget,
    pub work_dir: PathBuf,
    pub confirm_delay: Duration,
    pub step_timeout: Duration,
    pub epoch: watch::Receiver<u64>,
    pub signals: mpsc::UnboundedSender<ControllerSignal>,
}

/// How a cycle ended.
#[derive(Debug)]
pub(crate) enum CycleOutcome {
    /// The transcoder is producing output from `producers`.
    Live {
        layout: Layout,
        producers: Vec<ProducerId>,
    },

    /// No producer could be given an endpoint.
    Empty,

    /// A step failed; the process is stopped and consumers are paused.
    Failed { reason: DegradedReason },

    /// A newer epoch superseded the cycle.
    Cancelled,
}

/// Result handed back to the controller.
pub(crate) struct CycleReport {
    pub generation: u64,
    pub outcome: CycleOutcome,
    /// Producers the cycle tried to compose.
    pub attempted: Vec<ProducerId>,
    /// Producers left out, with the reason.
    pub excluded: Vec<(ProducerId, String)>,
    pub resources: CompositionResources,
}

enum CycleError {
    Cancelled,
    Failed(DegradedReason),
}

fn start_failed(phase: RestartPhase, message: impl Into<String>) -> CycleError {
    CycleError::Failed(DegradedReason::StartFailed {
        phase,
        message: message.into(),
    })
}

impl CycleContext {
    fn enter(&self, phase: RestartPhase) {
        debug!(generation = self.generation, phase = phase.name(), "Entering phase");
        let _ = self.signals.send(ControllerSignal::Phase {
            generation: self.generation,
            phase,
        });
    }

    fn is_current(&self) -> bool {
        *self.epoch.borrow() == self.generation
    }

    fn check(&self) -> Result<(), CycleError> {
        if self.is_current() {
            Ok(())
        } else {
            Err(CycleError::Cancelled)
        }
    }

    /// Resolves once the cycle is superseded.
    async fn superseded(&self) {
        let mut epoch = self.epoch.clone();
        loop {
            if *epoch.borrow_and_update() != self.generation {
                return;
            }
            if epoch.changed().await.is_err() {
                // Controller gone; nothing left to wait for.
                std::future::pending::<()>().await;
            }
        }
    }

    /// Race a future against supersession. Only used for futures that are
    /// safe to drop half way.
    async fn cancellable<F: Future>(&self, fut: F) -> Result<F::Output, CycleError> {
        tokio::select! {
            output = fut => {
                self.check()?;
                Ok(output)
            }
            _ = self.superseded() => Err(CycleError::Cancelled),
        }
    }

    /// Run one endpoint operation under the step timeout.
    async fn bounded<F>(&self, phase: RestartPhase, producer_id: &str, fut: F) -> Result<(), CycleError>
    where
        F: Future<Output = Result<(), TransportError>>,
    {
        match self.cancellable(tokio::time::timeout(self.step_timeout, fut)).await? {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(start_failed(phase, format!("{producer_id}: {e}"))),
            Err(_) => Err(start_failed(
                phase,
                format!("{producer_id}: timed out after {:?}", self.step_timeout),
            )),
        }
    }
}

/// Drive one cycle to completion.
#[instrument(name = "composition_cycle", skip(ctx, resources), fields(generation = ctx.generation))]
pub(crate) async fn run_cycle(ctx: CycleContext, mut resources: CompositionResources) -> CycleReport {
    let mut excluded = Vec::new();

    let outcome = match drive(&ctx, &mut resources, &mut excluded).await {
        Ok(outcome) => outcome,
        Err(err) => {
            // Leave nothing half started.
            resources.supervisor.stop().await;
            resources.pause_all().await;
            match err {
                CycleError::Cancelled => {
                    info!("Cycle superseded");
                    CycleOutcome::Cancelled
                }
                CycleError::Failed(reason) => {
                    warn!("Cycle failed: {}", reason.message());
                    CycleOutcome::Failed { reason }
                }
            }
        }
    };

    let attempted = ctx
        .producers
        .iter()
        .map(|p| p.id.clone())
        .filter(|id| !excluded.iter().any(|(excluded, _)| excluded == id))
        .collect();

    CycleReport {
        generation: ctx.generation,
        outcome,
        attempted,
        excluded,
        resources,
    }
}

async fn drive(
    ctx: &CycleContext,
    resources: &mut CompositionResources,
    excluded: &mut Vec<(ProducerId, String)>,
) -> Result<CycleOutcome, CycleError> {
    ctx.enter(RestartPhase::AllocateEndpoints);

    // Ports may be reused below, so the old writer must be gone first.
    if let Some(exit) = resources.supervisor.stop().await {
        debug!(?exit, "Previous generation stopped");
    }
    ctx.check()?;

    let stale: Vec<ProducerId> = resources
        .active
        .iter()
        .filter(|(id, endpoint)| {
            !endpoint.is_alive() || !ctx.producers.iter().any(|p| &p.id == *id)
        })
        .map(|(id, _)| id.clone())
        .collect();
    for id in stale {
        debug!(producer_id = %id, "Releasing endpoint");
        resources.release(&id);
    }

    // Kept endpoints stay paused until the new process is confirmed.
    let mut unpausable = Vec::new();
    for (id, endpoint) in &resources.active {
        if endpoint.consumer().pause().await.is_err() {
            unpausable.push(id.clone());
        }
    }
    for id in unpausable {
        resources.release(&id);
    }
    ctx.check()?;

    for producer in &ctx.producers {
        if resources.active.contains_key(&producer.id) {
            continue;
        }
        match resources.endpoints.allocate(producer).await {
            Ok(endpoint) => {
                resources.active.insert(producer.id.clone(), endpoint);
            }
            Err(e @ (TransportError::CapabilityMismatch { .. } | TransportError::ProducerNotFound(_))) => {
                warn!(producer_id = %producer.id, "Producer left out of composition: {}", e);
                excluded.push((producer.id.clone(), e.to_string()));
            }
            Err(e) => {
                return Err(CycleError::Failed(DegradedReason::TransportUnavailable {
                    message: e.to_string(),
                }));
            }
        }
        ctx.check()?;
    }

    if resources.active.is_empty() {
        return Ok(CycleOutcome::Empty);
    }

    let order: Vec<ProducerId> = ctx
        .producers
        .iter()
        .filter(|p| resources.active.contains_key(&p.id))
        .map(|p| p.id.clone())
        .collect();

    ctx.enter(RestartPhase::WriteDescriptors);
    let inputs = write_descriptors(ctx, resources, &order)
        .await
        .map_err(|e| start_failed(RestartPhase::WriteDescriptors, e.to_string()))?;
    ctx.check()?;

    ctx.enter(RestartPhase::SpawnProcess);
    let layout = select_layout(&inputs);
    let request = SpawnRequest {
        generation: ctx.generation,
        inputs,
        output: ctx.output.clone(),
    };
    resources
        .supervisor
        .spawn(&request)
        .await
        .map_err(|e| start_failed(RestartPhase::SpawnProcess, e.to_string()))?;
    ctx.check()?;

    ctx.enter(RestartPhase::AwaitStart);
    ctx.cancellable(resources.supervisor.await_ready())
        .await?
        .map_err(|e| start_failed(RestartPhase::AwaitStart, e.to_string()))?;

    ctx.enter(RestartPhase::BindPorts);
    // Placeholder for a real bind probe.
    ctx.cancellable(tokio::time::sleep(ctx.confirm_delay)).await?;
    let ip = resources.endpoints.transcoder_ip();
    for id in &order {
        let endpoint = &resources.active[id];
        ctx.bounded(RestartPhase::BindPorts, id, endpoint.connect(ip))
            .await?;
    }

    ctx.enter(RestartPhase::ResumeConsumers);
    for id in &order {
        let endpoint = &resources.active[id];
        ctx.bounded(RestartPhase::ResumeConsumers, id, endpoint.consumer().resume())
            .await?;
    }

    ctx.enter(RestartPhase::RequestKeyFrames);
    for id in &order {
        let endpoint = &resources.active[id];
        if endpoint.producer().kind != MediaKind::Video {
            continue;
        }
        ctx.bounded(
            RestartPhase::RequestKeyFrames,
            id,
            endpoint.consumer().request_key_frame(),
        )
        .await?;
    }
    ctx.check()?;

    info!(layout = layout.name(), inputs = order.len(), "Composition live");
    Ok(CycleOutcome::Live {
        layout,
        producers: order,
    })
}

/// Write one SDP file per endpoint into a per-generation directory.
async fn write_descriptors(
    ctx: &CycleContext,
    resources: &CompositionResources,
    order: &[ProducerId],
) -> std::io::Result<Vec<InputSpec>> {
    let dir = ctx.work_dir.join(format!("g{}", ctx.generation));
    tokio::fs::create_dir_all(&dir).await?;
    prune_descriptor_dirs(&ctx.work_dir, ctx.generation).await;

    let ip = resources.endpoints.transcoder_ip();
    let mut inputs = Vec::with_capacity(order.len());
    for (index, id) in order.iter().enumerate() {
        let endpoint = &resources.active[id];
        let producer = endpoint.producer();
        let path = dir.join(format!("input_{index}_{}.sdp", producer.kind.as_str()));
        tokio::fs::write(&path, sdp::endpoint_descriptor(endpoint, ip)).await?;

        inputs.push(InputSpec {
            producer_id: id.clone(),
            kind: producer.kind,
            codec: producer.codec.clone(),
            descriptor: path,
        });
    }
    Ok(inputs)
}

/// Remove descriptor directories of other generations.
async fn prune_descriptor_dirs(work_dir: &std::path::Path, current: u64) {
    let Ok(mut entries) = tokio::fs::read_dir(work_dir).await else {
        return;
    };
    let keep = format!("g{current}");
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let is_generation = name
            .strip_prefix('g')
            .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()));
        if is_generation && name != keep {
            if let Err(e) = tokio::fs::remove_dir_all(entry.path()).await {
                debug!(dir = name, "Could not remove old descriptors: {}", e);
            }
        }
    }
}
