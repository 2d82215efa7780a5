//! Transcoder process supervisor.
//!
//! At most one transcoder runs at a time. Spawning a new generation stops
//! the previous one and waits for its exit before the new process starts,
//! so two processes never write to the output directory concurrently.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::args::{build_args, ARGS_VERSION};
use crate::error::TranscoderError;
use crate::process::{ChildProcess, ExitInfo, ProcessSpawner, SpawnedProcess};
use crate::{SpawnRequest, TranscodeConfig, TranscoderResult};

/// Notifications from the process monitor.
#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    /// The process exited. `requested` is true when the exit followed a stop.
    Exited {
        generation: u64,
        exit: ExitInfo,
        requested: bool,
    },

    /// Waiting on the process failed.
    FatalError { generation: u64, message: String },

    /// One stderr line.
    Diagnostic { generation: u64, line: String },
}

impl SupervisorEvent {
    pub fn generation(&self) -> u64 {
        match self {
            Self::Exited { generation, .. }
            | Self::FatalError { generation, .. }
            | Self::Diagnostic { generation, .. } => *generation,
        }
    }
}

/// Information about the running generation.
#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub generation: u64,
    pub pid: Option<u32>,
    pub spawned_at: Instant,
}

enum Control {
    Stop { ack: oneshot::Sender<ExitInfo> },
}

struct Running {
    info: ProcessInfo,
    control: mpsc::Sender<Control>,
    ready: Option<oneshot::Receiver<Result<(), ExitInfo>>>,
    confirmed: bool,
    monitor: JoinHandle<()>,
}

/// Owns the transcoder process.
pub struct TranscodeSupervisor {
    spawner: Arc<dyn ProcessSpawner>,
    config: TranscodeConfig,
    running: Option<Running>,
    events: mpsc::UnboundedSender<SupervisorEvent>,
}

impl TranscodeSupervisor {
    /// Create a supervisor and the receiver for its events.
    pub fn new(
        spawner: Arc<dyn ProcessSpawner>,
        config: TranscodeConfig,
    ) -> (Self, mpsc::UnboundedReceiver<SupervisorEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                spawner,
                config,
                running: None,
                events,
            },
            rx,
        )
    }

    pub fn config(&self) -> &TranscodeConfig {
        &self.config
    }

    /// Running generation, if any. A process that exited on its own stays
    /// listed until the next `stop` or `spawn`.
    pub fn current(&self) -> Option<&ProcessInfo> {
        self.running.as_ref().map(|r| &r.info)
    }

    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|r| !r.monitor.is_finished())
    }

    /// Spawn a new generation without waiting for readiness.
    ///
    /// Any previous process is stopped first and its exit awaited.
    #[instrument(name = "transcoder_spawn", skip(self, request), fields(generation = request.generation))]
    pub async fn spawn(&mut self, request: &SpawnRequest) -> TranscoderResult<()> {
        if let Some(exit) = self.stop().await {
            debug!(?exit, "Previous generation stopped");
        }

        if request.inputs.is_empty() {
            return Err(TranscoderError::NoInputs);
        }

        tokio::fs::create_dir_all(&request.output.dir).await?;

        let args = build_args(&self.config, request);
        info!(
            args_version = ARGS_VERSION,
            inputs = request.inputs.len(),
            "Spawning transcoder: {} {}",
            self.config.program.display(),
            args.join(" ")
        );

        let spawned = self
            .spawner
            .spawn(&self.config.program, &args)
            .await
            .map_err(TranscoderError::SpawnFailed)?;

        let info = ProcessInfo {
            generation: request.generation,
            pid: spawned.child.id(),
            spawned_at: Instant::now(),
        };

        let (control_tx, control_rx) = mpsc::channel(1);
        let (ready_tx, ready_rx) = oneshot::channel();
        let monitor = tokio::spawn(monitor(
            MonitorContext {
                generation: request.generation,
                ready_pattern: self.config.ready_pattern.clone(),
                grace: self.config.stop_grace(),
                kill_timeout: self.config.kill_timeout(),
                events: self.events.clone(),
            },
            spawned,
            control_rx,
            ready_tx,
        ));

        self.running = Some(Running {
            info,
            control: control_tx,
            ready: Some(ready_rx),
            confirmed: false,
            monitor,
        });
        Ok(())
    }

    /// Wait until the running generation reports output.
    ///
    /// Only waits on the readiness signal, so the future may be dropped at
    /// any point. On failure the process is left for the caller to stop.
    pub async fn await_ready(&mut self) -> TranscoderResult<ProcessInfo> {
        let timeout = self.config.start_timeout();
        let running = self.running.as_mut().ok_or(TranscoderError::NotRunning)?;
        let info = running.info.clone();

        if running.confirmed {
            return Ok(info);
        }
        let Some(ready) = running.ready.as_mut() else {
            // An earlier wait already failed.
            return Err(TranscoderError::NotRunning);
        };

        let result = match tokio::time::timeout(timeout, ready).await {
            Ok(Ok(Ok(()))) => {
                info!(
                    generation = info.generation,
                    elapsed = ?info.spawned_at.elapsed(),
                    "Transcoder producing output"
                );
                running.confirmed = true;
                Ok(info)
            }
            Ok(Ok(Err(exit))) => Err(TranscoderError::ExitedBeforeStart {
                code: exit.code,
                signal: exit.signal,
            }),
            Ok(Err(_)) => Err(TranscoderError::ExitedBeforeStart {
                code: None,
                signal: None,
            }),
            Err(_) => {
                warn!(generation = info.generation, ?timeout, "Transcoder start timed out");
                Err(TranscoderError::StartTimeout(timeout))
            }
        };
        running.ready = None;
        result
    }

    /// Spawn and wait for readiness. A process that fails to become ready
    /// is stopped before returning.
    pub async fn start(&mut self, request: &SpawnRequest) -> TranscoderResult<ProcessInfo> {
        self.spawn(request).await?;
        match self.await_ready().await {
            Ok(info) => Ok(info),
            Err(e) => {
                self.stop().await;
                Err(e)
            }
        }
    }

    /// Stop the running process and wait for its exit. Safe to call when
    /// nothing runs. Returns the exit when this call caused it.
    pub async fn stop(&mut self) -> Option<ExitInfo> {
        let running = self.running.take()?;
        let generation = running.info.generation;
        let (ack_tx, ack_rx) = oneshot::channel();

        let exit = if running.control.send(Control::Stop { ack: ack_tx }).await.is_ok() {
            ack_rx.await.ok()
        } else {
            // Monitor already finished: the process exited on its own.
            None
        };

        if let Err(e) = running.monitor.await {
            error!(generation, "Transcoder monitor failed: {}", e);
        }

        debug!(generation, ?exit, "Transcoder stopped");
        exit
    }
}

impl Drop for TranscodeSupervisor {
    fn drop(&mut self) {
        // Aborting the monitor drops the child, which kills it.
        if let Some(running) = self.running.take() {
            running.monitor.abort();
        }
    }
}

struct MonitorContext {
    generation: u64,
    ready_pattern: String,
    grace: Duration,
    kill_timeout: Duration,
    events: mpsc::UnboundedSender<SupervisorEvent>,
}

async fn monitor(
    ctx: MonitorContext,
    spawned: SpawnedProcess,
    mut control: mpsc::Receiver<Control>,
    ready_tx: oneshot::Sender<Result<(), ExitInfo>>,
) {
    let SpawnedProcess {
        mut child,
        mut diagnostics,
    } = spawned;
    let generation = ctx.generation;
    let mut ready_tx = Some(ready_tx);
    let mut diagnostics_open = true;

    loop {
        tokio::select! {
            biased;

            line = diagnostics.recv(), if diagnostics_open => match line {
                Some(line) => {
                    if line.contains(&ctx.ready_pattern) {
                        if let Some(tx) = ready_tx.take() {
                            let _ = tx.send(Ok(()));
                        }
                    }
                    let _ = ctx.events.send(SupervisorEvent::Diagnostic { generation, line });
                }
                None => diagnostics_open = false,
            },

            command = control.recv() => {
                let exit = shutdown(child.as_mut(), ctx.grace, ctx.kill_timeout).await;
                if let Some(tx) = ready_tx.take() {
                    let _ = tx.send(Err(exit));
                }
                let _ = ctx.events.send(SupervisorEvent::Exited { generation, exit, requested: true });
                if let Some(Control::Stop { ack }) = command {
                    let _ = ack.send(exit);
                }
                return;
            }

            status = child.wait() => {
                let exit = match status {
                    Ok(exit) => exit,
                    Err(e) => {
                        let _ = ctx.events.send(SupervisorEvent::FatalError {
                            generation,
                            message: e.to_string(),
                        });
                        ExitInfo::default()
                    }
                };
                if let Some(tx) = ready_tx.take() {
                    let _ = tx.send(Err(exit));
                }
                warn!(generation, code = ?exit.code, signal = ?exit.signal, "Transcoder exited");
                let _ = ctx.events.send(SupervisorEvent::Exited { generation, exit, requested: false });
                return;
            }
        }
    }
}

/// Graceful stop, then kill after the grace period.
async fn shutdown(child: &mut dyn ChildProcess, grace: Duration, kill_timeout: Duration) -> ExitInfo {
    if let Err(e) = child.terminate().await {
        debug!("Graceful terminate failed: {}", e);
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(exit)) => return exit,
        Ok(Err(e)) => warn!("Waiting for transcoder failed: {}", e),
        Err(_) => warn!(?grace, "Transcoder ignored graceful stop, killing"),
    }

    if let Err(e) = child.kill() {
        warn!("Kill failed: {}", e);
    }
    match tokio::time::timeout(kill_timeout, child.wait()).await {
        Ok(Ok(exit)) => exit,
        _ => {
            error!("Transcoder did not exit after kill");
            ExitInfo::default()
        }
    }
}
