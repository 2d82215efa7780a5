//! relaycast server binary.
//!
//! Wires the UDP relay engine, the composition controller and the session
//! gateway together behind an HTTP API.

mod config;
mod routes;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::Receiver;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use relaycast_engine::{create_controller, ControllerDeps, ProducerRegistry, SessionGateway};
use relaycast_ipc::{event_channel, ControllerCommand, ControllerEvent};
use relaycast_transcoder::CommandSpawner;
use relaycast_transport::{MediaEngine, UdpRelayEngine};

use crate::config::ServerConfig;
use crate::routes::AppState;

#[derive(Parser, Debug)]
#[command(name = "relaycast")]
#[command(about = "Composites live producers into a single HLS output", long_about = None)]
struct Args {
    /// Configuration file (TOML or JSON)
    #[arg(short, long, env = "RELAYCAST_CONFIG")]
    config: Option<PathBuf>,

    /// HTTP listen address, overrides the configured one
    #[arg(long)]
    listen: Option<SocketAddr>,
}

/// Initialize logging.
fn init_logging() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "relaycast_server=info,relaycast_engine=debug,relaycast_transport=info,relaycast_transcoder=info,relaycast_fallback=info".into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Drain controller events into the log until the controller drops its sender.
fn log_events(events: Receiver<ControllerEvent>) {
    while let Ok(event) = events.recv() {
        match event {
            ControllerEvent::StateChanged { previous, current } => {
                info!(from = previous.name(), to = current.name(), "Composition state changed");
            }
            ControllerEvent::Metrics(metrics) => {
                debug!(
                    generation = metrics.generation,
                    restarts = metrics.restarts,
                    abnormal_exits = metrics.abnormal_exits,
                    "Composition metrics"
                );
            }
            ControllerEvent::Diagnostic { generation, line } => {
                debug!(generation, "transcoder: {}", line);
            }
            ControllerEvent::ProducerExcluded {
                producer_id,
                reason,
            } => {
                warn!(%producer_id, "Producer excluded: {}", reason);
            }
            ControllerEvent::FallbackWritten { kind, tier } => {
                info!(?kind, ?tier, "Fallback content written");
            }
            ControllerEvent::Ready => info!("Composition controller ready"),
            ControllerEvent::Shutdown => info!("Composition controller stopped"),
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", e);
    }
    info!("Shutdown requested");
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let args = Args::parse();
    let mut config = ServerConfig::load(args.config.as_deref()).context("loading configuration")?;
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    info!(
        listen = %config.listen,
        output = %config.controller.output.dir.display(),
        "relaycast starting"
    );

    let engine: Arc<dyn MediaEngine> = Arc::new(UdpRelayEngine::new(config.udp.clone()));
    let registry = ProducerRegistry::shared();

    let (event_tx, event_rx) = event_channel();
    let events = thread::Builder::new()
        .name("relaycast-events".to_string())
        .spawn(move || log_events(event_rx))
        .context("spawning event logger")?;

    let deps = ControllerDeps {
        engine: engine.clone(),
        relay: config.relay.clone(),
        spawner: Arc::new(CommandSpawner),
        registry: registry.clone(),
    };
    let (controller, handle) = create_controller(config.controller.clone(), deps, event_tx);
    let controller_task = tokio::spawn(controller.run());

    let gateway = Arc::new(SessionGateway::new(engine, registry, handle.sender()));
    let watcher = gateway.spawn_producer_watcher();

    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("binding {}", config.listen))?;
    info!("HTTP API listening on {}", config.listen);

    let app = routes::router(AppState {
        controller: handle.clone(),
        gateway,
    });
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    // Stop the controller even if the server failed.
    if handle.send(ControllerCommand::Shutdown).await.is_err() {
        warn!("Controller already stopped");
    }
    if let Err(e) = controller_task.await {
        error!("Controller task failed: {}", e);
    }
    watcher.abort();
    if events.join().is_err() {
        error!("Event logger panicked");
    }

    served.context("serving HTTP API")?;
    info!("relaycast stopped");
    Ok(())
}
