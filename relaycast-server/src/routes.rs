//! HTTP surface: composition control and signalling routes.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use relaycast_engine::{ControllerHandle, GatewayError, GatewayResponse, GatewayResult, SessionGateway};
use relaycast_ipc::{
    CodecDescriptor, CompositionMetrics, CompositionStatus, ControllerCommand, MediaKind,
    RtpCapabilities, SessionId,
};
use relaycast_transport::{RemoteAddr, TransportDirection};

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub controller: ControllerHandle,
    pub gateway: Arc<SessionGateway>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/composition", get(composition))
        .route("/api/composition/restart", post(restart))
        .route("/api/output/clear", post(clear_output))
        .route("/api/capabilities", get(capabilities))
        .route("/api/sessions", post(open_session))
        .route("/api/sessions/{session_id}", delete(close_session))
        .route("/api/sessions/{session_id}/transports", post(create_transport))
        .route(
            "/api/sessions/{session_id}/transports/{transport_id}/connect",
            post(connect_transport),
        )
        .route(
            "/api/sessions/{session_id}/transports/{transport_id}/produce",
            post(produce),
        )
        .route(
            "/api/sessions/{session_id}/transports/{transport_id}/consume",
            post(consume),
        )
        .route(
            "/api/sessions/{session_id}/consumers/{consumer_id}/resume",
            post(resume_consumer),
        )
        .route(
            "/api/sessions/{session_id}/producers/{producer_id}",
            delete(close_producer),
        )
        .with_state(state)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CompositionView {
    pub status: CompositionStatus,
    pub metrics: CompositionMetrics,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Ack {
    pub ok: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionCreated {
    pub session_id: SessionId,
}

#[derive(Debug, Deserialize)]
pub struct CreateTransportRequest {
    pub direction: TransportDirection,
}

#[derive(Debug, Deserialize)]
pub struct ProduceRequest {
    pub kind: MediaKind,
    pub codec: CodecDescriptor,
}

#[derive(Debug, Deserialize)]
pub struct ConsumeRequest {
    pub producer_id: String,
    pub rtp_capabilities: RtpCapabilities,
}

async fn composition(State(state): State<AppState>) -> Json<CompositionView> {
    Json(CompositionView {
        status: state.controller.status(),
        metrics: state.controller.metrics(),
    })
}

async fn restart(State(state): State<AppState>) -> Response {
    command(&state, ControllerCommand::Restart).await
}

async fn clear_output(State(state): State<AppState>) -> Response {
    command(&state, ControllerCommand::ClearOutput).await
}

async fn command(state: &AppState, command: ControllerCommand) -> Response {
    info!(?command, "HTTP command");
    match state.controller.send(command).await {
        Ok(()) => (StatusCode::ACCEPTED, Json(Ack { ok: true })).into_response(),
        Err(e) => {
            warn!("Command rejected: {}", e);
            let body: GatewayResponse<Ack> = GatewayResponse::Error {
                error: e.to_string(),
            };
            (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
        }
    }
}

async fn capabilities(State(state): State<AppState>) -> Json<RtpCapabilities> {
    Json(state.gateway.capabilities())
}

async fn open_session(State(state): State<AppState>) -> Response {
    let session_id = state.gateway.open_session();
    (StatusCode::CREATED, Json(SessionCreated { session_id })).into_response()
}

async fn close_session(State(state): State<AppState>, Path(session_id): Path<String>) -> Response {
    reply(state.gateway.close_session(&session_id).await.map(ack))
}

async fn create_transport(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(request): Json<CreateTransportRequest>,
) -> Response {
    reply(
        state
            .gateway
            .create_transport(&session_id, request.direction)
            .await,
    )
}

async fn connect_transport(
    State(state): State<AppState>,
    Path((session_id, transport_id)): Path<(String, String)>,
    Json(remote): Json<RemoteAddr>,
) -> Response {
    reply(
        state
            .gateway
            .connect_transport(&session_id, &transport_id, remote)
            .await
            .map(ack),
    )
}

async fn produce(
    State(state): State<AppState>,
    Path((session_id, transport_id)): Path<(String, String)>,
    Json(request): Json<ProduceRequest>,
) -> Response {
    reply(
        state
            .gateway
            .produce(&session_id, &transport_id, request.kind, request.codec)
            .await,
    )
}

async fn consume(
    State(state): State<AppState>,
    Path((session_id, transport_id)): Path<(String, String)>,
    Json(request): Json<ConsumeRequest>,
) -> Response {
    reply(
        state
            .gateway
            .consume(
                &session_id,
                &transport_id,
                &request.producer_id,
                &request.rtp_capabilities,
            )
            .await,
    )
}

async fn resume_consumer(
    State(state): State<AppState>,
    Path((session_id, consumer_id)): Path<(String, String)>,
) -> Response {
    reply(
        state
            .gateway
            .resume_consumer(&session_id, &consumer_id)
            .await
            .map(ack),
    )
}

async fn close_producer(
    State(state): State<AppState>,
    Path((session_id, producer_id)): Path<(String, String)>,
) -> Response {
    reply(
        state
            .gateway
            .close_producer(&session_id, &producer_id)
            .await
            .map(ack),
    )
}

fn ack(_: ()) -> Ack {
    Ack { ok: true }
}

fn status_for(error: &GatewayError) -> StatusCode {
    match error {
        GatewayError::UnknownSession(_)
        | GatewayError::UnknownTransport(_)
        | GatewayError::UnknownConsumer(_) => StatusCode::NOT_FOUND,
        GatewayError::NotOwner(_) => StatusCode::FORBIDDEN,
        GatewayError::CannotConsume(_) => StatusCode::UNPROCESSABLE_ENTITY,
        GatewayError::Registry(_) => StatusCode::CONFLICT,
        GatewayError::Transport(e) if e.is_unavailable() => StatusCode::SERVICE_UNAVAILABLE,
        GatewayError::Transport(_) => StatusCode::BAD_REQUEST,
    }
}

fn reply<T: Serialize>(result: GatewayResult<T>) -> Response {
    let status = match &result {
        Ok(_) => StatusCode::OK,
        Err(e) => {
            warn!("Signalling request failed: {}", e);
            status_for(e)
        }
    };
    (status, Json(GatewayResponse::from(result))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::{IpAddr, Ipv4Addr};

    use axum::body::Body;
    use axum::http::Request;
    use serde_json::Value;
    use tokio::task::JoinHandle;
    use tower::ServiceExt;

    use relaycast_engine::{create_controller, ControllerConfig, ControllerDeps, ProducerRegistry};
    use relaycast_ipc::OutputTarget;
    use relaycast_transcoder::CommandSpawner;
    use relaycast_transport::{MediaEngine, RelayConfig, UdpRelayConfig, UdpRelayEngine};

    struct TestApp {
        router: Router,
        controller: ControllerHandle,
        task: JoinHandle<()>,
        _dir: tempfile::TempDir,
    }

    fn app() -> TestApp {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ControllerConfig::default();
        config.output = OutputTarget::new(dir.path().join("hls"));
        config.transcoder.work_dir = dir.path().join("work");
        config.transcoder.program = dir.path().join("missing-transcoder");

        let engine: Arc<dyn MediaEngine> = Arc::new(UdpRelayEngine::new(UdpRelayConfig {
            listen_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ..UdpRelayConfig::default()
        }));
        let registry = ProducerRegistry::shared();
        let deps = ControllerDeps {
            engine: engine.clone(),
            relay: RelayConfig::default(),
            spawner: Arc::new(CommandSpawner),
            registry: registry.clone(),
        };
        let (event_tx, _event_rx) = crossbeam_channel::unbounded();
        let (controller, handle) = create_controller(config, deps, event_tx);
        let task = tokio::spawn(controller.run());

        let gateway = Arc::new(SessionGateway::new(engine, registry, handle.sender()));
        let router = router(AppState {
            controller: handle.clone(),
            gateway,
        });

        TestApp {
            router,
            controller: handle,
            task,
            _dir: dir,
        }
    }

    async fn call(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn shutdown(app: TestApp) {
        app.controller.send(ControllerCommand::Shutdown).await.unwrap();
        app.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_composition_reports_idle_without_producers() {
        let app = app();
        let (status, body) = call(&app.router, "GET", "/api/composition", None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"]["state"], "idle");
        assert_eq!(body["metrics"]["restarts"], 0);
        shutdown(app).await;
    }

    #[tokio::test]
    async fn test_restart_and_clear_are_accepted() {
        let app = app();

        let (status, body) = call(&app.router, "POST", "/api/composition/restart", None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["ok"], true);

        let (status, _) = call(&app.router, "POST", "/api/output/clear", None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        shutdown(app).await;
    }

    #[tokio::test]
    async fn test_commands_fail_once_controller_stopped() {
        let app = app();
        let router = app.router.clone();
        shutdown(app).await;

        let (status, body) = call(&router, "POST", "/api/composition/restart", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body["error"].as_str().unwrap().contains("not running"));
    }

    #[tokio::test]
    async fn test_unknown_session_returns_error_shape() {
        let app = app();
        let (status, body) = call(
            &app.router,
            "POST",
            "/api/sessions/nope/transports",
            Some(serde_json::json!({ "direction": "receive" })),
        )
        .await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Unknown session: nope");
        shutdown(app).await;
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let app = app();

        let (status, body) = call(&app.router, "POST", "/api/sessions", None).await;
        assert_eq!(status, StatusCode::CREATED);
        let session_id = body["session_id"].as_str().unwrap().to_string();

        let (status, body) = call(
            &app.router,
            "POST",
            &format!("/api/sessions/{session_id}/transports"),
            Some(serde_json::json!({ "direction": "receive" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["direction"], "receive");
        assert!(body["id"].as_str().is_some());

        let (status, body) = call(
            &app.router,
            "DELETE",
            &format!("/api/sessions/{session_id}/producers/unknown"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(body["error"].as_str().is_some());

        let (status, _) = call(
            &app.router,
            "DELETE",
            &format!("/api/sessions/{session_id}"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = call(
            &app.router,
            "DELETE",
            &format!("/api/sessions/{session_id}"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        shutdown(app).await;
    }

    #[tokio::test]
    async fn test_capabilities_lists_codecs() {
        let app = app();
        let (status, body) = call(&app.router, "GET", "/api/capabilities", None).await;

        assert_eq!(status, StatusCode::OK);
        assert!(!body["codecs"].as_array().unwrap().is_empty());
        shutdown(app).await;
    }
}
