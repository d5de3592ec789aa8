//! The control plane's HTTP surface (spec §4.7, §6): GET status, a
//! path-addressed COMMAND route, a JSON-body COMMAND route, and a
//! WebSocket that mirrors every NOTIFY/DASHBOARD event flowing through the
//! [`EventBus`] while accepting COMMANDs pushed back from the peer.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;

use crate::config::dashboard::{DashboardBlock, DashboardRegistry};
use crate::control::event_bus::EventBus;
use crate::control::message::ControlRequest;
use crate::core::runtime::CONTROL_REQUEST_TIMEOUT;
use crate::core::stage::{CommandSender, ControlCommand};

/// Every individual `/api/{req}/{node}/{params*}` path segment is capped at
/// this many bytes (spec §6); an oversized segment is rejected with 400
/// before any stage is even looked up.
const MAX_PARAM_BYTES: usize = 1000;

const WEBSOCKET_PING_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Clone)]
struct AppState {
    bus: EventBus,
    stage_ids: Arc<Vec<String>>,
    command_senders: Arc<HashMap<String, CommandSender>>,
    dashboard: Arc<DashboardRegistry>,
}

#[derive(Serialize)]
struct StatusResponse<'a> {
    stages: &'a [String],
    dashboard: Vec<&'a DashboardBlock>,
}

#[derive(Deserialize)]
struct ApiRequestBody {
    request: String,
    node: String,
    #[serde(default)]
    args: Vec<Value>,
}

fn error_body(message: impl Into<String>) -> Value {
    json!({"response": "ERROR", "data": message.into()})
}

fn ok_body() -> Value {
    json!({"response": "OK"})
}

/// Build the control-plane router. `stage_ids` is the static set of stage
/// ids in the running graph, reported by `GET /status`; `command_senders`
/// routes a `COMMAND` at the matching running stage's command channel;
/// `dashboard` is the block registry parsed from the `-d` flag, also
/// reported by `GET /status` so peers can label DASHBOARD events by id.
pub fn router(
    bus: EventBus,
    stage_ids: Vec<String>,
    command_senders: HashMap<String, CommandSender>,
    dashboard: DashboardRegistry,
) -> Router {
    let state = AppState {
        bus,
        stage_ids: Arc::new(stage_ids),
        command_senders: Arc::new(command_senders),
        dashboard: Arc::new(dashboard),
    };
    Router::new()
        .route("/status", get(status))
        .route("/api", get(websocket).post(command_post))
        .route("/api/:req/:node/*params", get(command_get))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the control plane on `addr` until the future is dropped.
pub async fn serve(
    bus: EventBus,
    stage_ids: Vec<String>,
    command_senders: HashMap<String, CommandSender>,
    dashboard: DashboardRegistry,
    addr: SocketAddr,
) -> std::io::Result<()> {
    let app = router(bus, stage_ids, command_senders, dashboard);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "control plane listening");
    axum::serve(listener, app).await
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    Json(StatusResponse {
        stages: &state.stage_ids,
        dashboard: state.dashboard.blocks().collect(),
    })
}

/// Dispatch a `COMMAND` at `node`'s command channel and await its reply.
/// `args` is the full argument array as the peer sent it (spec §6's
/// `receiveRequest(args)`); its first element also doubles as the action
/// name a stage's command loop matches on.
async fn dispatch_command(state: &AppState, node: &str, args: Vec<Value>) -> (StatusCode, Value) {
    let Some(sender) = state.command_senders.get(node) else {
        return (StatusCode::EXPECTATION_FAILED, error_body("unknown stage"));
    };
    let Some(action) = args.first().and_then(Value::as_str) else {
        return (
            StatusCode::EXPECTATION_FAILED,
            error_body("missing command action"),
        );
    };
    let action = action.to_string();
    let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
    let sent = sender.send(ControlCommand {
        action,
        args: Value::Array(args),
        reply: reply_tx,
    });
    if sent.is_err() {
        return (
            StatusCode::EXPECTATION_FAILED,
            error_body("stage is not accepting commands"),
        );
    }
    match tokio::time::timeout(CONTROL_REQUEST_TIMEOUT, reply_rx).await {
        Ok(Ok(_)) => (StatusCode::OK, ok_body()),
        Ok(Err(_)) => (
            StatusCode::EXPECTATION_FAILED,
            error_body("stage dropped the reply"),
        ),
        Err(_) => (
            StatusCode::EXPECTATION_FAILED,
            error_body("stage did not reply in time"),
        ),
    }
}

/// `GET /api/{req}/{node}/{params*}` (spec §6): `req` must be `COMMAND`;
/// the wildcard tail is split on `/` into the argument array.
async fn command_get(
    State(state): State<AppState>,
    Path((req, node, params)): Path<(String, String, String)>,
) -> axum::response::Response {
    if req != "COMMAND" {
        return (
            StatusCode::EXPECTATION_FAILED,
            Json(error_body(format!("unsupported request '{req}'"))),
        )
            .into_response();
    }

    let segments: Vec<&str> = if params.is_empty() {
        Vec::new()
    } else {
        params.split('/').collect()
    };
    if segments.iter().any(|s| s.len() > MAX_PARAM_BYTES) {
        return StatusCode::BAD_REQUEST.into_response();
    }
    let args: Vec<Value> = segments
        .into_iter()
        .map(|s| Value::String(s.to_string()))
        .collect();

    let (status, body) = dispatch_command(&state, &node, args).await;
    (status, Json(body)).into_response()
}

/// `POST /api` (spec §6): JSON body `{request:"COMMAND", node, args:[...]}`.
async fn command_post(
    State(state): State<AppState>,
    Json(body): Json<ApiRequestBody>,
) -> axum::response::Response {
    if body.request != "COMMAND" {
        return (
            StatusCode::EXPECTATION_FAILED,
            Json(error_body(format!("unsupported request '{}'", body.request))),
        )
            .into_response();
    }
    let (status, response) = dispatch_command(&state, &body.node, body.args).await;
    (status, Json(response)).into_response()
}

/// `/api` also accepts a WebSocket upgrade (spec §6): outbound NOTIFY and
/// DASHBOARD events mirror every message published on the [`EventBus`],
/// inbound text frames are parsed as COMMAND requests and dispatched the
/// same way the HTTP routes do, and a ping every 30 s keeps the peer alive.
async fn websocket(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let mut rx = state.bus.subscribe();
    let mut ping = tokio::time::interval(WEBSOCKET_PING_INTERVAL);
    ping.tick().await;
    loop {
        tokio::select! {
            event = rx.recv() => {
                let Ok(message) = event else { break };
                let Ok(text) = serde_json::to_string(&message) else { continue };
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            _ = ping.tick() => {
                if socket.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if let Ok(ControlRequest::Command { node, args }) =
                            serde_json::from_str::<ControlRequest>(&text)
                        {
                            let (_, response) = dispatch_command(&state, &node, args).await;
                            let Ok(reply) = serde_json::to_string(&response) else { continue };
                            if socket.send(Message::Text(reply)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn status_reports_configured_stage_ids() {
        let bus = EventBus::new();
        let app = router(bus, vec!["a".into(), "b".into()], HashMap::new(), DashboardRegistry::default());
        let response = axum::http::Request::builder()
            .uri("/status")
            .body(axum::body::Body::empty())
            .unwrap();
        use tower::ServiceExt;
        let resp = app.oneshot(response).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn command_get_dispatches_to_the_named_stage_and_returns_its_reply() {
        let bus = EventBus::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut senders = HashMap::new();
        senders.insert("vad-1".to_string(), tx);
        let app = router(bus, vec!["vad-1".into()], senders, DashboardRegistry::default());

        let responder = tokio::spawn(async move {
            let cmd = rx.recv().await.unwrap();
            assert_eq!(cmd.action, "mute");
            assert_eq!(cmd.args, json!(["mute"]));
            let _ = cmd.reply.send(serde_json::json!("OK"));
        });

        let request = axum::http::Request::builder()
            .uri("/api/COMMAND/vad-1/mute")
            .body(axum::body::Body::empty())
            .unwrap();
        use tower::ServiceExt;
        let resp = app.oneshot(request).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn command_get_splits_extra_params_into_the_argument_array() {
        let bus = EventBus::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut senders = HashMap::new();
        senders.insert("trace".to_string(), tx);
        let app = router(bus, vec!["trace".into()], senders, DashboardRegistry::default());

        let responder = tokio::spawn(async move {
            let cmd = rx.recv().await.unwrap();
            assert_eq!(cmd.action, "seek");
            assert_eq!(cmd.args, json!(["seek", "120"]));
            let _ = cmd.reply.send(serde_json::json!("OK"));
        });

        let request = axum::http::Request::builder()
            .uri("/api/COMMAND/trace/seek/120")
            .body(axum::body::Body::empty())
            .unwrap();
        use tower::ServiceExt;
        let resp = app.oneshot(request).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn command_get_returns_417_for_unknown_stage() {
        let bus = EventBus::new();
        let app = router(bus, vec![], HashMap::new(), DashboardRegistry::default());
        let request = axum::http::Request::builder()
            .uri("/api/COMMAND/nope/mute")
            .body(axum::body::Body::empty())
            .unwrap();
        use tower::ServiceExt;
        let resp = app.oneshot(request).await.unwrap();
        assert_eq!(resp.status(), StatusCode::EXPECTATION_FAILED);
    }

    #[tokio::test]
    async fn command_get_returns_400_for_an_oversized_param() {
        let bus = EventBus::new();
        let app = router(bus, vec![], HashMap::new(), DashboardRegistry::default());
        let oversized = "x".repeat(MAX_PARAM_BYTES + 1);
        let request = axum::http::Request::builder()
            .uri(format!("/api/COMMAND/trace/{oversized}"))
            .body(axum::body::Body::empty())
            .unwrap();
        use tower::ServiceExt;
        let resp = app.oneshot(request).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn command_post_dispatches_the_json_body_envelope() {
        let bus = EventBus::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut senders = HashMap::new();
        senders.insert("vad-1".to_string(), tx);
        let app = router(bus, vec!["vad-1".into()], senders, DashboardRegistry::default());

        let responder = tokio::spawn(async move {
            let cmd = rx.recv().await.unwrap();
            assert_eq!(cmd.action, "mute");
            let _ = cmd.reply.send(serde_json::json!("OK"));
        });

        let body = json!({"request": "COMMAND", "node": "vad-1", "args": ["mute"]});
        let request = axum::http::Request::builder()
            .uri("/api")
            .method("POST")
            .header("content-type", "application/json")
            .body(axum::body::Body::from(body.to_string()))
            .unwrap();
        use tower::ServiceExt;
        let resp = app.oneshot(request).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        responder.await.unwrap();
    }
}
