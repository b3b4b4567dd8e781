//! Operator HTTP surface and UI WebSocket
//!
//! Every endpoint answers JSON. Supervision failures come back as
//! `{"success": false, "error": ...}` with status 500; unknown routes,
//! wrong methods and failed upgrades use the same body.

use std::future::Future;
use std::sync::Arc;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use super::{HealthReport, PipelineSupervisor, StartReport, StopReport};
use crate::error::SupervisionError;

type AppState = Arc<PipelineSupervisor>;

/// JSON error body for supervision failures
#[derive(Debug)]
pub struct AppError(SupervisionError);

impl From<SupervisionError> for AppError {
    fn from(err: SupervisionError) -> Self {
        AppError(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        error!("Supervision error: {}", self.0);
        json_error(StatusCode::INTERNAL_SERVER_ERROR, &self.0.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Create the router with all routes
pub fn router(supervisor: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let static_dir = supervisor.config().supervisor.static_dir.clone();

    let app = Router::new()
        .route("/start-capture", post(start_capture))
        .route("/start-inference", post(start_inference))
        .route("/stop-all", post(stop_all))
        .route("/health", get(health))
        // Legacy names used by the original dashboard
        .route("/start-packet-capture", post(start_capture))
        .route("/start-prediction-api", post(start_inference))
        .route("/stop-services", post(stop_all))
        .route("/health-check", get(legacy_health))
        .route("/ws", get(ws_handler))
        .method_not_allowed_fallback(method_not_allowed);

    let app = match static_dir {
        Some(dir) => app.fallback_service(ServeDir::new(dir)),
        None => app.fallback(not_found),
    };

    app.layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(supervisor)
}

/// Serve until `shutdown` resolves
pub async fn serve(
    supervisor: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let addr = supervisor.config().supervisor.listen_addr.clone();
    let listener = TcpListener::bind(&addr).await?;
    info!("Supervisor listening on {}", listener.local_addr()?);
    axum::serve(listener, router(supervisor))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn start_capture(State(sup): State<AppState>) -> AppResult<Json<StartReport>> {
    Ok(Json(sup.start_capture().await?))
}

async fn start_inference(State(sup): State<AppState>) -> AppResult<Json<StartReport>> {
    Ok(Json(sup.start_inference().await?))
}

async fn stop_all(State(sup): State<AppState>) -> Json<StopReport> {
    Json(sup.stop_all().await)
}

async fn health(State(sup): State<AppState>) -> Json<HealthReport> {
    Json(sup.health())
}

async fn legacy_health(State(sup): State<AppState>) -> Json<serde_json::Value> {
    let h = sup.health();
    Json(json!({
        "api_healthy": h.inference_alive,
        "capture_healthy": h.capture_alive,
        "websocket_connected": h.link_connected,
    }))
}

async fn ws_handler(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    State(sup): State<AppState>,
) -> Response {
    match ws {
        Ok(ws) => ws.on_upgrade(move |socket| handle_socket(socket, sup)),
        Err(rejection) => json_error(rejection.status(), &rejection.body_text()),
    }
}

async fn not_found() -> Response {
    json_error(StatusCode::NOT_FOUND, "Not found")
}

async fn method_not_allowed() -> Response {
    json_error(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed")
}

fn json_error(status: StatusCode, message: &str) -> Response {
    let body = Json(json!({
        "success": false,
        "error": message,
    }));
    (status, body).into_response()
}

async fn handle_socket(mut socket: WebSocket, sup: AppState) {
    let (id, mut rx) = sup.ui().subscribe();
    debug!("UI subscriber {} connected", id);

    let hello = json!({ "connected": true }).to_string();
    if socket.send(Message::Text(hello.into())).await.is_ok() {
        loop {
            tokio::select! {
                // Forward predictions to the browser
                msg = rx.recv() => {
                    match msg {
                        Some(text) => {
                            if socket.send(Message::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                incoming = socket.recv() => {
                    match incoming {
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                        Some(Ok(_)) => {}
                    }
                }
            }
        }
    }

    sup.ui().unsubscribe(id);
    debug!("UI subscriber {} disconnected", id);
}
