//! `/predict` test endpoint
//!
//! Runs a posted feature frame through the same prediction path as frames
//! arriving on the link. A top-level error answers 400; per-profile
//! failures are reported inline with 200.

use std::future::Future;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::info;

use super::Predictor;
use crate::link::messages::FeatureFrame;

pub fn router(predictor: Arc<Predictor>) -> Router {
    Router::new()
        .route("/predict", post(predict))
        .route("/health", get(health))
        .fallback(not_found)
        .method_not_allowed_fallback(method_not_allowed)
        .with_state(predictor)
}

/// Serve the router until `shutdown` resolves
pub async fn serve(
    addr: &str,
    predictor: Arc<Predictor>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Prediction API listening on {}", listener.local_addr()?);
    axum::serve(listener, router(predictor))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn predict(State(predictor): State<Arc<Predictor>>, body: Bytes) -> Response {
    let value: Value = if body.iter().all(u8::is_ascii_whitespace) {
        Value::Null
    } else {
        match serde_json::from_slice(&body) {
            Ok(value) => value,
            Err(e) => return bad_request(&format!("Invalid JSON: {}", e)),
        }
    };
    if is_empty(&value) {
        return bad_request("No input data provided");
    }

    let frame: FeatureFrame = match serde_json::from_value(value) {
        Ok(frame) => frame,
        Err(e) => return bad_request(&format!("Invalid feature frame: {}", e)),
    };

    let result = predictor.predict(&frame).await;
    let status = if result.error.is_some() {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::OK
    };
    (status, Json(result)).into_response()
}

async fn health(State(predictor): State<Arc<Predictor>>) -> Json<Value> {
    Json(json!({ "ready": predictor.is_ready().await }))
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

async fn not_found() -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "Not found" }))).into_response()
}

async fn method_not_allowed() -> Response {
    (StatusCode::METHOD_NOT_ALLOWED, Json(json!({ "error": "Method not allowed" }))).into_response()
}

fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}
