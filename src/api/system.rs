use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde_json::json;

use crate::AppState;

/// GET / — service banner.
pub async fn root(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339(),
        "port": state.config.port,
        "env": state.config.environment,
    }))
}

/// GET /health — liveness probe.
pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "uptime": state.started_at.elapsed().as_secs_f64(),
    }))
}

/// GET /metrics — Prometheus text exposition.
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain")],
        state.metrics.render(),
    )
}

/// GET /transcripts/{call_sid} — snapshot of a call's transcript.
pub async fn transcript(
    State(state): State<AppState>,
    Path(call_sid): Path<String>,
) -> Response {
    match state.transcripts.read(&call_sid).await {
        Some(turns) => Json(json!({
            "callSid": call_sid,
            "transcript": turns,
        }))
        .into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("No transcript for call {call_sid}") })),
        )
            .into_response(),
    }
}
