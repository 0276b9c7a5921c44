use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Form, Json};
use serde::Deserialize;
use serde_json::json;

use crate::AppState;

/// Call statuses after which no further media can flow.
const TERMINAL_STATUSES: [&str; 5] = ["completed", "busy", "no-answer", "failed", "canceled"];

#[derive(Debug, Deserialize)]
pub struct TwimlParams {
    #[serde(rename = "reqId")]
    req_id: Option<String>,
}

/// Handle POST /twilio/outbound_twiml — TwiML webhook for outbound calls.
///
/// When the callee picks up, Twilio fetches this URL and gets TwiML that
/// connects the call to our media-stream WebSocket. The request ID rides
/// along in the stream URL so the WebSocket can recover the call context.
pub async fn outbound_twiml(Query(params): Query<TwimlParams>, headers: HeaderMap) -> Response {
    let Some(req_id) = params.req_id else {
        return (StatusCode::BAD_REQUEST, "missing reqId").into_response();
    };

    let host = request_host(&headers);
    tracing::info!(req_id = %req_id, host = %host, "Serving stream TwiML");

    (
        [(header::CONTENT_TYPE, "text/xml")],
        stream_twiml(&host, &req_id),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
pub struct CallStatusForm {
    #[serde(rename = "CallSid")]
    call_sid: String,
    #[serde(rename = "CallStatus")]
    call_status: String,
}

/// Handle POST /twilio/call_status — call-progress callback.
///
/// Terminal statuses release the call's registry entry and decrement the
/// active-call gauge, once per call SID no matter how often Twilio
/// retries the callback.
pub async fn call_status(
    State(state): State<AppState>,
    Form(form): Form<CallStatusForm>,
) -> Json<serde_json::Value> {
    tracing::info!(call_sid = %form.call_sid, status = %form.call_status, "Call status");

    if TERMINAL_STATUSES.contains(&form.call_status.as_str()) {
        if state.registry.clear_active(&form.call_sid).await {
            state.metrics.call_ended();
        }
        state.registry.forget_call(&form.call_sid).await;
    }

    Json(json!({ "status": "received" }))
}

/// TwiML connecting an answered call to the media-stream WebSocket.
fn stream_twiml(host: &str, req_id: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<Response>
  <Connect>
    <Stream url="{}/media-stream?reqId={}" />
  </Connect>
</Response>"#,
        ws_base(host),
        req_id
    )
}

/// Host of the inbound request, as the caller reached us.
pub fn request_host(headers: &HeaderMap) -> String {
    headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost")
        .to_string()
}

/// WebSocket base URL for a host: wss, or ws for loopback.
pub fn ws_base(host: &str) -> String {
    let scheme = if host_is_loopback(host) { "ws" } else { "wss" };
    format!("{scheme}://{host}")
}

/// HTTP base URL for a host: https, or http for loopback.
pub fn http_base(host: &str) -> String {
    let scheme = if host_is_loopback(host) { "http" } else { "https" };
    format!("{scheme}://{host}")
}

fn host_is_loopback(host: &str) -> bool {
    let name = if let Some(rest) = host.strip_prefix('[') {
        rest.split(']').next().unwrap_or(rest)
    } else {
        host.split(':').next().unwrap_or(host)
    };
    matches!(name, "localhost" | "127.0.0.1" | "::1")
}
