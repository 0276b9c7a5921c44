use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::registry::CallContext;
use crate::twilio::client::{is_valid_e164, OutboundError};
use crate::twilio::webhook::{http_base, request_host};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct OutboundCallRequest {
    /// Destination number, E.164.
    pub to: Option<String>,
    /// Caller ID; defaults to the configured Twilio number.
    pub from: Option<String>,
    pub script: Option<String>,
    pub persona: Option<String>,
    pub context: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct OutboundCallResponse {
    pub success: bool,
    #[serde(rename = "callSid")]
    pub call_sid: String,
    pub to: String,
    pub from: String,
    pub status: String,
    #[serde(rename = "reqId")]
    pub req_id: String,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    success: bool,
    error: String,
}

/// POST /twilio/outbound_call — place a call and register its context.
///
/// The minted request ID links this request to the media-stream WebSocket
/// Twilio opens later: it rides through the TwiML URL, and the stream
/// handler uses it to recover the script/persona/context for the agent.
pub async fn outbound_call(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<OutboundCallRequest>,
) -> impl IntoResponse {
    let to = match req.to {
        Some(to) if is_valid_e164(&to) => to,
        Some(to) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                format!("`to` is not a valid E.164 number: {to}"),
            );
        }
        None => {
            return error_response(StatusCode::BAD_REQUEST, "`to` is required".to_string());
        }
    };
    let from = req
        .from
        .unwrap_or_else(|| state.twilio.default_from().to_string());

    let req_id = generate_request_id();
    let base = http_base(&request_host(&headers));
    let twiml_url = format!("{base}/twilio/outbound_twiml?reqId={req_id}");
    let status_url = format!("{base}/twilio/call_status");

    tracing::info!(to = %to, req_id = %req_id, "Outbound call requested");

    match state.twilio.place_call(&to, &from, &twiml_url, &status_url).await {
        Ok(call) => {
            state
                .registry
                .put(CallContext {
                    call_sid: Some(call.sid.clone()),
                    script: req.script,
                    persona: req.persona,
                    context: req.context,
                    ..CallContext::new(req_id.clone())
                })
                .await;
            state.metrics.call_started();

            (
                StatusCode::OK,
                Json(OutboundCallResponse {
                    success: true,
                    call_sid: call.sid,
                    to,
                    from,
                    status: call.status,
                    req_id,
                    timestamp: Utc::now().to_rfc3339(),
                }),
            )
                .into_response()
        }
        Err(OutboundError::InvalidNumber(number)) => error_response(
            StatusCode::BAD_REQUEST,
            format!("`to` is not a valid E.164 number: {number}"),
        ),
        Err(e) => {
            tracing::error!("Failed to create call: {e}");
            state.metrics.provider_error();
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

fn error_response(status: StatusCode, error: String) -> axum::response::Response {
    (
        status,
        Json(ErrorResponse {
            success: false,
            error,
        }),
    )
        .into_response()
}

/// Opaque 16-hex-char request ID.
fn generate_request_id() -> String {
    format!("{:016x}", rand::random::<u64>())
}
