pub mod agent;
pub mod protocol;
pub mod session;

use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct StreamParams {
    #[serde(rename = "reqId")]
    req_id: Option<String>,
}

/// WebSocket upgrade handler for GET /media-stream.
///
/// The request ID in the query string is the only link back to the
/// outbound-call context, so a request without one is refused outright.
pub async fn handle_media_upgrade(
    ws: WebSocketUpgrade,
    Query(params): Query<StreamParams>,
    State(state): State<AppState>,
) -> Response {
    let Some(req_id) = params.req_id else {
        return (StatusCode::BAD_REQUEST, "missing reqId").into_response();
    };
    ws.on_upgrade(move |socket| session::run(socket, state, req_id))
}
