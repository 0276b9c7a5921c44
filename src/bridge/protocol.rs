//! Twilio media-stream frame types.
//!
//! All frames are JSON text tagged by `event`. Media payloads are
//! base64-encoded mu-law at 8 kHz and pass through this service opaque.

use serde::Deserialize;
use serde_json::json;

/// Events received from the telephony peer.
#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum StreamEvent {
    Connected {
        #[serde(default)]
        protocol: Option<String>,
    },
    Start {
        start: StartMetadata,
    },
    Media {
        media: MediaPayload,
    },
    Mark,
    Stop,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartMetadata {
    pub stream_sid: String,
    #[serde(default)]
    pub call_sid: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MediaPayload {
    /// base64-encoded mu-law audio
    pub payload: String,
}

/// Agent audio for playback, tagged with the session's stream SID.
pub fn media_frame(stream_sid: &str, payload: &str) -> String {
    json!({
        "event": "media",
        "streamSid": stream_sid,
        "media": { "payload": payload }
    })
    .to_string()
}

/// Barge-in: tell the provider to drop queued playback.
pub fn clear_frame(stream_sid: &str) -> String {
    json!({
        "event": "clear",
        "streamSid": stream_sid,
    })
    .to_string()
}
