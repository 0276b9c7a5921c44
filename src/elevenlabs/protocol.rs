//! Frame types for the conversational-agent WebSocket.
//!
//! Inbound frames are JSON text tagged by `type`; audio rides as opaque
//! base64 strings in both directions.

use serde::Deserialize;
use serde_json::json;

/// Events received from the agent peer.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// Session is ready: buffered caller audio may flow.
    ConversationInitiationMetadata,
    Audio {
        audio_event: AudioEvent,
    },
    /// Caller spoke over agent playback; queued audio must be discarded.
    Interruption,
    Ping {
        ping_event: PingEvent,
    },
    UserTranscript {
        user_transcription_event: UserTranscription,
    },
    AgentResponse {
        agent_response_event: AgentResponse,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
pub struct AudioEvent {
    pub audio_base_64: String,
}

#[derive(Debug, Deserialize)]
pub struct PingEvent {
    /// Echoed verbatim in the pong; the provider has used both strings
    /// and integers here.
    pub event_id: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct UserTranscription {
    pub user_transcript: String,
}

#[derive(Debug, Deserialize)]
pub struct AgentResponse {
    pub agent_response: String,
}

/// Per-call conversation overrides passed through from the control plane.
#[derive(Debug, Clone, Default)]
pub struct ConversationInit {
    pub script: Option<String>,
    pub persona: Option<String>,
    pub context: Option<String>,
}

impl ConversationInit {
    pub fn is_empty(&self) -> bool {
        self.script.is_none() && self.persona.is_none() && self.context.is_none()
    }
}

/// First frame after the agent socket opens, carrying only the populated
/// override fields. None when there is nothing to send.
pub fn initiation_frame(init: &ConversationInit) -> Option<String> {
    if init.is_empty() {
        return None;
    }

    let mut data = serde_json::Map::new();
    if let Some(script) = &init.script {
        data.insert("script".to_string(), json!(script));
    }
    if let Some(persona) = &init.persona {
        data.insert("persona".to_string(), json!(persona));
    }
    if let Some(context) = &init.context {
        data.insert("context".to_string(), json!(context));
    }

    Some(
        json!({
            "type": "conversation_initiation_client_data",
            "conversation_initiation_client_data": data,
        })
        .to_string(),
    )
}

/// One caller audio chunk, live or replayed from the pending buffer.
pub fn audio_chunk_frame(payload: &str) -> String {
    json!({ "user_audio_chunk": payload }).to_string()
}

/// Keepalive reply, pairing the ping's own event id.
pub fn pong_frame(event_id: &serde_json::Value) -> String {
    json!({ "type": "pong", "event_id": event_id }).to_string()
}
