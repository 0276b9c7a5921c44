use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

/// Who produced a transcript turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Agent,
}

/// One turn of conversation as reported by the agent peer.
#[derive(Debug, Clone, Serialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// In-memory per-call transcripts, keyed by call SID.
///
/// Append-only while a session runs; reads hand out a snapshot so a
/// concurrent append never races a reader.
#[derive(Clone, Default)]
pub struct TranscriptStore {
    inner: Arc<Mutex<HashMap<String, Vec<Turn>>>>,
}

impl TranscriptStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a fresh transcript for a call, replacing any previous one.
    pub async fn begin(&self, call_sid: &str) {
        self.inner
            .lock()
            .await
            .insert(call_sid.to_string(), Vec::new());
    }

    pub async fn append(&self, call_sid: &str, role: Role, text: String) {
        let mut map = self.inner.lock().await;
        map.entry(call_sid.to_string()).or_default().push(Turn {
            role,
            text,
            timestamp: Utc::now(),
        });
    }

    /// Snapshot of a call's transcript, in append order.
    pub async fn read(&self, call_sid: &str) -> Option<Vec<Turn>> {
        self.inner.lock().await.get(call_sid).cloned()
    }
}
