use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

/// Per-call context captured at outbound-call creation.
///
/// Carried from the control plane to the later media-stream WebSocket via
/// the request ID embedded in the stream URL.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub request_id: String,
    /// Twilio call SID, assigned once the call is created.
    pub call_sid: Option<String>,
    pub script: Option<String>,
    pub persona: Option<String>,
    pub context: Option<String>,
    pub created_at: Instant,
}

impl CallContext {
    pub fn new(request_id: String) -> Self {
        Self {
            request_id,
            call_sid: None,
            script: None,
            persona: None,
            context: None,
            created_at: Instant::now(),
        }
    }
}

/// Registry of pending and active calls, keyed by request ID.
///
/// Entries live from outbound-call creation until a terminal call status
/// or the TTL sweep removes them. Also tracks which call SIDs are still
/// active so terminal status callbacks decrement the gauge exactly once.
#[derive(Clone, Default)]
pub struct CallRegistry {
    inner: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    contexts: HashMap<String, CallContext>,
    active_sids: HashSet<String>,
}

impl CallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a call context under its request ID.
    pub async fn put(&self, context: CallContext) {
        let mut state = self.inner.lock().await;
        if let Some(sid) = &context.call_sid {
            state.active_sids.insert(sid.clone());
        }
        tracing::debug!(
            request_id = %context.request_id,
            call_sid = context.call_sid.as_deref().unwrap_or("-"),
            "Call context registered"
        );
        state.contexts.insert(context.request_id.clone(), context);
    }

    /// Look up a context by request ID.
    pub async fn get(&self, request_id: &str) -> Option<CallContext> {
        self.inner.lock().await.contexts.get(request_id).cloned()
    }

    /// Drop any context belonging to the given call SID.
    pub async fn forget_call(&self, call_sid: &str) {
        let mut state = self.inner.lock().await;
        let before = state.contexts.len();
        state
            .contexts
            .retain(|_, ctx| ctx.call_sid.as_deref() != Some(call_sid));
        if state.contexts.len() < before {
            tracing::debug!(call_sid, "Call context released");
        }
    }

    /// Mark a call SID as no longer active.
    ///
    /// Returns true only the first time a given SID is cleared, so a
    /// repeated terminal status callback cannot double-decrement.
    pub async fn clear_active(&self, call_sid: &str) -> bool {
        self.inner.lock().await.active_sids.remove(call_sid)
    }

    /// Remove contexts older than `older_than`, along with their
    /// active-SID markers. Returns how many entries were removed.
    pub async fn sweep(&self, older_than: Duration) -> usize {
        let mut state = self.inner.lock().await;
        let cutoff = Instant::now();
        let expired: Vec<String> = state
            .contexts
            .iter()
            .filter(|(_, ctx)| cutoff.duration_since(ctx.created_at) >= older_than)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            if let Some(ctx) = state.contexts.remove(id) {
                if let Some(sid) = ctx.call_sid {
                    state.active_sids.remove(&sid);
                }
            }
        }

        if !expired.is_empty() {
            tracing::info!(removed = expired.len(), "Swept expired call contexts");
        }
        expired.len()
    }
}
