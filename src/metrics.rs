use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Process-wide call counters, rendered at GET /metrics.
///
/// `calls_total`, `errors_total` and `reconnects_total` are monotonic;
/// `active_calls` is a gauge that floors at zero.
#[derive(Clone, Default)]
pub struct Metrics {
    inner: Arc<Counters>,
}

#[derive(Default)]
struct Counters {
    calls_total: AtomicU64,
    errors_total: AtomicU64,
    active_calls: AtomicU64,
    reconnects_total: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an accepted outbound call: one more total, one more active.
    pub fn call_started(&self) {
        self.inner.calls_total.fetch_add(1, Ordering::Relaxed);
        self.inner.active_calls.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a call reaching a terminal status. Floors at zero.
    pub fn call_ended(&self) {
        let _ = self
            .inner
            .active_calls
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    /// Record a provider failure. Caller validation errors are not counted.
    pub fn provider_error(&self) {
        self.inner.errors_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an agent connection reaching readiness.
    pub fn agent_connected(&self) {
        self.inner.reconnects_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn active_calls(&self) -> u64 {
        self.inner.active_calls.load(Ordering::Relaxed)
    }

    pub fn reconnects_total(&self) -> u64 {
        self.inner.reconnects_total.load(Ordering::Relaxed)
    }

    /// Prometheus text exposition: one `name value` line per counter.
    pub fn render(&self) -> String {
        format!(
            "calls_total {}\nerrors_total {}\nactive_calls {}\nreconnects_total {}\n",
            self.inner.calls_total.load(Ordering::Relaxed),
            self.inner.errors_total.load(Ordering::Relaxed),
            self.inner.active_calls.load(Ordering::Relaxed),
            self.inner.reconnects_total.load(Ordering::Relaxed),
        )
    }
}
