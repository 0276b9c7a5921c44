//! Keeper task for the agent-side WebSocket.
//!
//! Owns the tokio-tungstenite stream for the life of a call: dials via a
//! fresh signed URL, pumps frames in both directions, and reconnects with
//! bounded exponential backoff until the session ends or the retry
//! budget is spent. The session task consumes the emitted [`AgentLink`]
//! events and owns all protocol-level state.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::elevenlabs::client::ElevenLabsClient;
use crate::metrics::Metrics;

/// Lifecycle and traffic events from the keeper to the session.
pub enum AgentLink {
    /// A connection is open; frames pushed into the sender reach it.
    Opened(mpsc::UnboundedSender<String>),
    /// A text frame from the agent peer.
    Frame(String),
    /// The current connection is gone; a reconnect may follow.
    Closed,
    /// Retry budget spent; the keeper has stopped.
    Exhausted,
}

/// Backoff before reconnect attempt `attempt` (1-based): 1s, 2s, 4s, ...
pub fn backoff_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    Duration::from_millis(1000 << exp)
}

/// Maintain the agent connection until the session drops the link or the
/// retry budget runs out. `attempts` is shared with the session, which
/// zeroes it when a connection reaches readiness.
pub async fn maintain_connection(
    client: Arc<ElevenLabsClient>,
    max_retries: u32,
    attempts: Arc<AtomicU32>,
    link_tx: mpsc::Sender<AgentLink>,
    metrics: Metrics,
) {
    loop {
        match client.open_conversation().await {
            Ok(socket) => {
                let (out_tx, out_rx) = mpsc::unbounded_channel();
                if link_tx.send(AgentLink::Opened(out_tx)).await.is_err() {
                    return;
                }
                pump(socket, out_rx, &link_tx).await;
                if link_tx.send(AgentLink::Closed).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                tracing::warn!("Agent connection attempt failed: {e}");
                metrics.provider_error();
            }
        }

        let used = attempts.load(Ordering::Relaxed);
        if used >= max_retries {
            tracing::error!(attempts = used, "Agent retry budget exhausted");
            let _ = link_tx.send(AgentLink::Exhausted).await;
            return;
        }
        let attempt = used + 1;
        attempts.store(attempt, Ordering::Relaxed);
        let delay = backoff_delay(attempt);
        tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting to agent");
        tokio::time::sleep(delay).await;
    }
}

/// Shuttle frames for one connection until either side drops it.
async fn pump(
    socket: crate::elevenlabs::client::AgentSocket,
    mut out_rx: mpsc::UnboundedReceiver<String>,
    link_tx: &mpsc::Sender<AgentLink>,
) {
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            outbound = out_rx.recv() => {
                let Some(frame) = outbound else {
                    // Session side is gone; close out politely.
                    let _ = sink.send(WsMessage::Close(None)).await;
                    return;
                };
                if let Err(e) = sink.send(WsMessage::Text(frame.into())).await {
                    tracing::warn!("Agent send failed: {e}");
                    return;
                }
            }
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(WsMessage::Text(text))) => {
                        if link_tx.send(AgentLink::Frame(text.to_string())).await.is_err() {
                            return;
                        }
                    }
                    Some(Ok(WsMessage::Ping(payload))) => {
                        let _ = sink.send(WsMessage::Pong(payload)).await;
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        tracing::info!("Agent WebSocket closed");
                        return;
                    }
                    Some(Err(e)) => {
                        tracing::warn!("Agent WebSocket error: {e}");
                        return;
                    }
                    _ => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ElevenLabsConfig;

    #[test]
    fn backoff_doubles_from_one_second() {
        assert_eq!(backoff_delay(1), Duration::from_millis(1000));
        assert_eq!(backoff_delay(2), Duration::from_millis(2000));
        assert_eq!(backoff_delay(3), Duration::from_millis(4000));
        assert_eq!(backoff_delay(4), Duration::from_millis(8000));
    }

    #[tokio::test]
    async fn exhausts_without_budget() {
        let config = ElevenLabsConfig {
            agent_id: "agent".into(),
            api_key: "key".into(),
        };
        // Unroutable endpoint: the single allowed attempt fails fast.
        let client = Arc::new(ElevenLabsClient::with_api_base(&config, "http://127.0.0.1:1"));
        let attempts = Arc::new(AtomicU32::new(0));
        let (link_tx, mut link_rx) = mpsc::channel(8);
        let metrics = Metrics::new();

        maintain_connection(client, 0, attempts.clone(), link_tx, metrics.clone()).await;

        match link_rx.recv().await {
            Some(AgentLink::Exhausted) => {}
            _ => panic!("expected Exhausted"),
        }
        assert!(link_rx.recv().await.is_none());
        assert_eq!(attempts.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.reconnects_total(), 0);
    }
}
