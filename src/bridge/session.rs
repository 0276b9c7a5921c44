//! The per-call bridge between the telephony media stream and the
//! conversational agent.
//!
//! One session owns both peers for the lifetime of a call. The telephony
//! socket is split: a writer task drains an unbounded channel into the
//! sink while the session task multiplexes telephony reads, agent link
//! events, and the session lifetime cap. The agent socket lives in the
//! keeper task (`agent::maintain_connection`) so a reconnect never blocks
//! caller audio; audio that arrives while the agent is not ready queues
//! in `pending_audio` and is flushed, in order, at readiness.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::bridge::agent::{self, AgentLink};
use crate::bridge::protocol::{clear_frame, media_frame, StreamEvent};
use crate::elevenlabs::client::ElevenLabsClient;
use crate::elevenlabs::protocol::{
    audio_chunk_frame, initiation_frame, pong_frame, AgentEvent, ConversationInit,
};
use crate::metrics::Metrics;
use crate::transcript::{Role, TranscriptStore};
use crate::AppState;

/// Whether the session loop keeps running after an event.
#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Terminate,
}

/// Run one bridge session over an accepted telephony WebSocket.
pub async fn run(socket: WebSocket, state: AppState, req_id: String) {
    let context = state.registry.get(&req_id).await;
    if context.is_none() {
        tracing::warn!(req_id = %req_id, "No call context for media stream");
    }
    let init = context
        .as_ref()
        .map(|c| ConversationInit {
            script: c.script.clone(),
            persona: c.persona.clone(),
            context: c.context.clone(),
        })
        .unwrap_or_default();
    let call_sid = context.and_then(|c| c.call_sid);
    if let Some(sid) = &call_sid {
        state.transcripts.begin(sid).await;
    }

    tracing::info!(req_id = %req_id, call_sid = call_sid.as_deref().unwrap_or("-"), "Media stream connected");

    let (ws_tx, ws_rx) = socket.split();
    let (tel_tx, tel_rx) = mpsc::unbounded_channel::<Message>();
    let writer = tokio::spawn(write_telephony(ws_tx, tel_rx));

    let attempts = Arc::new(AtomicU32::new(0));
    let (link_tx, link_rx) = mpsc::channel::<AgentLink>(64);
    let keeper = tokio::spawn(agent::maintain_connection(
        Arc::new(ElevenLabsClient::new(&state.config.elevenlabs)),
        state.config.max_agent_retries,
        attempts.clone(),
        link_tx,
        state.metrics.clone(),
    ));

    let mut session = Session::new(
        req_id,
        call_sid,
        init,
        tel_tx,
        state.transcripts.clone(),
        state.metrics.clone(),
        attempts,
    );

    event_loop(&mut session, ws_rx, link_rx, &state).await;

    // Terminal: tear down both peers and release the call's context.
    keeper.abort();
    if let Some(sid) = &session.call_sid {
        state.registry.forget_call(sid).await;
    }
    let _ = session.tel_tx.send(Message::Close(None));
    tracing::info!(req_id = %session.req_id, "Bridge session closed");
    drop(session);
    let _ = writer.await;
}

async fn event_loop(
    session: &mut Session,
    mut ws_rx: SplitStream<WebSocket>,
    mut link_rx: mpsc::Receiver<AgentLink>,
    state: &AppState,
) {
    // Absolute lifetime cap, not a rolling idle window.
    let idle = tokio::time::sleep(state.config.media_stream_timeout);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            inbound = ws_rx.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        if session.on_telephony_frame(text.as_str()).await == Flow::Terminate {
                            return;
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = session.tel_tx.send(Message::Pong(payload));
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::info!("Telephony stream closed");
                        return;
                    }
                    Some(Err(e)) => {
                        tracing::error!("Telephony WebSocket error: {e}");
                        return;
                    }
                    _ => {}
                }
            }
            Some(link) = link_rx.recv() => {
                if session.on_agent_link(link).await == Flow::Terminate {
                    return;
                }
            }
            _ = &mut idle => {
                tracing::info!("Media stream hit its lifetime cap");
                return;
            }
        }
    }
}

/// Drain queued frames into the telephony sink until the channel closes.
async fn write_telephony(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(msg) = rx.recv().await {
        if sink.send(msg).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
}

/// Per-call bridge state. Owned exclusively by the session task.
struct Session {
    req_id: String,
    call_sid: Option<String>,
    /// Set by the telephony `start` event; required on every outbound
    /// media/clear frame.
    stream_sid: Option<String>,
    /// True between `conversation_initiation_metadata` and the next
    /// agent disconnect.
    agent_ready: bool,
    /// Caller audio waiting for the agent, FIFO. Survives reconnects.
    pending_audio: VecDeque<String>,
    agent_tx: Option<mpsc::UnboundedSender<String>>,
    tel_tx: mpsc::UnboundedSender<Message>,
    init: ConversationInit,
    transcripts: TranscriptStore,
    metrics: Metrics,
    /// Reconnect attempts, shared with the keeper task.
    attempts: Arc<AtomicU32>,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    fn new(
        req_id: String,
        call_sid: Option<String>,
        init: ConversationInit,
        tel_tx: mpsc::UnboundedSender<Message>,
        transcripts: TranscriptStore,
        metrics: Metrics,
        attempts: Arc<AtomicU32>,
    ) -> Self {
        Self {
            req_id,
            call_sid,
            stream_sid: None,
            agent_ready: false,
            pending_audio: VecDeque::new(),
            agent_tx: None,
            tel_tx,
            init,
            transcripts,
            metrics,
            attempts,
        }
    }

    async fn on_telephony_frame(&mut self, text: &str) -> Flow {
        let event: StreamEvent = match serde_json::from_str(text) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!("Unparseable telephony frame: {e}");
                return Flow::Continue;
            }
        };

        match event {
            StreamEvent::Connected { protocol } => {
                tracing::debug!(protocol = protocol.as_deref().unwrap_or("-"), "Stream connected");
            }
            StreamEvent::Start { start } => {
                tracing::info!(
                    stream_sid = %start.stream_sid,
                    call_sid = start.call_sid.as_deref().unwrap_or("-"),
                    "Stream started"
                );
                self.stream_sid = Some(start.stream_sid);
                // The start event names the call when the registry could not.
                if self.call_sid.is_none() {
                    if let Some(sid) = start.call_sid {
                        self.transcripts.begin(&sid).await;
                        self.call_sid = Some(sid);
                    }
                }
            }
            StreamEvent::Media { media } => self.forward_caller_audio(media.payload),
            StreamEvent::Stop => {
                tracing::info!("Caller ended the stream");
                return Flow::Terminate;
            }
            StreamEvent::Mark => {}
            StreamEvent::Unknown => tracing::debug!("Ignoring unrecognized stream event"),
        }
        Flow::Continue
    }

    /// Caller audio goes straight to a ready agent, otherwise queues.
    fn forward_caller_audio(&mut self, payload: String) {
        if self.agent_ready {
            if self.send_agent(audio_chunk_frame(&payload)) {
                return;
            }
            // Connection died under us; requeue until the next readiness.
            self.agent_ready = false;
        }
        self.pending_audio.push_back(payload);
    }

    async fn on_agent_link(&mut self, link: AgentLink) -> Flow {
        match link {
            AgentLink::Opened(tx) => {
                self.agent_ready = false;
                if let Some(frame) = initiation_frame(&self.init) {
                    let _ = tx.send(frame);
                }
                self.agent_tx = Some(tx);
                tracing::info!("Agent connection open, awaiting initiation metadata");
            }
            AgentLink::Frame(text) => self.on_agent_event(&text).await,
            AgentLink::Closed => {
                self.agent_ready = false;
                self.agent_tx = None;
            }
            AgentLink::Exhausted => {
                tracing::error!("Agent unavailable, ending the call");
                return Flow::Terminate;
            }
        }
        Flow::Continue
    }

    async fn on_agent_event(&mut self, text: &str) {
        let event: AgentEvent = match serde_json::from_str(text) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!("Unparseable agent frame: {e}");
                return;
            }
        };

        match event {
            AgentEvent::ConversationInitiationMetadata => {
                tracing::info!(buffered = self.pending_audio.len(), "Agent session ready");
                self.agent_ready = true;
                self.attempts.store(0, Ordering::Relaxed);
                self.metrics.agent_connected();
                self.flush_pending();
            }
            AgentEvent::Audio { audio_event } => match &self.stream_sid {
                Some(sid) => self.send_telephony(media_frame(sid, &audio_event.audio_base_64)),
                // Cannot tag the frame yet; the start event is expected first.
                None => tracing::debug!("Dropping agent audio before stream start"),
            },
            AgentEvent::Interruption => {
                if let Some(sid) = &self.stream_sid {
                    tracing::debug!("Barge-in, clearing queued playback");
                    self.send_telephony(clear_frame(sid));
                }
            }
            AgentEvent::Ping { ping_event } => {
                self.send_agent(pong_frame(&ping_event.event_id));
            }
            AgentEvent::UserTranscript {
                user_transcription_event,
            } => {
                self.record_turn(Role::User, user_transcription_event.user_transcript)
                    .await;
            }
            AgentEvent::AgentResponse {
                agent_response_event,
            } => {
                self.record_turn(Role::Agent, agent_response_event.agent_response)
                    .await;
            }
            AgentEvent::Unknown => tracing::debug!("Ignoring unrecognized agent event"),
        }
    }

    /// Drain the pending queue FIFO into the agent connection.
    fn flush_pending(&mut self) {
        while let Some(payload) = self.pending_audio.pop_front() {
            if !self.send_agent(audio_chunk_frame(&payload)) {
                self.pending_audio.push_front(payload);
                self.agent_ready = false;
                break;
            }
        }
    }

    fn send_agent(&self, frame: String) -> bool {
        match &self.agent_tx {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        }
    }

    fn send_telephony(&self, frame: String) {
        if self.tel_tx.send(Message::Text(frame.into())).is_err() {
            tracing::warn!("Telephony writer gone, dropping frame");
        }
    }

    async fn record_turn(&self, role: Role, text: String) {
        match &self.call_sid {
            Some(sid) => self.transcripts.append(sid, role, text).await,
            None => tracing::debug!("Dropping transcript turn without call SID"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tokio::sync::mpsc::error::TryRecvError;

    struct Harness {
        session: Session,
        tel_rx: mpsc::UnboundedReceiver<Message>,
        transcripts: TranscriptStore,
        metrics: Metrics,
        attempts: Arc<AtomicU32>,
    }

    fn harness(call_sid: Option<&str>, init: ConversationInit) -> Harness {
        let (tel_tx, tel_rx) = mpsc::unbounded_channel();
        let transcripts = TranscriptStore::new();
        let metrics = Metrics::new();
        let attempts = Arc::new(AtomicU32::new(0));
        let session = Session::new(
            "a1b2c3d4e5f60718".to_string(),
            call_sid.map(str::to_string),
            init,
            tel_tx,
            transcripts.clone(),
            metrics.clone(),
            attempts.clone(),
        );
        Harness {
            session,
            tel_rx,
            transcripts,
            metrics,
            attempts,
        }
    }

    fn start_json(stream_sid: &str) -> String {
        format!(r#"{{"event":"start","start":{{"streamSid":"{stream_sid}"}}}}"#)
    }

    fn media_json(payload: &str) -> String {
        format!(r#"{{"event":"media","media":{{"payload":"{payload}"}}}}"#)
    }

    const METADATA: &str = r#"{"type":"conversation_initiation_metadata"}"#;

    fn recv_telephony_json(rx: &mut mpsc::UnboundedReceiver<Message>) -> Value {
        match rx.try_recv().expect("telephony frame expected") {
            Message::Text(text) => serde_json::from_str(text.as_str()).expect("valid json"),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn buffered_audio_flushes_in_order_at_readiness() {
        let mut h = harness(None, ConversationInit::default());
        let (agent_tx, mut agent_rx) = mpsc::unbounded_channel();

        assert_eq!(h.session.on_telephony_frame(&start_json("SID1")).await, Flow::Continue);
        h.session.on_telephony_frame(&media_json("AA")).await;
        h.session.on_telephony_frame(&media_json("BB")).await;

        h.session.on_agent_link(AgentLink::Opened(agent_tx)).await;
        // Empty context: no initiation frame, nothing until readiness.
        assert_eq!(agent_rx.try_recv().unwrap_err(), TryRecvError::Empty);

        h.session.on_agent_link(AgentLink::Frame(METADATA.into())).await;
        assert_eq!(agent_rx.try_recv().unwrap(), r#"{"user_audio_chunk":"AA"}"#);
        assert_eq!(agent_rx.try_recv().unwrap(), r#"{"user_audio_chunk":"BB"}"#);
        assert_eq!(agent_rx.try_recv().unwrap_err(), TryRecvError::Empty);

        // Live audio after readiness flows straight through.
        h.session.on_telephony_frame(&media_json("CC")).await;
        assert_eq!(agent_rx.try_recv().unwrap(), r#"{"user_audio_chunk":"CC"}"#);
    }

    #[tokio::test]
    async fn initiation_frame_precedes_buffered_audio() {
        let init = ConversationInit {
            script: Some("greet".into()),
            persona: None,
            context: None,
        };
        let mut h = harness(Some("CA1"), init);
        let (agent_tx, mut agent_rx) = mpsc::unbounded_channel();

        h.session.on_telephony_frame(&media_json("AA")).await;
        h.session.on_agent_link(AgentLink::Opened(agent_tx)).await;

        let first: Value = serde_json::from_str(&agent_rx.try_recv().unwrap()).unwrap();
        assert_eq!(first["type"], "conversation_initiation_client_data");
        assert_eq!(agent_rx.try_recv().unwrap_err(), TryRecvError::Empty);

        h.session.on_agent_link(AgentLink::Frame(METADATA.into())).await;
        assert_eq!(agent_rx.try_recv().unwrap(), r#"{"user_audio_chunk":"AA"}"#);
    }

    #[tokio::test]
    async fn agent_audio_is_tagged_with_the_stream_sid() {
        let mut h = harness(None, ConversationInit::default());
        let (agent_tx, _agent_rx) = mpsc::unbounded_channel();

        h.session.on_telephony_frame(&start_json("SID2")).await;
        h.session.on_agent_link(AgentLink::Opened(agent_tx)).await;
        h.session
            .on_agent_link(AgentLink::Frame(
                r#"{"type":"audio","audio_event":{"audio_base_64":"ZZ"}}"#.into(),
            ))
            .await;

        let frame = recv_telephony_json(&mut h.tel_rx);
        assert_eq!(frame["event"], "media");
        assert_eq!(frame["streamSid"], "SID2");
        assert_eq!(frame["media"]["payload"], "ZZ");
    }

    #[tokio::test]
    async fn agent_audio_before_start_is_dropped() {
        let mut h = harness(None, ConversationInit::default());
        h.session
            .on_agent_event(r#"{"type":"audio","audio_event":{"audio_base_64":"ZZ"}}"#)
            .await;
        assert_eq!(h.tel_rx.try_recv().unwrap_err(), TryRecvError::Empty);
    }

    #[tokio::test]
    async fn ping_gets_a_matching_pong() {
        let mut h = harness(None, ConversationInit::default());
        let (agent_tx, mut agent_rx) = mpsc::unbounded_channel();

        h.session.on_agent_link(AgentLink::Opened(agent_tx)).await;
        h.session
            .on_agent_link(AgentLink::Frame(
                r#"{"type":"ping","ping_event":{"event_id":"e-42"}}"#.into(),
            ))
            .await;

        let pong: Value = serde_json::from_str(&agent_rx.try_recv().unwrap()).unwrap();
        assert_eq!(pong["type"], "pong");
        assert_eq!(pong["event_id"], "e-42");
        assert_eq!(agent_rx.try_recv().unwrap_err(), TryRecvError::Empty);
    }

    #[tokio::test]
    async fn interruption_clears_queued_playback() {
        let mut h = harness(None, ConversationInit::default());
        h.session.on_telephony_frame(&start_json("SID3")).await;
        h.session
            .on_agent_event(r#"{"type":"interruption","interruption_event":{"event_id":3}}"#)
            .await;

        let frame = recv_telephony_json(&mut h.tel_rx);
        assert_eq!(frame["event"], "clear");
        assert_eq!(frame["streamSid"], "SID3");
        assert_eq!(h.tel_rx.try_recv().unwrap_err(), TryRecvError::Empty);
    }

    #[tokio::test]
    async fn pending_audio_survives_a_reconnect() {
        let mut h = harness(None, ConversationInit::default());
        let (agent_tx, mut agent_rx) = mpsc::unbounded_channel();

        h.session.on_telephony_frame(&start_json("SID4")).await;
        h.session.on_agent_link(AgentLink::Opened(agent_tx)).await;
        h.session.on_agent_link(AgentLink::Frame(METADATA.into())).await;
        assert_eq!(h.metrics.reconnects_total(), 1);

        // Connection drops; audio keeps queueing.
        h.session.on_agent_link(AgentLink::Closed).await;
        h.session.on_telephony_frame(&media_json("DD")).await;
        h.session.on_telephony_frame(&media_json("EE")).await;
        assert_eq!(agent_rx.try_recv().unwrap_err(), TryRecvError::Disconnected);

        // Fresh connection reaches readiness; the queue drains in order.
        let (agent_tx2, mut agent_rx2) = mpsc::unbounded_channel();
        h.session.on_agent_link(AgentLink::Opened(agent_tx2)).await;
        h.attempts.store(2, Ordering::Relaxed);
        h.session.on_agent_link(AgentLink::Frame(METADATA.into())).await;

        assert_eq!(agent_rx2.try_recv().unwrap(), r#"{"user_audio_chunk":"DD"}"#);
        assert_eq!(agent_rx2.try_recv().unwrap(), r#"{"user_audio_chunk":"EE"}"#);
        // Readiness resets the retry budget and counts as a reconnect.
        assert_eq!(h.attempts.load(Ordering::Relaxed), 0);
        assert_eq!(h.metrics.reconnects_total(), 2);
    }

    #[tokio::test]
    async fn stop_and_exhaustion_terminate_the_session() {
        let mut h = harness(None, ConversationInit::default());
        assert_eq!(
            h.session.on_telephony_frame(r#"{"event":"stop"}"#).await,
            Flow::Terminate
        );
        assert_eq!(
            h.session.on_agent_link(AgentLink::Exhausted).await,
            Flow::Terminate
        );
    }

    #[tokio::test]
    async fn malformed_frames_are_dropped_quietly() {
        let mut h = harness(None, ConversationInit::default());
        assert_eq!(
            h.session.on_telephony_frame("not json at all").await,
            Flow::Continue
        );
        h.session.on_agent_event("{\"type\":").await;
        assert_eq!(h.tel_rx.try_recv().unwrap_err(), TryRecvError::Empty);
    }

    #[tokio::test]
    async fn transcript_turns_use_the_start_events_call_sid() {
        let mut h = harness(None, ConversationInit::default());
        h.session
            .on_telephony_frame(
                r#"{"event":"start","start":{"streamSid":"SID5","callSid":"CA9"}}"#,
            )
            .await;
        h.session
            .on_agent_event(
                r#"{"type":"user_transcript","user_transcription_event":{"user_transcript":"hello"}}"#,
            )
            .await;
        h.session
            .on_agent_event(
                r#"{"type":"agent_response","agent_response_event":{"agent_response":"hi"}}"#,
            )
            .await;

        let turns = h.transcripts.read("CA9").await.expect("transcript exists");
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].role, Role::User);
        assert_eq!(turns[0].text, "hello");
        assert_eq!(turns[1].role, Role::Agent);
        assert_eq!(turns[1].text, "hi");
    }
}
