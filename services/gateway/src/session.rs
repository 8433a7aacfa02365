//! Per-session actor.
//!
//! Each interview session is owned by exactly one task. Connection
//! attach/detach, inbound client frames, and AI generation results
//! all arrive as events on one queue, so every mutation of room
//! state and turn state is serialized by ownership instead of locks.
//! AI calls are dispatched as independent tasks and deliver their
//! result back into the same queue, so a pending generation never
//! blocks unrelated session events.

use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use tokio::sync::mpsc;

use parley_core::context::{InterviewContext, InterviewStore};
use parley_core::resolver::{CredentialResolver, ResolveRequest};
use parley_core::turns::TurnController;
use parley_core::{ConversationMessage, MessageRole};

use crate::config::SttConfig;
use crate::protocol::{
    ClientMessage, RoomState, SCREEN_SURFACE_UNKNOWN, ServerMessage, TurnState,
};

/// Outbound channel capacity per connection. A stalled socket sheds
/// frames with a warning instead of wedging the actor.
pub const OUTBOUND_BUFFER: usize = 64;

/// How long a session survives without its candidate. A reconnect
/// inside this window replaces the connection; past it the session
/// ends and the token has to pass the readiness gate again.
pub const DISCONNECT_GRACE: std::time::Duration = std::time::Duration::from_secs(120);

pub type OutboundSender = mpsc::Sender<ServerMessage>;

/// Everything that can happen to a session, in arrival order.
#[derive(Debug)]
pub enum SessionEvent {
    CandidateConnected { outbound: OutboundSender },
    CandidateDisconnected,
    /// Fires once the disconnect grace period elapses; stale when the
    /// sequence number no longer matches.
    DisconnectDeadline { seq: u64 },
    MonitorConnected { id: String, outbound: OutboundSender },
    MonitorDisconnected { id: String },
    FromCandidate(ClientMessage),
    FromMonitor { id: String, message: ClientMessage },
    GenerationFinished {
        generation_id: u64,
        result: Result<String, String>,
    },
    TranscriptionFinished(Result<String, String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Created,
    Active,
    Ended,
}

/// Dependencies shared by every session the hub creates.
pub struct SessionDeps {
    pub resolver: Arc<CredentialResolver>,
    pub store: Arc<dyn InterviewStore>,
    pub stt: Option<SttConfig>,
    pub monitor_cap: usize,
    pub temperature: f32,
    pub max_tokens: u32,
}

pub struct SessionActor {
    token: String,
    status: SessionStatus,
    context: InterviewContext,
    controller: TurnController,
    min_user_turns_before_wrap: u32,
    user_turn_count: u32,
    last_user_text: String,
    history: Vec<ConversationMessage>,
    room: RoomState,
    candidate: Option<OutboundSender>,
    monitors: HashMap<String, OutboundSender>,
    pending_generation: Option<u64>,
    next_generation_id: u64,
    disconnect_seq: u64,
    deps: Arc<SessionDeps>,
    events_tx: mpsc::Sender<SessionEvent>,
}

impl SessionActor {
    pub fn new(
        token: String,
        context: InterviewContext,
        deps: Arc<SessionDeps>,
        events_tx: mpsc::Sender<SessionEvent>,
    ) -> Self {
        let min_user_turns_before_wrap = context.ai.min_user_turns_before_wrap;
        Self {
            token,
            status: SessionStatus::Created,
            context,
            controller: TurnController::default(),
            min_user_turns_before_wrap,
            user_turn_count: 0,
            last_user_text: String::new(),
            history: Vec::new(),
            room: RoomState::new(),
            candidate: None,
            monitors: HashMap::new(),
            pending_generation: None,
            next_generation_id: 0,
            disconnect_seq: 0,
            deps,
            events_tx,
        }
    }

    /// Runs the session to completion. Returns once the session has
    /// ended, at which point the hub forgets the token.
    pub async fn run(mut self, mut events: mpsc::Receiver<SessionEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_event(event).await;
            if self.status == SessionStatus::Ended {
                break;
            }
        }
        tracing::info!(token = %self.token, "session ended");
    }

    pub(crate) async fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::CandidateConnected { outbound } => {
                self.on_candidate_connected(outbound).await;
            }
            SessionEvent::CandidateDisconnected => {
                self.on_candidate_disconnected();
            }
            SessionEvent::DisconnectDeadline { seq } => {
                if self.status == SessionStatus::Active
                    && seq == self.disconnect_seq
                    && self.candidate.is_none()
                {
                    self.end_session("candidate left the interview");
                }
            }
            SessionEvent::MonitorConnected { id, outbound } => {
                self.on_monitor_connected(id, outbound);
            }
            SessionEvent::MonitorDisconnected { id } => {
                self.monitors.remove(&id);
                self.broadcast_room();
            }
            SessionEvent::FromCandidate(message) => {
                self.on_candidate_message(message).await;
            }
            SessionEvent::FromMonitor { id, message } => {
                self.on_monitor_message(id, message).await;
            }
            SessionEvent::GenerationFinished {
                generation_id,
                result,
            } => {
                self.on_generation_finished(generation_id, result).await;
            }
            SessionEvent::TranscriptionFinished(result) => match result {
                Ok(text) if !text.trim().is_empty() => {
                    self.on_user_text(text).await;
                }
                Ok(_) => {}
                Err(reason) => {
                    tracing::warn!(token = %self.token, %reason, "transcription failed");
                    self.send_candidate(ServerMessage::SpeechCaptureHint { capture: true });
                }
            },
        }
    }

    // --- connection lifecycle -------------------------------------

    async fn on_candidate_connected(&mut self, outbound: OutboundSender) {
        // Invalidate any outstanding disconnect deadline.
        self.disconnect_seq += 1;
        let reconnecting = self.candidate.is_some() || self.user_turn_count > 0;
        if reconnecting {
            // Same token within policy: replace the connection
            // object, never reset turn state.
            tracing::info!(token = %self.token, "candidate reconnected, replacing connection");
        }
        self.candidate = Some(outbound);
        if self.status == SessionStatus::Created {
            self.status = SessionStatus::Active;
        }
        self.room.candidate_online = true;
        self.broadcast_room();

        self.send_candidate(ServerMessage::VoiceMode { enabled: true });
        self.send_candidate(ServerMessage::SpeechCaptureHint { capture: true });
        self.send_candidate(ServerMessage::InputGate {
            accepting: self.pending_generation.is_none(),
            reason: None,
        });
        self.send_candidate(ServerMessage::InterviewTurnState {
            state: TurnState::Listening,
        });
    }

    fn on_candidate_disconnected(&mut self) {
        self.candidate = None;
        self.room.candidate_online = false;
        self.broadcast_room();
        if self.status != SessionStatus::Active {
            return;
        }
        self.disconnect_seq += 1;
        let seq = self.disconnect_seq;
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(DISCONNECT_GRACE).await;
            let _ = events.send(SessionEvent::DisconnectDeadline { seq }).await;
        });
    }

    fn on_monitor_connected(&mut self, id: String, outbound: OutboundSender) {
        if self.monitors.len() >= self.deps.monitor_cap {
            tracing::warn!(token = %self.token, monitor = %id, "monitor cap reached, refusing");
            Self::try_send(&outbound, ServerMessage::SystemBlocked {
                reason: "monitor limit reached for this session".to_string(),
            });
            return;
        }
        // Joining monitors get a full snapshot, not a delta.
        Self::try_send(&outbound, ServerMessage::RoomState {
            state: self.room_snapshot(),
        });
        self.monitors.insert(id.clone(), outbound);
        self.broadcast_room();
        // Ask the candidate for a fresh offer so the new monitor can
        // attach to the screen share.
        self.send_candidate(ServerMessage::WebrtcRequestOffer { from: id });
    }

    // --- inbound routing ------------------------------------------

    async fn on_candidate_message(&mut self, message: ClientMessage) {
        if self.status == SessionStatus::Ended {
            return;
        }
        match message {
            ClientMessage::UserText { text } => {
                self.on_user_text(text).await;
            }
            ClientMessage::Audio { data, mime_type } => {
                self.on_candidate_audio(data, mime_type);
            }
            ClientMessage::VadEvent { speaking } => {
                if speaking {
                    self.send_candidate(ServerMessage::InterviewTurnState {
                        state: TurnState::Listening,
                    });
                }
            }
            ClientMessage::SecurityViolation { kind, detail } => {
                self.broadcast_monitors(ServerMessage::IntegrityEvent {
                    kind: kind.clone(),
                    detail,
                    at: Utc::now(),
                });
                self.send_candidate(ServerMessage::InterventionWarning {
                    message: format!("A proctoring event was recorded: {kind}"),
                });
            }
            ClientMessage::ScreenShareStatus {
                active,
                surface,
                muted,
            } => {
                self.on_screen_share_status(active, surface, muted);
            }
            ClientMessage::CodeSync { content, language } => {
                self.broadcast_monitors(ServerMessage::CodeSync { content, language });
            }
            ClientMessage::WebrtcSignal { signal } => {
                // Candidate-originated signaling goes to the
                // addressed monitor, or every monitor when
                // unaddressed.
                match signal.target_monitor() {
                    Some(monitor_id) => {
                        if let Some(outbound) = self.monitors.get(monitor_id) {
                            Self::try_send(outbound, ServerMessage::WebrtcSignal {
                                from: None,
                                signal,
                            });
                        }
                    }
                    None => {
                        self.broadcast_monitors(ServerMessage::WebrtcSignal {
                            from: None,
                            signal,
                        });
                    }
                }
            }
            other => {
                tracing::debug!(token = %self.token, ?other, "ignoring monitor frame from candidate");
            }
        }
    }

    async fn on_monitor_message(&mut self, id: String, message: ClientMessage) {
        if self.status == SessionStatus::Ended {
            return;
        }
        match message {
            ClientMessage::RoomStateRequest => {
                if let Some(outbound) = self.monitors.get(&id) {
                    Self::try_send(outbound, ServerMessage::RoomState {
                        state: self.room_snapshot(),
                    });
                }
            }
            ClientMessage::WebrtcRequestOffer | ClientMessage::MonitorRequestReshare => {
                self.send_candidate(ServerMessage::WebrtcRequestOffer { from: id });
            }
            ClientMessage::WebrtcSignal { signal } => {
                self.send_candidate(ServerMessage::WebrtcSignal {
                    from: Some(id),
                    signal,
                });
            }
            ClientMessage::MonitorTerminate { reason } => {
                let reason = reason.unwrap_or_else(|| "terminated by monitor".to_string());
                self.terminate(&reason);
            }
            ClientMessage::ScreenShareStatus { muted, .. } => {
                // Monitors may only toggle the mute flag; the share
                // itself is candidate-owned.
                if let Some(muted) = muted {
                    self.room.screen_muted = muted;
                    self.broadcast_room();
                }
            }
            other => {
                tracing::debug!(token = %self.token, monitor = %id, ?other, "ignoring candidate frame from monitor");
            }
        }
    }

    // --- turn processing ------------------------------------------

    async fn on_user_text(&mut self, text: String) {
        if self.status != SessionStatus::Active {
            return;
        }
        if self.pending_generation.is_some() {
            // Explicit busy signal; the submission is not queued.
            self.send_candidate(ServerMessage::InputGate {
                accepting: false,
                reason: Some("a previous response is still being generated".to_string()),
            });
            return;
        }

        self.user_turn_count += 1;
        self.last_user_text = text.clone();
        let message = ConversationMessage::user(text.clone());
        self.history.push(message.clone());
        self.persist(message).await;

        let transcript = ServerMessage::Transcript {
            role: MessageRole::User,
            text,
            turn: self.user_turn_count,
        };
        self.send_candidate(transcript.clone());
        self.broadcast_monitors(transcript);

        self.send_candidate(ServerMessage::InputGate {
            accepting: false,
            reason: None,
        });
        self.send_candidate(ServerMessage::InterviewTurnState {
            state: TurnState::Thinking,
        });

        self.dispatch_generation();
    }

    /// Spawns the AI call as an independent unit of work. The result
    /// re-enters the serialized event queue; a session that has ended
    /// in the meantime simply drops it.
    fn dispatch_generation(&mut self) {
        self.next_generation_id += 1;
        let generation_id = self.next_generation_id;
        self.pending_generation = Some(generation_id);

        let system_instruction = format!(
            "{}\n\n{}",
            self.controller.build_system_prompt(&self.context),
            self.controller.build_turn_flow_directive(
                self.user_turn_count,
                self.min_user_turns_before_wrap,
                &self.context.question_plan,
            )
        );
        let request = ResolveRequest {
            company_id: self.context.company_id.clone(),
            provider: self.context.ai.provider,
            model: self.context.ai.model.clone(),
            preferred_key_id: self.context.ai.preferred_key_id.clone(),
            runtime_primary: None,
            allow_key_fallback: true,
            allow_env_fallback: true,
            prompt: self.render_history(),
            system_instruction,
            temperature: self.deps.temperature,
            max_tokens: self.deps.max_tokens,
        };

        let resolver = self.deps.resolver.clone();
        let events = self.events_tx.clone();
        let token = self.token.clone();
        tokio::spawn(async move {
            let result = match resolver.resolve(request).await {
                Ok(resolution) => {
                    tracing::info!(
                        token = %token,
                        provider = resolution.provider.as_str(),
                        source = resolution.used.source.as_str(),
                        "generation resolved"
                    );
                    Ok(resolution.response.text)
                }
                Err(err) => {
                    tracing::error!(token = %token, error = %err, "generation cascade exhausted");
                    Err("the AI interviewer is temporarily unavailable; please try again".to_string())
                }
            };
            let _ = events
                .send(SessionEvent::GenerationFinished {
                    generation_id,
                    result,
                })
                .await;
        });
    }

    async fn on_generation_finished(
        &mut self,
        generation_id: u64,
        result: Result<String, String>,
    ) {
        if self.status == SessionStatus::Ended || self.pending_generation != Some(generation_id) {
            // A terminated session, or a stale generation superseded
            // by termination: discard the result.
            tracing::debug!(token = %self.token, generation_id, "discarding stale generation result");
            return;
        }
        self.pending_generation = None;

        match result {
            Ok(raw_text) => {
                let text = self.controller.post_process_assistant_text(
                    &raw_text,
                    &self.last_user_text,
                    self.user_turn_count,
                    self.min_user_turns_before_wrap,
                    &self.context.question_plan,
                );
                let message = ConversationMessage::assistant(text.clone());
                self.history.push(message.clone());
                self.persist(message).await;

                self.send_candidate(ServerMessage::InterviewTurnState {
                    state: TurnState::Speaking,
                });
                let ai_text = ServerMessage::AiText {
                    text: text.clone(),
                    turn: self.user_turn_count,
                };
                self.send_candidate(ai_text.clone());
                self.broadcast_monitors(ai_text);
                // No TTS collaborator yet, so no audio_playback frames
                // precede this; it closes the speaking stage directly.
                self.send_candidate(ServerMessage::AssistantAudioDone);

                // Closing language past the turn floor passed the
                // gatekeeper above, so this is the interview's normal
                // end.
                if self.user_turn_count >= self.min_user_turns_before_wrap
                    && self.controller.is_closing(&text)
                {
                    self.end_session("interview concluded");
                    return;
                }
            }
            Err(reason) => {
                self.send_candidate(ServerMessage::SystemBlocked { reason });
            }
        }

        self.send_candidate(ServerMessage::InterviewTurnState {
            state: TurnState::Listening,
        });
        self.send_candidate(ServerMessage::InputGate {
            accepting: true,
            reason: None,
        });
    }

    fn on_candidate_audio(&mut self, data: String, mime_type: Option<String>) {
        let Some(stt) = self.deps.stt.clone() else {
            tracing::debug!(token = %self.token, "audio frame received but STT is not configured");
            return;
        };
        let bytes = match BASE64.decode(data.as_bytes()) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(token = %self.token, error = %err, "dropping undecodable audio frame");
                return;
            }
        };

        let gateway = self.deps.resolver.gateway();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let options = parley_core::gateway::TranscribeOptions {
                api_key: stt.api_key,
                base_url: stt.base_url,
                model: stt.model,
                language: stt.language,
                mime_type: mime_type.unwrap_or_else(|| "audio/webm".to_string()),
            };
            let result = gateway
                .transcribe(bytes, options)
                .await
                .map_err(|err| err.to_string());
            let _ = events.send(SessionEvent::TranscriptionFinished(result)).await;
        });
    }

    // --- room state -----------------------------------------------

    fn on_screen_share_status(
        &mut self,
        active: bool,
        surface: Option<String>,
        muted: Option<bool>,
    ) {
        self.room.screen_share_active = active;
        self.room.screen_surface = if active {
            surface.unwrap_or_else(|| SCREEN_SURFACE_UNKNOWN.to_string())
        } else {
            SCREEN_SURFACE_UNKNOWN.to_string()
        };
        self.room.screen_muted = muted.unwrap_or(false);
        if active {
            self.room.last_screen_share_at = Some(Utc::now());
        }
        self.broadcast_monitors(ServerMessage::ScreenShareStatus {
            active,
            surface: self.room.screen_surface.clone(),
            muted: self.room.screen_muted,
        });
        self.broadcast_room();
    }

    fn room_snapshot(&self) -> RoomState {
        let mut state = self.room.clone();
        state.monitor_count = self.monitors.len();
        state.candidate_online = self.candidate.is_some();
        state
    }

    fn broadcast_room(&mut self) {
        self.room.updated_at = Utc::now();
        self.room.monitor_count = self.monitors.len();
        self.room.candidate_online = self.candidate.is_some();
        let state = self.room.clone();
        self.broadcast_monitors(ServerMessage::RoomState { state });
    }

    // --- termination ----------------------------------------------

    fn terminate(&mut self, reason: &str) {
        tracing::info!(token = %self.token, %reason, "terminating session");
        self.status = SessionStatus::Ended;
        self.pending_generation = None;
        self.send_candidate(ServerMessage::ForceTerminate {
            reason: reason.to_string(),
        });
        // Dropping the sender closes the candidate's write loop and
        // with it the socket.
        self.candidate = None;
        self.broadcast_monitors(ServerMessage::IntegrityEvent {
            kind: "session_terminated".to_string(),
            detail: Some(reason.to_string()),
            at: Utc::now(),
        });
        self.broadcast_room();
    }

    /// Non-punitive end of session: normal completion or a candidate
    /// who left and never came back. The candidate channel is simply
    /// dropped, which flushes queued frames and closes the socket.
    fn end_session(&mut self, reason: &str) {
        tracing::info!(token = %self.token, %reason, "session ended");
        self.status = SessionStatus::Ended;
        self.pending_generation = None;
        self.candidate = None;
        self.broadcast_monitors(ServerMessage::IntegrityEvent {
            kind: "session_ended".to_string(),
            detail: Some(reason.to_string()),
            at: Utc::now(),
        });
        self.broadcast_room();
    }

    // --- plumbing -------------------------------------------------

    async fn persist(&self, message: ConversationMessage) {
        // Transcript persistence is best-effort telemetry; a store
        // hiccup must not abort the session.
        if let Err(err) = self
            .deps
            .store
            .append_conversation_message(&self.token, message)
            .await
        {
            tracing::warn!(token = %self.token, error = %err, "failed to persist conversation message");
        }
    }

    fn render_history(&self) -> String {
        self.history
            .iter()
            .map(|message| {
                let label = match message.role {
                    MessageRole::User => "Candidate",
                    MessageRole::Assistant => "Interviewer",
                    MessageRole::System => "System",
                };
                format!("{label}: {}", message.content)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn send_candidate(&self, message: ServerMessage) {
        if let Some(outbound) = &self.candidate {
            Self::try_send(outbound, message);
        }
    }

    fn broadcast_monitors(&self, message: ServerMessage) {
        for outbound in self.monitors.values() {
            Self::try_send(outbound, message.clone());
        }
    }

    fn try_send(outbound: &OutboundSender, message: ServerMessage) {
        if let Err(err) = outbound.try_send(message) {
            tracing::warn!("failed to queue outbound message: {err}");
        }
    }

    #[cfg(test)]
    pub(crate) fn user_turn_count(&self) -> u32 {
        self.user_turn_count
    }

    #[cfg(test)]
    pub(crate) fn status(&self) -> SessionStatus {
        self.status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use parley_core::context::{
        AiPreferences, CandidateProfile, InterviewType, JobProfile, QuestionPlan,
    };
    use parley_core::gateway::{AiGateway, GenerateOutcome, GenerateRequest, TranscribeOptions};
    use parley_core::providers::{CredentialDirectory, OauthCredential, Provider, StoredKeyRecord};
    use secrecy::SecretString;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct OneKeyDirectory;

    #[async_trait]
    impl CredentialDirectory for OneKeyDirectory {
        async fn connected_keys(
            &self,
            _company_id: &str,
            provider: Provider,
        ) -> Result<Vec<StoredKeyRecord>> {
            if provider == Provider::OpenAi {
                Ok(vec![StoredKeyRecord {
                    id: "k1".to_string(),
                    key_name: "primary".to_string(),
                    api_key: SecretString::from("sk-test".to_string()),
                    base_url: None,
                    is_active: true,
                    last_tested_at: None,
                    updated_at: Utc::now(),
                }])
            } else {
                Ok(vec![])
            }
        }

        async fn oauth_credential(&self, _company_id: &str) -> Result<Option<OauthCredential>> {
            Ok(None)
        }
    }

    /// Gateway stub: counts calls, optionally delays, returns a fixed
    /// reply.
    struct StubGateway {
        calls: AtomicUsize,
        delay: Duration,
        reply: String,
    }

    impl StubGateway {
        fn new(reply: &str, delay: Duration) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay,
                reply: reply.to_string(),
            }
        }
    }

    #[async_trait]
    impl AiGateway for StubGateway {
        async fn generate(&self, _request: GenerateRequest) -> Result<GenerateOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.delay > Duration::ZERO {
                tokio::time::sleep(self.delay).await;
            }
            Ok(GenerateOutcome {
                text: self.reply.clone(),
                usage: None,
            })
        }

        async fn transcribe(&self, _audio: Vec<u8>, _options: TranscribeOptions) -> Result<String> {
            Ok("transcribed".to_string())
        }
    }

    #[derive(Default)]
    struct RecordingStore {
        appended: Mutex<Vec<ConversationMessage>>,
    }

    #[async_trait]
    impl InterviewStore for RecordingStore {
        async fn load_interview_context(&self, _interview_id: &str) -> Result<InterviewContext> {
            unimplemented!("sessions under test receive their context directly")
        }

        async fn append_conversation_message(
            &self,
            _session_id: &str,
            message: ConversationMessage,
        ) -> Result<()> {
            self.appended.lock().unwrap().push(message);
            Ok(())
        }
    }

    fn context() -> InterviewContext {
        InterviewContext {
            company_id: "co_1".to_string(),
            job: JobProfile {
                title: "Platform Engineer".to_string(),
                description: "Own the build pipeline.".to_string(),
                requirements: vec![],
            },
            candidate: CandidateProfile {
                name: "Sam Park".to_string(),
            },
            interview_type: InterviewType::Technical,
            question_plan: QuestionPlan {
                core_questions: vec![
                    "Tell me about yourself.".to_string(),
                    "Describe a hard bug you fixed.".to_string(),
                ],
                followups: vec!["ask for details".to_string()],
            },
            ai: AiPreferences {
                provider: Provider::OpenAi,
                model: "gpt-4o".to_string(),
                preferred_key_id: None,
                min_user_turns_before_wrap: 3,
            },
        }
    }

    struct Harness {
        actor: SessionActor,
        gateway: Arc<StubGateway>,
        store: Arc<RecordingStore>,
        events_rx: mpsc::Receiver<SessionEvent>,
    }

    fn harness(reply: &str, delay: Duration) -> Harness {
        let gateway = Arc::new(StubGateway::new(reply, delay));
        let store = Arc::new(RecordingStore::default());
        let resolver = Arc::new(CredentialResolver::new(
            Arc::new(OneKeyDirectory),
            gateway.clone(),
            None,
        ));
        let deps = Arc::new(SessionDeps {
            resolver,
            store: store.clone(),
            stt: None,
            monitor_cap: 2,
            temperature: 0.7,
            max_tokens: 256,
        });
        let (events_tx, events_rx) = mpsc::channel(OUTBOUND_BUFFER);
        Harness {
            actor: SessionActor::new("sess_1".to_string(), context(), deps, events_tx),
            gateway,
            store,
            events_rx,
        }
    }

    fn drain(rx: &mut mpsc::Receiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(message) = rx.try_recv() {
            out.push(message);
        }
        out
    }

    #[tokio::test]
    async fn second_user_text_while_pending_is_rejected_not_queued() {
        let mut h = harness("ok", Duration::from_millis(200));
        let (tx, mut rx) = mpsc::channel(OUTBOUND_BUFFER);
        h.actor
            .handle_event(SessionEvent::CandidateConnected { outbound: tx })
            .await;
        drain(&mut rx);

        h.actor
            .handle_event(SessionEvent::FromCandidate(ClientMessage::UserText {
                text: "first answer".to_string(),
            }))
            .await;
        drain(&mut rx);

        h.actor
            .handle_event(SessionEvent::FromCandidate(ClientMessage::UserText {
                text: "second answer".to_string(),
            }))
            .await;

        let messages = drain(&mut rx);
        assert!(
            messages.iter().any(|m| matches!(
                m,
                ServerMessage::InputGate {
                    accepting: false,
                    reason: Some(reason)
                } if reason.contains("still being generated")
            )),
            "expected an explicit busy rejection, got {messages:?}"
        );
        // The second submission made no AI call and took no turn.
        assert_eq!(h.actor.user_turn_count(), 1);
        // Give the first dispatch a beat to reach the stub.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.gateway.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn screen_share_stop_resets_surface_for_every_monitor() {
        let mut h = harness("ok", Duration::ZERO);
        let (mon_a_tx, mut mon_a_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let (mon_b_tx, mut mon_b_rx) = mpsc::channel(OUTBOUND_BUFFER);
        h.actor
            .handle_event(SessionEvent::MonitorConnected {
                id: "mon_a".to_string(),
                outbound: mon_a_tx,
            })
            .await;
        h.actor
            .handle_event(SessionEvent::MonitorConnected {
                id: "mon_b".to_string(),
                outbound: mon_b_tx,
            })
            .await;

        h.actor
            .handle_event(SessionEvent::FromCandidate(ClientMessage::ScreenShareStatus {
                active: true,
                surface: Some("monitor".to_string()),
                muted: Some(false),
            }))
            .await;
        drain(&mut mon_a_rx);
        drain(&mut mon_b_rx);

        h.actor
            .handle_event(SessionEvent::FromCandidate(ClientMessage::ScreenShareStatus {
                active: false,
                surface: None,
                muted: None,
            }))
            .await;

        for rx in [&mut mon_a_rx, &mut mon_b_rx] {
            let messages = drain(rx);
            let room = messages
                .iter()
                .find_map(|m| match m {
                    ServerMessage::RoomState { state } => Some(state.clone()),
                    _ => None,
                })
                .expect("every monitor receives the room broadcast");
            assert!(!room.screen_share_active);
            assert_eq!(room.screen_surface, SCREEN_SURFACE_UNKNOWN);
            assert!(room.last_screen_share_at.is_some());
        }
    }

    #[tokio::test]
    async fn results_arriving_after_termination_are_discarded() {
        let mut h = harness("late reply", Duration::ZERO);
        let (tx, mut rx) = mpsc::channel(OUTBOUND_BUFFER);
        h.actor
            .handle_event(SessionEvent::CandidateConnected { outbound: tx })
            .await;
        h.actor
            .handle_event(SessionEvent::FromCandidate(ClientMessage::UserText {
                text: "answer".to_string(),
            }))
            .await;
        drain(&mut rx);

        h.actor
            .handle_event(SessionEvent::FromMonitor {
                id: "mon_1".to_string(),
                message: ClientMessage::MonitorTerminate {
                    reason: Some("integrity violation".to_string()),
                },
            })
            .await;
        assert_eq!(h.actor.status(), SessionStatus::Ended);
        let closing = drain(&mut rx);
        assert!(closing.iter().any(|m| matches!(
            m,
            ServerMessage::ForceTerminate { reason } if reason == "integrity violation"
        )));

        // The in-flight generation resolves afterwards; its id is 1.
        h.actor
            .handle_event(SessionEvent::GenerationFinished {
                generation_id: 1,
                result: Ok("late reply".to_string()),
            })
            .await;
        assert!(
            drain(&mut rx)
                .iter()
                .all(|m| !matches!(m, ServerMessage::AiText { .. })),
            "no AI text may be delivered after termination"
        );
    }

    #[tokio::test]
    async fn generation_result_is_post_processed_and_mirrored() {
        let mut h = harness("ignored", Duration::ZERO);
        let (cand_tx, mut cand_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let (mon_tx, mut mon_rx) = mpsc::channel(OUTBOUND_BUFFER);
        h.actor
            .handle_event(SessionEvent::CandidateConnected { outbound: cand_tx })
            .await;
        h.actor
            .handle_event(SessionEvent::MonitorConnected {
                id: "mon_1".to_string(),
                outbound: mon_tx,
            })
            .await;
        h.actor
            .handle_event(SessionEvent::FromCandidate(ClientMessage::UserText {
                text: "I led the payments migration".to_string(),
            }))
            .await;
        drain(&mut cand_rx);
        drain(&mut mon_rx);

        // The model tries to wrap on turn 1 of a 3-turn floor; the
        // controller must substitute a continuation.
        h.actor
            .handle_event(SessionEvent::GenerationFinished {
                generation_id: 1,
                result: Ok("Thanks, that's all for today, we'll be in touch!".to_string()),
            })
            .await;

        let candidate_messages = drain(&mut cand_rx);
        let ai_text = candidate_messages
            .iter()
            .find_map(|m| match m {
                ServerMessage::AiText { text, .. } => Some(text.clone()),
                _ => None,
            })
            .expect("candidate receives AI text");
        assert!(ai_text.contains("Describe a hard bug you fixed."));
        assert!(!ai_text.contains("be in touch"));

        // Monitors mirror the same text.
        let mirrored = drain(&mut mon_rx);
        assert!(mirrored.iter().any(|m| matches!(
            m,
            ServerMessage::AiText { text, .. } if text == &ai_text
        )));
        // Both user and assistant messages were persisted in order.
        let persisted = h.store.appended.lock().unwrap();
        assert_eq!(persisted.len(), 2);
        assert_eq!(persisted[0].role, MessageRole::User);
        assert_eq!(persisted[1].role, MessageRole::Assistant);
    }

    #[tokio::test]
    async fn reconnecting_candidate_keeps_turn_count_and_session() {
        let mut h = harness("Noted. What drew you to this role?", Duration::ZERO);
        let (tx1, mut rx1) = mpsc::channel(OUTBOUND_BUFFER);
        h.actor
            .handle_event(SessionEvent::CandidateConnected { outbound: tx1 })
            .await;
        h.actor
            .handle_event(SessionEvent::FromCandidate(ClientMessage::UserText {
                text: "hello".to_string(),
            }))
            .await;
        h.actor
            .handle_event(SessionEvent::GenerationFinished {
                generation_id: 1,
                result: Ok("Noted. What drew you to this role?".to_string()),
            })
            .await;
        drain(&mut rx1);

        h.actor.handle_event(SessionEvent::CandidateDisconnected).await;
        let (tx2, mut rx2) = mpsc::channel(OUTBOUND_BUFFER);
        h.actor
            .handle_event(SessionEvent::CandidateConnected { outbound: tx2 })
            .await;

        assert_eq!(h.actor.status(), SessionStatus::Active);
        assert_eq!(h.actor.user_turn_count(), 1, "turn count survives reconnect");
        // The replacement connection is live and gated open.
        let messages = drain(&mut rx2);
        assert!(messages.iter().any(|m| matches!(
            m,
            ServerMessage::InputGate { accepting: true, .. }
        )));
        // The old connection no longer receives anything.
        assert!(rx1.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn candidate_absence_past_the_grace_period_ends_the_session() {
        let mut h = harness("ok", Duration::ZERO);
        let (tx, _rx) = mpsc::channel(OUTBOUND_BUFFER);
        h.actor
            .handle_event(SessionEvent::CandidateConnected { outbound: tx })
            .await;
        h.actor.handle_event(SessionEvent::CandidateDisconnected).await;

        let deadline = h.events_rx.recv().await.expect("grace timer fires");
        assert!(matches!(deadline, SessionEvent::DisconnectDeadline { .. }));
        h.actor.handle_event(deadline).await;
        assert_eq!(h.actor.status(), SessionStatus::Ended);
    }

    #[tokio::test(start_paused = true)]
    async fn a_reconnect_within_the_grace_period_cancels_the_deadline() {
        let mut h = harness("ok", Duration::ZERO);
        let (tx1, _rx1) = mpsc::channel(OUTBOUND_BUFFER);
        h.actor
            .handle_event(SessionEvent::CandidateConnected { outbound: tx1 })
            .await;
        h.actor.handle_event(SessionEvent::CandidateDisconnected).await;
        let (tx2, _rx2) = mpsc::channel(OUTBOUND_BUFFER);
        h.actor
            .handle_event(SessionEvent::CandidateConnected { outbound: tx2 })
            .await;

        // The timer still fires, but its sequence number is stale.
        let deadline = h.events_rx.recv().await.expect("grace timer fires");
        h.actor.handle_event(deadline).await;
        assert_eq!(h.actor.status(), SessionStatus::Active);
    }

    #[tokio::test]
    async fn post_floor_wrap_up_ends_the_session_normally() {
        let mut h = harness("ok", Duration::ZERO);
        let (cand_tx, mut cand_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let (mon_tx, mut mon_rx) = mpsc::channel(OUTBOUND_BUFFER);
        h.actor
            .handle_event(SessionEvent::CandidateConnected { outbound: cand_tx })
            .await;
        h.actor
            .handle_event(SessionEvent::MonitorConnected {
                id: "mon_1".to_string(),
                outbound: mon_tx,
            })
            .await;

        // The floor is three answers; replies stay neutral until it
        // is reached.
        for (id, reply) in [
            (1, "Noted. Could you expand on that?"),
            (2, "Interesting. What was your role exactly?"),
        ] {
            h.actor
                .handle_event(SessionEvent::FromCandidate(ClientMessage::UserText {
                    text: format!("answer {id}"),
                }))
                .await;
            h.actor
                .handle_event(SessionEvent::GenerationFinished {
                    generation_id: id,
                    result: Ok(reply.to_string()),
                })
                .await;
        }
        assert_eq!(h.actor.status(), SessionStatus::Active);

        h.actor
            .handle_event(SessionEvent::FromCandidate(ClientMessage::UserText {
                text: "final answer".to_string(),
            }))
            .await;
        drain(&mut cand_rx);
        drain(&mut mon_rx);
        h.actor
            .handle_event(SessionEvent::GenerationFinished {
                generation_id: 3,
                result: Ok("Thank you, that's all for today. Best of luck!".to_string()),
            })
            .await;

        assert_eq!(h.actor.status(), SessionStatus::Ended);
        // The closing text is still delivered before the channel drops.
        let messages = drain(&mut cand_rx);
        assert!(messages.iter().any(|m| matches!(
            m,
            ServerMessage::AiText { text, .. } if text.contains("all for today")
        )));
        let mirrored = drain(&mut mon_rx);
        assert!(mirrored.iter().any(|m| matches!(
            m,
            ServerMessage::IntegrityEvent { kind, .. } if kind == "session_ended"
        )));
    }

    #[tokio::test]
    async fn monitor_cap_is_enforced_with_an_explicit_refusal() {
        let mut h = harness("ok", Duration::ZERO);
        for i in 0..2 {
            let (tx, _rx) = mpsc::channel(OUTBOUND_BUFFER);
            h.actor
                .handle_event(SessionEvent::MonitorConnected {
                    id: format!("mon_{i}"),
                    outbound: tx,
                })
                .await;
        }
        let (tx, mut rx) = mpsc::channel(OUTBOUND_BUFFER);
        h.actor
            .handle_event(SessionEvent::MonitorConnected {
                id: "mon_over".to_string(),
                outbound: tx,
            })
            .await;
        let messages = drain(&mut rx);
        assert!(messages.iter().any(|m| matches!(
            m,
            ServerMessage::SystemBlocked { reason } if reason.contains("monitor limit")
        )));
    }

    #[tokio::test]
    async fn monitor_signaling_is_relayed_to_the_candidate_with_origin() {
        let mut h = harness("ok", Duration::ZERO);
        let (cand_tx, mut cand_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let (mon_tx, _mon_rx) = mpsc::channel(OUTBOUND_BUFFER);
        h.actor
            .handle_event(SessionEvent::CandidateConnected { outbound: cand_tx })
            .await;
        h.actor
            .handle_event(SessionEvent::MonitorConnected {
                id: "mon_1".to_string(),
                outbound: mon_tx,
            })
            .await;
        drain(&mut cand_rx);

        h.actor
            .handle_event(SessionEvent::FromMonitor {
                id: "mon_1".to_string(),
                message: ClientMessage::WebrtcSignal {
                    signal: crate::signaling::SignalPayload::Answer {
                        sdp: "v=0".to_string(),
                        to: None,
                    },
                },
            })
            .await;

        let messages = drain(&mut cand_rx);
        assert!(messages.iter().any(|m| matches!(
            m,
            ServerMessage::WebrtcSignal { from: Some(from), .. } if from == "mon_1"
        )));
    }
}
