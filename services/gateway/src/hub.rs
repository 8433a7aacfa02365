//! Session hub.
//!
//! Owns the token-to-session map and the readiness gate. Sockets are
//! bridged onto the per-session event queue here; everything after the
//! handshake is the session actor's business.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use parley_core::context::InterviewContext;
use parley_core::health::{HealthCheck, RuntimeHealthCache};
use parley_core::resolver::ResolveRequest;

use crate::protocol::{ClientMessage, ServerMessage, encode_server_message, parse_client_message};
use crate::session::{OUTBOUND_BUFFER, SessionActor, SessionDeps, SessionEvent};

/// Capacity of the per-session event queue. Large enough to absorb a
/// burst of audio frames without backpressuring the socket read loop.
const EVENT_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Candidate,
    Monitor,
}

impl Role {
    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "candidate" => Some(Role::Candidate),
            "monitor" => Some(Role::Monitor),
            _ => None,
        }
    }
}

type SessionResult = Result<mpsc::Sender<SessionEvent>, String>;

/// One slot per token. `Creating` marks the token as claimed while the
/// readiness gate runs, so a second connect with the same token joins
/// the same creation instead of racing it.
enum SessionSlot {
    Creating(watch::Receiver<Option<SessionResult>>),
    Ready(mpsc::Sender<SessionEvent>),
}

pub struct SessionHub {
    sessions: Arc<DashMap<String, SessionSlot>>,
    deps: Arc<SessionDeps>,
    health: Arc<RuntimeHealthCache>,
    default_min_user_turns: u32,
}

impl SessionHub {
    pub fn new(
        deps: Arc<SessionDeps>,
        health: Arc<RuntimeHealthCache>,
        default_min_user_turns: u32,
    ) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            deps,
            health,
            default_min_user_turns,
        }
    }

    /// Returns the event queue of the session for `token`, creating
    /// the session if this is the first candidate connection. A
    /// session is only created once the readiness gate passes; the
    /// error string is the user-facing blocked reason.
    ///
    /// The token is claimed in the map before any await, so concurrent
    /// connects with one token always end up on one session.
    pub async fn ensure_session(&self, token: &str) -> SessionResult {
        enum Found {
            Ready(mpsc::Sender<SessionEvent>),
            Wait(watch::Receiver<Option<SessionResult>>),
            Stale,
            None,
        }

        loop {
            let found = match self.sessions.get(token) {
                Some(slot) => match slot.value() {
                    SessionSlot::Ready(events) if !events.is_closed() => {
                        Found::Ready(events.clone())
                    }
                    SessionSlot::Ready(_) => Found::Stale,
                    SessionSlot::Creating(rx) => Found::Wait(rx.clone()),
                },
                None => Found::None,
            };
            match found {
                Found::Ready(events) => return Ok(events),
                Found::Wait(mut rx) => {
                    loop {
                        if let Some(result) = rx.borrow().clone() {
                            return result;
                        }
                        if rx.changed().await.is_err() {
                            // The creating task went away without
                            // publishing; clear its claim and retry.
                            self.sessions
                                .remove_if(token, |_, slot| matches!(slot, SessionSlot::Creating(_)));
                            break;
                        }
                    }
                    continue;
                }
                Found::Stale => {
                    self.sessions.remove_if(token, |_, slot| {
                        matches!(slot, SessionSlot::Ready(events) if events.is_closed())
                    });
                    continue;
                }
                Found::None => {}
            }

            let (tx, rx) = watch::channel(None);
            match self.sessions.entry(token.to_string()) {
                Entry::Occupied(_) => continue, // lost the claim race, join theirs
                Entry::Vacant(slot) => {
                    slot.insert(SessionSlot::Creating(rx));
                }
            }

            let result = self.create_session(token).await;
            match &result {
                Ok(events) => {
                    self.sessions
                        .insert(token.to_string(), SessionSlot::Ready(events.clone()));
                }
                Err(_) => {
                    self.sessions
                        .remove_if(token, |_, slot| matches!(slot, SessionSlot::Creating(_)));
                }
            }
            let _ = tx.send(Some(result.clone()));
            return result;
        }
    }

    /// Runs the readiness gate and spawns the actor. Only the task
    /// holding the `Creating` claim for the token gets here.
    async fn create_session(&self, token: &str) -> SessionResult {
        let mut context = match self.deps.store.load_interview_context(token).await {
            Ok(context) => context,
            Err(err) => {
                tracing::error!(%token, error = %err, "failed to load interview context");
                return Err("interview not found or not ready".to_string());
            }
        };
        if context.ai.min_user_turns_before_wrap == 0 {
            context.ai.min_user_turns_before_wrap = self.default_min_user_turns;
        }

        self.check_readiness(&context).await?;

        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let actor = SessionActor::new(
            token.to_string(),
            context,
            self.deps.clone(),
            events_tx.clone(),
        );
        let sessions = self.sessions.clone();
        let token = token.to_string();
        let cleanup_events = events_tx.clone();
        tokio::spawn(async move {
            actor.run(events_rx).await;
            // Remove only our own handle; a replacement session
            // registered under the same token stays untouched.
            sessions.remove_if(&token, |_, slot| {
                matches!(slot, SessionSlot::Ready(events) if events.same_channel(&cleanup_events))
            });
        });
        Ok(events_tx)
    }

    /// Looks up a running session without creating one. Monitors may
    /// only join sessions a candidate has started.
    pub fn running_session(&self, token: &str) -> Option<mpsc::Sender<SessionEvent>> {
        self.sessions.get(token).and_then(|slot| match slot.value() {
            SessionSlot::Ready(events) if !events.is_closed() => Some(events.clone()),
            _ => None,
        })
    }

    /// Readiness gate: at least one credential must exist for the
    /// company, and at least one credential in cascade order must pass
    /// the runtime health check. A dead primary with a healthy
    /// fallback behind it still opens the session, since generation
    /// would cascade to the fallback anyway. Blocks session creation,
    /// never an in-progress interview.
    async fn check_readiness(&self, context: &InterviewContext) -> Result<(), String> {
        let request = ResolveRequest {
            company_id: context.company_id.clone(),
            provider: context.ai.provider,
            model: context.ai.model.clone(),
            preferred_key_id: context.ai.preferred_key_id.clone(),
            runtime_primary: None,
            allow_key_fallback: true,
            allow_env_fallback: true,
            prompt: String::new(),
            system_instruction: String::new(),
            temperature: 0.0,
            max_tokens: 1,
        };
        let candidates = self.deps.resolver.ordered_candidates(&request).await;
        if candidates.is_empty() {
            return Err(
                "no AI credential is configured; connect an AI key in settings".to_string(),
            );
        }
        let mut first_reason: Option<String> = None;
        for (provider, candidate) in candidates {
            let check = HealthCheck {
                provider,
                credential_id: candidate.id().map(str::to_string),
                key_name: Some(candidate.key_name().to_string()),
                api_key: Some(candidate.api_key().clone()),
                base_url: candidate.base_url().map(str::to_string),
            };
            let result = self.health.check(&context.company_id, &check).await;
            if result.ready {
                return Ok(());
            }
            if first_reason.is_none() {
                first_reason = result.reason;
            }
        }
        Err(first_reason.unwrap_or_else(|| "the AI runtime is not ready".to_string()))
    }
}

/// Bridges one accepted WebSocket onto the session event queue.
pub async fn handle_socket(hub: Arc<SessionHub>, socket: WebSocket, role: Role, token: String) {
    match role {
        Role::Candidate => handle_candidate_socket(hub, socket, token).await,
        Role::Monitor => handle_monitor_socket(hub, socket, token).await,
    }
}

async fn handle_candidate_socket(hub: Arc<SessionHub>, socket: WebSocket, token: String) {
    let events = match hub.ensure_session(&token).await {
        Ok(events) => events,
        Err(reason) => {
            tracing::warn!(%token, %reason, "refusing candidate connection");
            reject_socket(socket, reason).await;
            return;
        }
    };

    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
    if events
        .send(SessionEvent::CandidateConnected {
            outbound: outbound_tx,
        })
        .await
        .is_err()
    {
        tracing::warn!(%token, "session ended before candidate attach completed");
        return;
    }

    pump_socket(socket, outbound_rx, events.clone(), |message| {
        SessionEvent::FromCandidate(message)
    })
    .await;
    let _ = events.send(SessionEvent::CandidateDisconnected).await;
    tracing::info!(%token, "candidate connection closed");
}

async fn handle_monitor_socket(hub: Arc<SessionHub>, socket: WebSocket, token: String) {
    let Some(events) = hub.running_session(&token) else {
        tracing::warn!(%token, "monitor attach for a session that is not running");
        reject_socket(socket, "interview session is not active".to_string()).await;
        return;
    };

    let monitor_id = format!("mon_{}", Uuid::new_v4().simple());
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
    if events
        .send(SessionEvent::MonitorConnected {
            id: monitor_id.clone(),
            outbound: outbound_tx,
        })
        .await
        .is_err()
    {
        tracing::warn!(%token, "session ended before monitor attach completed");
        return;
    }

    let id_for_events = monitor_id.clone();
    pump_socket(socket, outbound_rx, events.clone(), move |message| {
        SessionEvent::FromMonitor {
            id: id_for_events.clone(),
            message,
        }
    })
    .await;
    let _ = events
        .send(SessionEvent::MonitorDisconnected { id: monitor_id })
        .await;
    tracing::info!(%token, "monitor connection closed");
}

/// Sends a single blocked frame and closes the socket.
async fn reject_socket(mut socket: WebSocket, reason: String) {
    let frame = encode_server_message(&ServerMessage::SystemBlocked { reason });
    let _ = socket.send(Message::Text(frame.into())).await;
    let _ = socket.close().await;
}

/// Runs the read and write halves of one connection until either side
/// closes. Outbound frames come from the session actor; inbound text
/// frames are parsed and wrapped into session events.
async fn pump_socket<F>(
    socket: WebSocket,
    mut outbound_rx: mpsc::Receiver<ServerMessage>,
    events: mpsc::Sender<SessionEvent>,
    wrap: F,
) where
    F: Fn(ClientMessage) -> SessionEvent,
{
    let (mut sink, mut stream) = socket.split();

    let mut write_task = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let frame = encode_server_message(&message);
            if sink.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    loop {
        tokio::select! {
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(raw))) => match parse_client_message(&raw) {
                        Ok(message) => {
                            if events.send(wrap(message)).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => {
                            // Protocol error: drop the frame, keep the
                            // connection.
                            tracing::warn!(error = %err, "dropping malformed client frame");
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        tracing::warn!(error = %err, "websocket read error");
                        break;
                    }
                }
            }
            _ = &mut write_task => break,
        }
    }
    write_task.abort();
}
