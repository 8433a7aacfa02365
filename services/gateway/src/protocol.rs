//! WebSocket wire protocol.
//!
//! Every frame is a JSON object tagged by `type`. Candidate and
//! monitor connections share one inbound enum; the session actor
//! decides per role what is meaningful. Unrecognized or malformed
//! payloads are protocol errors: logged and dropped, the connection
//! stays open.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use parley_core::MessageRole;

use crate::signaling::SignalPayload;

/// Messages arriving from candidate or monitor connections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// One complete candidate utterance, base64-encoded. The bytes
    /// are opaque to the hub and only ever handed to the STT
    /// collaborator.
    Audio {
        data: String,
        #[serde(default)]
        mime_type: Option<String>,
    },
    /// Voice-activity edge from the candidate's capture pipeline.
    VadEvent { speaking: bool },
    /// A typed candidate answer.
    UserText { text: String },
    /// Proctoring telemetry (tab switch, copy attempt, ...).
    SecurityViolation {
        kind: String,
        #[serde(default)]
        detail: Option<String>,
    },
    /// Screen-share lifecycle, driven by the candidate side. Surface
    /// policy enforcement happens there, not in the hub.
    ScreenShareStatus {
        active: bool,
        #[serde(default)]
        surface: Option<String>,
        #[serde(default)]
        muted: Option<bool>,
    },
    /// Live coding pad contents, mirrored to monitors verbatim.
    CodeSync {
        content: String,
        #[serde(default)]
        language: Option<String>,
    },
    /// Monitor asks for the full room snapshot.
    RoomStateRequest,
    /// Monitor asks the candidate for a fresh WebRTC offer.
    WebrtcRequestOffer,
    /// Signaling payload to relay to the other side.
    WebrtcSignal { signal: SignalPayload },
    /// Monitor asks the candidate to restart the screen share.
    MonitorRequestReshare,
    /// Monitor force-terminates the session.
    MonitorTerminate {
        #[serde(default)]
        reason: Option<String>,
    },
}

/// Pipeline-stage indicator for UI feedback only; it carries no
/// decision authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    Listening,
    Thinking,
    Speaking,
}

/// Messages the server sends to candidate or monitor connections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Transcript {
        role: MessageRole,
        text: String,
        turn: u32,
    },
    AiText {
        text: String,
        turn: u32,
    },
    /// Opaque synthesized audio for the candidate, relayed untouched.
    /// Reserved for a TTS collaborator; the current pipeline delivers
    /// `ai_text` and goes straight to `assistant_audio_done`, so the
    /// candidate UI must not wait for playback frames.
    AudioPlayback {
        data: String,
    },
    AssistantAudioDone,
    InterviewTurnState {
        state: TurnState,
    },
    VoiceMode {
        enabled: bool,
    },
    SpeechCaptureHint {
        capture: bool,
    },
    InputGate {
        accepting: bool,
        #[serde(default)]
        reason: Option<String>,
    },
    SystemBlocked {
        reason: String,
    },
    ForceTerminate {
        reason: String,
    },
    InterventionWarning {
        message: String,
    },
    RoomState {
        state: RoomState,
    },
    IntegrityEvent {
        kind: String,
        #[serde(default)]
        detail: Option<String>,
        at: DateTime<Utc>,
    },
    ScreenShareStatus {
        active: bool,
        surface: String,
        muted: bool,
    },
    /// Relayed signaling; `from` carries the originating monitor id
    /// when the payload travels monitor-to-candidate.
    WebrtcSignal {
        #[serde(default)]
        from: Option<String>,
        signal: SignalPayload,
    },
    /// Server-initiated request for a fresh offer, sent to the
    /// candidate when a monitor attaches or asks for a reshare.
    WebrtcRequestOffer {
        from: String,
    },
    CodeSync {
        content: String,
        #[serde(default)]
        language: Option<String>,
    },
}

pub const SCREEN_SURFACE_UNKNOWN: &str = "unknown";

/// Single authoritative per-session snapshot, mutated only by the
/// session actor and broadcast to monitors on every mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomState {
    pub candidate_online: bool,
    pub monitor_count: usize,
    pub screen_share_active: bool,
    pub screen_surface: String,
    pub screen_muted: bool,
    pub last_screen_share_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl RoomState {
    pub fn new() -> Self {
        Self {
            candidate_online: false,
            monitor_count: 0,
            screen_share_active: false,
            screen_surface: SCREEN_SURFACE_UNKNOWN.to_string(),
            screen_muted: false,
            last_screen_share_at: None,
            updated_at: Utc::now(),
        }
    }
}

impl Default for RoomState {
    fn default() -> Self {
        Self::new()
    }
}

/// Parses one inbound frame. Errors here are protocol errors, handled
/// by logging and dropping the frame.
pub fn parse_client_message(raw: &str) -> Result<ClientMessage, serde_json::Error> {
    serde_json::from_str(raw)
}

pub fn encode_server_message(message: &ServerMessage) -> String {
    // ServerMessage contains no map keys that can fail to serialize;
    // fall back to a minimal blocked frame if that ever changes.
    serde_json::to_string(message).unwrap_or_else(|err| {
        tracing::error!(error = %err, "failed to encode server message");
        r#"{"type":"system_blocked","reason":"internal encoding error"}"#.to_string()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_messages_round_trip_their_tags() {
        let parsed = parse_client_message(r#"{"type":"user_text","text":"hi"}"#).unwrap();
        assert_eq!(
            parsed,
            ClientMessage::UserText {
                text: "hi".to_string()
            }
        );

        let parsed = parse_client_message(r#"{"type":"room_state_request"}"#).unwrap();
        assert_eq!(parsed, ClientMessage::RoomStateRequest);

        let parsed = parse_client_message(
            r#"{"type":"screen_share_status","active":true,"surface":"monitor","muted":false}"#,
        )
        .unwrap();
        assert_eq!(
            parsed,
            ClientMessage::ScreenShareStatus {
                active: true,
                surface: Some("monitor".to_string()),
                muted: Some(false),
            }
        );
    }

    #[test]
    fn malformed_and_unknown_frames_are_errors_not_panics() {
        assert!(parse_client_message("not json").is_err());
        assert!(parse_client_message(r#"{"type":"no_such_message"}"#).is_err());
        assert!(parse_client_message(r#"{"text":"missing tag"}"#).is_err());
    }

    #[test]
    fn server_messages_use_snake_case_tags() {
        let encoded = encode_server_message(&ServerMessage::InterviewTurnState {
            state: TurnState::Thinking,
        });
        assert_eq!(
            encoded,
            r#"{"type":"interview_turn_state","state":"thinking"}"#
        );

        let encoded = encode_server_message(&ServerMessage::InputGate {
            accepting: false,
            reason: Some("generation_pending".to_string()),
        });
        assert!(encoded.contains(r#""type":"input_gate""#));
        assert!(encoded.contains(r#""accepting":false"#));
    }
}
