//! WebRTC signaling relay payloads.
//!
//! The hub forwards offer/answer/ICE-candidate payloads between the
//! candidate's sharing peer connection and each monitor's viewing
//! peer connection. SDP and candidate bodies are relayed verbatim;
//! media bytes never transit the server.

use serde::{Deserialize, Serialize};

/// One signaling payload. `to` addresses a specific monitor when the
/// candidate answers; monitor-originated payloads leave it empty and
/// the relay stamps the monitor id on the forwarded frame instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum SignalPayload {
    Offer {
        sdp: String,
        #[serde(default)]
        to: Option<String>,
    },
    Answer {
        sdp: String,
        #[serde(default)]
        to: Option<String>,
    },
    IceCandidate {
        candidate: serde_json::Value,
        #[serde(default)]
        to: Option<String>,
    },
}

impl SignalPayload {
    /// The monitor a candidate-originated payload is addressed to, if
    /// any. Unaddressed payloads fan out to every monitor.
    pub fn target_monitor(&self) -> Option<&str> {
        match self {
            SignalPayload::Offer { to, .. }
            | SignalPayload::Answer { to, .. }
            | SignalPayload::IceCandidate { to, .. } => to.as_deref(),
        }
    }
}
