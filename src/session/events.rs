//! Session Events
//!
//! Lifecycle events broadcast by the orchestrator.

use serde::{Deserialize, Serialize};

use super::machine::TerminalCause;
use super::state::SessionStatus;

/// Kind of challenge surfaced to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChallengeKind {
    Qr,
    PairingCode,
}

/// Events that can be emitted during a session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SessionEvent {
    /// Session status changed
    StatusChanged {
        session_id: String,
        old_status: SessionStatus,
        new_status: SessionStatus,
    },

    /// A challenge was surfaced to the caller
    ChallengeIssued {
        session_id: String,
        kind: ChallengeKind,
    },

    /// Handshake completed and the credential was stored
    Paired {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        phone_hint: Option<String>,
    },

    /// Reconnect scheduled after a transient disconnect
    Reconnecting {
        session_id: String,
        attempt: u32,
    },

    /// Session ended
    Terminated {
        session_id: String,
        cause: TerminalCause,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl SessionEvent {
    /// Get the session ID from any event
    pub fn session_id(&self) -> &str {
        match self {
            Self::StatusChanged { session_id, .. } => session_id,
            Self::ChallengeIssued { session_id, .. } => session_id,
            Self::Paired { session_id, .. } => session_id,
            Self::Reconnecting { session_id, .. } => session_id,
            Self::Terminated { session_id, .. } => session_id,
        }
    }

    /// Get the scoped event name for this event
    pub fn event_name(&self) -> String {
        format!("{}:{}", self.global_event_name(), self.session_id())
    }

    /// Get the global event name
    pub fn global_event_name(&self) -> &'static str {
        match self {
            Self::StatusChanged { .. } => "session-status",
            Self::ChallengeIssued { .. } => "session-challenge",
            Self::Paired { .. } => "session-paired",
            Self::Reconnecting { .. } => "session-reconnecting",
            Self::Terminated { .. } => "session-terminated",
        }
    }
}
