//! Session State Management
//!
//! Tracks the state of individual pairing sessions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::machine::SessionMachine;
use crate::engine::ConnectionHandle;

/// Status of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Session is created, engine not opened yet
    Init,
    /// Engine connection open, waiting for the human to act on a challenge
    AwaitingChallenge,
    /// Handshake completed, credential persisted
    Connected,
    /// Waiting out the backoff before reopening the engine
    Reconnecting,
    /// Session is finished and its connection released
    Terminated,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self::Init
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Init => write!(f, "init"),
            Self::AwaitingChallenge => write!(f, "awaiting_challenge"),
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting => write!(f, "reconnecting"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

/// Complete state of a single session
#[derive(Debug)]
pub struct SessionState {
    /// Unique session identifier
    pub id: String,
    /// Registry generation this state belongs to
    pub epoch: u64,
    /// Transition logic and counters
    pub machine: SessionMachine,
    /// Engine connection, present only while the session is live
    pub handle: Option<ConnectionHandle>,
    /// Phone number for numeric pairing code sessions
    pub pairing_phone: Option<String>,
    /// Phone identifier read from the credential
    pub phone_hint: Option<String>,
    /// When the session was created
    pub created_at: DateTime<Utc>,
    /// When the session last changed
    pub last_activity: DateTime<Utc>,
    /// Error message if the session terminated abnormally
    pub error_message: Option<String>,
}

impl SessionState {
    /// Create a new session state
    pub fn new(id: impl Into<String>, epoch: u64, max_retries: u32) -> Self {
        let now = Utc::now();

        Self {
            id: id.into(),
            epoch,
            machine: SessionMachine::new(max_retries),
            handle: None,
            pairing_phone: None,
            phone_hint: None,
            created_at: now,
            last_activity: now,
            error_message: None,
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.machine.status()
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    /// Mark session as failed with error
    pub fn set_failed(&mut self, error: impl Into<String>) {
        self.error_message = Some(error.into());
    }

    /// Check if session is active (still owns or awaits an engine connection)
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Check if session is terminal (finished)
    pub fn is_terminal(&self) -> bool {
        self.status() == SessionStatus::Terminated
    }

    /// Get session age in seconds
    pub fn duration_secs(&self) -> i64 {
        (self.last_activity - self.created_at).num_seconds()
    }
}

/// Serializable session snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: String,
    pub epoch: u64,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub challenge_emitted: bool,
    pub retry_count: u32,
    pub phone_hint: Option<String>,
    pub connection: Option<String>,
    pub error_message: Option<String>,
    pub duration_secs: i64,
}

impl From<&SessionState> for SessionInfo {
    fn from(state: &SessionState) -> Self {
        Self {
            session_id: state.id.clone(),
            epoch: state.epoch,
            status: state.status(),
            created_at: state.created_at,
            last_activity: state.last_activity,
            challenge_emitted: state.machine.challenge_emitted(),
            retry_count: state.machine.retry_count(),
            phone_hint: state.phone_hint.clone(),
            connection: state.handle.as_ref().map(|h| h.to_string()),
            error_message: state.error_message.clone(),
            duration_secs: state.duration_secs(),
        }
    }
}
