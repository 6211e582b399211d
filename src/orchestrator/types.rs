//! Orchestrator Types
//!
//! Configuration, requests and results of the orchestrator API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::PairingError;
use crate::session::SessionStatus;

/// What happens to the credential after the first successful pairing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialRetention {
    /// Keep the credential in the store
    Keep,
    /// Deliver the credential through the engine, then wipe it and end the session
    WipeAfterPairing,
}

impl Default for CredentialRetention {
    fn default() -> Self {
        Self::Keep
    }
}

/// Orchestrator tuning
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Budget for the first challenge or connect
    pub start_timeout: Duration,
    /// Transient disconnects tolerated before giving up
    pub max_retries: u32,
    /// Delay before reopening after a transient disconnect
    pub reconnect_backoff: Duration,
    /// Default credential retention policy
    pub retention: CredentialRetention,
    /// How long shutdown waits for connections to close
    pub shutdown_grace: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            start_timeout: Duration::from_secs(45),
            max_retries: 3,
            reconnect_backoff: Duration::from_millis(3000),
            retention: CredentialRetention::Keep,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Options for starting a session
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Caller-chosen id; generated when absent
    pub session_id: Option<String>,
    /// Phone number for numeric pairing code sessions
    pub pairing_phone: Option<String>,
    /// Override of the default retention policy
    pub retention: Option<CredentialRetention>,
}

impl StartOptions {
    pub fn with_id(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            ..Default::default()
        }
    }
}

/// Challenge a human must act on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum Challenge {
    Qr(String),
    PairingCode(String),
}

/// First surfaced result of a start request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum StartOutcome {
    #[serde(rename_all = "camelCase")]
    Challenge {
        session_id: String,
        challenge: Challenge,
    },
    #[serde(rename_all = "camelCase")]
    Connected {
        session_id: String,
        phone_hint: Option<String>,
    },
}

impl StartOutcome {
    pub fn session_id(&self) -> &str {
        match self {
            Self::Challenge { session_id, .. } => session_id,
            Self::Connected { session_id, .. } => session_id,
        }
    }
}

/// Last terminal failure of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl From<&PairingError> for ErrorRecord {
    fn from(err: &PairingError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
            at: Utc::now(),
        }
    }
}

/// Result of `get_status`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusReport {
    pub session_id: String,
    pub exists: bool,
    pub is_active: bool,
    pub status: Option<SessionStatus>,
    pub has_credentials: bool,
    pub phone_hint: Option<String>,
    pub last_error: Option<ErrorRecord>,
}

/// Entry of `list_sessions`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    pub is_active: bool,
    pub status: Option<SessionStatus>,
    pub has_credentials: bool,
    pub phone_hint: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Result of `delete_session`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
}
