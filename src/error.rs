//! Pairing Error Types
//!
//! Error taxonomy shared by the orchestrator, the credential store and the
//! HTTP layer. Every variant carries a stable kind string and a
//! human-readable message.

use thiserror::Error;

use crate::engine::EngineError;

/// Errors surfaced by pairing operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PairingError {
    #[error("Session already active: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Engine initialization failed: {0}")]
    EngineInit(String),

    #[error("Pairing code unavailable: {0}")]
    PairingUnavailable(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Logged out: {0}")]
    LoggedOut(String),

    #[error("Transient disconnect: {0}")]
    TransientDisconnect(String),

    /// Connection closed for an unclassified reason before pairing finished
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// Session was deleted while a start request was still waiting
    #[error("Session cancelled: {0}")]
    Cancelled(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl PairingError {
    /// Stable, machine-readable error kind
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Conflict(_) => "conflict",
            Self::NotFound(_) => "not_found",
            Self::EngineInit(_) => "engine_init",
            Self::PairingUnavailable(_) => "pairing_unavailable",
            Self::Timeout(_) => "timeout",
            Self::LoggedOut(_) => "logged_out",
            Self::TransientDisconnect(_) => "transient_disconnect",
            Self::ConnectionClosed(_) => "connection_closed",
            Self::Cancelled(_) => "cancelled",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Storage(_) => "storage",
        }
    }
}

impl From<std::io::Error> for PairingError {
    fn from(err: std::io::Error) -> Self {
        PairingError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for PairingError {
    fn from(err: serde_json::Error) -> Self {
        PairingError::Storage(format!("Invalid credential document: {}", err))
    }
}

impl From<EngineError> for PairingError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::InitFailed(msg) => PairingError::EngineInit(msg),
            EngineError::PairingUnavailable(msg) => PairingError::PairingUnavailable(msg),
        }
    }
}

/// Result type alias for pairing operations
pub type PairingResult<T> = Result<T, PairingError>;
