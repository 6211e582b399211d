//! Connection Engine Adapter
//!
//! The interface the orchestrator uses to drive a multi-device protocol
//! engine. Implementations own the actual handshake and encryption; the
//! orchestrator only sees a handle, an ordered event stream and a small set
//! of commands.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

/// Opaque reference to one engine connection attempt
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionHandle {
    /// Session this connection belongs to
    pub session_id: String,
    /// Engine-assigned connection identifier, unique per engine instance
    pub connection_id: u64,
}

impl ConnectionHandle {
    pub fn new(session_id: impl Into<String>, connection_id: u64) -> Self {
        Self {
            session_id: session_id.into(),
            connection_id,
        }
    }
}

impl std::fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.session_id, self.connection_id)
    }
}

/// Closed classification of disconnect reasons
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DisconnectReason {
    /// Credential is permanently invalid and must be discarded
    LoggedOut,
    /// Retryable network or server-side interruption
    Transient,
    /// Anything the adapter could not classify
    Unknown,
}

impl DisconnectReason {
    /// Classify a multi-device disconnect status code.
    ///
    /// 401 (logged out) and 403 (forbidden) invalidate the credential.
    /// 408 (timed out / connection lost), 428 (connection closed),
    /// 500 (bad session), 503 (service unavailable) and 515 (restart
    /// required) are retryable. 440 (replaced by another client) and
    /// everything else is unknown.
    pub fn from_status_code(code: u16) -> Self {
        match code {
            401 | 403 => Self::LoggedOut,
            408 | 428 | 500 | 503 | 515 => Self::Transient,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LoggedOut => write!(f, "loggedOut"),
            Self::Transient => write!(f, "transient"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Events emitted by an engine connection, in order
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// QR challenge payload; engines may retransmit or rotate it
    Qr(String),
    /// The connection is ready to accept a numeric pairing code request
    PairingCodeReady,
    /// Credential material was refreshed by the engine
    CredentialsUpdated(serde_json::Value),
    /// Handshake finished; carries the full credential document
    Connected(serde_json::Value),
    /// Connection closed; terminal for this attempt
    Closed(DisconnectReason),
}

/// An opened connection: its handle plus the event stream
#[derive(Debug)]
pub struct EngineConnection {
    pub handle: ConnectionHandle,
    pub events: mpsc::Receiver<EngineEvent>,
}

/// Engine adapter errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Engine failed to open connection: {0}")]
    InitFailed(String),

    #[error("Pairing code unavailable: {0}")]
    PairingUnavailable(String),
}

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Connection engine trait - the contract every protocol engine implements
#[async_trait]
pub trait ConnectionEngine: Send + Sync {
    /// Open a connection, optionally resuming from a stored credential
    async fn open(
        &self,
        session_id: &str,
        seed: Option<serde_json::Value>,
    ) -> EngineResult<EngineConnection>;

    /// Request a numeric pairing code for the given phone number
    async fn request_pairing_code(
        &self,
        handle: &ConnectionHandle,
        phone_number: &str,
    ) -> EngineResult<String>;

    /// Hand the credential to the paired account before it is wiped locally
    async fn deliver_credential(
        &self,
        _handle: &ConnectionHandle,
        _credential: &serde_json::Value,
    ) -> EngineResult<()> {
        Ok(())
    }

    /// Release engine resources. Idempotent.
    async fn close(&self, handle: &ConnectionHandle);

    /// Engine name for logs
    fn engine_name(&self) -> &'static str;
}
