//! Session State Machine
//!
//! Pure transition logic for one pairing session. The orchestrator feeds it
//! engine events and timer expiries and acts on the returned decisions; the
//! machine itself performs no I/O.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::state::SessionStatus;
use crate::engine::DisconnectReason;
use crate::error::PairingError;

/// Whether a challenge event reaches the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeDecision {
    Surface,
    Suppress,
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalCause {
    /// Engine reported the credential as logged out
    LoggedOut,
    /// Transient disconnects used up the retry budget
    RetriesExhausted,
    /// Closed for an unclassified reason
    Disconnected,
    /// Engine failed to open a connection
    EngineInit,
    /// No challenge or connect within the start budget
    StartTimeout,
    /// Numeric pairing code could not be issued
    PairingUnavailable,
    /// Credential handed off and wiped after pairing
    Delivered,
    /// Explicit delete
    Deleted,
    /// Process shutdown
    Shutdown,
}

impl TerminalCause {
    /// Whether the stored credential must be discarded
    pub fn wipes_credential(&self) -> bool {
        matches!(self, Self::LoggedOut | Self::Delivered)
    }

    /// Error reported for this cause, `None` when the end was requested or successful
    pub fn error(&self, session_id: &str, detail: Option<&str>) -> Option<PairingError> {
        let detail = detail.map(|d| format!(": {}", d)).unwrap_or_default();
        match self {
            Self::LoggedOut => Some(PairingError::LoggedOut(format!(
                "session {} was logged out{}",
                session_id, detail
            ))),
            Self::RetriesExhausted => Some(PairingError::Timeout(format!(
                "session {} gave up reconnecting{}",
                session_id, detail
            ))),
            Self::Disconnected => Some(PairingError::ConnectionClosed(format!(
                "session {} closed before pairing completed{}",
                session_id, detail
            ))),
            Self::EngineInit => Some(PairingError::EngineInit(format!(
                "session {}{}",
                session_id, detail
            ))),
            Self::StartTimeout => Some(PairingError::Timeout(format!(
                "no challenge issued for session {}{}",
                session_id, detail
            ))),
            Self::PairingUnavailable => Some(PairingError::PairingUnavailable(format!(
                "session {}{}",
                session_id, detail
            ))),
            Self::Delivered | Self::Deleted | Self::Shutdown => None,
        }
    }
}

/// Decision after a `closed` event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// Wait out the backoff, then reopen with the stored seed
    Reconnect { attempt: u32 },
    /// Session is over
    Terminate(TerminalCause),
    /// Session was already terminated
    Ignored,
}

/// Invalid transition
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Cannot apply {event} in state {from}")]
pub struct TransitionError {
    pub from: SessionStatus,
    pub event: &'static str,
}

/// Per-session state machine
#[derive(Debug, Clone)]
pub struct SessionMachine {
    status: SessionStatus,
    /// A challenge was surfaced in this lifecycle
    challenge_emitted: bool,
    /// Consecutive transient closes since the last connect
    retry_count: u32,
    max_retries: u32,
    /// Reached CONNECTED at least once in this lifecycle
    ever_connected: bool,
}

impl SessionMachine {
    pub fn new(max_retries: u32) -> Self {
        Self {
            status: SessionStatus::Init,
            challenge_emitted: false,
            retry_count: 0,
            max_retries,
            ever_connected: false,
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn challenge_emitted(&self) -> bool {
        self.challenge_emitted
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn ever_connected(&self) -> bool {
        self.ever_connected
    }

    pub fn is_terminal(&self) -> bool {
        self.status == SessionStatus::Terminated
    }

    /// Engine `open` succeeded
    pub fn opened(&mut self) -> Result<(), TransitionError> {
        match self.status {
            SessionStatus::Init | SessionStatus::Reconnecting => {
                self.status = SessionStatus::AwaitingChallenge;
                Ok(())
            }
            from => Err(TransitionError {
                from,
                event: "opened",
            }),
        }
    }

    /// Engine emitted a challenge (or is ready for a pairing code).
    ///
    /// At most one challenge is surfaced per lifecycle; retransmits and
    /// challenges after a resumed connect are suppressed.
    pub fn challenge(&mut self) -> ChallengeDecision {
        if self.status == SessionStatus::AwaitingChallenge
            && !self.challenge_emitted
            && !self.ever_connected
        {
            self.challenge_emitted = true;
            ChallengeDecision::Surface
        } else {
            ChallengeDecision::Suppress
        }
    }

    /// Handshake completed. Returns `true` on the first connect of the lifecycle.
    pub fn connected(&mut self) -> Result<bool, TransitionError> {
        match self.status {
            SessionStatus::AwaitingChallenge => {
                let first = !self.ever_connected;
                self.status = SessionStatus::Connected;
                self.ever_connected = true;
                self.retry_count = 0;
                Ok(first)
            }
            from => Err(TransitionError {
                from,
                event: "connected",
            }),
        }
    }

    /// Connection closed
    pub fn closed(&mut self, reason: DisconnectReason) -> CloseOutcome {
        if self.is_terminal() {
            return CloseOutcome::Ignored;
        }

        let outcome = match reason {
            DisconnectReason::LoggedOut => CloseOutcome::Terminate(TerminalCause::LoggedOut),
            DisconnectReason::Unknown => CloseOutcome::Terminate(TerminalCause::Disconnected),
            DisconnectReason::Transient => {
                // An established identity always gets at least one reconnect
                let budget = if self.ever_connected {
                    self.max_retries.max(1)
                } else {
                    self.max_retries
                };
                if self.retry_count < budget {
                    self.retry_count += 1;
                    CloseOutcome::Reconnect {
                        attempt: self.retry_count,
                    }
                } else {
                    CloseOutcome::Terminate(TerminalCause::RetriesExhausted)
                }
            }
        };

        self.status = match outcome {
            CloseOutcome::Reconnect { .. } => SessionStatus::Reconnecting,
            _ => SessionStatus::Terminated,
        };
        outcome
    }

    /// Start budget elapsed. Terminates only a session still waiting for its
    /// first challenge.
    pub fn timed_out(&mut self) -> bool {
        let waiting = matches!(
            self.status,
            SessionStatus::Init | SessionStatus::AwaitingChallenge | SessionStatus::Reconnecting
        );
        if waiting && !self.challenge_emitted && !self.ever_connected {
            self.status = SessionStatus::Terminated;
            true
        } else {
            false
        }
    }

    /// Force the terminal state
    pub fn terminate(&mut self) {
        self.status = SessionStatus::Terminated;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn awaiting(max_retries: u32) -> SessionMachine {
        let mut machine = SessionMachine::new(max_retries);
        machine.opened().unwrap();
        machine
    }

    #[test]
    fn test_challenge_surfaced_once() {
        let mut machine = awaiting(3);
        assert_eq!(machine.challenge(), ChallengeDecision::Surface);
        assert_eq!(machine.challenge(), ChallengeDecision::Suppress);
        assert!(machine.challenge_emitted());
    }

    #[test]
    fn test_challenge_before_open_is_suppressed() {
        let mut machine = SessionMachine::new(3);
        assert_eq!(machine.challenge(), ChallengeDecision::Suppress);
        assert!(!machine.challenge_emitted());
    }

    #[test]
    fn test_direct_connect() {
        let mut machine = awaiting(3);
        assert_eq!(machine.connected(), Ok(true));
        assert_eq!(machine.status(), SessionStatus::Connected);
        assert_eq!(machine.challenge(), ChallengeDecision::Suppress);
    }

    #[test]
    fn test_connect_requires_open() {
        let mut machine = SessionMachine::new(3);
        let err = machine.connected().unwrap_err();
        assert_eq!(err.from, SessionStatus::Init);
    }

    #[test]
    fn test_transient_close_within_budget_reconnects() {
        let mut machine = awaiting(2);
        assert_eq!(
            machine.closed(DisconnectReason::Transient),
            CloseOutcome::Reconnect { attempt: 1 }
        );
        assert_eq!(machine.status(), SessionStatus::Reconnecting);
        machine.opened().unwrap();
        assert_eq!(
            machine.closed(DisconnectReason::Transient),
            CloseOutcome::Reconnect { attempt: 2 }
        );
        machine.opened().unwrap();
        assert_eq!(
            machine.closed(DisconnectReason::Transient),
            CloseOutcome::Terminate(TerminalCause::RetriesExhausted)
        );
        assert!(machine.is_terminal());
    }

    #[test]
    fn test_zero_retries_fails_fast() {
        let mut machine = awaiting(0);
        assert_eq!(
            machine.closed(DisconnectReason::Transient),
            CloseOutcome::Terminate(TerminalCause::RetriesExhausted)
        );
    }

    #[test]
    fn test_connected_session_reconnects_with_zero_budget() {
        let mut machine = awaiting(0);
        machine.connected().unwrap();
        assert_eq!(
            machine.closed(DisconnectReason::Transient),
            CloseOutcome::Reconnect { attempt: 1 }
        );
        machine.opened().unwrap();
        assert_eq!(machine.connected(), Ok(false));
        assert_eq!(machine.retry_count(), 0);
    }

    #[test]
    fn test_no_new_challenge_after_reconnect() {
        let mut machine = awaiting(3);
        assert_eq!(machine.challenge(), ChallengeDecision::Surface);
        machine.closed(DisconnectReason::Transient);
        machine.opened().unwrap();
        assert_eq!(machine.challenge(), ChallengeDecision::Suppress);
    }

    #[test]
    fn test_challenge_after_early_transient_close() {
        let mut machine = awaiting(3);
        machine.closed(DisconnectReason::Transient);
        machine.opened().unwrap();
        assert_eq!(machine.challenge(), ChallengeDecision::Surface);
    }

    #[test]
    fn test_logged_out_terminates_and_wipes() {
        let mut machine = awaiting(3);
        machine.connected().unwrap();
        let outcome = machine.closed(DisconnectReason::LoggedOut);
        assert_eq!(outcome, CloseOutcome::Terminate(TerminalCause::LoggedOut));
        assert!(TerminalCause::LoggedOut.wipes_credential());
        assert_eq!(machine.closed(DisconnectReason::Transient), CloseOutcome::Ignored);
    }

    #[test]
    fn test_timeout_only_without_challenge() {
        let mut machine = awaiting(3);
        machine.challenge();
        assert!(!machine.timed_out());
        assert_eq!(machine.status(), SessionStatus::AwaitingChallenge);

        let mut machine = awaiting(3);
        assert!(machine.timed_out());
        assert!(machine.is_terminal());
    }

    #[test]
    fn test_cause_errors() {
        let err = TerminalCause::RetriesExhausted.error("s2", None).unwrap();
        assert_eq!(err.kind(), "timeout");
        assert!(TerminalCause::Deleted.error("s2", None).is_none());
        let err = TerminalCause::EngineInit.error("s2", Some("refused")).unwrap();
        assert!(err.to_string().contains("refused"));
    }
}
