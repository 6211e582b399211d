//! Session Driver
//!
//! One task per session reads the engine event stream in order and advances
//! the state machine. It is the only code that issues engine commands on the
//! session's connection handle.

use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use super::types::{Challenge, CredentialRetention, StartOutcome};
use super::Inner;
use crate::engine::{ConnectionHandle, DisconnectReason, EngineConnection, EngineEvent};
use crate::error::PairingResult;
use crate::session::{ChallengeDecision, ChallengeKind, CloseOutcome, SessionEntry, SessionEvent, TerminalCause};
use crate::store::phone_hint;

/// Slot for the first surfaced result of a start request
pub(super) type SurfaceSender = oneshot::Sender<PairingResult<StartOutcome>>;

enum Flow {
    Continue,
    Reconnect,
    Stop,
}

pub(super) struct SessionDriver {
    inner: Arc<Inner>,
    entry: Arc<SessionEntry>,
    handle: ConnectionHandle,
    events: mpsc::Receiver<EngineEvent>,
    cancel_rx: oneshot::Receiver<()>,
    surface: Option<SurfaceSender>,
    pairing_phone: Option<String>,
    retention: CredentialRetention,
}

impl SessionDriver {
    pub(super) fn new(
        inner: Arc<Inner>,
        entry: Arc<SessionEntry>,
        connection: EngineConnection,
        cancel_rx: oneshot::Receiver<()>,
        surface: SurfaceSender,
        pairing_phone: Option<String>,
        retention: CredentialRetention,
    ) -> Self {
        Self {
            inner,
            entry,
            handle: connection.handle,
            events: connection.events,
            cancel_rx,
            surface: Some(surface),
            pairing_phone,
            retention,
        }
    }

    pub(super) async fn run(mut self) {
        loop {
            let next = tokio::select! {
                biased;
                _ = &mut self.cancel_rx => None,
                event = self.events.recv() => {
                    // A dropped stream without a terminal event is an unclassified close
                    Some(event.unwrap_or(EngineEvent::Closed(DisconnectReason::Unknown)))
                }
            };

            let Some(event) = next else {
                self.release().await;
                return;
            };

            match self.handle_event(event).await {
                Flow::Continue => {}
                Flow::Reconnect => {
                    if !self.reconnect().await {
                        return;
                    }
                }
                Flow::Stop => return,
            }
        }
    }

    async fn handle_event(&mut self, event: EngineEvent) -> Flow {
        match event {
            EngineEvent::Qr(payload) => {
                if let Some(phone) = self.pairing_phone.clone() {
                    return self.issue_pairing_code(phone).await;
                }
                let decision = self.entry.state().machine.challenge();
                match decision {
                    ChallengeDecision::Surface => {
                        info!("[{}] QR challenge issued", self.entry.id);
                        self.inner.emit(SessionEvent::ChallengeIssued {
                            session_id: self.entry.id.clone(),
                            kind: ChallengeKind::Qr,
                        });
                        self.surface(Ok(StartOutcome::Challenge {
                            session_id: self.entry.id.clone(),
                            challenge: Challenge::Qr(payload),
                        }));
                    }
                    ChallengeDecision::Suppress => {
                        debug!("[{}] QR retransmit suppressed", self.entry.id);
                    }
                }
                Flow::Continue
            }
            EngineEvent::PairingCodeReady => match self.pairing_phone.clone() {
                Some(phone) => self.issue_pairing_code(phone).await,
                None => Flow::Continue,
            },
            EngineEvent::CredentialsUpdated(credential) => {
                self.refresh_credentials(credential).await;
                Flow::Continue
            }
            EngineEvent::Connected(credential) => self.on_connected(credential).await,
            EngineEvent::Closed(reason) => self.on_closed(reason).await,
        }
    }

    async fn issue_pairing_code(&mut self, phone: String) -> Flow {
        let decision = self.entry.state().machine.challenge();
        if decision == ChallengeDecision::Suppress {
            debug!("[{}] Pairing code already issued", self.entry.id);
            return Flow::Continue;
        }

        match self
            .inner
            .engine
            .request_pairing_code(&self.handle, &phone)
            .await
        {
            Ok(code) => {
                info!("[{}] Pairing code issued", self.entry.id);
                self.inner.emit(SessionEvent::ChallengeIssued {
                    session_id: self.entry.id.clone(),
                    kind: ChallengeKind::PairingCode,
                });
                self.surface(Ok(StartOutcome::Challenge {
                    session_id: self.entry.id.clone(),
                    challenge: Challenge::PairingCode(code),
                }));
                Flow::Continue
            }
            Err(e) => {
                warn!("[{}] Pairing code request failed: {}", self.entry.id, e);
                self.terminate(TerminalCause::PairingUnavailable, Some(e.to_string()))
                    .await;
                Flow::Stop
            }
        }
    }

    async fn refresh_credentials(&mut self, credential: serde_json::Value) {
        let connected = self.entry.state().machine.ever_connected();
        if !connected {
            debug!("[{}] Credential refresh before pairing ignored", self.entry.id);
            return;
        }
        if !self.inner.registry.is_current(&self.entry.id, self.entry.epoch) {
            return;
        }

        self.entry.state().phone_hint = phone_hint(&credential);
        match self.persist(&credential).await {
            Ok(true) => debug!("[{}] Credentials refreshed", self.entry.id),
            Ok(false) => debug!("[{}] Session gone, refresh dropped", self.entry.id),
            Err(e) => error!("[{}] Failed to refresh credentials: {}", self.entry.id, e),
        }
    }

    /// Write the credential unless this generation was removed meanwhile.
    /// The check runs under the store's per-id lock, so a concurrent delete
    /// either sees the document or it is never written.
    async fn persist(&mut self, credential: &serde_json::Value) -> PairingResult<bool> {
        let registry = &self.inner.registry;
        let entry = &self.entry;
        let still_current = || registry.is_current(&entry.id, entry.epoch);
        self.inner
            .store
            .write_if(&entry.id, credential, &still_current)
            .await
    }

    async fn on_connected(&mut self, credential: serde_json::Value) -> Flow {
        let first = match self
            .inner
            .transition(&self.entry, |s| s.machine.connected())
        {
            Ok(first) => first,
            Err(e) => {
                warn!("[{}] Ignoring connect: {}", self.entry.id, e);
                return Flow::Continue;
            }
        };
        self.entry.control().disarm_timeout();

        let hint = phone_hint(&credential);
        self.entry.state().phone_hint = hint.clone();

        match self.persist(&credential).await {
            Ok(true) => info!("[{}] Credentials saved", self.entry.id),
            Ok(false) => debug!("[{}] Session gone, credentials not saved", self.entry.id),
            Err(e) => error!("[{}] Failed to save credentials: {}", self.entry.id, e),
        }

        info!("[{}] Connected", self.entry.id);
        self.inner.emit(SessionEvent::Paired {
            session_id: self.entry.id.clone(),
            phone_hint: hint.clone(),
        });
        self.surface(Ok(StartOutcome::Connected {
            session_id: self.entry.id.clone(),
            phone_hint: hint,
        }));

        if first && self.retention == CredentialRetention::WipeAfterPairing {
            match self
                .inner
                .engine
                .deliver_credential(&self.handle, &credential)
                .await
            {
                Ok(()) => {
                    info!("[{}] Credential delivered, wiping local copy", self.entry.id);
                    self.terminate(TerminalCause::Delivered, None).await;
                    return Flow::Stop;
                }
                Err(e) => {
                    warn!("[{}] Credential delivery failed, keeping it: {}", self.entry.id, e);
                }
            }
        }

        Flow::Continue
    }

    async fn on_closed(&mut self, reason: DisconnectReason) -> Flow {
        info!("[{}] Connection closed ({})", self.entry.id, reason);

        let outcome = self
            .inner
            .transition(&self.entry, |s| s.machine.closed(reason));
        match outcome {
            CloseOutcome::Reconnect { attempt } => {
                info!("[{}] Reconnecting (attempt {})", self.entry.id, attempt);
                self.inner.emit(SessionEvent::Reconnecting {
                    session_id: self.entry.id.clone(),
                    attempt,
                });
                Flow::Reconnect
            }
            CloseOutcome::Terminate(cause) => {
                self.terminate(cause, Some(format!("disconnect reason {}", reason)))
                    .await;
                Flow::Stop
            }
            CloseOutcome::Ignored => {
                // Ended elsewhere; the connection is still ours to close
                self.release().await;
                Flow::Stop
            }
        }
    }

    /// Wait out the backoff and reopen with the stored seed. Returns `false`
    /// when the driver must stop.
    async fn reconnect(&mut self) -> bool {
        let id = self.entry.id.clone();
        let epoch = self.entry.epoch;

        self.inner.engine.close(&self.handle).await;

        let backoff = self.inner.config.reconnect_backoff;
        let cancelled = tokio::select! {
            biased;
            _ = &mut self.cancel_rx => true,
            _ = tokio::time::sleep(backoff) => false,
        };
        if cancelled || !self.inner.registry.is_current(&id, epoch) {
            debug!("[{}] Reconnect abandoned", id);
            self.release().await;
            return false;
        }

        let seed = match self.inner.store.read(&id).await {
            Ok(seed) => seed,
            Err(e) => {
                warn!("[{}] Ignoring unreadable credential: {}", id, e);
                None
            }
        };

        let EngineConnection { handle, events } = match self.inner.engine.open(&id, seed).await {
            Ok(connection) => connection,
            Err(e) => {
                error!("[{}] Reopen failed: {}", id, e);
                self.terminate(TerminalCause::EngineInit, Some(e.to_string()))
                    .await;
                return false;
            }
        };

        if !self.inner.registry.is_current(&id, epoch) {
            // Deleted while reopening
            self.inner.engine.close(&handle).await;
            self.release().await;
            return false;
        }

        let new_handle = handle.clone();
        let opened = self.inner.transition(&self.entry, move |s| {
            s.handle = Some(new_handle);
            s.machine.opened()
        });
        self.handle = handle;
        self.events = events;

        if let Err(e) = opened {
            warn!("[{}] Reconnect dropped: {}", id, e);
            self.release().await;
            return false;
        }

        info!("[{}] Reopened connection {}", id, self.handle);
        true
    }

    /// Terminal path initiated by the driver itself
    async fn terminate(&mut self, cause: TerminalCause, detail: Option<String>) {
        let err = self
            .inner
            .finish(&self.entry, cause, detail.as_deref())
            .await;
        if let Some(err) = err {
            self.surface(Err(err));
        }
    }

    /// Cancellation path: close the connection and stop
    async fn release(&mut self) {
        self.inner.transition(&self.entry, |s| s.machine.terminate());
        self.inner.engine.close(&self.handle).await;
        self.entry.state().handle = None;
        self.inner
            .registry
            .remove_if_epoch(&self.entry.id, self.entry.epoch);
        debug!("[{}] Connection released", self.entry.id);
    }

    fn surface(&mut self, result: PairingResult<StartOutcome>) {
        if let Some(tx) = self.surface.take() {
            let _ = tx.send(result);
        }
    }
}
