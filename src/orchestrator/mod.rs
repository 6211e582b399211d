//! Session Orchestrator
//!
//! The facade transports call. Coordinates the registry, the per-session
//! state machine, the credential store and the connection engine:
//! - At most one engine connection per session id
//! - Start-timeout timer and reconnect backoff, both cancellable
//! - Exactly one surfaced challenge per start request
//! - Graceful shutdown of every live connection

mod driver;
pub mod types;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot};

use crate::engine::ConnectionEngine;
use crate::error::{PairingError, PairingResult};
use crate::session::{
    SessionEntry, SessionEvent, SessionRegistry, SessionState, SessionStatus, TerminalCause,
};
use crate::store::{phone_hint, CredentialStore};
use driver::SessionDriver;

pub use types::{
    Challenge, CredentialRetention, DeleteOutcome, ErrorRecord, OrchestratorConfig, SessionStatusReport,
    SessionSummary, StartOptions, StartOutcome,
};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const MAX_SESSION_ID_LEN: usize = 64;

/// Shared orchestrator state, owned by the facade and every session driver
struct Inner {
    config: OrchestratorConfig,
    registry: SessionRegistry,
    engine: Arc<dyn ConnectionEngine>,
    store: Arc<dyn CredentialStore>,
    /// Last terminal failure per session id
    outcomes: DashMap<String, (PairingError, DateTime<Utc>)>,
    event_tx: broadcast::Sender<SessionEvent>,
}

impl Inner {
    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.event_tx.send(event);
    }

    /// Apply a change to the session state and announce a status change
    fn transition<T>(&self, entry: &SessionEntry, f: impl FnOnce(&mut SessionState) -> T) -> T {
        let (old_status, new_status, result) = {
            let mut state = entry.state();
            let old_status = state.status();
            let result = f(&mut state);
            state.touch();
            (old_status, state.status(), result)
        };

        if old_status != new_status {
            debug!("[{}] {} -> {}", entry.id, old_status, new_status);
            self.emit(SessionEvent::StatusChanged {
                session_id: entry.id.clone(),
                old_status,
                new_status,
            });
        }
        result
    }

    fn record_outcome(&self, entry: &SessionEntry, err: &PairingError) {
        if self.registry.is_current(&entry.id, entry.epoch) {
            self.outcomes
                .insert(entry.id.clone(), (err.clone(), Utc::now()));
        }
    }

    /// Terminal cleanup: close the connection, apply the credential policy,
    /// drop the registry entry. Returns the error to report, if any.
    async fn finish(
        &self,
        entry: &SessionEntry,
        cause: TerminalCause,
        detail: Option<&str>,
    ) -> Option<PairingError> {
        let err = cause.error(&entry.id, detail);
        if let Some(err) = &err {
            self.record_outcome(entry, err);
        }

        let message = err.as_ref().map(|e| e.to_string());
        let handle = self.transition(entry, |s| {
            s.machine.terminate();
            if let Some(message) = &message {
                s.set_failed(message.clone());
            }
            s.handle.clone()
        });
        entry.control().disarm_timeout();

        if let Some(handle) = &handle {
            self.engine.close(handle).await;
        }

        // Wipe before the handle is released so a replacement session
        // cannot read the stale document
        if cause.wipes_credential() && self.registry.is_current(&entry.id, entry.epoch) {
            match self.store.delete(&entry.id).await {
                Ok(_) => info!("[{}] Credentials wiped ({:?})", entry.id, cause),
                Err(e) => error!("[{}] Failed to wipe credentials: {}", entry.id, e),
            }
        }

        entry.state().handle = None;
        self.registry.remove_if_epoch(&entry.id, entry.epoch);

        match &err {
            Some(e) => warn!("[{}] Session terminated: {}", entry.id, e),
            None => info!("[{}] Session finished ({:?})", entry.id, cause),
        }
        self.emit(SessionEvent::Terminated {
            session_id: entry.id.clone(),
            cause,
            message,
        });

        err
    }

    /// Start-timeout timer expiry. Acts only on the generation that armed it.
    fn expire_start(&self, session_id: &str, epoch: u64) {
        let Some(entry) = self.registry.get_current(session_id, epoch) else {
            return;
        };

        let expired = self.transition(&entry, |s| s.machine.timed_out());
        if !expired {
            return;
        }

        let err = TerminalCause::StartTimeout.error(session_id, None);
        let message = err.as_ref().map(|e| e.to_string());
        if let Some(err) = &err {
            self.record_outcome(&entry, err);
        }
        if let Some(message) = &message {
            entry.state().set_failed(message.clone());
        }

        {
            let mut control = entry.control();
            // This task is the timer; detach it instead of aborting itself
            let _ = control.take_timeout_task();
            control.cancel();
        }

        warn!("[{}] Start timed out", session_id);
        self.emit(SessionEvent::Terminated {
            session_id: session_id.to_string(),
            cause: TerminalCause::StartTimeout,
            message,
        });
    }

    fn last_error(&self, session_id: &str) -> Option<PairingError> {
        self.outcomes.get(session_id).map(|o| o.value().0.clone())
    }
}

/// Session orchestrator
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Create a new orchestrator
    pub fn new(
        config: OrchestratorConfig,
        engine: Arc<dyn ConnectionEngine>,
        store: Arc<dyn CredentialStore>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        info!(
            "Orchestrator ready ({} engine, start timeout {:?}, max retries {})",
            engine.engine_name(),
            config.start_timeout,
            config.max_retries
        );

        Self {
            inner: Arc::new(Inner {
                config,
                registry: SessionRegistry::new(),
                engine,
                store,
                outcomes: DashMap::new(),
                event_tx,
            }),
        }
    }

    /// Subscribe to session events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Number of sessions that are not terminated
    pub fn active_count(&self) -> usize {
        self.inner
            .registry
            .list_all()
            .iter()
            .filter(|s| s.status != SessionStatus::Terminated)
            .count()
    }

    /// Start a pairing session and wait for its first surfaced outcome
    pub async fn start_session(&self, options: StartOptions) -> PairingResult<StartOutcome> {
        let session_id = match options.session_id {
            Some(id) => {
                validate_session_id(&id)?;
                id
            }
            None => generate_session_id(),
        };
        let retention = options.retention.unwrap_or(self.inner.config.retention);

        let entry = self
            .inner
            .registry
            .create(&session_id, self.inner.config.max_retries)
            .map_err(|_| PairingError::Conflict(session_id.clone()))?;
        self.inner.outcomes.remove(&session_id);
        entry.state().pairing_phone = options.pairing_phone.clone();

        info!(
            "[{}] Starting session ({} engine)",
            session_id,
            self.inner.engine.engine_name()
        );

        let seed = match self.inner.store.read(&session_id).await {
            Ok(seed) => seed,
            Err(e) => {
                warn!("[{}] Ignoring unreadable credential: {}", session_id, e);
                None
            }
        };
        if seed.is_some() {
            debug!("[{}] Resuming from stored credential", session_id);
        }

        let connection = match self.inner.engine.open(&session_id, seed).await {
            Ok(connection) => connection,
            Err(e) => {
                error!("[{}] Engine open failed: {}", session_id, e);
                let detail = e.to_string();
                let err = self
                    .inner
                    .finish(&entry, TerminalCause::EngineInit, Some(&detail))
                    .await;
                return Err(err.unwrap_or_else(|| e.into()));
            }
        };
        let handle = connection.handle.clone();

        let (cancel_tx, cancel_rx) = oneshot::channel();
        let installed = entry.control().install_cancel(cancel_tx);
        let opened = installed
            && self
                .inner
                .transition(&entry, |s| match s.machine.opened() {
                    Ok(()) => {
                        s.handle = Some(handle.clone());
                        true
                    }
                    Err(_) => false,
                });
        if !opened {
            // Deleted or shut down while the engine was opening
            self.inner.engine.close(&handle).await;
            return Err(PairingError::Cancelled(session_id));
        }

        let (surface_tx, surface_rx) = oneshot::channel();
        let driver = SessionDriver::new(
            self.inner.clone(),
            entry.clone(),
            connection,
            cancel_rx,
            surface_tx,
            options.pairing_phone,
            retention,
        );
        let driver_task = tokio::spawn(driver.run());
        entry.control().set_driver_task(driver_task);

        let budget = self.inner.config.start_timeout;
        let epoch = entry.epoch;
        let timer = {
            let inner = self.inner.clone();
            let session_id = session_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(budget).await;
                inner.expire_start(&session_id, epoch);
            })
        };
        entry.control().set_timeout_task(timer);

        match tokio::time::timeout(budget, surface_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(self
                .inner
                .last_error(&session_id)
                .unwrap_or(PairingError::Cancelled(session_id))),
            Err(_) => {
                self.inner.expire_start(&session_id, epoch);
                Err(self.inner.last_error(&session_id).unwrap_or_else(|| {
                    PairingError::Timeout(format!("no challenge issued for session {}", session_id))
                }))
            }
        }
    }

    /// Start a session that pairs with a numeric code instead of a QR
    pub async fn request_pairing_code(
        &self,
        session_id: Option<String>,
        phone_number: &str,
    ) -> PairingResult<StartOutcome> {
        let phone = normalize_phone(phone_number)?;
        self.start_session(StartOptions {
            session_id,
            pairing_phone: Some(phone),
            retention: None,
        })
        .await
    }

    /// Registry and store view of one session
    pub async fn get_status(&self, session_id: &str) -> PairingResult<SessionStatusReport> {
        validate_session_id(session_id)?;

        let live = self.inner.registry.get(session_id).map(|entry| {
            let state = entry.state();
            (state.is_active(), state.status(), state.phone_hint.clone())
        });
        let has_credentials = self.inner.store.exists(session_id).await;

        let mut hint = live.as_ref().and_then(|(_, _, hint)| hint.clone());
        if hint.is_none() && has_credentials {
            hint = self
                .inner
                .store
                .read(session_id)
                .await
                .ok()
                .flatten()
                .and_then(|doc| phone_hint(&doc));
        }

        let last_error = self.inner.outcomes.get(session_id).map(|o| {
            let (err, at) = o.value();
            ErrorRecord {
                at: *at,
                ..ErrorRecord::from(err)
            }
        });
        let is_active = live.as_ref().map(|(active, _, _)| *active).unwrap_or(false);

        Ok(SessionStatusReport {
            session_id: session_id.to_string(),
            exists: live.is_some() || has_credentials,
            is_active,
            status: live.map(|(_, status, _)| status),
            has_credentials,
            phone_hint: hint,
            last_error,
        })
    }

    /// Stored credential document
    pub async fn download_credential(&self, session_id: &str) -> PairingResult<serde_json::Value> {
        validate_session_id(session_id)?;
        self.inner
            .store
            .read(session_id)
            .await?
            .ok_or_else(|| PairingError::NotFound(format!("no credentials for session {}", session_id)))
    }

    /// Cancel a live session and delete its stored credential. Does not wait
    /// for the engine connection to close.
    pub async fn delete_session(&self, session_id: &str) -> PairingResult<DeleteOutcome> {
        validate_session_id(session_id)?;

        let was_live = match self.inner.registry.remove(session_id) {
            Some(entry) => {
                let was_active = self.inner.transition(&entry, |s| {
                    let active = s.is_active();
                    s.machine.terminate();
                    active
                });
                entry.control().cancel();
                if was_active {
                    self.inner.emit(SessionEvent::Terminated {
                        session_id: session_id.to_string(),
                        cause: TerminalCause::Deleted,
                        message: None,
                    });
                }
                info!("[{}] Session cancelled", session_id);
                true
            }
            None => false,
        };
        self.inner.outcomes.remove(session_id);

        let had_credentials = self.inner.store.delete(session_id).await?;
        if was_live || had_credentials {
            info!("[{}] Session deleted", session_id);
            Ok(DeleteOutcome::Deleted)
        } else {
            debug!("[{}] Nothing to delete", session_id);
            Ok(DeleteOutcome::NotFound)
        }
    }

    /// Merge of live sessions and stored credentials, oldest first
    pub async fn list_sessions(&self) -> PairingResult<Vec<SessionSummary>> {
        let mut summaries: HashMap<String, SessionSummary> = self
            .inner
            .registry
            .list_all()
            .into_iter()
            .map(|info| {
                let summary = SessionSummary {
                    session_id: info.session_id.clone(),
                    is_active: info.status != SessionStatus::Terminated,
                    status: Some(info.status),
                    has_credentials: false,
                    phone_hint: info.phone_hint,
                    created_at: info.created_at,
                };
                (info.session_id, summary)
            })
            .collect();

        for stored in self.inner.store.list().await? {
            if let Some(summary) = summaries.get_mut(&stored.session_id) {
                summary.has_credentials = true;
                continue;
            }

            let hint = self
                .inner
                .store
                .read(&stored.session_id)
                .await
                .ok()
                .flatten()
                .and_then(|doc| phone_hint(&doc));
            summaries.insert(
                stored.session_id.clone(),
                SessionSummary {
                    session_id: stored.session_id,
                    is_active: false,
                    status: None,
                    has_credentials: true,
                    phone_hint: hint,
                    created_at: stored.modified_at,
                },
            );
        }

        let mut sessions: Vec<SessionSummary> = summaries.into_values().collect();
        sessions.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        Ok(sessions)
    }

    /// Cancel every session and wait, up to the configured grace period, for
    /// the drivers to close their connections
    pub async fn shutdown(&self) {
        let entries = self.inner.registry.drain();
        if entries.is_empty() {
            return;
        }
        info!("Shutting down {} session(s)", entries.len());

        let mut drivers = Vec::new();
        for entry in entries {
            let was_active = self.inner.transition(&entry, |s| {
                let active = s.is_active();
                s.machine.terminate();
                active
            });
            {
                let mut control = entry.control();
                control.cancel();
                if let Some(task) = control.take_driver_task() {
                    drivers.push(task);
                }
            }
            if was_active {
                self.inner.emit(SessionEvent::Terminated {
                    session_id: entry.id.clone(),
                    cause: TerminalCause::Shutdown,
                    message: None,
                });
            }
        }

        let aborts: Vec<_> = drivers.iter().map(|t| t.abort_handle()).collect();
        let grace = self.inner.config.shutdown_grace;
        if tokio::time::timeout(grace, futures::future::join_all(drivers))
            .await
            .is_err()
        {
            warn!("Connections still open after {:?}, abandoning them", grace);
            for abort in aborts {
                abort.abort();
            }
        } else {
            info!("All sessions closed");
        }
    }
}

/// Generate a session id
pub fn generate_session_id() -> String {
    format!("session_{}", uuid::Uuid::new_v4().simple())
}

/// Check a caller-supplied session id. Ids double as directory names, so
/// only `[A-Za-z0-9_.-]` is accepted and `.`/`..` are rejected.
pub fn validate_session_id(session_id: &str) -> PairingResult<()> {
    let valid_chars = session_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));

    if session_id.is_empty()
        || session_id.len() > MAX_SESSION_ID_LEN
        || !valid_chars
        || session_id == "."
        || session_id == ".."
    {
        return Err(PairingError::InvalidRequest(format!(
            "invalid session id: {:?}",
            session_id
        )));
    }
    Ok(())
}

/// Normalize a phone number to bare international digits.
///
/// Spaces, dashes and parentheses are ignored; a leading `+` is optional.
/// The result is 7 to 15 digits not starting with 0.
pub fn normalize_phone(phone_number: &str) -> PairingResult<String> {
    let compact: String = phone_number
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '(' | ')'))
        .collect();
    let digits = compact.strip_prefix('+').unwrap_or(&compact);

    let valid = (7..=15).contains(&digits.len())
        && digits.chars().all(|c| c.is_ascii_digit())
        && !digits.starts_with('0');
    if !valid {
        return Err(PairingError::InvalidRequest(format!(
            "invalid phone number: {:?}",
            phone_number
        )));
    }
    Ok(digits.to_string())
}
