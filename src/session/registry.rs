//! Session Registry
//!
//! Concurrent map of live sessions using DashMap. Registry membership is the
//! single source of truth for whether a session is active.
//!
//! Lock order: a registry shard lock may be held while taking an entry's
//! state lock, never the other way round.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::{debug, info};
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::state::{SessionInfo, SessionState};

/// Timers and kill switch for a live session
#[derive(Default)]
pub struct SessionControl {
    /// Set once the session has been cancelled
    cancelled: bool,
    /// Kill switch for the session driver
    cancel_tx: Option<oneshot::Sender<()>>,
    /// Start-timeout timer
    timeout_task: Option<JoinHandle<()>>,
    /// Driver task reading the engine event stream
    driver_task: Option<JoinHandle<()>>,
}

impl SessionControl {
    /// Install the driver kill switch. Returns `false` if the session was
    /// already cancelled.
    pub fn install_cancel(&mut self, tx: oneshot::Sender<()>) -> bool {
        if self.cancelled {
            return false;
        }
        self.cancel_tx = Some(tx);
        true
    }

    /// Set the start-timeout timer
    pub fn set_timeout_task(&mut self, task: JoinHandle<()>) {
        if self.cancelled {
            task.abort();
        } else {
            self.timeout_task = Some(task);
        }
    }

    /// Set the driver task
    pub fn set_driver_task(&mut self, task: JoinHandle<()>) {
        self.driver_task = Some(task);
    }

    /// Detach the start-timeout timer without aborting it
    pub fn take_timeout_task(&mut self) -> Option<JoinHandle<()>> {
        self.timeout_task.take()
    }

    /// Abort the start-timeout timer
    pub fn disarm_timeout(&mut self) {
        if let Some(task) = self.timeout_task.take() {
            task.abort();
        }
    }

    /// Cancel the session: abort its timer and signal its driver
    pub fn cancel(&mut self) {
        self.cancelled = true;
        self.disarm_timeout();
        if let Some(tx) = self.cancel_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Take the driver task so the caller can wait for it
    pub fn take_driver_task(&mut self) -> Option<JoinHandle<()>> {
        self.driver_task.take()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }
}

/// One registry entry
pub struct SessionEntry {
    pub id: String,
    /// Generation number, unique per `create`
    pub epoch: u64,
    pub created_at: DateTime<Utc>,
    state: Mutex<SessionState>,
    control: Mutex<SessionControl>,
}

impl SessionEntry {
    fn new(id: &str, epoch: u64, max_retries: u32) -> Self {
        let state = SessionState::new(id, epoch, max_retries);
        Self {
            id: id.to_string(),
            epoch,
            created_at: state.created_at,
            state: Mutex::new(state),
            control: Mutex::new(SessionControl::default()),
        }
    }

    /// Lock the session state. Never hold across an await point.
    pub fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock()
    }

    /// Lock the session controls. Never hold across an await point.
    pub fn control(&self) -> MutexGuard<'_, SessionControl> {
        self.control.lock()
    }

    pub fn snapshot(&self) -> SessionInfo {
        SessionInfo::from(&*self.state())
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// Terminated and its engine connection fully released
    pub fn is_replaceable(&self) -> bool {
        let state = self.state();
        state.is_terminal() && state.handle.is_none()
    }
}

/// Registry errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Session already active: {0}")]
    AlreadyActive(String),
}

/// Session registry
pub struct SessionRegistry {
    /// Live sessions (session_id -> entry)
    sessions: Arc<DashMap<String, Arc<SessionEntry>>>,
    next_epoch: AtomicU64,
}

impl SessionRegistry {
    /// Create a new registry
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            next_epoch: AtomicU64::new(1),
        }
    }

    /// Insert a fresh session.
    ///
    /// Fails if a non-terminal session already uses the id; a terminated
    /// leftover whose connection is released is replaced. The shard lock is
    /// held across the check and the insert, so concurrent creates for one id
    /// cannot both succeed.
    pub fn create(
        &self,
        session_id: &str,
        max_retries: u32,
    ) -> Result<Arc<SessionEntry>, RegistryError> {
        match self.sessions.entry(session_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().is_replaceable() {
                    return Err(RegistryError::AlreadyActive(session_id.to_string()));
                }
                let entry = Arc::new(self.new_entry(session_id, max_retries));
                occupied.insert(entry.clone());
                debug!("Replaced terminated session: {}", session_id);
                Ok(entry)
            }
            Entry::Vacant(vacant) => {
                let entry = Arc::new(self.new_entry(session_id, max_retries));
                vacant.insert(entry.clone());
                info!("Created session: {}", session_id);
                Ok(entry)
            }
        }
    }

    fn new_entry(&self, session_id: &str, max_retries: u32) -> SessionEntry {
        let epoch = self.next_epoch.fetch_add(1, Ordering::SeqCst);
        SessionEntry::new(session_id, epoch, max_retries)
    }

    /// Get a session by ID
    pub fn get(&self, session_id: &str) -> Option<Arc<SessionEntry>> {
        self.sessions.get(session_id).map(|e| e.value().clone())
    }

    /// Get a session only if it is still the given generation
    pub fn get_current(&self, session_id: &str, epoch: u64) -> Option<Arc<SessionEntry>> {
        self.get(session_id).filter(|e| e.epoch == epoch)
    }

    /// Whether the given generation is still registered
    pub fn is_current(&self, session_id: &str, epoch: u64) -> bool {
        self.sessions
            .get(session_id)
            .map(|e| e.epoch == epoch)
            .unwrap_or(false)
    }

    /// Remove a session regardless of generation
    pub fn remove(&self, session_id: &str) -> Option<Arc<SessionEntry>> {
        self.sessions.remove(session_id).map(|(_, e)| e)
    }

    /// Remove a session only if it is still the given generation
    pub fn remove_if_epoch(&self, session_id: &str, epoch: u64) -> Option<Arc<SessionEntry>> {
        self.sessions
            .remove_if(session_id, |_, e| e.epoch == epoch)
            .map(|(_, e)| e)
    }

    /// Snapshots of all sessions
    pub fn list_all(&self) -> Vec<SessionInfo> {
        self.sessions.iter().map(|e| e.value().snapshot()).collect()
    }

    /// Remove and return every session
    pub fn drain(&self) -> Vec<Arc<SessionEntry>> {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        ids.iter().filter_map(|id| self.remove(id)).collect()
    }

    /// Check if a session exists
    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    /// Get total session count
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;

    #[test]
    fn test_create_session() {
        let registry = SessionRegistry::new();
        let entry = registry.create("test-1", 3).unwrap();
        assert_eq!(entry.id, "test-1");
        assert!(registry.contains("test-1"));
        assert!(registry.is_current("test-1", entry.epoch));
    }

    #[test]
    fn test_duplicate_session() {
        let registry = SessionRegistry::new();
        let _ = registry.create("test-1", 3);
        let result = registry.create("test-1", 3);
        assert!(matches!(result, Err(RegistryError::AlreadyActive(_))));
    }

    #[test]
    fn test_terminated_entry_is_replaced() {
        let registry = SessionRegistry::new();
        let first = registry.create("test-1", 3).unwrap();
        first.state().machine.terminate();

        let second = registry.create("test-1", 3).unwrap();
        assert_ne!(first.epoch, second.epoch);
        assert!(!registry.is_current("test-1", first.epoch));
    }

    #[test]
    fn test_terminated_entry_with_open_connection_is_kept() {
        let registry = SessionRegistry::new();
        let first = registry.create("test-1", 3).unwrap();
        {
            let mut state = first.state();
            state.handle = Some(crate::engine::ConnectionHandle::new("test-1", 1));
            state.machine.terminate();
        }

        assert!(registry.create("test-1", 3).is_err());
        first.state().handle = None;
        assert!(registry.create("test-1", 3).is_ok());
    }

    #[test]
    fn test_remove_if_epoch_ignores_stale_generation() {
        let registry = SessionRegistry::new();
        let first = registry.create("s1", 3).unwrap();
        first.state().machine.terminate();
        let second = registry.create("s1", 3).unwrap();

        assert!(registry.remove_if_epoch("s1", first.epoch).is_none());
        assert!(registry.contains("s1"));
        assert!(registry.remove_if_epoch("s1", second.epoch).is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_concurrent_create_is_exclusive() {
        let registry = Arc::new(SessionRegistry::new());
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    registry.create("same-id", 3).is_ok()
                })
            })
            .collect();

        let successes = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(successes, 1);
    }

    #[test]
    fn test_cancel_before_install() {
        let mut control = SessionControl::default();
        control.cancel();
        let (tx, _rx) = oneshot::channel();
        assert!(!control.install_cancel(tx));
        assert!(control.is_cancelled());
    }

    #[test]
    fn test_list_and_drain() {
        let registry = SessionRegistry::new();
        registry.create("a", 3).unwrap();
        registry.create("b", 3).unwrap();

        assert_eq!(registry.list_all().len(), 2);
        assert_eq!(registry.drain().len(), 2);
        assert_eq!(registry.len(), 0);
    }
}
