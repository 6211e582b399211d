//! Scripted engine test double. Each `open` hands the test a sender for the
//! connection's event stream.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

use super::adapter::{
    ConnectionEngine, ConnectionHandle, EngineConnection, EngineError, EngineEvent, EngineResult,
};

/// Test-side view of one opened connection
pub(crate) struct ScriptedConnection {
    pub handle: ConnectionHandle,
    pub seed: Option<serde_json::Value>,
    pub events: mpsc::Sender<EngineEvent>,
}

pub(crate) struct ScriptedEngine {
    next_id: AtomicU64,
    fail_opens: AtomicUsize,
    open_tx: mpsc::UnboundedSender<ScriptedConnection>,
    open_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ScriptedConnection>>,
    opened: AtomicUsize,
    closed: Mutex<Vec<ConnectionHandle>>,
    delivered: Mutex<Vec<serde_json::Value>>,
    pairing_code: Mutex<Option<String>>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        let (open_tx, open_rx) = mpsc::unbounded_channel();
        Self {
            next_id: AtomicU64::new(1),
            fail_opens: AtomicUsize::new(0),
            open_tx,
            open_rx: tokio::sync::Mutex::new(open_rx),
            opened: AtomicUsize::new(0),
            closed: Mutex::new(Vec::new()),
            delivered: Mutex::new(Vec::new()),
            pairing_code: Mutex::new(Some("ABCD1234".to_string())),
        }
    }

    /// Make the next `n` opens fail
    pub fn fail_next_opens(&self, n: usize) {
        self.fail_opens.store(n, Ordering::SeqCst);
    }

    /// Make pairing code requests fail
    pub fn disable_pairing_codes(&self) {
        *self.pairing_code.lock() = None;
    }

    /// Wait for the next opened connection
    pub async fn next_connection(&self) -> ScriptedConnection {
        let mut rx = self.open_rx.lock().await;
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("engine was never opened")
            .expect("engine channel closed")
    }

    /// Wait briefly for another open, returning None if none happens
    pub async fn try_next_connection(&self, wait: Duration) -> Option<ScriptedConnection> {
        let mut rx = self.open_rx.lock().await;
        tokio::time::timeout(wait, rx.recv()).await.ok().flatten()
    }

    pub fn open_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed_handles(&self) -> Vec<ConnectionHandle> {
        self.closed.lock().clone()
    }

    pub fn delivered(&self) -> Vec<serde_json::Value> {
        self.delivered.lock().clone()
    }
}

#[async_trait]
impl ConnectionEngine for ScriptedEngine {
    async fn open(
        &self,
        session_id: &str,
        seed: Option<serde_json::Value>,
    ) -> EngineResult<EngineConnection> {
        let failing = self
            .fail_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(EngineError::InitFailed("scripted open failure".to_string()));
        }

        let handle = ConnectionHandle::new(session_id, self.next_id.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = mpsc::channel(16);
        self.opened.fetch_add(1, Ordering::SeqCst);
        let _ = self.open_tx.send(ScriptedConnection {
            handle: handle.clone(),
            seed,
            events: tx,
        });
        Ok(EngineConnection { handle, events: rx })
    }

    async fn request_pairing_code(
        &self,
        _handle: &ConnectionHandle,
        _phone_number: &str,
    ) -> EngineResult<String> {
        self.pairing_code
            .lock()
            .clone()
            .ok_or_else(|| EngineError::PairingUnavailable("pairing disabled".to_string()))
    }

    async fn deliver_credential(
        &self,
        _handle: &ConnectionHandle,
        credential: &serde_json::Value,
    ) -> EngineResult<()> {
        self.delivered.lock().push(credential.clone());
        Ok(())
    }

    async fn close(&self, handle: &ConnectionHandle) {
        let mut closed = self.closed.lock();
        if !closed.contains(handle) {
            closed.push(handle.clone());
        }
    }

    fn engine_name(&self) -> &'static str {
        "scripted"
    }
}
