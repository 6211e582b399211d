//! Loopback Engine
//!
//! A self-contained engine used when no real protocol engine is linked in.
//! It issues QR payloads and pairing codes, and can synthesize a credential
//! document after a confirm delay so the full pairing flow can be exercised
//! end to end.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use log::{debug, info};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::adapter::{
    ConnectionEngine, ConnectionHandle, EngineConnection, EngineError, EngineEvent, EngineResult,
};

/// Live loopback connection
struct LoopbackConnection {
    /// Phone number supplied through a pairing code request
    phone: Arc<Mutex<Option<String>>>,
    /// Task feeding the event stream
    task: JoinHandle<()>,
}

/// Loopback engine
pub struct LoopbackEngine {
    connections: Arc<DashMap<u64, LoopbackConnection>>,
    next_id: AtomicU64,
    /// Delay after which an unpaired connection reports success
    confirm_after: Option<Duration>,
}

impl LoopbackEngine {
    /// Create an engine that never confirms pairing on its own
    pub fn new() -> Self {
        Self {
            connections: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
            confirm_after: None,
        }
    }

    /// Create an engine that confirms pairing after `delay`
    pub fn with_confirm_after(delay: Duration) -> Self {
        let mut engine = Self::new();
        engine.confirm_after = Some(delay);
        engine
    }

    /// Number of open connections
    pub fn open_connections(&self) -> usize {
        self.connections.len()
    }

    fn qr_payload() -> String {
        let reference = uuid::Uuid::new_v4().simple().to_string();
        let noise = uuid::Uuid::new_v4().simple().to_string();
        let identity = uuid::Uuid::new_v4().simple().to_string();
        format!("2@{},{},{}", reference, noise, identity)
    }

    fn pairing_code() -> String {
        uuid::Uuid::new_v4()
            .simple()
            .to_string()
            .chars()
            .take(8)
            .collect::<String>()
            .to_uppercase()
    }

    fn synthesize_credential(session_id: &str, phone: Option<&str>) -> serde_json::Value {
        let now = Utc::now();
        let phone = phone
            .map(|p| p.trim_start_matches('+').to_string())
            .unwrap_or_else(|| format!("{}", 10_000_000_000u64 + now.timestamp_millis() as u64 % 1_000_000_000));
        let token = || uuid::Uuid::new_v4().simple().to_string();

        serde_json::json!({
            "clientID": format!("linkpair-{}", session_id),
            "serverToken": format!("1@{}", token()),
            "clientToken": token(),
            "encKey": token(),
            "macKey": token(),
            "registered": true,
            "platform": "web",
            "me": { "id": format!("{}:1@s.whatsapp.net", phone) },
            "generatedAt": now.to_rfc3339(),
        })
    }
}

impl Default for LoopbackEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConnectionEngine for LoopbackEngine {
    async fn open(
        &self,
        session_id: &str,
        seed: Option<serde_json::Value>,
    ) -> EngineResult<EngineConnection> {
        let connection_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let handle = ConnectionHandle::new(session_id, connection_id);
        let (tx, rx) = mpsc::channel(32);
        let phone = Arc::new(Mutex::new(None::<String>));

        let confirm_after = self.confirm_after;
        let task_phone = phone.clone();
        let task_session = session_id.to_string();

        let task = tokio::spawn(async move {
            if let Some(credential) = seed {
                if tx.send(EngineEvent::Connected(credential)).await.is_err() {
                    return;
                }
            } else {
                if tx.send(EngineEvent::Qr(Self::qr_payload())).await.is_err() {
                    return;
                }
                let _ = tx.send(EngineEvent::PairingCodeReady).await;

                if let Some(delay) = confirm_after {
                    tokio::time::sleep(delay).await;
                    let phone = task_phone.lock().clone();
                    let credential = Self::synthesize_credential(&task_session, phone.as_deref());
                    let _ = tx.send(EngineEvent::Connected(credential)).await;
                }
            }

            // Keep the stream open until the connection is closed
            tx.closed().await;
        });

        self.connections
            .insert(connection_id, LoopbackConnection { phone, task });

        info!("Loopback connection opened: {}", handle);
        Ok(EngineConnection { handle, events: rx })
    }

    async fn request_pairing_code(
        &self,
        handle: &ConnectionHandle,
        phone_number: &str,
    ) -> EngineResult<String> {
        let connection = self.connections.get(&handle.connection_id).ok_or_else(|| {
            EngineError::PairingUnavailable(format!("connection {} is not open", handle))
        })?;

        *connection.phone.lock() = Some(phone_number.to_string());
        let code = Self::pairing_code();
        debug!("Issued pairing code for {}", handle);
        Ok(code)
    }

    async fn close(&self, handle: &ConnectionHandle) {
        if let Some((_, connection)) = self.connections.remove(&handle.connection_id) {
            connection.task.abort();
            debug!("Loopback connection closed: {}", handle);
        }
    }

    fn engine_name(&self) -> &'static str {
        "loopback"
    }
}
