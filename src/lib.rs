//! linkpair
//!
//! Pairing session orchestrator for linked-device messaging accounts. Drives
//! an external protocol engine through QR or numeric-code pairing, persists
//! the resulting credential, and serves the whole lifecycle over HTTP.

// Declare modules
pub mod config;
pub mod engine;
pub mod error;
pub mod orchestrator;
pub mod session;
pub mod store;
pub mod web_server;

use log::{debug, info, warn};
use tokio::sync::broadcast::error::RecvError;

pub use config::Config;
pub use error::{PairingError, PairingResult};
pub use orchestrator::Orchestrator;

/// Forward session events to the log
pub fn setup_session_event_logger(orchestrator: &Orchestrator) {
    let mut rx = orchestrator.subscribe();

    tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Event logger skipped {} events", skipped);
                    continue;
                }
                Err(RecvError::Closed) => break,
            };

            let payload = serde_json::to_string(&event).unwrap_or_default();
            match &event {
                session::SessionEvent::StatusChanged { .. } => {
                    debug!("{} {}", event.event_name(), payload)
                }
                _ => info!("{} {}", event.event_name(), payload),
            }
        }
    });
}
