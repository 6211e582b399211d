//! Runtime Configuration
//!
//! Command-line flags, each with an environment variable fallback.

use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::orchestrator::{CredentialRetention, OrchestratorConfig};

#[derive(Debug, Clone, Parser)]
#[command(
    name = "linkpair",
    version,
    about = "Pairing session orchestrator for linked-device messaging accounts"
)]
pub struct Config {
    /// Port to listen on
    #[arg(long, env = "PORT", default_value_t = 3000)]
    pub port: u16,

    /// Address to bind
    #[arg(long, env = "BIND", default_value = "0.0.0.0")]
    pub bind: IpAddr,

    /// Directory holding one sub-directory per paired session
    #[arg(long, env = "SESSIONS_DIR", default_value = "./sessions")]
    pub sessions_dir: PathBuf,

    /// Seconds a start request may wait for its first challenge
    #[arg(long, env = "START_TIMEOUT_SECS", default_value_t = 45)]
    pub start_timeout_secs: u64,

    /// Transient disconnects tolerated before a session gives up
    #[arg(long, env = "MAX_RETRIES", default_value_t = 3)]
    pub max_retries: u32,

    /// Delay before reconnecting after a transient disconnect
    #[arg(long, env = "RECONNECT_BACKOFF_MS", default_value_t = 3000)]
    pub reconnect_backoff_ms: u64,

    /// Seconds shutdown waits for open connections to close
    #[arg(long, env = "SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    pub shutdown_grace_secs: u64,

    /// Deliver and wipe credentials once pairing succeeds
    #[arg(long, env = "WIPE_AFTER_PAIRING", default_value_t = false)]
    pub wipe_after_pairing: bool,

    /// Make the loopback engine confirm pairing after this many seconds
    #[arg(long, env = "LOOPBACK_CONFIRM_SECS")]
    pub loopback_confirm_secs: Option<u64>,
}

impl Config {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    pub fn loopback_confirm_after(&self) -> Option<Duration> {
        self.loopback_confirm_secs.map(Duration::from_secs)
    }

    pub fn to_orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            start_timeout: Duration::from_secs(self.start_timeout_secs),
            max_retries: self.max_retries,
            reconnect_backoff: Duration::from_millis(self.reconnect_backoff_ms),
            retention: if self.wipe_after_pairing {
                CredentialRetention::WipeAfterPairing
            } else {
                CredentialRetention::Keep
            },
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
        }
    }
}
