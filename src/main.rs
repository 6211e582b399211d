use anyhow::Context;
use clap::Parser;
use log::{info, warn};
use std::sync::Arc;

use linkpair::engine::LoopbackEngine;
use linkpair::store::FileCredentialStore;
use linkpair::{setup_session_event_logger, web_server, Config, Orchestrator};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::parse();

    let store = FileCredentialStore::open(config.sessions_dir.clone()).with_context(|| {
        format!(
            "Failed to open sessions directory {}",
            config.sessions_dir.display()
        )
    })?;
    info!("Credentials stored under {}", store.root().display());

    let engine = match config.loopback_confirm_after() {
        Some(delay) => LoopbackEngine::with_confirm_after(delay),
        None => LoopbackEngine::new(),
    };

    let orchestrator = Orchestrator::new(
        config.to_orchestrator_config(),
        Arc::new(engine),
        Arc::new(store),
    );
    setup_session_event_logger(&orchestrator);

    web_server::serve(orchestrator.clone(), config.listen_addr(), shutdown_signal())
        .await
        .context("HTTP server failed")?;

    orchestrator.shutdown().await;
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received, closing sessions");
}
