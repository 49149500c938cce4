//! # Chat Hub Server
//!
//! Launches the realtime chat hub: a WebSocket endpoint where clients
//! announce an identity and exchange messages that every connected client
//! receives in the same order, plus `/chats` for the transcript so far.
//!
//! ## Execution Flow:
//! 1.  **Configuration**: `.env`, then defaults, `server_hub.conf`, env and
//!     CLI flags, merged by `lib_hub::configs`.
//! 2.  **Logging**: console plus daily rolling JSON files.
//! 3.  **Hub**: builds the shared hub and spawns its broadcast engine.
//! 4.  **Signals**: Ctrl+C or SIGTERM cancels the hub, which closes every
//!     connection and stops the listener.
//! 5.  **Serve**: plain TCP, or TLS when a certificate and key are set.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};

use lib_hub::configs::{load_config, ServerConfig};
use lib_hub::core::Hub;
use lib_hub::gateway;
use lib_hub::loggers::setup_logging;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = load_config(ServerConfig::parse()).context("invalid configuration")?;
    let _log_guard = setup_logging(&settings.log_dir, &settings.log_level, "server_hub")
        .context("failed to initialize logging")?;
    info!(addr = %settings.addr, tls = settings.tls.is_some(), "Chat hub booting");

    let (hub, engine) = Hub::new(settings.hub.clone());
    let engine_task = engine.spawn();

    let signal_hub = Arc::clone(&hub);
    tokio::spawn(async move {
        shutdown_signal().await;
        warn!("Shutdown signal received. Closing connections...");
        signal_hub.shutdown();
    });

    let served = gateway::serve(&settings, Arc::clone(&hub)).await;
    // A listener failure still has to stop the engine.
    hub.shutdown();
    if let Err(e) = engine_task.await {
        error!(error = %e, "Broadcast engine task failed");
    }

    served.context("gateway stopped with an error")?;
    info!("Chat hub stopped");
    Ok(())
}

/// Resolves on Ctrl+C, or SIGTERM on Unix. If a handler cannot be installed
/// that source is logged and ignored.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
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
}
