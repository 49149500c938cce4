use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::configs::Settings;
use crate::core::Hub;
use crate::gateway::{cors_layer, router, GatewayError};

/// Serves `hub` on the configured address until the hub's shutdown token
/// fires. Uses TLS when both certificate and key are configured.
pub async fn serve(settings: &Settings, hub: Arc<Hub>) -> Result<(), GatewayError> {
    let shutdown = hub.shutdown_token();
    let app = router(hub, cors_layer(&settings.allowed_origins)?);

    match &settings.tls {
        Some(tls) => {
            // rustls 0.23 needs a process-wide provider. A second install is
            // rejected, which is fine.
            if rustls::crypto::ring::default_provider().install_default().is_err() {
                debug!("rustls crypto provider already installed");
            }
            let tls_config = RustlsConfig::from_pem_file(&tls.cert, &tls.key)
                .await
                .map_err(GatewayError::Tls)?;

            let handle = axum_server::Handle::new();
            let signal_handle = handle.clone();
            let grace = settings.shutdown_grace;
            tokio::spawn(async move {
                shutdown.cancelled().await;
                info!("Shutting down TLS listener");
                signal_handle.graceful_shutdown(Some(grace));
            });

            info!(addr = %settings.addr, "Hub listening (TLS)");
            axum_server::bind_rustls(settings.addr, tls_config)
                .handle(handle)
                .serve(app.into_make_service_with_connect_info::<SocketAddr>())
                .await
                .map_err(GatewayError::Serve)
        }
        None => {
            let listener = TcpListener::bind(settings.addr)
                .await
                .map_err(|source| GatewayError::Bind { addr: settings.addr, source })?;
            info!(addr = %settings.addr, "Hub listening");
            serve_listener(listener, app, shutdown).await
        }
    }
}

/// Runs `app` on an already bound listener until `shutdown` fires.
pub async fn serve_listener(
    listener: TcpListener,
    app: Router,
    shutdown: CancellationToken,
) -> Result<(), GatewayError> {
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            info!("Shutting down listener");
        })
        .await
        .map_err(GatewayError::Serve)
}
