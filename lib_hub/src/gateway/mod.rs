//! # HTTP/WebSocket Gateway
//!
//! Binds the hub to the network: a router with the `/ws` upgrade endpoint,
//! the `/chats` history download and two monitoring routes, wrapped in a
//! CORS layer, served over plain TCP or TLS.

/// Router, handlers and CORS layer.
pub mod routes;
/// Listener setup and graceful shutdown.
pub mod server;

use thiserror::Error;

pub use routes::{cors_layer, router, GatewayState, StatusReport};
pub use server::{serve, serve_listener};

/// Failures that stop the gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The listening socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested address.
        addr: std::net::SocketAddr,
        /// OS error.
        #[source]
        source: std::io::Error,
    },

    /// Certificate or key could not be loaded.
    #[error("TLS configuration error: {0}")]
    Tls(#[source] std::io::Error),

    /// The accept loop failed.
    #[error("server error: {0}")]
    Serve(#[source] std::io::Error),

    /// An allowed origin is not a valid header value.
    #[error("invalid allowed origin {0:?}")]
    InvalidOrigin(String),
}
