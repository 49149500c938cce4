use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, State},
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use futures_util::StreamExt;
use serde::Serialize;
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};
use tracing::{debug, error};

use crate::core::{Hub, Session};
use crate::gateway::GatewayError;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct GatewayState {
    /// The hub all connections attach to.
    pub hub: Arc<Hub>,
}

/// Body of `/status`.
#[derive(Debug, Serialize)]
pub struct StatusReport {
    /// Server time, RFC 3339.
    pub ts: String,
    /// Registered connections.
    pub online: usize,
    /// Messages in the history log.
    pub history: usize,
}

/// Builds the application router.
pub fn router(hub: Arc<Hub>, cors: CorsLayer) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/chats", get(chats_handler))
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .layer(cors)
        .with_state(GatewayState { hub })
}

/// CORS policy for the given origins. Credentials are allowed, so `*` is
/// served by echoing the request origin rather than a literal wildcard.
pub fn cors_layer(origins: &[String]) -> Result<CorsLayer, GatewayError> {
    let allow_origin = if origins.iter().any(|o| o == "*") {
        AllowOrigin::mirror_request()
    } else {
        let values = origins
            .iter()
            .map(|o| HeaderValue::from_str(o).map_err(|_| GatewayError::InvalidOrigin(o.clone())))
            .collect::<Result<Vec<_>, _>>()?;
        AllowOrigin::list(values)
    };

    Ok(CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<GatewayState>,
) -> impl IntoResponse {
    debug!(peer = %addr, "WebSocket upgrade requested");
    ws.on_upgrade(move |socket| async move {
        let (sink, stream) = socket.split();
        Session::new(state.hub, addr.to_string()).run(stream, sink).await;
    })
}

async fn chats_handler(State(state): State<GatewayState>) -> Response {
    match state.hub.encoded_history() {
        Ok(body) => ([(header::CONTENT_TYPE, "application/json")], body).into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode history");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn health_handler() -> &'static str {
    "OK"
}

async fn status_handler(State(state): State<GatewayState>) -> Json<StatusReport> {
    Json(StatusReport {
        ts: Utc::now().to_rfc3339(),
        online: state.hub.online(),
        history: state.hub.history_len(),
    })
}
