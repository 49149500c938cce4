//! # lib_hub
//!
//! A realtime chat hub: clients connect over WebSocket, announce an
//! identity, and every chat message is delivered to every connected client
//! in one global order. The hub also keeps the full transcript and
//! broadcasts presence whenever membership changes.
//!
//! ## Modules:
//!
//! - **`protocol`**: wire types and their JSON encoding.
//! - **`core`**: registry, history, broadcast engine, presence and the
//!   per-connection session.
//! - **`gateway`**: axum router, CORS and the TCP/TLS listener.
//! - **`configs`**: layered defaults/file/env/CLI configuration.
//! - **`loggers`**: `tracing` subscriber setup.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]

pub mod configs;
pub mod core;
pub mod gateway;
pub mod loggers;
pub mod protocol;

pub use crate::core::{BroadcastEngine, Hub, HubConfig, HubError, Overflow, QueueBound, Session, SessionError};
pub use crate::protocol::{ChatMessage, HubMessage, Identity, PresenceSnapshot};
