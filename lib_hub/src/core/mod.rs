//! # Core Engine Module
//!
//! The realtime hub itself: who is connected, what has been said, and the
//! single ordered stream that carries every outbound message.
//!
//! ## Core Components:
//!
//! - **`registry`**: connection handle → announced identity + delivery link.
//!   Pruning during fan-out happens inside the same iteration, never by
//!   re-locking.
//!
//! - **`history`**: the append-only chat transcript.
//!
//! - **`hub`**: registry and history behind one mutex, plus the broadcast
//!   queue's producer side. The only shared mutable state in the crate.
//!
//! - **`broadcast`**: the single-consumer FIFO queue and the engine that
//!   writes each message to every registered connection.
//!
//! - **`presence`**: snapshots the registry's identities and enqueues them.
//!
//! - **`session`**: the per-connection state machine (Connecting → Active →
//!   Closed) and its writer task.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// The single-consumer broadcast queue and fan-out engine.
pub mod broadcast;
/// Error types for the hub and its sessions.
pub mod error;
/// Append-only chat transcript.
pub mod history;
/// Registry + history + queue, the unit of shared state.
pub mod hub;
/// Presence snapshots derived from the registry.
pub mod presence;
/// Connection handles, delivery links and the registry map.
pub mod registry;
/// The per-connection control loop.
pub mod session;

// --- Public API Re-exports ---
pub use broadcast::{BroadcastEngine, Delivery, Overflow, QueueBound};
pub use error::{HubError, SessionError};
pub use history::HistoryLog;
pub use hub::{Attachment, Hub, HubConfig, DEFAULT_OUTBOX_CAPACITY};
pub use presence::PresenceNotifier;
pub use registry::{ConnectionId, Link, Outbox, Registry, RegistryEntry, Visit, WriteFailure};
pub use session::Session;
