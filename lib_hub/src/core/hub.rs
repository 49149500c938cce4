//! # Hub
//!
//! The unit of shared state: connection registry and history log behind one
//! mutex, plus the producer side of the broadcast queue. There are no
//! globals. Every caller goes through an `Arc<Hub>`, and tests build as many
//! independent hubs as they like.
//!
//! ## Locking Discipline:
//!
//! - Registry and history share a single `std::sync::Mutex`, so a history
//!   reader never observes a half-applied append and membership and
//!   transcript are always read from the same instant.
//! - The lock is held only for the map/vec operation or for a fan-out
//!   iteration. Fan-out writes are `try_send` calls, so nothing awaits while
//!   the lock is held.
//! - Enqueueing never touches the lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::core::broadcast::{BroadcastEngine, BroadcastQueue, QueueBound};
use crate::core::error::HubError;
use crate::core::history::HistoryLog;
use crate::core::presence::PresenceNotifier;
use crate::core::registry::{ConnectionId, Link, Outbox, Registry, RegistryEntry, Visit};
use crate::protocol::{self, ChatMessage, HubMessage, Identity, PRESENCE_LABEL};

/// Default number of frames a connection may have waiting before it is
/// considered too slow and pruned.
pub const DEFAULT_OUTBOX_CAPACITY: usize = 1024;

/// Tunables for a single hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubConfig {
    /// Bound and overflow policy of the broadcast queue.
    pub queue: QueueBound,
    /// Per-connection outbox size.
    pub outbox_capacity: usize,
    /// Label carried by presence snapshots.
    pub presence_label: String,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            queue: QueueBound::Unbounded,
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
            presence_label: PRESENCE_LABEL.to_string(),
        }
    }
}

#[derive(Debug, Default)]
struct HubState {
    registry: Registry,
    history: HistoryLog,
}

/// A freshly registered connection: its handle and the outbox its writer
/// task drains.
#[derive(Debug)]
pub struct Attachment {
    /// Registry handle.
    pub id: ConnectionId,
    /// Frames the broadcast engine hands to this connection.
    pub outbox: Outbox,
}

/// # Hub
///
/// Registry + history log + broadcast queue.
pub struct Hub {
    state: Mutex<HubState>,
    queue: BroadcastQueue,
    presence: PresenceNotifier,
    next_id: AtomicU64,
    shutdown: CancellationToken,
    config: HubConfig,
}

impl Hub {
    /// # New Hub
    ///
    /// Creates a hub and the engine that drains its broadcast queue.
    ///
    /// ## Logic:
    /// 1.  Builds the broadcast queue with the bound from `config.queue` and
    ///     keeps the producer half.
    /// 2.  Starts with an empty registry and history, a fresh shutdown token
    ///     and connection handles counting up from 1.
    /// 3.  Hands the consumer half to a [`BroadcastEngine`] holding its own
    ///     `Arc` of the hub.
    ///
    /// The engine does nothing until it is run or spawned. It stops when
    /// [`Hub::shutdown`] is called, not when the last `Arc<Hub>` is dropped.
    pub fn new(config: HubConfig) -> (Arc<Hub>, BroadcastEngine) {
        let (queue, receiver) = BroadcastQueue::new(config.queue);
        let hub = Arc::new(Hub {
            state: Mutex::new(HubState::default()),
            queue,
            presence: PresenceNotifier::new(config.presence_label.clone()),
            next_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
            config,
        });
        let engine = BroadcastEngine::new(Arc::clone(&hub), receiver);
        (hub, engine)
    }

    fn state(&self) -> MutexGuard<'_, HubState> {
        // A panic while holding the lock leaves the map and vec structurally
        // valid, so keep serving.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Allocates a handle that has never been used by this hub.
    pub fn next_connection_id(&self) -> ConnectionId {
        ConnectionId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Allocates a handle, builds its delivery link and registers it under
    /// `identity`.
    pub fn attach(&self, identity: Identity) -> Attachment {
        let id = self.next_connection_id();
        let (link, outbox) = Link::new(self.config.outbox_capacity, &self.shutdown);
        self.register(id, identity, link);
        Attachment { id, outbox }
    }

    /// Inserts or overwrites the entry for `id`.
    pub fn register(&self, id: ConnectionId, identity: Identity, link: Link) {
        let replaced = {
            let mut state = self.state();
            state.registry.register(id, RegistryEntry::new(identity.clone(), link))
        };
        if let Some(old) = replaced {
            debug!(connection = %id, previous = %old.identity, "Registry entry overwritten");
        }
        info!(connection = %id, identity = %identity, "Client registered");
    }

    /// Removes the entry for `id` if present. Returns whether anything was
    /// removed.
    pub fn deregister(&self, id: ConnectionId) -> bool {
        let removed = self.state().registry.deregister(id);
        match removed {
            Some(entry) => {
                info!(connection = %id, identity = %entry.identity, "Client deregistered");
                true
            }
            None => false,
        }
    }

    /// Identities of all live connections, in connect order.
    pub fn snapshot(&self) -> Vec<Identity> {
        self.state().registry.snapshot()
    }

    /// Visits every registered connection under the lock. See
    /// [`Registry::for_each`].
    pub fn for_each<F>(&self, visit: F) -> usize
    where
        F: FnMut(ConnectionId, &RegistryEntry) -> Visit,
    {
        self.state().registry.for_each(visit)
    }

    /// Number of live connections.
    pub fn online(&self) -> usize {
        self.state().registry.len()
    }

    /// Appends a chat message to the history log. Returns its position.
    pub fn append_history(&self, message: ChatMessage) -> usize {
        self.state().history.append(message)
    }

    /// Runs `read` over the history log with the lock held.
    pub fn with_history<R>(&self, read: impl FnOnce(&[ChatMessage]) -> R) -> R {
        let state = self.state();
        read(state.history.entries())
    }

    /// A copy of the full history log.
    pub fn history(&self) -> Vec<ChatMessage> {
        self.with_history(<[ChatMessage]>::to_vec)
    }

    /// Number of messages in the history log.
    pub fn history_len(&self) -> usize {
        self.state().history.len()
    }

    /// The history log encoded as the JSON document served by `/chats`.
    pub fn encoded_history(&self) -> Result<String, HubError> {
        Ok(self.with_history(protocol::encode_history)?)
    }

    /// Places `message` on the broadcast queue.
    pub async fn enqueue(&self, message: HubMessage) -> Result<(), HubError> {
        self.queue.enqueue(message).await
    }

    /// Broadcasts the current set of identities. Returns how many were
    /// published.
    pub async fn publish_presence(&self) -> Result<usize, HubError> {
        self.presence.publish(self).await
    }

    /// A clone of the hub-wide shutdown token. Every connection's close token
    /// is a child of it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stops the broadcast engine and closes every connection.
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            info!(online = self.online(), "Hub shutting down");
        }
        self.shutdown.cancel();
    }

    /// `true` once [`Hub::shutdown`] has been called.
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_ids_are_never_reused() {
        let (hub, _engine) = Hub::new(HubConfig::default());
        let a = hub.attach("alice".into());
        assert!(hub.deregister(a.id));
        let b = hub.attach("alice".into());
        assert_ne!(a.id, b.id);
        assert!(b.id > a.id);
    }

    #[test]
    fn deregister_is_idempotent() {
        let (hub, _engine) = Hub::new(HubConfig::default());
        let a = hub.attach("alice".into());
        let _b = hub.attach("bob".into());

        assert!(hub.deregister(a.id));
        assert!(!hub.deregister(a.id));
        assert!(!hub.deregister(ConnectionId::new(4242)));
        assert_eq!(hub.snapshot(), vec![Identity::from("bob")]);
        assert_eq!(hub.online(), 1);
    }

    #[test]
    fn history_is_shared_through_the_hub_lock() {
        let (hub, _engine) = Hub::new(HubConfig::default());
        hub.append_history(ChatMessage::new("alice".into(), "m1"));
        hub.append_history(ChatMessage::new("bob".into(), "m2"));

        let history = hub.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content, "m1");
        assert_eq!(history[1].sender.as_str(), "bob");

        let body: serde_json::Value = serde_json::from_str(&hub.encoded_history().unwrap()).unwrap();
        assert_eq!(body[0]["UserID"], "alice");
        assert_eq!(body[1]["type"], "chat");
    }

    #[test]
    fn concurrent_appends_are_all_recorded() {
        let (hub, _engine) = Hub::new(HubConfig::default());
        let workers: Vec<_> = (0..8)
            .map(|w| {
                let hub = Arc::clone(&hub);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        hub.append_history(ChatMessage::new(format!("w{w}").into(), i.to_string()));
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(hub.history_len(), 400);

        // Per-writer order survives interleaving.
        let history = hub.history();
        for w in 0..8 {
            let sender = format!("w{w}");
            let seen: Vec<usize> = history
                .iter()
                .filter(|m| m.sender.as_str() == sender)
                .map(|m| m.content.parse().unwrap())
                .collect();
            assert_eq!(seen, (0..50).collect::<Vec<_>>());
        }
    }

    #[test]
    fn shutdown_closes_every_link() {
        let (hub, _engine) = Hub::new(HubConfig::default());
        let a = hub.attach("alice".into());
        let b = hub.attach("bob".into());
        hub.shutdown();
        assert!(hub.is_shut_down());
        assert!(a.outbox.closed.is_cancelled());
        assert!(b.outbox.closed.is_cancelled());
    }
}
