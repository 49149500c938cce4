//! # Connection Registry
//!
//! The single source of truth for "who is connected". Each live connection
//! has exactly one entry, keyed by its [`ConnectionId`], holding the identity
//! it announced and the [`Link`] the broadcast engine writes through.
//!
//! The registry itself is not synchronized. It lives inside the hub's state
//! mutex next to the history log, and every method here runs with that lock
//! held.
//!
//! ## Delivery Links
//!
//! A connection is written to by pushing a pre-encoded frame into its bounded
//! outbox with `try_send`, so a fan-out never awaits while the lock is held.
//! A dedicated writer task per connection drains the outbox into the socket.
//! When that task dies the receiving half is dropped, and the next push fails
//! with [`WriteFailure::Closed`]. A client that stops reading fills its outbox
//! and fails with [`WriteFailure::Full`].

use std::collections::BTreeMap;
use std::fmt;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::protocol::{Frame, Identity};

/// Opaque handle for a live connection. Allocated from a per-hub counter and
/// never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Wraps a raw counter value.
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw counter value.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Reason a frame could not be handed to a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteFailure {
    /// The connection's writer is gone.
    Closed,
    /// The connection is not draining its outbox fast enough.
    Full,
}

/// # Link
///
/// The broadcast-side handle to one connection: the sending half of its
/// outbox plus the token that closes it.
#[derive(Debug)]
pub struct Link {
    outbox: mpsc::Sender<Frame>,
    closer: CancellationToken,
}

/// The connection-side half of a [`Link`], consumed by the writer task.
#[derive(Debug)]
pub struct Outbox {
    /// Frames waiting to be written to the socket.
    pub frames: mpsc::Receiver<Frame>,
    /// Cancelled when the connection must close.
    pub closed: CancellationToken,
}

impl Link {
    /// Creates a link with an outbox of `capacity` frames. The close token is
    /// a child of `parent`, so cancelling the parent closes every link.
    pub fn new(capacity: usize, parent: &CancellationToken) -> (Link, Outbox) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let closer = parent.child_token();
        let outbox = Outbox {
            frames: rx,
            closed: closer.clone(),
        };
        (Link { outbox: tx, closer }, outbox)
    }

    /// Hands `frame` to the connection without waiting.
    pub fn deliver(&self, frame: &Frame) -> Result<(), WriteFailure> {
        if self.closer.is_cancelled() {
            return Err(WriteFailure::Closed);
        }
        self.outbox.try_send(Frame::clone(frame)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => WriteFailure::Full,
            mpsc::error::TrySendError::Closed(_) => WriteFailure::Closed,
        })
    }

    /// Signals the connection's tasks to shut down.
    pub fn close(&self) {
        self.closer.cancel();
    }
}

/// One registered connection.
#[derive(Debug)]
pub struct RegistryEntry {
    /// Identity announced at handshake.
    pub identity: Identity,
    link: Link,
}

impl RegistryEntry {
    /// Binds `identity` to a delivery link.
    pub fn new(identity: Identity, link: Link) -> Self {
        Self { identity, link }
    }

    /// The delivery link for this connection.
    pub fn link(&self) -> &Link {
        &self.link
    }
}

/// Verdict returned by a [`Registry::for_each`] visitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    /// Leave the entry in place.
    Keep,
    /// Drop the entry once the visitor returns.
    Remove,
}

/// # Registry
///
/// Map from live connection to its entry. Ordered by connection id, so
/// iteration and snapshots follow connect order.
#[derive(Debug, Default)]
pub struct Registry {
    entries: BTreeMap<ConnectionId, RegistryEntry>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or overwrites the entry for `id`. Returns the replaced entry.
    pub fn register(&mut self, id: ConnectionId, entry: RegistryEntry) -> Option<RegistryEntry> {
        self.entries.insert(id, entry)
    }

    /// Removes the entry for `id`. Removing an absent id is a no-op.
    pub fn deregister(&mut self, id: ConnectionId) -> Option<RegistryEntry> {
        self.entries.remove(&id)
    }

    /// Identities of all live connections, one per connection.
    pub fn snapshot(&self) -> Vec<Identity> {
        self.entries.values().map(|e| e.identity.clone()).collect()
    }

    /// Visits every entry once. Entries for which `visit` returns
    /// [`Visit::Remove`] are dropped in the same pass. Returns how many were
    /// removed.
    pub fn for_each<F>(&mut self, mut visit: F) -> usize
    where
        F: FnMut(ConnectionId, &RegistryEntry) -> Visit,
    {
        let before = self.entries.len();
        self.entries
            .retain(|id, entry| visit(*id, entry) == Visit::Keep);
        before - self.entries.len()
    }

    /// `true` if `id` is registered.
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` if nobody is connected.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
