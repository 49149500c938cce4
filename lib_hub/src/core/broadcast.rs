//! # Broadcast Engine
//!
//! Serializes every outbound message into one ordered stream. Sessions and
//! the presence notifier enqueue; a single consumer task dequeues in FIFO
//! order and fans each message out to every registered connection.
//!
//! ## Core Design Principles:
//!
//! 1.  **One Consumer**: Only [`BroadcastEngine::run`] reads the queue, so
//!     every client that receives both `m1` and `m2` receives them in enqueue
//!     order.
//!
//! 2.  **Encode Once**: A message is serialized once per cycle and the
//!     resulting [`Frame`] is shared by every recipient's outbox.
//!
//! 3.  **Prune, Don't Abort**: A recipient whose outbox is closed or full is
//!     closed and removed from the registry inside the same iteration. The
//!     rest of the recipients still get the message.
//!
//! 4.  **Explicit Bound**: The queue is unbounded unless configured
//!     otherwise. A bounded queue either makes producers wait
//!     ([`Overflow::Block`]) or drops the new message ([`Overflow::Drop`]).

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::error::HubError;
use crate::core::hub::Hub;
use crate::core::registry::Visit;
use crate::protocol::{self, HubMessage};

/// What a bounded queue does when it is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Overflow {
    /// The producer waits for room.
    #[default]
    Block,
    /// The new message is dropped and the producer gets [`HubError::QueueFull`].
    Drop,
}

/// Capacity policy for the broadcast queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueBound {
    /// Never blocks a producer.
    #[default]
    Unbounded,
    /// At most `capacity` messages wait for the consumer.
    Bounded {
        /// Maximum queued messages.
        capacity: usize,
        /// Policy once `capacity` is reached.
        overflow: Overflow,
    },
}

#[derive(Debug)]
enum QueueTx {
    Unbounded(mpsc::UnboundedSender<HubMessage>),
    Bounded(mpsc::Sender<HubMessage>, Overflow),
}

#[derive(Debug)]
enum QueueRx {
    Unbounded(mpsc::UnboundedReceiver<HubMessage>),
    Bounded(mpsc::Receiver<HubMessage>),
}

impl QueueRx {
    async fn recv(&mut self) -> Option<HubMessage> {
        match self {
            QueueRx::Unbounded(rx) => rx.recv().await,
            QueueRx::Bounded(rx) => rx.recv().await,
        }
    }
}

/// Producer side of the broadcast queue, owned by the hub.
#[derive(Debug)]
pub struct BroadcastQueue {
    tx: QueueTx,
}

/// Consumer side of the broadcast queue. Handed to [`BroadcastEngine`].
#[derive(Debug)]
pub struct QueueReceiver {
    rx: QueueRx,
}

impl QueueReceiver {
    /// Next message in FIFO order, or `None` once every producer is gone.
    async fn recv(&mut self) -> Option<HubMessage> {
        self.rx.recv().await
    }
}

impl BroadcastQueue {
    /// Creates a queue with the given bound.
    pub fn new(bound: QueueBound) -> (BroadcastQueue, QueueReceiver) {
        match bound {
            QueueBound::Unbounded => {
                let (tx, rx) = mpsc::unbounded_channel();
                (
                    BroadcastQueue { tx: QueueTx::Unbounded(tx) },
                    QueueReceiver { rx: QueueRx::Unbounded(rx) },
                )
            }
            QueueBound::Bounded { capacity, overflow } => {
                let (tx, rx) = mpsc::channel(capacity.max(1));
                (
                    BroadcastQueue { tx: QueueTx::Bounded(tx, overflow) },
                    QueueReceiver { rx: QueueRx::Bounded(rx) },
                )
            }
        }
    }

    /// Places `message` at the back of the queue.
    pub async fn enqueue(&self, message: HubMessage) -> Result<(), HubError> {
        match &self.tx {
            QueueTx::Unbounded(tx) => tx.send(message).map_err(|_| HubError::EngineStopped),
            QueueTx::Bounded(tx, Overflow::Block) => {
                tx.send(message).await.map_err(|_| HubError::EngineStopped)
            }
            QueueTx::Bounded(tx, Overflow::Drop) => tx.try_send(message).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => HubError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => HubError::EngineStopped,
            }),
        }
    }
}

/// Outcome of one fan-out cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    /// Connections the frame was handed to.
    pub delivered: usize,
    /// Connections closed and removed because the write failed.
    pub pruned: usize,
}

/// # Broadcast Engine
///
/// The single consumer of a hub's broadcast queue.
pub struct BroadcastEngine {
    hub: Arc<Hub>,
    queue: QueueReceiver,
}

impl BroadcastEngine {
    pub(crate) fn new(hub: Arc<Hub>, queue: QueueReceiver) -> Self {
        Self { hub, queue }
    }

    /// Drains the queue until the hub shuts down.
    pub async fn run(mut self) {
        let shutdown = self.hub.shutdown_token();
        info!("Broadcast engine started.");
        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                next = self.queue.recv() => next,
            };
            match next {
                Some(message) => {
                    let delivery = self.dispatch(&message);
                    debug!(
                        kind = message.kind(),
                        delivered = delivery.delivered,
                        pruned = delivery.pruned,
                        "Broadcast cycle complete"
                    );
                }
                None => break,
            }
        }
        info!("Broadcast engine stopped.");
    }

    /// Runs the engine on its own task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// # Dispatch
    ///
    /// Writes one message to every registered connection, pruning those that
    /// cannot take it.
    ///
    /// ## Logic:
    /// 1.  **Encode**: serializes `message` once. A message that fails to
    ///     encode is logged and dropped, and nobody receives it.
    /// 2.  **Fan-out**: visits the registry under the hub lock and hands a
    ///     clone of the frame to each connection's outbox with `try_send`.
    ///     Nothing awaits while the lock is held.
    /// 3.  **Prune**: a connection whose outbox is closed or full has its
    ///     close token cancelled and is removed in the same pass. Its session
    ///     sees the cancellation and runs its own teardown.
    ///
    /// Returns how many connections got the frame and how many were pruned.
    pub fn dispatch(&self, message: &HubMessage) -> Delivery {
        let frame = match protocol::encode(message) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(kind = message.kind(), error = %e, "Dropping message that failed to encode");
                return Delivery::default();
            }
        };

        let mut delivery = Delivery::default();
        self.hub.for_each(|id, entry| match entry.link().deliver(&frame) {
            Ok(()) => {
                delivery.delivered += 1;
                Visit::Keep
            }
            Err(failure) => {
                warn!(
                    connection = %id,
                    identity = %entry.identity,
                    ?failure,
                    "Write failed. Closing connection and removing it from the registry."
                );
                entry.link().close();
                delivery.pruned += 1;
                Visit::Remove
            }
        });
        delivery
    }
}
