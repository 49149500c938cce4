//! Presence notifier: turns the registry's identity set into a broadcast.

use tracing::debug;

use crate::core::error::HubError;
use crate::core::hub::Hub;
use crate::protocol::{HubMessage, PresenceSnapshot, PRESENCE_LABEL};

/// Builds and enqueues presence snapshots. Called by sessions after every
/// register and every deregister.
#[derive(Debug, Clone)]
pub struct PresenceNotifier {
    label: String,
}

impl Default for PresenceNotifier {
    fn default() -> Self {
        Self::new(PRESENCE_LABEL)
    }
}

impl PresenceNotifier {
    /// Creates a notifier whose snapshots carry `label`.
    pub fn new(label: impl Into<String>) -> Self {
        Self { label: label.into() }
    }

    /// A presence message for the registry as it is right now.
    pub fn snapshot(&self, hub: &Hub) -> HubMessage {
        HubMessage::Presence(PresenceSnapshot {
            label: self.label.clone(),
            identities: hub.snapshot(),
        })
    }

    /// Takes a snapshot and enqueues it. Returns the number of identities
    /// published.
    pub async fn publish(&self, hub: &Hub) -> Result<usize, HubError> {
        let message = self.snapshot(hub);
        let online = match &message {
            HubMessage::Presence(snapshot) => snapshot.identities.len(),
            HubMessage::Chat(_) => 0,
        };
        hub.enqueue(message).await?;
        debug!(online, "Presence snapshot published");
        Ok(online)
    }
}
