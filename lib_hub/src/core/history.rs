//! Append-only transcript of accepted chat messages.

use crate::protocol::ChatMessage;

/// Ordered chat transcript. Insertion order is the order in which appends
/// won the hub lock. Never evicts.
#[derive(Debug, Default)]
pub struct HistoryLog {
    entries: Vec<ChatMessage>,
}

impl HistoryLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `message` and returns its position.
    pub fn append(&mut self, message: ChatMessage) -> usize {
        self.entries.push(message);
        self.entries.len() - 1
    }

    /// All entries in arrival order.
    pub fn entries(&self) -> &[ChatMessage] {
        &self.entries
    }

    /// Number of stored messages.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` if nothing has been said yet.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
