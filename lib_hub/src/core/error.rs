use thiserror::Error;

/// Failures surfaced by the hub's enqueue and encode paths. None of them is
/// fatal; callers log and carry on.
#[derive(Debug, Error)]
pub enum HubError {
    /// A bounded queue with the `drop` policy had no room.
    #[error("broadcast queue is full, message dropped")]
    QueueFull,

    /// The consumer side of the queue is gone.
    #[error("broadcast engine has stopped")]
    EngineStopped,

    /// Serialization failed.
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Why a session left its loop. Every variant ends in the same teardown.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The first frame was not a valid identity announcement.
    #[error("malformed identity announcement: {0}")]
    Handshake(#[source] serde_json::Error),

    /// A frame in the active loop was not a valid chat message.
    #[error("malformed message: {0}")]
    Decode(#[source] serde_json::Error),

    /// The transport returned an error.
    #[error("transport read failed: {0}")]
    Read(String),

    /// Close frame or end of stream.
    #[error("peer closed the connection")]
    Disconnected,

    /// The hub closed the connection (write failure or shutdown).
    #[error("connection closed by the hub")]
    Evicted,
}
