//! # Connection Session
//!
//! The per-connection control loop, from identity announcement to teardown.
//!
//! ## States:
//!
//! - **Connecting**: read exactly one announcement frame. If it fails to
//!   read or decode, close the transport without registering.
//! - **Active**: entered after register + presence publish. Each inbound
//!   chat frame is re-attributed to the bound identity, appended to history
//!   and enqueued for broadcast. Any read or decode failure, a close frame,
//!   or the hub closing the connection ends the loop.
//! - **Closed**: close the transport, deregister, publish presence.
//!
//! The transport is taken as separate read and write halves so the session
//! works over anything that yields and accepts WebSocket messages. The read
//! half is driven by the session itself. The write half is moved to a writer
//! task that drains the connection's outbox.

use std::fmt;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::ws::{Message, Utf8Bytes};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::error::SessionError;
use crate::core::hub::Hub;
use crate::core::registry::{ConnectionId, Outbox};
use crate::protocol::{self, ChatMessage, HubMessage, Identity};

/// A frame that carries application data.
#[derive(Debug)]
enum Payload {
    Text(Utf8Bytes),
    Binary(Bytes),
}

impl Payload {
    fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::Text(text) => text.as_str().as_bytes(),
            Payload::Binary(bytes) => &bytes[..],
        }
    }
}

#[derive(Debug)]
enum Inbound {
    Payload(Payload),
    Control,
    Close,
}

fn classify(frame: Message) -> Inbound {
    match frame {
        Message::Text(text) => Inbound::Payload(Payload::Text(text)),
        Message::Binary(bytes) => Inbound::Payload(Payload::Binary(bytes)),
        Message::Ping(_) | Message::Pong(_) => Inbound::Control,
        Message::Close(_) => Inbound::Close,
    }
}

/// Reads until the next data frame. Control frames are skipped; a close
/// frame or the end of the stream is reported as a disconnect.
async fn next_payload<St, E>(stream: &mut St) -> Result<Payload, SessionError>
where
    St: Stream<Item = Result<Message, E>> + Unpin,
    E: fmt::Display,
{
    loop {
        match stream.next().await {
            None => return Err(SessionError::Disconnected),
            Some(Err(e)) => return Err(SessionError::Read(e.to_string())),
            Some(Ok(frame)) => match classify(frame) {
                Inbound::Payload(payload) => return Ok(payload),
                Inbound::Control => continue,
                Inbound::Close => return Err(SessionError::Disconnected),
            },
        }
    }
}

/// # Session
///
/// Drives one connection. Construct with [`Session::new`] and consume with
/// [`Session::run`].
pub struct Session {
    hub: Arc<Hub>,
    peer: String,
}

impl Session {
    /// Creates a session on `hub`. `peer` is only used in log fields.
    pub fn new(hub: Arc<Hub>, peer: impl Into<String>) -> Self {
        Self {
            hub,
            peer: peer.into(),
        }
    }

    /// # Run
    ///
    /// Drives the connection through all three states and returns the reason
    /// it closed.
    ///
    /// ## Logic:
    /// 1.  **Connecting**: waits for the announcement frame. A decode or read
    ///     failure, or a hub shutdown, closes `sink` and returns before
    ///     anything is registered.
    /// 2.  **Register**: attaches to the hub, moves `sink` into a writer task
    ///     that drains the new outbox, and publishes presence.
    /// 3.  **Active**: reads chat frames until the peer leaves, a frame fails
    ///     to decode, or the connection's close token is cancelled (writer
    ///     failure, broadcast prune or hub shutdown).
    /// 4.  **Closed**: cancels the close token, deregisters, publishes
    ///     presence again and waits for the writer to flush its close frame.
    ///
    /// Nothing is ever written to a client that misbehaves; the transport is
    /// just closed.
    pub async fn run<St, Si, E>(self, mut stream: St, sink: Si) -> SessionError
    where
        St: Stream<Item = Result<Message, E>> + Unpin,
        E: fmt::Display,
        Si: Sink<Message> + Send + 'static,
        Si::Error: fmt::Debug + Send,
    {
        // Connecting
        let identity = match self.handshake(&mut stream).await {
            Ok(identity) => identity,
            Err(reason) => {
                match &reason {
                    SessionError::Evicted => {
                        info!(peer = %self.peer, "Hub shut down before the handshake completed")
                    }
                    _ => warn!(peer = %self.peer, %reason, "Handshake failed. Closing without registering."),
                }
                let mut sink = Box::pin(sink);
                let _ = sink.close().await;
                return reason;
            }
        };

        let attachment = self.hub.attach(identity.clone());
        let id = attachment.id;
        let closer = attachment.outbox.closed.clone();
        let writer = tokio::spawn(write_loop(id, sink, attachment.outbox));
        info!(peer = %self.peer, connection = %id, identity = %identity, "Session active");
        self.publish_presence().await;

        // Active
        let reason = self.active(&mut stream, id, &identity, &closer).await;

        // Closed
        closer.cancel();
        self.hub.deregister(id);
        self.publish_presence().await;
        if let Err(e) = writer.await {
            warn!(connection = %id, error = %e, "Writer task ended abnormally");
        }
        match &reason {
            SessionError::Decode(_) | SessionError::Read(_) => {
                warn!(connection = %id, identity = %identity, %reason, "Session closed")
            }
            _ => info!(connection = %id, identity = %identity, %reason, "Session closed"),
        }
        reason
    }

    async fn handshake<St, E>(&self, stream: &mut St) -> Result<Identity, SessionError>
    where
        St: Stream<Item = Result<Message, E>> + Unpin,
        E: fmt::Display,
    {
        let shutdown = self.hub.shutdown_token();
        let payload = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Err(SessionError::Evicted),
            next = next_payload(stream) => next?,
        };
        let announcement =
            protocol::decode_announcement(payload.as_bytes()).map_err(SessionError::Handshake)?;
        Ok(Identity::from(announcement.username))
    }

    async fn active<St, E>(
        &self,
        stream: &mut St,
        id: ConnectionId,
        identity: &Identity,
        closer: &CancellationToken,
    ) -> SessionError
    where
        St: Stream<Item = Result<Message, E>> + Unpin,
        E: fmt::Display,
    {
        loop {
            let next = tokio::select! {
                biased;
                _ = closer.cancelled() => return SessionError::Evicted,
                next = next_payload(stream) => next,
            };
            let payload = match next {
                Ok(payload) => payload,
                Err(reason) => return reason,
            };
            let inbound = match protocol::decode_chat(payload.as_bytes()) {
                Ok(inbound) => inbound,
                Err(e) => return SessionError::Decode(e),
            };

            // The client-supplied sender, if any, was never decoded.
            let message = ChatMessage::new(identity.clone(), inbound.content);
            let position = self.hub.append_history(message.clone());
            debug!(connection = %id, position, "Chat message accepted");
            if let Err(e) = self.hub.enqueue(HubMessage::Chat(message)).await {
                warn!(connection = %id, error = %e, "Chat message not broadcast");
            }
        }
    }

    async fn publish_presence(&self) {
        if let Err(e) = self.hub.publish_presence().await {
            warn!(peer = %self.peer, error = %e, "Presence snapshot not broadcast");
        }
    }
}

/// Drains `outbox` into `sink` until the connection is closed or a write
/// fails. Either way the close token is cancelled on exit so the reader
/// stops too.
async fn write_loop<Si>(id: ConnectionId, sink: Si, mut outbox: Outbox)
where
    Si: Sink<Message>,
    Si::Error: fmt::Debug + Send,
{
    let mut sink = Box::pin(sink);
    loop {
        let frame = tokio::select! {
            biased;
            _ = outbox.closed.cancelled() => break,
            frame = outbox.frames.recv() => frame,
        };
        let Some(frame) = frame else { break };
        if let Err(e) = sink.send(Message::Text(frame)).await {
            debug!(connection = %id, error = ?e, "Socket write failed");
            break;
        }
    }
    outbox.closed.cancel();
    outbox.frames.close();
    let _ = sink.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hub::HubConfig;
    use crate::protocol::PresenceSnapshot;
    use futures_util::stream;
    use std::convert::Infallible;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;
    use tokio_util::sync::PollSender;

    fn text(raw: &str) -> Result<Message, Infallible> {
        Ok(Message::Text(raw.into()))
    }

    fn sink() -> (PollSender<Message>, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(64);
        (PollSender::new(tx), rx)
    }

    async fn next_message(outbox: &mut Outbox) -> HubMessage {
        let frame = timeout(Duration::from_secs(2), outbox.frames.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("outbox closed");
        serde_json::from_str(frame.as_str()).unwrap()
    }

    fn presence(names: &[&str]) -> HubMessage {
        HubMessage::Presence(PresenceSnapshot {
            label: protocol::PRESENCE_LABEL.to_string(),
            identities: names.iter().map(|n| Identity::from(*n)).collect(),
        })
    }

    #[test]
    fn control_frames_are_not_payloads() {
        assert!(matches!(classify(Message::Ping(Bytes::new())), Inbound::Control));
        assert!(matches!(classify(Message::Pong(Bytes::new())), Inbound::Control));
        assert!(matches!(classify(Message::Close(None)), Inbound::Close));
        assert!(matches!(
            classify(Message::Binary(Bytes::from_static(b"{}"))),
            Inbound::Payload(Payload::Binary(_))
        ));
    }

    #[tokio::test]
    async fn malformed_announcement_never_registers() {
        let (hub, engine) = Hub::new(HubConfig::default());
        let task = engine.spawn();
        let mut observer = hub.attach("observer".into());
        let (sink, _written) = sink();

        let frames = stream::iter(vec![text("not json"), text(r#"{"Content":"hi"}"#)]);
        let reason = Session::new(Arc::clone(&hub), "test").run(frames, sink).await;

        assert!(matches!(reason, SessionError::Handshake(_)));
        assert_eq!(hub.online(), 1);
        assert_eq!(hub.history_len(), 0);
        assert!(observer.outbox.frames.try_recv().is_err());

        hub.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn chat_is_reattributed_stored_and_broadcast() {
        let (hub, engine) = Hub::new(HubConfig::default());
        let task = engine.spawn();
        let mut bob = hub.attach("bob".into());
        let (sink, _written) = sink();

        let frames = stream::iter(vec![
            text(r#"{"username":"alice"}"#),
            Ok(Message::Ping(Bytes::new())),
            text(r#"{"UserID":"eve","Content":"hi","type":"user_list"}"#),
        ]);
        let reason = Session::new(Arc::clone(&hub), "test").run(frames, sink).await;
        assert!(matches!(reason, SessionError::Disconnected));

        assert_eq!(next_message(&mut bob.outbox).await, presence(&["bob", "alice"]));
        let expected = HubMessage::Chat(ChatMessage::new("alice".into(), "hi"));
        assert_eq!(next_message(&mut bob.outbox).await, expected);
        assert_eq!(next_message(&mut bob.outbox).await, presence(&["bob"]));

        assert_eq!(hub.history(), vec![ChatMessage::new("alice".into(), "hi")]);
        assert_eq!(hub.snapshot(), vec![Identity::from("bob")]);

        hub.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn undecodable_message_closes_the_session() {
        let (hub, engine) = Hub::new(HubConfig::default());
        let task = engine.spawn();
        let (sink, _written) = sink();

        let frames = stream::iter(vec![
            text(r#"{"username":"alice"}"#),
            text(r#"{"Content":"kept"}"#),
            text("{broken"),
            text(r#"{"Content":"never read"}"#),
        ]);
        let reason = Session::new(Arc::clone(&hub), "test").run(frames, sink).await;

        assert!(matches!(reason, SessionError::Decode(_)));
        assert_eq!(hub.online(), 0);
        let contents: Vec<String> = hub.history().into_iter().map(|m| m.content).collect();
        assert_eq!(contents, ["kept"]);

        hub.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn array_frames_are_not_accepted_as_objects() {
        let (hub, engine) = Hub::new(HubConfig::default());
        let task = engine.spawn();

        let (sink_a, _written_a) = sink();
        let frames = stream::iter(vec![text(r#"["mallory"]"#)]);
        let reason = Session::new(Arc::clone(&hub), "test").run(frames, sink_a).await;
        assert!(matches!(reason, SessionError::Handshake(_)));

        let (sink_b, _written_b) = sink();
        let frames = stream::iter(vec![
            text(r#"{"username":"alice"}"#),
            text("null"),
            text(r#"["hi"]"#),
            text(r#"{"Content":"never read"}"#),
        ]);
        let reason = Session::new(Arc::clone(&hub), "test").run(frames, sink_b).await;
        assert!(matches!(reason, SessionError::Decode(_)));

        // `null` is an empty chat; the array is not.
        assert_eq!(hub.history(), vec![ChatMessage::new("alice".into(), "")]);
        assert_eq!(hub.online(), 0);

        hub.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_ends_a_session_waiting_for_its_announcement() {
        let (hub, engine) = Hub::new(HubConfig::default());
        let task = engine.spawn();
        let (sink, mut written) = sink();

        let frames = stream::pending::<Result<Message, Infallible>>();
        let session = tokio::spawn(Session::new(Arc::clone(&hub), "test").run(frames, sink));
        tokio::task::yield_now().await;

        hub.shutdown();
        let reason = timeout(Duration::from_secs(2), session).await.unwrap().unwrap();
        assert!(matches!(reason, SessionError::Evicted));
        assert_eq!(hub.online(), 0);
        // The socket is closed without a single frame written.
        assert!(timeout(Duration::from_secs(2), written.recv()).await.unwrap().is_none());
        task.await.unwrap();
    }

    #[tokio::test]
    async fn session_writes_broadcasts_to_its_socket() {
        let (hub, engine) = Hub::new(HubConfig::default());
        let task = engine.spawn();
        let (sink, mut written) = sink();

        let frames = stream::iter(vec![text(r#"{"username":"alice"}"#), text(r#"{"Content":"echo"}"#)])
            .chain(stream::pending());
        let session = tokio::spawn(Session::new(Arc::clone(&hub), "test").run(frames, sink));

        let mut seen = Vec::new();
        while seen.len() < 2 {
            let frame = timeout(Duration::from_secs(2), written.recv()).await.unwrap().unwrap();
            if let Message::Text(text) = frame {
                seen.push(serde_json::from_str::<HubMessage>(text.as_str()).unwrap());
            }
        }
        assert_eq!(seen[0], presence(&["alice"]));
        assert_eq!(seen[1], HubMessage::Chat(ChatMessage::new("alice".into(), "echo")));

        hub.shutdown();
        let reason = timeout(Duration::from_secs(2), session).await.unwrap().unwrap();
        assert!(matches!(reason, SessionError::Evicted));
        task.await.unwrap();
    }

    #[tokio::test]
    async fn failed_socket_write_ends_its_session() {
        let (hub, engine) = Hub::new(HubConfig::default());
        let (sink, written) = sink();
        drop(written);

        let frames = stream::iter(vec![text(r#"{"username":"alice"}"#)]).chain(stream::pending());
        let session = tokio::spawn(Session::new(Arc::clone(&hub), "test").run(frames, sink));
        let task = engine.spawn();

        let reason = timeout(Duration::from_secs(2), session).await.unwrap().unwrap();
        assert!(matches!(reason, SessionError::Evicted));
        assert_eq!(hub.online(), 0);

        hub.shutdown();
        task.await.unwrap();
    }
}
