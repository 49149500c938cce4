//! # Wire Protocol
//!
//! JSON shapes exchanged with WebSocket clients and returned by the history
//! endpoint. Field names (`UserID`, `Content`, `type`) follow the browser
//! client this hub was written for, so they are kept PascalCase on the wire.
//!
//! ## Shapes:
//! - **Announcement** (inbound, first frame): `{"username": "alice"}`
//! - **Chat** (inbound): `{"Content": "hi"}`. Any `UserID` or `type` field
//!   sent by the client is ignored.
//! - **Chat** (outbound / history): `{"type":"chat","UserID":"alice","Content":"hi"}`
//! - **Presence** (outbound): `{"type":"user_list","Content":"Online users","Users":[...]}`

use std::fmt;
use std::sync::Arc;

use axum::extract::ws::Utf8Bytes;
use serde::de::{self, DeserializeOwned, Unexpected};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Label carried in the `Content` field of presence messages.
pub const PRESENCE_LABEL: &str = "Online users";

/// A pre-encoded outbound frame. Encoded once per broadcast cycle; clones
/// share the same buffer, so every recipient's outbox holds the same bytes.
pub type Frame = Utf8Bytes;

/// # Identity
///
/// The name a client announces when it connects. Not authenticated and not
/// unique: two connections may share one identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(Arc<str>);

impl Identity {
    /// Wraps a name as an `Identity`.
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self(name.into())
    }

    /// The announced name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for Identity {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}

/// A user-authored message as stored in history and broadcast to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Identity bound to the sending connection at handshake time.
    #[serde(rename = "UserID")]
    pub sender: Identity,
    /// Message body as sent by the client.
    #[serde(rename = "Content")]
    pub content: String,
}

impl ChatMessage {
    /// Builds a chat message attributed to `sender`.
    pub fn new(sender: Identity, content: impl Into<String>) -> Self {
        Self {
            sender,
            content: content.into(),
        }
    }
}

/// The set of identities online at the moment the snapshot was taken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceSnapshot {
    /// Fixed human-readable label.
    #[serde(rename = "Content")]
    pub label: String,
    /// One entry per live connection, duplicates included.
    #[serde(rename = "Users", default)]
    pub identities: Vec<Identity>,
}

/// # Hub Message
///
/// Everything the hub pushes to clients. A closed set: there is no
/// "unknown kind" on the outbound path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum HubMessage {
    /// User chat, appended to history before being broadcast.
    #[serde(rename = "chat")]
    Chat(ChatMessage),
    /// Membership snapshot, never stored.
    #[serde(rename = "user_list")]
    Presence(PresenceSnapshot),
}

impl HubMessage {
    /// Short name of the variant, used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            HubMessage::Chat(_) => "chat",
            HubMessage::Presence(_) => "user_list",
        }
    }
}

/// First frame a client sends after the upgrade.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Announcement {
    /// The identity to bind to the connection. Missing means empty.
    #[serde(default)]
    pub username: String,
}

/// A chat frame as received from a client. Only the content is trusted.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InboundChat {
    /// Message body. Missing means empty.
    #[serde(rename = "Content", alias = "content", default)]
    pub content: String,
}

/// Decodes an inbound frame that must be a JSON object. `null` yields the
/// empty value; arrays and scalars are rejected even when their elements
/// would line up with the struct's fields.
fn decode_object<T>(bytes: &[u8]) -> Result<T, serde_json::Error>
where
    T: DeserializeOwned + Default,
{
    match serde_json::from_slice::<Value>(bytes)? {
        Value::Null => Ok(T::default()),
        value @ Value::Object(_) => serde_json::from_value(value),
        other => {
            let unexpected = match &other {
                Value::Bool(b) => Unexpected::Bool(*b),
                Value::String(s) => Unexpected::Str(s),
                Value::Array(_) => Unexpected::Seq,
                _ => Unexpected::Other("number"),
            };
            Err(de::Error::invalid_type(unexpected, &"a JSON object"))
        }
    }
}

/// Decodes the identity announcement.
pub fn decode_announcement(bytes: &[u8]) -> Result<Announcement, serde_json::Error> {
    decode_object(bytes)
}

/// Decodes an inbound chat frame.
pub fn decode_chat(bytes: &[u8]) -> Result<InboundChat, serde_json::Error> {
    decode_object(bytes)
}

/// Encodes an outbound message into a shareable frame.
pub fn encode(message: &HubMessage) -> Result<Frame, serde_json::Error> {
    serde_json::to_string(message).map(Frame::from)
}

#[derive(Serialize)]
struct HistoryEntry<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(flatten)]
    message: &'a ChatMessage,
}

/// Encodes the history log as a JSON array, each entry shaped like an
/// outbound chat message.
pub fn encode_history(entries: &[ChatMessage]) -> Result<String, serde_json::Error> {
    let entries: Vec<HistoryEntry<'_>> = entries
        .iter()
        .map(|message| HistoryEntry {
            kind: "chat",
            message,
        })
        .collect();
    serde_json::to_string(&entries)
}
