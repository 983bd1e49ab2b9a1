//! Message model and wire protocol.
//!
//! Payloads are JSON objects (the shape consumers see). Between a
//! [`RemoteBroker`](crate::broker::remote::RemoteBroker) and the relay,
//! messages travel as bincode-encoded [`Frame`]s inside WebSocket binary
//! messages:
//!
//! ```text
//! ┌───────────┬──────────┬─────────────────────┬───────────┐
//! │ frame tag │ topic    │ payload (JSON bytes)│ timestamp │
//! │ varint    │ len+utf8 │ len+bytes           │ varint    │
//! └───────────┴──────────┴─────────────────────┴───────────┘
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{CollabError, Result};

/// JSON object carried by every message.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Serialize a record into a message payload.
///
/// The only shape check is that the record serializes to a JSON object.
pub fn to_payload<T: Serialize + ?Sized>(record: &T) -> Result<Payload> {
    match serde_json::to_value(record)? {
        serde_json::Value::Object(map) => Ok(map),
        other => Err(CollabError::Serialization(format!(
            "payload must be a JSON object, got {}",
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

/// A message published to a topic.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Topic name
    pub topic: String,
    /// JSON object carried by the message
    pub payload: Payload,
    /// Publish time, milliseconds since the epoch
    pub timestamp: i64,
}

impl Message {
    /// Create a message stamped with the current time.
    pub fn new(topic: impl Into<String>, payload: Payload) -> Self {
        Self {
            topic: topic.into(),
            payload,
            timestamp: now_millis(),
        }
    }

    /// Decode the payload into a typed record.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(serde_json::Value::Object(
            self.payload.clone(),
        ))?)
    }

    /// Encode for transport (payload becomes JSON bytes).
    pub fn to_wire(&self) -> Result<WireMessage> {
        Ok(WireMessage {
            topic: self.topic.clone(),
            payload: serde_json::to_vec(&self.payload)?,
            timestamp: self.timestamp,
        })
    }
}

/// Transport form of a [`Message`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    /// Topic name
    pub topic: String,
    /// JSON-encoded payload object
    pub payload: Vec<u8>,
    /// Publish time, milliseconds since the epoch
    pub timestamp: i64,
}

impl WireMessage {
    /// Decode the JSON payload back into a [`Message`].
    pub fn into_message(self) -> Result<Message> {
        let payload: Payload = serde_json::from_slice(&self.payload)?;
        Ok(Message {
            topic: self.topic,
            payload,
            timestamp: self.timestamp,
        })
    }
}

/// Frames exchanged between a remote broker client and the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    /// Start consuming a topic on this connection
    Subscribe { topic: String },
    /// Stop consuming a topic on this connection
    Unsubscribe { topic: String },
    /// Client → relay: append to a topic
    Produce(WireMessage),
    /// Relay → client: a message on a consumed topic
    Deliver(WireMessage),
    Ping,
    Pong,
}

impl Frame {
    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serde::encode_to_vec(
            self,
            bincode::config::standard(),
        )?)
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (frame, _) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
        Ok(frame)
    }
}

// ───────────────────────────────────────────────────────────────────
// Collaborative editing payloads
// ───────────────────────────────────────────────────────────────────

/// What an edit does. Offsets and lengths count characters.
///
/// `position`/`length` exist only on text-changing kinds; a cursor move
/// carries only its offset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "kebab-case")]
pub enum EditKind {
    Insert {
        position: usize,
        content: String,
    },
    Delete {
        position: usize,
        length: usize,
    },
    Replace {
        position: usize,
        length: usize,
        content: String,
    },
    CursorMove {
        #[serde(rename = "cursorPosition")]
        cursor_position: usize,
    },
}

/// A single edit (or cursor move) on a document.
///
/// Serializes to the `edit` object of an edit message and, for cursor
/// moves, is itself the cursor message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditOperation {
    #[serde(rename = "templateId")]
    pub document_id: String,
    #[serde(rename = "userId")]
    pub author_id: String,
    #[serde(rename = "username")]
    pub author_name: String,
    /// Strictly increasing per session
    pub timestamp: i64,
    #[serde(flatten)]
    pub kind: EditKind,
}

impl EditOperation {
    /// Key used for echo suppression.
    pub fn origin(&self) -> (&str, i64) {
        (&self.author_id, self.timestamp)
    }

    /// Whether this only moves a caret.
    pub fn is_cursor_move(&self) -> bool {
        matches!(self.kind, EditKind::CursorMove { .. })
    }
}

/// Payload published on the `template-edits` topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditEnvelope {
    #[serde(rename = "templateId")]
    pub template_id: String,
    /// The edit itself
    pub edit: EditOperation,
    /// Publish time of the envelope
    pub timestamp: i64,
}

impl EditEnvelope {
    /// Wrap an edit, taking the document id from it.
    pub fn new(edit: EditOperation) -> Self {
        Self {
            template_id: edit.document_id.clone(),
            timestamp: now_millis(),
            edit,
        }
    }
}

/// Whole-document update broadcast by the realtime sync channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentUpdate {
    /// Document being replaced
    pub document_id: String,
    /// Sender
    pub user_id: String,
    /// Full new document text
    pub content: String,
    /// Send time, milliseconds since the epoch
    pub timestamp: i64,
}

/// Events understood on the `all-events` topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum BroadcastEvent {
    DocumentUpdate(DocumentUpdate),
}
