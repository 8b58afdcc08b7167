//! The immutable message record and its delivery frame encodings.

use std::sync::Arc;
use std::time::SystemTime;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Serialize;

use crate::address::ClientId;

/// One queued payload. Never mutated after creation; it is only read, copied
/// into delivery frames, and eventually dropped by expiry or eviction.
#[derive(Debug, Clone)]
pub struct Message {
    pub from: Option<ClientId>,
    pub to: ClientId,
    pub body: Vec<u8>,
    pub topic: Option<String>,
    pub created_at: SystemTime,
    pub expires_at: SystemTime,
}

/// A message as held by the store, with its assigned sequence number.
/// Wrapped in `Arc` so concurrent drains share one allocation.
#[derive(Debug)]
pub struct StoredMessage {
    pub sequence: u64,
    pub size_bytes: usize,
    pub message: Message,
}

pub type SharedMessage = Arc<StoredMessage>;

/// Wire frame delivered to subscribers: the sender id plus the payload,
/// base64-encoded so arbitrary bytes survive the JSON envelope.
#[derive(Serialize)]
struct EventFrame<'a> {
    from: &'a str,
    message: String,
}

/// Long-poll entry: an event frame plus its sequence id so the caller can
/// resume from the last entry it saw.
#[derive(Serialize)]
struct PollFrame<'a> {
    id: u64,
    from: &'a str,
    message: String,
}

impl StoredMessage {
    fn from_str(&self) -> &str {
        self.message
            .from
            .as_ref()
            .map(ClientId::as_str)
            .unwrap_or("")
    }

    /// JSON body for an SSE `data:` line.
    pub fn event_data(&self) -> String {
        let frame = EventFrame {
            from: self.from_str(),
            message: STANDARD.encode(&self.message.body),
        };
        // Serializing a struct of strings cannot fail.
        serde_json::to_string(&frame).unwrap_or_default()
    }

    /// JSON value for one entry of a long-poll batch response.
    pub fn poll_entry(&self) -> serde_json::Value {
        let frame = PollFrame {
            id: self.sequence,
            from: self.from_str(),
            message: STANDARD.encode(&self.message.body),
        };
        serde_json::to_value(frame).unwrap_or_default()
    }
}
