//! Send-side dispatcher: request-level business rules.
//!
//! The only place an internal condition turns into a caller-visible error.
//! TTL bounds and payload size are checked here; identifier validation has
//! already happened at the HTTP boundary. On acceptance the message is
//! enqueued and the registry notified — delivery to any listener is
//! best-effort and invisible to the sender.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::address::ClientId;
use crate::clock::Clock;
use crate::clog;
use crate::logging;
use crate::message::Message;
use crate::registry::Registry;
use crate::store::Storage;

/// Client-caused rejection of a send request. Always parameter-shaped so a
/// well-behaved sender can self-correct and retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    TtlNotPositive,
    TtlTooHigh,
    PayloadTooLarge,
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::TtlNotPositive => write!(f, "param \"ttl\" must be positive"),
            SendError::TtlTooHigh => write!(f, "param \"ttl\" too high"),
            SendError::PayloadTooLarge => write!(f, "payload too large"),
        }
    }
}

impl std::error::Error for SendError {}

pub struct Dispatcher {
    storage: Arc<dyn Storage>,
    registry: Arc<Registry>,
    clock: Arc<dyn Clock>,
    max_ttl: Duration,
    max_payload_bytes: usize,
}

impl Dispatcher {
    pub fn new(
        storage: Arc<dyn Storage>,
        registry: Arc<Registry>,
        clock: Arc<dyn Clock>,
        max_ttl: Duration,
        max_payload_bytes: usize,
    ) -> Self {
        Self {
            storage,
            registry,
            clock,
            max_ttl,
            max_payload_bytes,
        }
    }

    /// Validate, enqueue, notify. Returns the assigned sequence.
    ///
    /// Success means "accepted", not "delivered": the sender cannot observe
    /// whether any subscriber received the message.
    pub fn send(
        &self,
        from: Option<ClientId>,
        to: ClientId,
        body: Vec<u8>,
        ttl_seconds: i64,
        topic: Option<String>,
    ) -> Result<u64, SendError> {
        if ttl_seconds <= 0 {
            return Err(SendError::TtlNotPositive);
        }
        let ttl = Duration::from_secs(ttl_seconds as u64);
        if ttl > self.max_ttl {
            return Err(SendError::TtlTooHigh);
        }
        if body.len() > self.max_payload_bytes {
            return Err(SendError::PayloadTooLarge);
        }

        let now = self.clock.now();
        let sender_label = from
            .as_ref()
            .map(|id| logging::client_id(id.as_str()))
            .unwrap_or_else(|| "anonymous".to_string());
        let recipient_label = logging::client_id(to.as_str());

        let message = Message {
            from,
            to: to.clone(),
            body,
            topic,
            created_at: now,
            expires_at: now + ttl,
        };
        let sequence = self.storage.enqueue(message);
        self.registry.notify(&to, sequence);

        clog!("bridge: accepted {sender_label} -> {recipient_label} (seq {sequence})");
        Ok(sequence)
    }
}
