//! Subscription registry: per-recipient wakeup fan-out.
//!
//! Each recipient with at least one live delivery session has a broadcast
//! channel here. `notify` is a level-triggered signal — it tells every
//! attached session "there is new data, go re-drain", it does not carry the
//! message itself. A session that misses broadcast slots (lagged receiver)
//! loses nothing: the next drain re-reads the store from its cursor.
//!
//! The registry owns subscription lifetime only; message data stays in the
//! store.

use std::collections::HashMap;
use std::sync::RwLock;

use tokio::sync::broadcast;

use crate::address::ClientId;

/// Wake signals are tiny; a session behind by more than this many just
/// re-drains once.
const WAKE_CHANNEL_CAPACITY: usize = 32;

struct Channel {
    tx: broadcast::Sender<u64>,
    subscribers: usize,
}

/// One live subscription for one recipient. Obtained from
/// [`Registry::attach`]; the delivery session takes the receiver and must
/// eventually pass the handle back to [`Registry::detach`].
pub struct SubscriptionHandle {
    recipient: ClientId,
    receiver: Option<broadcast::Receiver<u64>>,
    detached: bool,
}

impl SubscriptionHandle {
    pub fn recipient(&self) -> &ClientId {
        &self.recipient
    }

    /// Take the wake receiver. Yields `None` after the first call.
    pub fn take_receiver(&mut self) -> Option<broadcast::Receiver<u64>> {
        self.receiver.take()
    }
}

/// Process-wide registry of live subscriptions. Explicitly constructed and
/// injected so tests can run isolated instances.
#[derive(Default)]
pub struct Registry {
    channels: RwLock<HashMap<ClientId, Channel>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscription for `recipient`.
    ///
    /// The returned handle's receiver observes every `notify` issued after
    /// this call returns; callers drain the store after attaching, so a
    /// message enqueued concurrently with attach is seen either by that
    /// initial drain or by the notification — never by neither.
    pub fn attach(&self, recipient: &ClientId) -> SubscriptionHandle {
        let mut channels = self.channels.write().expect("registry lock poisoned");
        let channel = channels.entry(recipient.clone()).or_insert_with(|| Channel {
            tx: broadcast::channel(WAKE_CHANNEL_CAPACITY).0,
            subscribers: 0,
        });
        channel.subscribers += 1;
        SubscriptionHandle {
            recipient: recipient.clone(),
            receiver: Some(channel.tx.subscribe()),
            detached: false,
        }
    }

    /// Wake every subscription attached to `recipient`. Called after each
    /// successful enqueue; a no-op when nobody is listening.
    pub fn notify(&self, recipient: &ClientId, sequence: u64) {
        let channels = self.channels.read().expect("registry lock poisoned");
        if let Some(channel) = channels.get(recipient) {
            let _ = channel.tx.send(sequence);
        }
    }

    /// Remove a subscription. Idempotent: calling it again, or after the
    /// recipient's channel is already gone, does nothing.
    pub fn detach(&self, handle: &mut SubscriptionHandle) {
        if handle.detached {
            return;
        }
        handle.detached = true;
        handle.receiver = None;

        let mut channels = self.channels.write().expect("registry lock poisoned");
        if let Some(channel) = channels.get_mut(&handle.recipient) {
            channel.subscribers = channel.subscribers.saturating_sub(1);
            if channel.subscribers == 0 {
                channels.remove(&handle.recipient);
            }
        }
    }

    /// Whether any live subscription exists for `recipient`. Consulted by
    /// the store's sweep before garbage-collecting an empty queue.
    pub fn has_subscribers(&self, recipient: &ClientId) -> bool {
        let channels = self.channels.read().expect("registry lock poisoned");
        channels
            .get(recipient)
            .is_some_and(|channel| channel.subscribers > 0)
    }

    /// Total live subscriptions across all recipients.
    pub fn subscriber_count(&self) -> usize {
        let channels = self.channels.read().expect("registry lock poisoned");
        channels.values().map(|channel| channel.subscribers).sum()
    }
}
