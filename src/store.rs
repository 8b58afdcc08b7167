//! In-memory message queue store.
//!
//! One bounded queue per recipient, keyed by [`ClientId`]. The store owns
//! message lifetime: sequence assignment at enqueue, TTL expiry, drop-oldest
//! eviction when a queue exceeds its configured message or byte bound, and
//! garbage collection of idle queue entries during the periodic sweep.
//!
//! The map itself is behind an `RwLock`; each queue is behind its own
//! `Mutex`, so traffic for different recipients never contends beyond the
//! map-level read lock. All operations are short and non-blocking — enqueue
//! never rejects, overflow is absorbed by eviction.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime};

use tokio::sync::oneshot;

use crate::address::ClientId;
use crate::clock::Clock;
use crate::clog;
use crate::message::{Message, SharedMessage, StoredMessage};
use crate::registry::Registry;

/// Per-recipient queue bounds. When either bound would be exceeded, the
/// oldest queued messages are evicted to admit the newest.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub max_messages: usize,
    pub max_queue_bytes: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_messages: 1_000,
            max_queue_bytes: 4 * 1024 * 1024,
        }
    }
}

/// What a sweep pass removed.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    pub expired_messages: usize,
    pub removed_queues: usize,
}

/// Snapshot of one recipient's queue for the stats endpoint.
#[derive(Debug, serde::Serialize)]
pub struct QueueStats {
    pub client_id: String,
    pub depth: usize,
    pub bytes: usize,
}

/// Store-wide counters and per-queue detail.
#[derive(Debug, serde::Serialize)]
pub struct StoreStats {
    pub recipients: usize,
    pub total_queued: usize,
    pub total_queued_bytes: usize,
    pub total_stored: u64,
    pub total_evicted: u64,
    pub total_expired: u64,
    pub queues: Vec<QueueStats>,
}

/// The storage contract the delivery engine is written against. An
/// alternative backend (e.g. a shared store for a multi-instance deployment)
/// implements these four operations with the same semantics.
pub trait Storage: Send + Sync {
    /// Append `message` to its recipient's queue and return the assigned
    /// sequence. Always succeeds; overflow evicts the oldest entries.
    fn enqueue(&self, message: Message) -> u64;

    /// All currently non-expired messages for `recipient` with
    /// `sequence > since_sequence`, ascending. Does not remove anything.
    fn drain(&self, recipient: &ClientId, since_sequence: u64) -> Vec<SharedMessage>;

    /// Remove every message with `expires_at <= now`, then drop recipients
    /// whose queue is empty and for which `has_subscribers` is false.
    fn sweep(&self, now: SystemTime, has_subscribers: &dyn Fn(&ClientId) -> bool)
        -> SweepOutcome;

    /// Point-in-time snapshot, expired messages excluded.
    fn stats(&self, now: SystemTime) -> StoreStats;
}

#[derive(Default)]
struct Inbox {
    queue: VecDeque<SharedMessage>,
    queued_bytes: usize,
}

impl Inbox {
    /// Drop expired entries, returning how many were removed.
    fn prune_expired(&mut self, now: SystemTime) -> usize {
        let before = self.queue.len();
        let queued_bytes = &mut self.queued_bytes;
        self.queue.retain(|item| {
            if item.message.expires_at <= now {
                *queued_bytes -= item.size_bytes;
                false
            } else {
                true
            }
        });
        before - self.queue.len()
    }
}

/// The in-memory [`Storage`] implementation.
pub struct MemStorage {
    config: StoreConfig,
    clock: Arc<dyn Clock>,
    sequence: AtomicU64,
    queues: RwLock<HashMap<ClientId, Mutex<Inbox>>>,
    total_stored: AtomicU64,
    total_evicted: AtomicU64,
    total_expired: AtomicU64,
}

impl MemStorage {
    pub fn new(config: StoreConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            sequence: AtomicU64::new(0),
            queues: RwLock::new(HashMap::new()),
            total_stored: AtomicU64::new(0),
            total_evicted: AtomicU64::new(0),
            total_expired: AtomicU64::new(0),
        }
    }

    fn push_locked(&self, inbox: &mut Inbox, stored: SharedMessage, now: SystemTime) {
        let expired = inbox.prune_expired(now);
        self.total_expired.fetch_add(expired as u64, Ordering::Relaxed);

        let size = stored.size_bytes;
        let mut evicted = 0u64;
        while !inbox.queue.is_empty()
            && (inbox.queue.len() >= self.config.max_messages
                || inbox.queued_bytes + size > self.config.max_queue_bytes)
        {
            if let Some(oldest) = inbox.queue.pop_front() {
                inbox.queued_bytes -= oldest.size_bytes;
                evicted += 1;
            }
        }
        self.total_evicted.fetch_add(evicted, Ordering::Relaxed);

        inbox.queued_bytes += size;
        inbox.queue.push_back(stored);
        self.total_stored.fetch_add(1, Ordering::Relaxed);
    }
}

impl Storage for MemStorage {
    fn enqueue(&self, message: Message) -> u64 {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let now = self.clock.now();
        let stored = Arc::new(StoredMessage {
            sequence,
            size_bytes: message.body.len(),
            message,
        });

        {
            let queues = self.queues.read().expect("store map lock poisoned");
            if let Some(inbox) = queues.get(&stored.message.to) {
                let mut inbox = inbox.lock().expect("store queue lock poisoned");
                self.push_locked(&mut inbox, stored, now);
                return sequence;
            }
        }

        let mut queues = self.queues.write().expect("store map lock poisoned");
        let inbox = queues
            .entry(stored.message.to.clone())
            .or_insert_with(|| Mutex::new(Inbox::default()));
        let mut inbox = inbox.lock().expect("store queue lock poisoned");
        self.push_locked(&mut inbox, stored, now);
        sequence
    }

    fn drain(&self, recipient: &ClientId, since_sequence: u64) -> Vec<SharedMessage> {
        let now = self.clock.now();
        let queues = self.queues.read().expect("store map lock poisoned");
        let Some(inbox) = queues.get(recipient) else {
            return Vec::new();
        };
        let inbox = inbox.lock().expect("store queue lock poisoned");
        inbox
            .queue
            .iter()
            .filter(|item| item.sequence > since_sequence && item.message.expires_at > now)
            .cloned()
            .collect()
    }

    fn sweep(
        &self,
        now: SystemTime,
        has_subscribers: &dyn Fn(&ClientId) -> bool,
    ) -> SweepOutcome {
        let mut queues = self.queues.write().expect("store map lock poisoned");
        let mut outcome = SweepOutcome::default();

        let mut empty: Vec<ClientId> = Vec::new();
        for (recipient, inbox) in queues.iter() {
            let mut inbox = inbox.lock().expect("store queue lock poisoned");
            outcome.expired_messages += inbox.prune_expired(now);
            if inbox.queue.is_empty() && !has_subscribers(recipient) {
                empty.push(recipient.clone());
            }
        }
        for recipient in empty {
            queues.remove(&recipient);
            outcome.removed_queues += 1;
        }

        self.total_expired
            .fetch_add(outcome.expired_messages as u64, Ordering::Relaxed);
        outcome
    }

    fn stats(&self, now: SystemTime) -> StoreStats {
        let queues = self.queues.read().expect("store map lock poisoned");
        let mut per_queue: Vec<QueueStats> = queues
            .iter()
            .map(|(recipient, inbox)| {
                let inbox = inbox.lock().expect("store queue lock poisoned");
                let live = inbox
                    .queue
                    .iter()
                    .filter(|item| item.message.expires_at > now);
                let (depth, bytes) =
                    live.fold((0usize, 0usize), |(d, b), item| (d + 1, b + item.size_bytes));
                QueueStats {
                    client_id: recipient.to_string(),
                    depth,
                    bytes,
                }
            })
            .collect();
        per_queue.sort_by(|a, b| b.depth.cmp(&a.depth).then(a.client_id.cmp(&b.client_id)));

        StoreStats {
            recipients: per_queue.len(),
            total_queued: per_queue.iter().map(|q| q.depth).sum(),
            total_queued_bytes: per_queue.iter().map(|q| q.bytes).sum(),
            total_stored: self.total_stored.load(Ordering::Relaxed),
            total_evicted: self.total_evicted.load(Ordering::Relaxed),
            total_expired: self.total_expired.load(Ordering::Relaxed),
            queues: per_queue,
        }
    }
}

/// Spawn the periodic sweep task. Runs until the shutdown channel fires,
/// pruning expired messages and collecting idle queue entries so total
/// memory stays bounded even with churn in the recipient key space.
pub fn start_sweep_task(
    storage: Arc<dyn Storage>,
    registry: Arc<Registry>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    if interval.is_zero() {
        return;
    }
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // immediate first tick
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let outcome = storage.sweep(clock.now(), &|id| registry.has_subscribers(id));
                    if outcome.expired_messages > 0 || outcome.removed_queues > 0 {
                        clog!(
                            "store: sweep expired {} message(s), removed {} idle queue(s)",
                            outcome.expired_messages,
                            outcome.removed_queues
                        );
                    }
                }
                _ = &mut shutdown_rx => break,
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::time::UNIX_EPOCH;

    fn test_id(fill: char) -> ClientId {
        ClientId::parse(&fill.to_string().repeat(64)).unwrap()
    }

    fn test_message(to: &ClientId, body: &[u8], now: SystemTime, ttl: Duration) -> Message {
        Message {
            from: Some(test_id('f')),
            to: to.clone(),
            body: body.to_vec(),
            topic: None,
            created_at: now,
            expires_at: now + ttl,
        }
    }

    fn test_store(config: StoreConfig) -> (MemStorage, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(UNIX_EPOCH + Duration::from_secs(1_000)));
        let store = MemStorage::new(config, clock.clone());
        (store, clock)
    }

    const TTL: Duration = Duration::from_secs(60);

    #[test]
    fn sequences_are_strictly_increasing() {
        let (store, clock) = test_store(StoreConfig::default());
        let to = test_id('a');
        let s1 = store.enqueue(test_message(&to, b"one", clock.now(), TTL));
        let s2 = store.enqueue(test_message(&to, b"two", clock.now(), TTL));
        assert!(s2 > s1);

        let drained = store.drain(&to, 0);
        assert_eq!(
            drained.iter().map(|m| m.sequence).collect::<Vec<_>>(),
            vec![s1, s2]
        );
    }

    #[test]
    fn drain_respects_cursor() {
        let (store, clock) = test_store(StoreConfig::default());
        let to = test_id('a');
        let s1 = store.enqueue(test_message(&to, b"one", clock.now(), TTL));
        let s2 = store.enqueue(test_message(&to, b"two", clock.now(), TTL));

        let drained = store.drain(&to, s1);
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].sequence, s2);
        assert!(store.drain(&to, s2).is_empty());
    }

    #[test]
    fn drain_does_not_remove_messages() {
        let (store, clock) = test_store(StoreConfig::default());
        let to = test_id('a');
        store.enqueue(test_message(&to, b"one", clock.now(), TTL));
        assert_eq!(store.drain(&to, 0).len(), 1);
        assert_eq!(store.drain(&to, 0).len(), 1);
    }

    #[test]
    fn bounded_by_message_count_drops_oldest() {
        let (store, clock) = test_store(StoreConfig {
            max_messages: 3,
            ..StoreConfig::default()
        });
        let to = test_id('a');
        for body in [b"m1" as &[u8], b"m2", b"m3", b"m4", b"m5"] {
            store.enqueue(test_message(&to, body, clock.now(), TTL));
        }

        let drained = store.drain(&to, 0);
        let bodies: Vec<&[u8]> = drained.iter().map(|m| m.message.body.as_slice()).collect();
        assert_eq!(bodies, vec![b"m3" as &[u8], b"m4", b"m5"]);
        assert_eq!(store.stats(clock.now()).total_evicted, 2);
    }

    #[test]
    fn bounded_by_byte_total_drops_oldest() {
        let (store, clock) = test_store(StoreConfig {
            max_messages: 100,
            max_queue_bytes: 10,
        });
        let to = test_id('a');
        store.enqueue(test_message(&to, &[0u8; 6], clock.now(), TTL));
        store.enqueue(test_message(&to, &[1u8; 6], clock.now(), TTL));

        let drained = store.drain(&to, 0);
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].message.body, vec![1u8; 6]);
    }

    #[test]
    fn oversized_message_clears_queue_but_never_loops() {
        let (store, clock) = test_store(StoreConfig {
            max_messages: 100,
            max_queue_bytes: 4,
        });
        let to = test_id('a');
        store.enqueue(test_message(&to, &[0u8; 2], clock.now(), TTL));
        // Larger than the whole byte bound; admitted after evicting everything.
        store.enqueue(test_message(&to, &[1u8; 8], clock.now(), TTL));
        assert_eq!(store.drain(&to, 0).len(), 1);
    }

    #[test]
    fn expired_messages_are_never_drained() {
        let (store, clock) = test_store(StoreConfig::default());
        let to = test_id('a');
        store.enqueue(test_message(&to, b"short", clock.now(), Duration::from_secs(5)));
        store.enqueue(test_message(&to, b"long", clock.now(), TTL));

        clock.advance(Duration::from_secs(5));
        // Still physically present (no sweep has run), but not deliverable.
        let drained = store.drain(&to, 0);
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].message.body, b"long");
    }

    #[test]
    fn sweep_removes_expired_and_idle_queues() {
        let (store, clock) = test_store(StoreConfig::default());
        let idle = test_id('a');
        let watched = test_id('b');
        store.enqueue(test_message(&idle, b"x", clock.now(), Duration::from_secs(5)));
        store.enqueue(test_message(&watched, b"y", clock.now(), Duration::from_secs(5)));

        clock.advance(Duration::from_secs(6));
        let outcome = store.sweep(clock.now(), &|id| *id == watched);
        assert_eq!(outcome.expired_messages, 2);
        // Only the unwatched queue entry is garbage collected.
        assert_eq!(outcome.removed_queues, 1);
        assert_eq!(store.stats(clock.now()).recipients, 1);
    }

    #[test]
    fn sweep_keeps_unexpired_messages() {
        let (store, clock) = test_store(StoreConfig::default());
        let to = test_id('a');
        store.enqueue(test_message(&to, b"keep", clock.now(), TTL));

        let outcome = store.sweep(clock.now(), &|_| false);
        assert_eq!(outcome, SweepOutcome::default());
        assert_eq!(store.drain(&to, 0).len(), 1);
    }

    #[test]
    fn queues_are_isolated_per_recipient() {
        let (store, clock) = test_store(StoreConfig::default());
        let a = test_id('a');
        let b = test_id('b');
        store.enqueue(test_message(&a, b"for-a", clock.now(), TTL));
        store.enqueue(test_message(&b, b"for-b", clock.now(), TTL));

        assert_eq!(store.drain(&a, 0).len(), 1);
        assert_eq!(store.drain(&a, 0)[0].message.body, b"for-a");
        assert_eq!(store.drain(&b, 0)[0].message.body, b"for-b");
    }

    #[test]
    fn stats_exclude_expired_entries() {
        let (store, clock) = test_store(StoreConfig::default());
        let to = test_id('a');
        store.enqueue(test_message(&to, b"gone", clock.now(), Duration::from_secs(1)));
        store.enqueue(test_message(&to, b"here", clock.now(), TTL));

        clock.advance(Duration::from_secs(2));
        let stats = store.stats(clock.now());
        assert_eq!(stats.total_queued, 1);
        assert_eq!(stats.total_queued_bytes, 4);
        assert_eq!(stats.total_stored, 2);
    }
}
