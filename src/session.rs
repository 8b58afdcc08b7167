//! Delivery session: binds one consumer connection to its subscriptions.
//!
//! A session attaches to the registry for one or more recipient identifiers,
//! drains anything already queued past its cursor, then alternates between
//! waiting for wakeups and delivering. Two modes:
//!
//! - streaming (SSE): cycles waiting/delivering until the consumer goes
//!   away, emitting a heartbeat frame at a fixed interval while idle;
//! - single-shot (long poll): returns the first non-empty batch, or an empty
//!   batch on timeout.
//!
//! Wakeups are level-triggered. Each registry receiver is forwarded into a
//! capacity-1 channel, so any burst of notifications collapses into one
//! pending re-drain and a lagged receiver is indistinguishable from a normal
//! wake. Detach runs exactly once on every exit path, including drops from
//! caller-side cancellation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval_at, Instant};

use crate::address::ClientId;
use crate::message::SharedMessage;
use crate::registry::{Registry, SubscriptionHandle};
use crate::store::Storage;

/// What the session emits to the transport in streaming mode.
#[derive(Debug)]
pub enum SessionEvent {
    /// Idle liveness signal; no state transition.
    Heartbeat,
    /// One queued message, in ascending sequence order.
    Message(SharedMessage),
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Single-shot batch delivered, or server-side channel shutdown.
    Closed,
    /// Single-shot wait elapsed with nothing to deliver.
    TimedOut,
    /// Consumer went away (connection closed or request dropped).
    Cancelled,
}

impl SessionEnd {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionEnd::Closed => "closed",
            SessionEnd::TimedOut => "timed out",
            SessionEnd::Cancelled => "cancelled",
        }
    }
}

pub struct DeliverySession {
    storage: Arc<dyn Storage>,
    registry: Arc<Registry>,
    handles: Vec<SubscriptionHandle>,
    cursor: u64,
    delivered: Arc<AtomicU64>,
}

impl DeliverySession {
    /// Attach to the registry for every recipient, then position the cursor.
    ///
    /// Subscribing happens before the caller's first drain, which is what
    /// rules out the attach/enqueue race: a message enqueued before this
    /// call is visible to the initial drain, one enqueued after it triggers
    /// a notification.
    pub fn attach(
        storage: Arc<dyn Storage>,
        registry: Arc<Registry>,
        recipients: &[ClientId],
        cursor: u64,
        delivered: Arc<AtomicU64>,
    ) -> Self {
        let handles = recipients
            .iter()
            .map(|recipient| registry.attach(recipient))
            .collect();
        Self {
            storage,
            registry,
            handles,
            cursor,
            delivered,
        }
    }

    /// Stream messages into `tx` until the receiver is dropped. Emits a
    /// heartbeat every `heartbeat` while idle.
    pub async fn run_streaming(
        mut self,
        tx: mpsc::Sender<SessionEvent>,
        heartbeat: Duration,
    ) -> SessionEnd {
        let mut wake_rx = self.spawn_wake_forwarders();

        // Initial drain covers everything queued before attach.
        if self.deliver_pending(&tx).await.is_err() {
            self.detach_all();
            return SessionEnd::Cancelled;
        }

        let mut ticker = interval_at(Instant::now() + heartbeat, heartbeat);
        loop {
            tokio::select! {
                wake = wake_rx.recv() => {
                    if wake.is_none() {
                        // All wake channels gone: server is shutting down.
                        self.detach_all();
                        return SessionEnd::Closed;
                    }
                    if self.deliver_pending(&tx).await.is_err() {
                        self.detach_all();
                        return SessionEnd::Cancelled;
                    }
                }
                _ = ticker.tick() => {
                    if tx.send(SessionEvent::Heartbeat).await.is_err() {
                        self.detach_all();
                        return SessionEnd::Cancelled;
                    }
                }
            }
        }
    }

    /// Wait up to `wait` for the first non-empty batch and return it.
    pub async fn run_single_shot(
        mut self,
        wait: Duration,
    ) -> (Vec<SharedMessage>, SessionEnd) {
        let mut wake_rx = self.spawn_wake_forwarders();
        let deadline = tokio::time::sleep(wait);
        tokio::pin!(deadline);

        loop {
            let batch = self.drain_pending();
            if !batch.is_empty() {
                self.detach_all();
                return (batch, SessionEnd::Closed);
            }
            tokio::select! {
                _ = &mut deadline => {
                    self.detach_all();
                    return (Vec::new(), SessionEnd::TimedOut);
                }
                wake = wake_rx.recv() => {
                    if wake.is_none() {
                        self.detach_all();
                        return (Vec::new(), SessionEnd::Closed);
                    }
                }
            }
        }
    }

    /// Move each handle's broadcast receiver into a forwarder task feeding
    /// one capacity-1 wake channel.
    fn spawn_wake_forwarders(&mut self) -> mpsc::Receiver<()> {
        let (wake_tx, wake_rx) = mpsc::channel(1);
        for handle in &mut self.handles {
            let Some(mut rx) = handle.take_receiver() else {
                continue;
            };
            let wake_tx = wake_tx.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = wake_tx.closed() => break,
                        result = rx.recv() => match result {
                            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                                // Full channel means a re-drain is already
                                // pending, which covers this wake too.
                                let _ = wake_tx.try_send(());
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            });
        }
        wake_rx
    }

    /// Drain every subscribed recipient past the cursor, merged in ascending
    /// sequence order, and advance the cursor past the batch.
    fn drain_pending(&mut self) -> Vec<SharedMessage> {
        let mut batch: Vec<SharedMessage> = Vec::new();
        for handle in &self.handles {
            batch.extend(self.storage.drain(handle.recipient(), self.cursor));
        }
        batch.sort_by_key(|item| item.sequence);
        if let Some(last) = batch.last() {
            self.cursor = last.sequence;
        }
        self.delivered
            .fetch_add(batch.len() as u64, Ordering::Relaxed);
        batch
    }

    async fn deliver_pending(
        &mut self,
        tx: &mpsc::Sender<SessionEvent>,
    ) -> Result<(), mpsc::error::SendError<SessionEvent>> {
        for item in self.drain_pending() {
            tx.send(SessionEvent::Message(item)).await?;
        }
        Ok(())
    }

    fn detach_all(&mut self) {
        for handle in &mut self.handles {
            self.registry.detach(handle);
        }
    }
}

impl Drop for DeliverySession {
    // Covers caller-side cancellation: a session future dropped mid-wait
    // must not stay registered. Detach is idempotent, so the explicit calls
    // on normal exits are unaffected.
    fn drop(&mut self) {
        self.detach_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::message::Message;
    use crate::store::{MemStorage, StoreConfig};
    use std::time::SystemTime;
    use tokio::time::timeout;

    fn test_id(fill: char) -> ClientId {
        ClientId::parse(&fill.to_string().repeat(64)).unwrap()
    }

    fn test_message(to: &ClientId, body: &[u8]) -> Message {
        let now = SystemTime::now();
        Message {
            from: Some(test_id('f')),
            to: to.clone(),
            body: body.to_vec(),
            topic: None,
            created_at: now,
            expires_at: now + Duration::from_secs(60),
        }
    }

    fn test_engine() -> (Arc<dyn Storage>, Arc<Registry>, Arc<AtomicU64>) {
        let storage: Arc<dyn Storage> = Arc::new(MemStorage::new(
            StoreConfig::default(),
            Arc::new(SystemClock),
        ));
        (storage, Arc::new(Registry::new()), Arc::new(AtomicU64::new(0)))
    }

    fn attach(
        storage: &Arc<dyn Storage>,
        registry: &Arc<Registry>,
        delivered: &Arc<AtomicU64>,
        recipients: &[ClientId],
        cursor: u64,
    ) -> DeliverySession {
        DeliverySession::attach(
            storage.clone(),
            registry.clone(),
            recipients,
            cursor,
            delivered.clone(),
        )
    }

    async fn next_message(rx: &mut mpsc::Receiver<SessionEvent>) -> SharedMessage {
        loop {
            match timeout(Duration::from_secs(5), rx.recv()).await {
                Ok(Some(SessionEvent::Message(item))) => return item,
                Ok(Some(SessionEvent::Heartbeat)) => continue,
                other => panic!("stream ended unexpectedly: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn enqueue_before_attach_is_delivered_by_initial_drain() {
        let (storage, registry, delivered) = test_engine();
        let to = test_id('a');
        storage.enqueue(test_message(&to, b"early"));
        registry.notify(&to, 1); // nobody listening yet

        let session = attach(&storage, &registry, &delivered, &[to.clone()], 0);
        let (tx, mut rx) = mpsc::channel(8);
        tokio::spawn(session.run_streaming(tx, Duration::from_secs(30)));

        let item = next_message(&mut rx).await;
        assert_eq!(item.message.body, b"early");
    }

    #[tokio::test]
    async fn enqueue_after_attach_is_delivered_by_notification() {
        let (storage, registry, delivered) = test_engine();
        let to = test_id('a');

        let session = attach(&storage, &registry, &delivered, &[to.clone()], 0);
        let (tx, mut rx) = mpsc::channel(8);
        tokio::spawn(session.run_streaming(tx, Duration::from_secs(30)));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let sequence = storage.enqueue(test_message(&to, b"late"));
        registry.notify(&to, sequence);

        let item = next_message(&mut rx).await;
        assert_eq!(item.message.body, b"late");
    }

    #[tokio::test]
    async fn messages_arrive_in_sequence_order_without_duplicates() {
        let (storage, registry, delivered) = test_engine();
        let to = test_id('a');

        let session = attach(&storage, &registry, &delivered, &[to.clone()], 0);
        let (tx, mut rx) = mpsc::channel(16);
        tokio::spawn(session.run_streaming(tx, Duration::from_secs(30)));

        for body in [b"m1" as &[u8], b"m2", b"m3"] {
            let sequence = storage.enqueue(test_message(&to, body));
            registry.notify(&to, sequence);
        }

        let mut sequences = Vec::new();
        for _ in 0..3 {
            sequences.push(next_message(&mut rx).await.sequence);
        }
        let mut sorted = sequences.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sequences, sorted);
        assert_eq!(delivered.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn multi_recipient_session_merges_streams() {
        let (storage, registry, delivered) = test_engine();
        let a = test_id('a');
        let b = test_id('b');

        let session = attach(
            &storage,
            &registry,
            &delivered,
            &[a.clone(), b.clone()],
            0,
        );
        let (tx, mut rx) = mpsc::channel(8);
        tokio::spawn(session.run_streaming(tx, Duration::from_secs(30)));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let s1 = storage.enqueue(test_message(&a, b"to-a"));
        registry.notify(&a, s1);
        let s2 = storage.enqueue(test_message(&b, b"to-b"));
        registry.notify(&b, s2);

        let first = next_message(&mut rx).await;
        let second = next_message(&mut rx).await;
        assert!(second.sequence > first.sequence);
    }

    #[tokio::test]
    async fn heartbeats_flow_while_waiting() {
        let (storage, registry, delivered) = test_engine();
        let to = test_id('a');

        let session = attach(&storage, &registry, &delivered, &[to], 0);
        let (tx, mut rx) = mpsc::channel(8);
        tokio::spawn(session.run_streaming(tx, Duration::from_millis(10)));

        match timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Some(SessionEvent::Heartbeat)) => {}
            other => panic!("expected heartbeat, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn dropping_the_consumer_cancels_and_detaches() {
        let (storage, registry, delivered) = test_engine();
        let to = test_id('a');

        let session = attach(&storage, &registry, &delivered, &[to.clone()], 0);
        let (tx, rx) = mpsc::channel(1);
        let task = tokio::spawn(session.run_streaming(tx, Duration::from_millis(10)));
        drop(rx);

        let end = timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert_eq!(end, SessionEnd::Cancelled);
        assert!(!registry.has_subscribers(&to));
    }

    #[tokio::test]
    async fn dropped_session_future_detaches() {
        let (storage, registry, delivered) = test_engine();
        let to = test_id('a');

        let session = attach(&storage, &registry, &delivered, &[to.clone()], 0);
        assert!(registry.has_subscribers(&to));
        drop(session);
        assert!(!registry.has_subscribers(&to));
    }

    #[tokio::test]
    async fn single_shot_returns_queued_batch_immediately() {
        let (storage, registry, delivered) = test_engine();
        let to = test_id('a');
        storage.enqueue(test_message(&to, b"one"));
        storage.enqueue(test_message(&to, b"two"));

        let session = attach(&storage, &registry, &delivered, &[to.clone()], 0);
        let (batch, end) = session.run_single_shot(Duration::from_secs(5)).await;
        assert_eq!(end, SessionEnd::Closed);
        assert_eq!(batch.len(), 2);
        assert!(!registry.has_subscribers(&to));
    }

    #[tokio::test]
    async fn single_shot_wakes_on_notification() {
        let (storage, registry, delivered) = test_engine();
        let to = test_id('a');

        let session = attach(&storage, &registry, &delivered, &[to.clone()], 0);
        let waiter = tokio::spawn(session.run_single_shot(Duration::from_secs(5)));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let sequence = storage.enqueue(test_message(&to, b"wake"));
        registry.notify(&to, sequence);

        let (batch, end) = timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(end, SessionEnd::Closed);
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn single_shot_times_out_empty() {
        let (storage, registry, delivered) = test_engine();
        let to = test_id('a');

        let session = attach(&storage, &registry, &delivered, &[to.clone()], 0);
        let (batch, end) = session.run_single_shot(Duration::from_millis(30)).await;
        assert!(batch.is_empty());
        assert_eq!(end, SessionEnd::TimedOut);
        assert!(!registry.has_subscribers(&to));
    }

    #[tokio::test]
    async fn cursor_skips_already_seen_messages() {
        let (storage, registry, delivered) = test_engine();
        let to = test_id('a');
        let s1 = storage.enqueue(test_message(&to, b"seen"));
        storage.enqueue(test_message(&to, b"new"));

        let session = attach(&storage, &registry, &delivered, &[to], s1);
        let (batch, _) = session.run_single_shot(Duration::from_secs(5)).await;
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].message.body, b"new");
    }
}
