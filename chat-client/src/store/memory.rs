//! In-process message store with push subscriptions.
//!
//! Behaves like a hosted realtime database: writes get a canonical id and a
//! store-side timestamp, and every subscriber of the conversation receives
//! the full snapshot after each change. Fault injection lets tests simulate
//! transient failures, rejections and an unreachable backend.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use duet_chat_core::LocalClock;
use duet_chat_types::{
    ConversationKey, MessageId, ParticipantId, StoreError, StoreMessage, Timestamp, TypingUpdate,
};
use tokio::sync::watch;

use super::{mark_delivered_in, mark_read_in, Fanout, MessageStore, StoreFeed};
use crate::clock::WallClock;
use crate::lock;

/// In-memory [`MessageStore`].
///
/// Clones share state, so one store can serve both participants.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

#[derive(Debug)]
struct MemoryInner {
    logs: DashMap<ConversationKey, Vec<StoreMessage>>,
    messages: Fanout<Vec<StoreMessage>>,
    typing: Fanout<TypingUpdate>,
    typing_log: DashMap<ConversationKey, Vec<TypingUpdate>>,
    faults: Mutex<Faults>,
    reachable: watch::Sender<bool>,
    clock: Mutex<StoreClock>,
    next_seq: AtomicU64,
    appends: AtomicUsize,
}

#[derive(Debug, Default)]
struct Faults {
    fail_next_append: Option<String>,
    reject_next_append: Option<String>,
    typing_latency: Option<Duration>,
}

#[derive(Debug)]
struct StoreClock {
    wall: WallClock,
    skew_ms: i64,
    logical: LocalClock,
}

impl MemoryStore {
    /// Create an empty store on the system clock.
    pub fn new() -> Self {
        Self::with_clock(WallClock::system())
    }

    /// Create an empty store that stamps records from `wall`.
    pub fn with_clock(wall: WallClock) -> Self {
        let (reachable, _) = watch::channel(true);
        Self {
            inner: Arc::new(MemoryInner {
                logs: DashMap::new(),
                messages: Fanout::new(),
                typing: Fanout::new(),
                typing_log: DashMap::new(),
                faults: Mutex::new(Faults::default()),
                reachable,
                clock: Mutex::new(StoreClock {
                    wall,
                    skew_ms: 0,
                    logical: LocalClock::new(),
                }),
                next_seq: AtomicU64::new(1),
                appends: AtomicUsize::new(0),
            }),
        }
    }

    /// Cause the next append to fail as unavailable.
    pub fn fail_next_append(&self, reason: &str) {
        lock(&self.inner.faults).fail_next_append = Some(reason.to_string());
    }

    /// Cause the next append to be rejected.
    pub fn reject_next_append(&self, reason: &str) {
        lock(&self.inner.faults).reject_next_append = Some(reason.to_string());
    }

    /// Delay every typing publication by `latency` before it lands.
    pub fn set_typing_latency(&self, latency: Duration) {
        lock(&self.inner.faults).typing_latency = Some(latency);
    }

    /// Take the store offline or bring it back.
    ///
    /// While unreachable, appends stall until the store is reachable again
    /// and every other request fails as unavailable.
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.reachable.send_replace(reachable);
    }

    /// Whether the store currently answers requests.
    pub fn is_reachable(&self) -> bool {
        *self.inner.reachable.borrow()
    }

    /// Offset the store's clock against the wall clock.
    pub fn set_clock_skew_ms(&self, skew_ms: i64) {
        lock(&self.inner.clock).skew_ms = skew_ms;
    }

    /// Write a record as another client would, notifying subscribers.
    pub fn insert_remote(&self, record: StoreMessage) {
        let key = record.conversation_key.clone();
        lock(&self.inner.clock).logical.observe(record.created_at);
        let snapshot = {
            let mut log = self.inner.logs.entry(key.clone()).or_default();
            log.retain(|r| r.id != record.id);
            log.push(record);
            log.clone()
        };
        self.inner.messages.publish(&key, snapshot);
    }

    /// Everything stored for `key`, in write order.
    pub fn messages(&self, key: &ConversationKey) -> Vec<StoreMessage> {
        self.inner
            .logs
            .get(key)
            .map(|log| log.clone())
            .unwrap_or_default()
    }

    /// Typing updates published for `key`, oldest first.
    pub fn typing_log(&self, key: &ConversationKey) -> Vec<TypingUpdate> {
        self.inner
            .typing_log
            .get(key)
            .map(|log| log.clone())
            .unwrap_or_default()
    }

    /// Number of successful appends.
    pub fn append_count(&self) -> usize {
        self.inner.appends.load(Ordering::SeqCst)
    }

    /// Live message subscribers for `key`.
    pub fn subscriber_count(&self, key: &ConversationKey) -> usize {
        self.inner.messages.count(key)
    }

    /// Live typing subscribers for `key`.
    pub fn typing_subscriber_count(&self, key: &ConversationKey) -> usize {
        self.inner.typing.count(key)
    }

    fn ensure_reachable(&self) -> Result<(), StoreError> {
        if self.is_reachable() {
            Ok(())
        } else {
            Err(StoreError::Unavailable("store unreachable".into()))
        }
    }

    async fn wait_until_reachable(&self) {
        let mut rx = self.inner.reachable.subscribe();
        // The sender lives as long as `self`, so this cannot observe a close.
        let _ = rx.wait_for(|reachable| *reachable).await;
    }

    fn stamp(&self) -> Timestamp {
        let mut clock = lock(&self.inner.clock);
        let wall = clock.wall.now().as_millis() as i64 + clock.skew_ms;
        let now = Timestamp::from_millis(wall.max(0) as u64);
        clock.logical.next(now)
    }

    fn update<R>(
        &self,
        key: &ConversationKey,
        f: impl FnOnce(&mut Vec<StoreMessage>) -> Result<(R, bool), StoreError>,
    ) -> Result<R, StoreError> {
        let (result, snapshot) = {
            let mut log = self.inner.logs.entry(key.clone()).or_default();
            let (result, changed) = f(&mut *log)?;
            (result, changed.then(|| log.clone()))
        };
        if let Some(snapshot) = snapshot {
            self.inner.messages.publish(key, snapshot);
        }
        Ok(result)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn append(
        &self,
        key: &ConversationKey,
        sender: &ParticipantId,
        text: &str,
    ) -> Result<StoreMessage, StoreError> {
        self.wait_until_reachable().await;

        {
            let mut faults = lock(&self.inner.faults);
            if let Some(reason) = faults.fail_next_append.take() {
                return Err(StoreError::Unavailable(reason));
            }
            if let Some(reason) = faults.reject_next_append.take() {
                return Err(StoreError::Rejected(reason));
            }
        }

        let seq = self.inner.next_seq.fetch_add(1, Ordering::SeqCst);
        let record = StoreMessage {
            id: MessageId::from_canonical(format!("m{seq:08}")),
            conversation_key: key.clone(),
            sender_id: sender.clone(),
            text: text.to_string(),
            created_at: self.stamp(),
            delivered: false,
            read: false,
        };
        let stored = record.clone();
        self.update(key, move |log| {
            log.push(stored);
            Ok(((), true))
        })?;
        self.inner.appends.fetch_add(1, Ordering::SeqCst);
        Ok(record)
    }

    async fn fetch(&self, key: &ConversationKey) -> Result<Vec<StoreMessage>, StoreError> {
        self.ensure_reachable()?;
        Ok(self.messages(key))
    }

    async fn subscribe(
        &self,
        key: &ConversationKey,
    ) -> Result<StoreFeed<Vec<StoreMessage>>, StoreError> {
        self.ensure_reachable()?;
        Ok(self.inner.messages.subscribe(key, Some(self.messages(key))))
    }

    async fn mark_read(
        &self,
        key: &ConversationKey,
        message_id: &MessageId,
    ) -> Result<(), StoreError> {
        self.ensure_reachable()?;
        self.update(key, |log| Ok(((), mark_read_in(log, message_id)?)))
    }

    async fn mark_delivered(
        &self,
        key: &ConversationKey,
        ids: &[MessageId],
    ) -> Result<(), StoreError> {
        self.ensure_reachable()?;
        self.update(key, |log| Ok(((), mark_delivered_in(log, ids))))
    }

    async fn subscribe_typing(
        &self,
        key: &ConversationKey,
    ) -> Result<StoreFeed<TypingUpdate>, StoreError> {
        self.ensure_reachable()?;
        Ok(self.inner.typing.subscribe(key, None))
    }

    async fn publish_typing(
        &self,
        key: &ConversationKey,
        participant: &ParticipantId,
        is_typing: bool,
    ) -> Result<(), StoreError> {
        self.ensure_reachable()?;
        let latency = lock(&self.inner.faults).typing_latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let update = TypingUpdate {
            participant: participant.clone(),
            is_typing,
        };
        self.inner
            .typing_log
            .entry(key.clone())
            .or_default()
            .push(update.clone());
        self.inner.typing.publish(key, update);
        Ok(())
    }
}
