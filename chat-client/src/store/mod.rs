//! Message store abstraction for duet.
//!
//! The store is the authoritative copy of every conversation. The sync
//! engine only ever talks to it through [`MessageStore`], so push-based,
//! polling and flat-file backends are interchangeable:
//!
//! - [`MemoryStore`] - in-process log with push subscriptions and fault
//!   injection, for tests and demos
//! - [`KvStore`] - one JSON document per conversation on disk
//! - [`PollingStore`] - wraps any store and turns `fetch` into a feed
//!
//! # Example
//!
//! ```ignore
//! let store = MemoryStore::new();
//! let record = store.append(&key, &alice, "hello").await?;
//! let mut feed = store.subscribe(&key).await?;
//! let snapshot = feed.recv().await;
//! ```

mod kv;
mod memory;
mod polling;

pub use kv::KvStore;
pub use memory::MemoryStore;
pub use polling::PollingStore;

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use duet_chat_types::{
    ConversationKey, MessageId, ParticipantId, StoreError, StoreMessage, TypingUpdate,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Authoritative message storage shared by both participants.
///
/// Implementations must be cheap to share behind an `Arc`; every method
/// takes `&self`.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a new message and return the stored record with its
    /// canonical id and store-assigned timestamp.
    async fn append(
        &self,
        key: &ConversationKey,
        sender: &ParticipantId,
        text: &str,
    ) -> Result<StoreMessage, StoreError>;

    /// Current contents of a conversation. Unknown conversations are empty.
    async fn fetch(&self, key: &ConversationKey) -> Result<Vec<StoreMessage>, StoreError>;

    /// Subscribe to full snapshots of a conversation.
    ///
    /// The feed yields the current snapshot first, then one snapshot per
    /// change. Dropping the feed unsubscribes.
    async fn subscribe(
        &self,
        key: &ConversationKey,
    ) -> Result<StoreFeed<Vec<StoreMessage>>, StoreError>;

    /// Mark `message_id` and every earlier message from the same sender read.
    async fn mark_read(
        &self,
        key: &ConversationKey,
        message_id: &MessageId,
    ) -> Result<(), StoreError>;

    /// Flag messages as observed by the recipient's client.
    async fn mark_delivered(
        &self,
        key: &ConversationKey,
        ids: &[MessageId],
    ) -> Result<(), StoreError>;

    /// Subscribe to typing updates for a conversation.
    async fn subscribe_typing(
        &self,
        key: &ConversationKey,
    ) -> Result<StoreFeed<TypingUpdate>, StoreError>;

    /// Publish a participant's typing state.
    async fn publish_typing(
        &self,
        key: &ConversationKey,
        participant: &ParticipantId,
        is_typing: bool,
    ) -> Result<(), StoreError>;
}

#[async_trait]
impl<S: MessageStore + ?Sized> MessageStore for Arc<S> {
    async fn append(
        &self,
        key: &ConversationKey,
        sender: &ParticipantId,
        text: &str,
    ) -> Result<StoreMessage, StoreError> {
        (**self).append(key, sender, text).await
    }

    async fn fetch(&self, key: &ConversationKey) -> Result<Vec<StoreMessage>, StoreError> {
        (**self).fetch(key).await
    }

    async fn subscribe(
        &self,
        key: &ConversationKey,
    ) -> Result<StoreFeed<Vec<StoreMessage>>, StoreError> {
        (**self).subscribe(key).await
    }

    async fn mark_read(
        &self,
        key: &ConversationKey,
        message_id: &MessageId,
    ) -> Result<(), StoreError> {
        (**self).mark_read(key, message_id).await
    }

    async fn mark_delivered(
        &self,
        key: &ConversationKey,
        ids: &[MessageId],
    ) -> Result<(), StoreError> {
        (**self).mark_delivered(key, ids).await
    }

    async fn subscribe_typing(
        &self,
        key: &ConversationKey,
    ) -> Result<StoreFeed<TypingUpdate>, StoreError> {
        (**self).subscribe_typing(key).await
    }

    async fn publish_typing(
        &self,
        key: &ConversationKey,
        participant: &ParticipantId,
        is_typing: bool,
    ) -> Result<(), StoreError> {
        (**self).publish_typing(key, participant, is_typing).await
    }
}

/// A live subscription to a store.
///
/// Items arrive in publication order. Dropping the feed (or calling
/// [`unsubscribe`](Self::unsubscribe)) ends the subscription and stops any
/// background task that produces it.
#[derive(Debug)]
pub struct StoreFeed<T> {
    rx: mpsc::UnboundedReceiver<T>,
    producer: Option<JoinHandle<()>>,
}

impl<T> StoreFeed<T> {
    /// Wrap a channel fed by a publisher that notices the receiver closing.
    pub fn new(rx: mpsc::UnboundedReceiver<T>) -> Self {
        Self { rx, producer: None }
    }

    /// Wrap a channel fed by a background task; the task is aborted when
    /// the feed is dropped.
    pub fn with_producer(rx: mpsc::UnboundedReceiver<T>, producer: JoinHandle<()>) -> Self {
        Self {
            rx,
            producer: Some(producer),
        }
    }

    /// Wait for the next item. `None` once the store side has gone away.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// End the subscription.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl<T> Drop for StoreFeed<T> {
    fn drop(&mut self) {
        if let Some(producer) = self.producer.take() {
            producer.abort();
        }
    }
}

/// Per-conversation subscriber lists with fan-out.
///
/// Closed subscribers are pruned on the next publish.
#[derive(Debug)]
pub(crate) struct Fanout<T> {
    subscribers: DashMap<ConversationKey, Vec<mpsc::UnboundedSender<T>>>,
}

impl<T: Clone> Fanout<T> {
    pub(crate) fn new() -> Self {
        Self {
            subscribers: DashMap::new(),
        }
    }

    /// Register a subscriber, optionally seeding it with a first item.
    pub(crate) fn subscribe(&self, key: &ConversationKey, initial: Option<T>) -> StoreFeed<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(item) = initial {
            let _ = tx.send(item);
        }
        self.subscribers.entry(key.clone()).or_default().push(tx);
        StoreFeed::new(rx)
    }

    /// Deliver `item` to every live subscriber of `key`.
    pub(crate) fn publish(&self, key: &ConversationKey, item: T) {
        if let Some(mut subscribers) = self.subscribers.get_mut(key) {
            subscribers.retain(|tx| tx.send(item.clone()).is_ok());
        }
    }

    /// Number of live subscribers for `key`.
    pub(crate) fn count(&self, key: &ConversationKey) -> usize {
        self.subscribers
            .get(key)
            .map_or(0, |subs| subs.iter().filter(|tx| !tx.is_closed()).count())
    }
}

/// Apply read semantics to a conversation log.
///
/// Returns whether any record changed.
pub(crate) fn mark_read_in(
    records: &mut [StoreMessage],
    message_id: &MessageId,
) -> Result<bool, StoreError> {
    let (sender, boundary) = records
        .iter()
        .find(|r| &r.id == message_id)
        .map(|r| (r.sender_id.clone(), r.created_at))
        .ok_or_else(|| StoreError::UnknownMessage(message_id.to_string()))?;

    let mut changed = false;
    for record in records.iter_mut() {
        if record.sender_id == sender && record.created_at <= boundary && !record.read {
            record.read = true;
            record.delivered = true;
            changed = true;
        }
    }
    Ok(changed)
}

/// Flag records delivered. Unknown ids are ignored.
///
/// Returns whether any record changed.
pub(crate) fn mark_delivered_in(records: &mut [StoreMessage], ids: &[MessageId]) -> bool {
    let mut changed = false;
    for record in records.iter_mut() {
        if !record.delivered && ids.contains(&record.id) {
            record.delivered = true;
            changed = true;
        }
    }
    changed
}
