//! Polling adapter: a live feed for stores without push notifications.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use duet_chat_types::{
    ConversationKey, MessageId, ParticipantId, StoreError, StoreMessage, TypingUpdate,
};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use super::{MessageStore, StoreFeed};

/// Wraps a store and implements [`MessageStore::subscribe`] by calling
/// `fetch` on an interval, emitting a snapshot only when it differs from
/// the previous one. Everything else is delegated.
#[derive(Debug)]
pub struct PollingStore<S> {
    inner: Arc<S>,
    interval: Duration,
}

impl<S> Clone for PollingStore<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            interval: self.interval,
        }
    }
}

impl<S: MessageStore + 'static> PollingStore<S> {
    /// Poll `inner` every `interval`.
    pub fn new(inner: S, interval: Duration) -> Self {
        Self::from_shared(Arc::new(inner), interval)
    }

    /// Poll a store that is also used elsewhere.
    pub fn from_shared(inner: Arc<S>, interval: Duration) -> Self {
        Self { inner, interval }
    }

    /// The wrapped store.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Time between fetches.
    pub fn interval(&self) -> Duration {
        self.interval
    }
}

#[async_trait]
impl<S: MessageStore + 'static> MessageStore for PollingStore<S> {
    async fn append(
        &self,
        key: &ConversationKey,
        sender: &ParticipantId,
        text: &str,
    ) -> Result<StoreMessage, StoreError> {
        self.inner.append(key, sender, text).await
    }

    async fn fetch(&self, key: &ConversationKey) -> Result<Vec<StoreMessage>, StoreError> {
        self.inner.fetch(key).await
    }

    async fn subscribe(
        &self,
        key: &ConversationKey,
    ) -> Result<StoreFeed<Vec<StoreMessage>>, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let store = Arc::clone(&self.inner);
        let key = key.clone();
        let period = self.interval;

        let producer = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut last: Option<Vec<StoreMessage>> = None;
            loop {
                ticker.tick().await;
                match store.fetch(&key).await {
                    Ok(snapshot) => {
                        if last.as_ref() == Some(&snapshot) {
                            continue;
                        }
                        if tx.send(snapshot.clone()).is_err() {
                            break;
                        }
                        last = Some(snapshot);
                    }
                    Err(err) => {
                        debug!(conversation = %key.fingerprint(), %err, "poll failed");
                    }
                }
            }
        });

        Ok(StoreFeed::with_producer(rx, producer))
    }

    async fn mark_read(
        &self,
        key: &ConversationKey,
        message_id: &MessageId,
    ) -> Result<(), StoreError> {
        self.inner.mark_read(key, message_id).await
    }

    async fn mark_delivered(
        &self,
        key: &ConversationKey,
        ids: &[MessageId],
    ) -> Result<(), StoreError> {
        self.inner.mark_delivered(key, ids).await
    }

    async fn subscribe_typing(
        &self,
        key: &ConversationKey,
    ) -> Result<StoreFeed<TypingUpdate>, StoreError> {
        self.inner.subscribe_typing(key).await
    }

    async fn publish_typing(
        &self,
        key: &ConversationKey,
        participant: &ParticipantId,
        is_typing: bool,
    ) -> Result<(), StoreError> {
        self.inner.publish_typing(key, participant, is_typing).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::WallClock;
    use crate::store::MemoryStore;
    use duet_chat_types::Timestamp;

    fn pid(s: &str) -> ParticipantId {
        ParticipantId::new(s).unwrap()
    }

    fn key() -> ConversationKey {
        ConversationKey::derive(&pid("alice"), &pid("bob")).unwrap()
    }

    fn polling() -> (MemoryStore, PollingStore<MemoryStore>) {
        let memory = MemoryStore::with_clock(WallClock::starting_at(Timestamp::from_millis(0)));
        let polling = PollingStore::new(memory.clone(), Duration::from_millis(1_000));
        (memory, polling)
    }

    #[tokio::test(start_paused = true)]
    async fn first_poll_yields_current_snapshot() {
        let (memory, polling) = polling();
        memory.append(&key(), &pid("bob"), "hi").await.unwrap();

        let mut feed = polling.subscribe(&key()).await.unwrap();
        assert_eq!(feed.recv().await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn emits_only_on_change() {
        let (memory, polling) = polling();
        let mut feed = polling.subscribe(&key()).await.unwrap();
        assert!(feed.recv().await.unwrap().is_empty());

        // Several intervals with no writes: nothing new.
        assert!(tokio::time::timeout(Duration::from_millis(3_500), feed.recv())
            .await
            .is_err());

        memory.append(&key(), &pid("alice"), "one").await.unwrap();
        let snapshot = feed.recv().await.unwrap();
        assert_eq!(snapshot[0].text, "one");
    }

    #[tokio::test(start_paused = true)]
    async fn keeps_polling_through_outages() {
        let (memory, polling) = polling();
        let mut feed = polling.subscribe(&key()).await.unwrap();
        feed.recv().await.unwrap();

        memory.set_reachable(false);
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        memory.set_reachable(true);
        memory.append(&key(), &pid("bob"), "back").await.unwrap();

        assert_eq!(feed.recv().await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn writes_are_delegated() {
        let (memory, polling) = polling();
        let record = polling.append(&key(), &pid("alice"), "hey").await.unwrap();
        polling.mark_read(&key(), &record.id).await.unwrap();
        assert!(memory.messages(&key())[0].read);
        assert_eq!(polling.interval(), Duration::from_millis(1_000));
        assert_eq!(polling.inner().append_count(), 1);
    }
}
