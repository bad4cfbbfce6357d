//! SyncEngine - the canonical message list of one conversation.
//!
//! # Architecture
//!
//! The engine drives the pure [`Timeline`] from chat-core with real time and
//! a [`MessageStore`]:
//!
//! ```text
//! Application → SyncEngine → MessageStore
//!                   ↓     ↖ snapshot feed (attach)
//!              chat-core Timeline (pure list logic)
//! ```
//!
//! Every mutation runs in one critical section of a `std::sync::Mutex` that
//! is never held across an `.await`; listeners are called inside it, so they
//! observe changes in the order they were applied. Listeners must not call
//! back into the engine.
//!
//! # Example
//!
//! ```ignore
//! let engine = SyncEngine::new(key, alice, store, &ChatConfig::default());
//! engine.subscribe(|messages| render(messages));
//! engine.attach().await?;
//! engine.load().await?;
//! let sent = engine.send("hello").await?;
//! ```

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use duet_chat_core::{AckOutcome, LocalClock, MergeOutcome, Timeline};
use duet_chat_types::{
    ConversationKey, DeliveryState, Message, MessageId, ParticipantId, StoreMessage,
};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::WallClock;
use crate::config::ChatConfig;
use crate::error::ClientError;
use crate::lock;
use crate::store::MessageStore;

/// Handle returned by `subscribe`, used to unsubscribe.
pub type ListenerId = u64;

type MessageListener = Box<dyn FnMut(&[Message]) + Send>;

/// Sync engine for one conversation.
///
/// Cheap to clone; clones share the same list.
pub struct SyncEngine<S> {
    inner: Arc<EngineInner<S>>,
}

impl<S> Clone for SyncEngine<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct EngineInner<S> {
    key: ConversationKey,
    local: ParticipantId,
    store: Arc<S>,
    send_timeout: Duration,
    clock: WallClock,
    state: Mutex<EngineState>,
    feed: Mutex<Option<JoinHandle<()>>>,
}

struct EngineState {
    timeline: Timeline,
    local_clock: LocalClock,
    /// Read marker applied locally that the store has not yet accepted.
    unpersisted_read: Option<MessageId>,
    listeners: Vec<(ListenerId, MessageListener)>,
    next_listener: ListenerId,
}

impl EngineState {
    fn notify(&mut self) {
        let messages = self.timeline.messages();
        for (_, listener) in self.listeners.iter_mut() {
            listener(messages);
        }
    }
}

impl<S: MessageStore + 'static> SyncEngine<S> {
    /// Create an engine for `key`, viewed by `local`, on the system clock.
    pub fn new(
        key: ConversationKey,
        local: ParticipantId,
        store: Arc<S>,
        config: &ChatConfig,
    ) -> Self {
        Self::with_clock(key, local, store, config, WallClock::system())
    }

    /// Create an engine that reads time from `clock`.
    pub fn with_clock(
        key: ConversationKey,
        local: ParticipantId,
        store: Arc<S>,
        config: &ChatConfig,
        clock: WallClock,
    ) -> Self {
        let timeline = Timeline::new(key.clone(), local.clone(), config.reconcile_policy());
        Self {
            inner: Arc::new(EngineInner {
                key,
                local,
                store,
                send_timeout: config.send_timeout(),
                clock,
                state: Mutex::new(EngineState {
                    timeline,
                    local_clock: LocalClock::new(),
                    unpersisted_read: None,
                    listeners: Vec::new(),
                    next_listener: 0,
                }),
                feed: Mutex::new(None),
            }),
        }
    }

    /// The conversation this engine syncs.
    pub fn key(&self) -> &ConversationKey {
        &self.inner.key
    }

    /// The participant this engine sends as.
    pub fn local(&self) -> &ParticipantId {
        &self.inner.local
    }

    /// The backing store.
    pub fn store(&self) -> &Arc<S> {
        &self.inner.store
    }

    /// Snapshot of the ordered list.
    pub fn messages(&self) -> Vec<Message> {
        lock(&self.inner.state).timeline.messages().to_vec()
    }

    /// Look up a message by id (canonical, or local before confirmation).
    pub fn message(&self, id: &MessageId) -> Option<Message> {
        let state = lock(&self.inner.state);
        state
            .timeline
            .get(id)
            .or_else(|| state.timeline.find_local(id))
            .cloned()
    }

    /// Send a message.
    ///
    /// The message is inserted as `Pending` and listeners are notified
    /// before the store is contacted. Store failures and timeouts never
    /// surface as errors: the returned message is then `Failed`.
    ///
    /// # Errors
    ///
    /// `EmptyMessage` if `text` is blank after trimming.
    pub async fn send(&self, text: &str) -> Result<Message, ClientError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ClientError::EmptyMessage);
        }

        let local_id = {
            let mut state = lock(&self.inner.state);
            let created_at = state.local_clock.next(self.inner.clock.now());
            let message = Message::pending(
                self.inner.key.clone(),
                self.inner.local.clone(),
                text,
                created_at,
            );
            let local_id = message.id.clone();
            state.timeline.insert_local(message);
            state.notify();
            local_id
        };
        debug!(conversation = %self.inner.key.fingerprint(), id = %local_id, "optimistic insert");

        let result = tokio::time::timeout(
            self.inner.send_timeout,
            self.inner
                .store
                .append(&self.inner.key, &self.inner.local, text),
        )
        .await;

        let mut state = lock(&self.inner.state);
        let canonical = match result {
            Ok(Ok(record)) => {
                state.local_clock.observe(record.created_at);
                let outcome = state.timeline.acknowledge(&local_id, &record);
                self.log_ack(&local_id, &outcome);
                Some(record.id)
            }
            Ok(Err(err)) => {
                warn!(
                    conversation = %self.inner.key.fingerprint(),
                    id = %local_id,
                    %err,
                    transient = err.is_transient(),
                    "send failed"
                );
                state.timeline.fail(&local_id);
                None
            }
            Err(_) => {
                warn!(
                    conversation = %self.inner.key.fingerprint(),
                    id = %local_id,
                    timeout_ms = self.inner.send_timeout.as_millis() as u64,
                    "send timed out"
                );
                state.timeline.fail(&local_id);
                None
            }
        };
        state.notify();

        let message = state
            .timeline
            .find_local(&local_id)
            .or_else(|| canonical.as_ref().and_then(|id| state.timeline.get(id)))
            .cloned();
        message.ok_or(ClientError::UnknownMessage(local_id))
    }

    /// Re-send the text of a failed message as a new message.
    ///
    /// The failed entry is removed from the list.
    ///
    /// # Errors
    ///
    /// `UnknownMessage` if `id` is not in the list, `NotRetryable` if it has
    /// not failed.
    pub async fn retry(&self, id: &MessageId) -> Result<Message, ClientError> {
        let failed = {
            let mut state = lock(&self.inner.state);
            let failed = state.timeline.discard_failed(id)?;
            state.notify();
            failed
        };
        info!(conversation = %self.inner.key.fingerprint(), id = %id, "retrying failed message");
        self.send(&failed.text).await
    }

    /// Merge a snapshot from the store into the list.
    ///
    /// Listeners are notified only when the list changed. Peer messages the
    /// store has not yet flagged delivered are acknowledged back to it.
    pub async fn apply_remote_snapshot(&self, records: &[StoreMessage]) -> MergeOutcome {
        let (outcome, receipts) = {
            let mut state = lock(&self.inner.state);
            if let Some(latest) = records
                .iter()
                .filter(|r| r.conversation_key == self.inner.key)
                .map(|r| r.created_at)
                .max()
            {
                state.local_clock.observe(latest);
            }
            let outcome = state.timeline.apply_snapshot(records, self.inner.clock.now());
            let receipts = state.timeline.mark_observed();
            if outcome.changed() || !receipts.is_empty() {
                state.notify();
            }
            (outcome, receipts)
        };
        self.log_merge(&outcome);

        if !receipts.is_empty() {
            if let Err(err) = self
                .inner
                .store
                .mark_delivered(&self.inner.key, &receipts)
                .await
            {
                warn!(conversation = %self.inner.key.fingerprint(), %err, "delivery receipt failed");
            }
        }
        outcome
    }

    /// Mark peer messages up to and including `upto` read.
    ///
    /// Idempotent: when nothing changes the store is not contacted, unless
    /// an earlier marker never reached it. That marker is retried here and
    /// on [`load`](Self::load) until the store accepts it.
    ///
    /// # Errors
    ///
    /// `UnknownMessage` if `upto` is not in the list; store errors while
    /// persisting the read marker.
    pub async fn mark_read(&self, upto: &MessageId) -> Result<Vec<MessageId>, ClientError> {
        let (marked, marker) = {
            let mut state = lock(&self.inner.state);
            let outcome = state.timeline.mark_read(upto)?;
            if !outcome.marked.is_empty() {
                state.notify();
            }
            let marker = outcome.store_marker.or_else(|| state.unpersisted_read.clone());
            state.unpersisted_read = marker.clone();
            (outcome.marked, marker)
        };

        if let Some(marker) = marker {
            self.persist_read_marker(&marker).await?;
        }
        Ok(marked)
    }

    async fn persist_read_marker(&self, marker: &MessageId) -> Result<(), ClientError> {
        debug!(conversation = %self.inner.key.fingerprint(), marker = %marker, "persisting read marker");
        self.inner.store.mark_read(&self.inner.key, marker).await?;
        let mut state = lock(&self.inner.state);
        if state.unpersisted_read.as_ref() == Some(marker) {
            state.unpersisted_read = None;
        }
        Ok(())
    }

    /// Register a listener.
    ///
    /// It is called immediately with the current list, then synchronously
    /// after every change until [`unsubscribe`](Self::unsubscribe).
    pub fn subscribe(&self, listener: impl FnMut(&[Message]) + Send + 'static) -> ListenerId {
        let mut listener: MessageListener = Box::new(listener);
        let mut state = lock(&self.inner.state);
        listener(state.timeline.messages());
        let id = state.next_listener;
        state.next_listener += 1;
        state.listeners.push((id, listener));
        id
    }

    /// Remove a listener. Returns whether it was registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut state = lock(&self.inner.state);
        let before = state.listeners.len();
        state.listeners.retain(|(listener_id, _)| *listener_id != id);
        state.listeners.len() != before
    }

    /// Subscribe to the store's live feed for this conversation.
    ///
    /// Snapshots are merged in arrival order by a background task. Calling
    /// `attach` while attached is a no-op.
    pub async fn attach(&self) -> Result<(), ClientError> {
        if self.is_attached() {
            return Ok(());
        }
        let mut feed = self.inner.store.subscribe(&self.inner.key).await?;
        let weak: Weak<EngineInner<S>> = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            while let Some(snapshot) = feed.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                SyncEngine { inner }.apply_remote_snapshot(&snapshot).await;
            }
        });

        let mut slot = lock(&self.inner.feed);
        if let Some(previous) = slot.replace(task) {
            previous.abort();
        }
        info!(conversation = %self.inner.key.fingerprint(), local = %self.inner.local, "attached");
        Ok(())
    }

    /// Stop following the store's feed. In-flight sends still complete.
    pub fn detach(&self) {
        if let Some(task) = lock(&self.inner.feed).take() {
            task.abort();
            info!(conversation = %self.inner.key.fingerprint(), "detached");
        }
    }

    /// Whether a live feed is being followed.
    pub fn is_attached(&self) -> bool {
        lock(&self.inner.feed)
            .as_ref()
            .map_or(false, |task| !task.is_finished())
    }

    /// Fetch the store's current view and merge it.
    pub async fn load(&self) -> Result<MergeOutcome, ClientError> {
        let records = self.inner.store.fetch(&self.inner.key).await?;
        let outcome = self.apply_remote_snapshot(&records).await;

        let pending = lock(&self.inner.state).unpersisted_read.clone();
        if let Some(marker) = pending {
            if let Err(err) = self.persist_read_marker(&marker).await {
                warn!(conversation = %self.inner.key.fingerprint(), marker = %marker, %err, "read marker still not persisted");
            }
        }
        Ok(outcome)
    }

    /// Number of messages in a given state.
    pub fn count_in_state(&self, delivery_state: DeliveryState) -> usize {
        lock(&self.inner.state)
            .timeline
            .messages()
            .iter()
            .filter(|m| m.delivery_state == delivery_state)
            .count()
    }

    fn log_ack(&self, local_id: &MessageId, outcome: &AckOutcome) {
        let conversation = self.inner.key.fingerprint();
        match outcome {
            AckOutcome::Confirmed { id } | AckOutcome::AlreadyConfirmed { id } => {
                debug!(%conversation, local = %local_id, canonical = %id, "send confirmed");
            }
            AckOutcome::Reconciled { id, ambiguous } => {
                debug!(%conversation, local = %local_id, canonical = %id, "send reconciled");
                if let Some(ambiguous) = ambiguous {
                    warn!(
                        %conversation,
                        canonical = %ambiguous.canonical_id,
                        chosen = %ambiguous.chosen,
                        candidates = ambiguous.candidates,
                        "reconciliation ambiguous"
                    );
                }
            }
            AckOutcome::Inserted { id } => {
                debug!(%conversation, local = %local_id, canonical = %id, "ack inserted as new entry");
            }
            AckOutcome::Ignored => {
                debug!(%conversation, local = %local_id, "late ack ignored");
            }
        }
    }

    fn log_merge(&self, outcome: &MergeOutcome) {
        let conversation = self.inner.key.fingerprint();
        for ambiguous in &outcome.ambiguous {
            warn!(
                %conversation,
                canonical = %ambiguous.canonical_id,
                chosen = %ambiguous.chosen,
                candidates = ambiguous.candidates,
                "reconciliation ambiguous"
            );
        }
        for id in &outcome.failed {
            warn!(%conversation, id = %id, "pending message expired");
        }
        if outcome.foreign > 0 {
            warn!(%conversation, skipped = outcome.foreign, "snapshot held records of another conversation");
        }
        if outcome.changed() {
            debug!(
                %conversation,
                inserted = outcome.inserted.len(),
                reconciled = outcome.reconciled.len(),
                updated = outcome.updated.len(),
                failed = outcome.failed.len(),
                "snapshot merged"
            );
        }
    }
}

impl<S> Drop for EngineInner<S> {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.feed).take() {
            task.abort();
        }
    }
}
