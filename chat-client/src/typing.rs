//! TypingSignal - typing presence for one conversation.
//!
//! Runs the pure [`TypingState`] machine with tokio timers and publishes
//! its transitions through the store. Inbound updates from the peer are
//! tracked in a [`PeerTyping`] with freshness expiry, so a lost "idle"
//! update cannot leave the indicator on.
//!
//! Publishing is best effort: failures are logged at debug level and never
//! retried.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use duet_chat_core::{PeerTyping, TypingAction, TypingEvent, TypingState};
use duet_chat_types::{ConversationKey, ParticipantId, TypingUpdate};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::clock::WallClock;
use crate::config::ChatConfig;
use crate::engine::ListenerId;
use crate::error::ClientError;
use crate::lock;
use crate::store::MessageStore;

type TypingListener = Box<dyn FnMut(&ParticipantId, bool) + Send>;

/// Typing presence for one conversation.
///
/// Cheap to clone; clones share state.
pub struct TypingSignal<S> {
    inner: Arc<TypingInner<S>>,
}

impl<S> Clone for TypingSignal<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct TypingInner<S> {
    key: ConversationKey,
    local: ParticipantId,
    store: Arc<S>,
    idle_ms: u64,
    clock: WallClock,
    state: Mutex<TypingShared>,
    /// Keeps publications in the order the machine emitted them.
    publish_order: tokio::sync::Mutex<()>,
}

struct TypingShared {
    machine: TypingState,
    idle_timer: Option<JoinHandle<()>>,
    peers: PeerTyping,
    expiry_timer: Option<JoinHandle<()>>,
    feed: Option<JoinHandle<()>>,
    listeners: Vec<(ListenerId, TypingListener)>,
    next_listener: ListenerId,
}

impl TypingShared {
    fn notify(&mut self, peer: &ParticipantId, is_typing: bool) {
        for (_, listener) in self.listeners.iter_mut() {
            listener(peer, is_typing);
        }
    }
}

impl<S: MessageStore + 'static> TypingSignal<S> {
    /// Create a signal for `key`, publishing as `local`.
    pub fn new(
        key: ConversationKey,
        local: ParticipantId,
        store: Arc<S>,
        config: &ChatConfig,
    ) -> Self {
        Self::with_clock(key, local, store, config, WallClock::system())
    }

    /// Create a signal that reads time from `clock`.
    pub fn with_clock(
        key: ConversationKey,
        local: ParticipantId,
        store: Arc<S>,
        config: &ChatConfig,
        clock: WallClock,
    ) -> Self {
        Self {
            inner: Arc::new(TypingInner {
                key,
                local,
                store,
                idle_ms: config.typing_idle_ms,
                clock,
                publish_order: tokio::sync::Mutex::new(()),
                state: Mutex::new(TypingShared {
                    machine: TypingState::new(),
                    idle_timer: None,
                    peers: PeerTyping::new(config.typing_freshness_ms),
                    expiry_timer: None,
                    feed: None,
                    listeners: Vec::new(),
                    next_listener: 0,
                }),
            }),
        }
    }

    /// Record a local keystroke.
    ///
    /// Publishes "typing" on the first keystroke of a burst; the idle
    /// publication follows once the keyboard has been quiet for the idle
    /// timeout.
    pub async fn keystroke(&self) {
        let now = self.inner.clock.now();
        let publishes = self.inner.step(TypingEvent::Keystroke { now }, Some(self));
        self.inner.publish_all(publishes).await;
    }

    /// End the local typing burst now (on send, or when leaving).
    pub async fn stop(&self) {
        let publishes = self.inner.step(TypingEvent::Stop, None);
        self.inner.publish_all(publishes).await;
    }

    /// Whether the local user is currently typing.
    pub fn is_typing(&self) -> bool {
        lock(&self.inner.state).machine.is_typing()
    }

    /// Whether the other participant is typing right now.
    pub fn peer_is_typing(&self) -> bool {
        let Some(peer) = self.inner.key.other(&self.inner.local) else {
            return false;
        };
        let now = self.inner.clock.now();
        lock(&self.inner.state).peers.is_typing(peer, now)
    }

    /// Register a listener for peer typing changes.
    pub fn subscribe(
        &self,
        listener: impl FnMut(&ParticipantId, bool) + Send + 'static,
    ) -> ListenerId {
        let mut state = lock(&self.inner.state);
        let id = state.next_listener;
        state.next_listener += 1;
        state.listeners.push((id, Box::new(listener)));
        id
    }

    /// Remove a listener. Returns whether it was registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut state = lock(&self.inner.state);
        let before = state.listeners.len();
        state.listeners.retain(|(listener_id, _)| *listener_id != id);
        state.listeners.len() != before
    }

    /// Follow the store's typing feed. No-op while attached.
    pub async fn attach(&self) -> Result<(), ClientError> {
        if self.is_attached() {
            return Ok(());
        }
        let mut feed = self.inner.store.subscribe_typing(&self.inner.key).await?;
        let weak = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            while let Some(update) = feed.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                TypingSignal { inner }.receive(update);
            }
        });
        if let Some(previous) = lock(&self.inner.state).feed.replace(task) {
            previous.abort();
        }
        Ok(())
    }

    /// Stop following the feed, end local typing and forget peer state.
    pub async fn detach(&self) {
        {
            let mut state = lock(&self.inner.state);
            if let Some(feed) = state.feed.take() {
                feed.abort();
            }
            if let Some(timer) = state.expiry_timer.take() {
                timer.abort();
            }
            state.peers.clear();
        }
        self.stop().await;
    }

    /// Whether the typing feed is being followed.
    pub fn is_attached(&self) -> bool {
        lock(&self.inner.state)
            .feed
            .as_ref()
            .map_or(false, |task| !task.is_finished())
    }

    fn receive(&self, update: TypingUpdate) {
        if update.participant == self.inner.local {
            return;
        }
        let now = self.inner.clock.now();
        let mut state = lock(&self.inner.state);
        if state.peers.update(&update.participant, update.is_typing, now) {
            debug!(
                conversation = %self.inner.key.fingerprint(),
                peer = %update.participant,
                is_typing = update.is_typing,
                "peer typing changed"
            );
            state.notify(&update.participant, update.is_typing);
        }
        self.schedule_expiry(&mut state, now);
    }

    /// (Re)arm the task that turns stale peer reports off.
    fn schedule_expiry(&self, state: &mut TypingShared, now: duet_chat_types::Timestamp) {
        if let Some(timer) = state.expiry_timer.take() {
            timer.abort();
        }
        let Some(deadline) = state.peers.next_expiry(now) else {
            return;
        };
        let weak = Arc::downgrade(&self.inner);
        let wait = Duration::from_millis(now.millis_until(deadline));
        state.expiry_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            let Some(inner) = weak.upgrade() else { return };
            let signal = TypingSignal { inner };
            let now = signal.inner.clock.now();
            let mut state = lock(&signal.inner.state);
            state.expiry_timer = None;
            for peer in state.peers.prune(now) {
                debug!(conversation = %signal.inner.key.fingerprint(), peer = %peer, "peer typing expired");
                state.notify(&peer, false);
            }
            signal.schedule_expiry(&mut state, now);
        }));
    }
}

impl<S: MessageStore + 'static> TypingInner<S> {
    /// Feed an event to the machine and return the publications to make.
    fn step(&self, event: TypingEvent, signal: Option<&TypingSignal<S>>) -> Vec<bool> {
        let mut state = lock(&self.state);
        let (next, actions) = state.machine.on_event(event, self.idle_ms);
        state.machine = next;

        let mut publishes = Vec::new();
        for action in actions {
            match action {
                TypingAction::Publish { is_typing } => publishes.push(is_typing),
                TypingAction::ArmTimer { .. } => {
                    let running = state
                        .idle_timer
                        .as_ref()
                        .map_or(false, |timer| !timer.is_finished());
                    if !running {
                        if let Some(signal) = signal {
                            state.idle_timer = Some(spawn_idle_timer(Arc::downgrade(&signal.inner)));
                        }
                    }
                }
                TypingAction::CancelTimer => {
                    if let Some(timer) = state.idle_timer.take() {
                        timer.abort();
                    }
                }
            }
        }
        publishes
    }

    async fn publish_all(&self, publishes: Vec<bool>) {
        if publishes.is_empty() {
            return;
        }
        let _order = self.publish_order.lock().await;
        for is_typing in publishes {
            debug!(conversation = %self.key.fingerprint(), is_typing, "publishing typing state");
            if let Err(err) = self
                .store
                .publish_typing(&self.key, &self.local, is_typing)
                .await
            {
                debug!(conversation = %self.key.fingerprint(), %err, "typing publish failed");
            }
        }
    }
}

/// Sleep until the machine's deadline and tick it, publishing idle once the
/// deadline has really passed. Runs until the machine has no deadline, so a
/// burst that starts while an idle publish is in flight is still covered.
fn spawn_idle_timer<S: MessageStore + 'static>(weak: Weak<TypingInner<S>>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let wait = {
                let Some(inner) = weak.upgrade() else { return };
                let mut state = lock(&inner.state);
                let Some(deadline) = state.machine.deadline() else {
                    // Released under the lock: the next keystroke arms a new timer.
                    state.idle_timer = None;
                    return;
                };
                inner.clock.now().millis_until(deadline)
            };
            tokio::time::sleep(Duration::from_millis(wait)).await;

            let Some(inner) = weak.upgrade() else { return };
            let now = inner.clock.now();
            let publishes = inner.step(TypingEvent::Tick { now }, None);
            inner.publish_all(publishes).await;
        }
    })
}

impl<S> Drop for TypingInner<S> {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        for task in [
            state.idle_timer.take(),
            state.expiry_timer.take(),
            state.feed.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }
    }
}
