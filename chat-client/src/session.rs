//! ConversationSession - the user's currently open conversation.
//!
//! A session owns one [`SyncEngine`] and [`TypingSignal`] per conversation
//! it has opened, kept in a bounded LRU cache. Exactly one of them is
//! active at a time. Background work for inactive conversations (feeds,
//! typing timers) is stopped on switch, but an in-flight send always
//! finishes on the engine it started on.
//!
//! Events are tagged with their conversation key and only forwarded while
//! that conversation is active, so a late callback from a conversation the
//! user has left never reaches the screen.

use std::sync::{Arc, Mutex};

use duet_chat_core::LruCache;
use duet_chat_types::{ConversationKey, Message, MessageId, ParticipantId};
use tracing::{debug, info};

use crate::clock::WallClock;
use crate::config::ChatConfig;
use crate::engine::{ListenerId, SyncEngine};
use crate::error::ClientError;
use crate::lock;
use crate::store::MessageStore;
use crate::typing::TypingSignal;

/// Something the UI should render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A conversation became active; `messages` is its current list.
    Ready {
        /// The conversation.
        key: ConversationKey,
        /// Ordered message list.
        messages: Vec<Message>,
    },

    /// The active conversation's list changed.
    Messages {
        /// The conversation.
        key: ConversationKey,
        /// Ordered message list.
        messages: Vec<Message>,
    },

    /// The peer in the active conversation started or stopped typing.
    PeerTyping {
        /// The conversation.
        key: ConversationKey,
        /// Who is typing.
        participant: ParticipantId,
        /// New state.
        is_typing: bool,
    },
}

impl SessionEvent {
    /// The conversation this event belongs to.
    pub fn key(&self) -> &ConversationKey {
        match self {
            Self::Ready { key, .. } | Self::Messages { key, .. } | Self::PeerTyping { key, .. } => {
                key
            }
        }
    }
}

type SessionListener = Box<dyn FnMut(&SessionEvent) + Send>;

#[derive(Default)]
struct Listeners {
    entries: Vec<(ListenerId, SessionListener)>,
    next: ListenerId,
}

impl Listeners {
    fn emit(&mut self, event: &SessionEvent) {
        for (_, listener) in self.entries.iter_mut() {
            listener(event);
        }
    }
}

/// Engine and typing signal of one opened conversation.
struct Conversation<S> {
    engine: SyncEngine<S>,
    typing: TypingSignal<S>,
}

impl<S> Clone for Conversation<S> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            typing: self.typing.clone(),
        }
    }
}

impl<S: MessageStore + 'static> Conversation<S> {
    async fn detach(&self) {
        self.engine.detach();
        self.typing.detach().await;
    }
}

/// The conversation a participant currently has open.
///
/// Cheap to clone; clones share state. Listeners run while internal locks
/// are held and must not call back into the session.
pub struct ConversationSession<S> {
    inner: Arc<SessionInner<S>>,
}

impl<S> Clone for ConversationSession<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct SessionInner<S> {
    local: ParticipantId,
    store: Arc<S>,
    config: ChatConfig,
    clock: WallClock,
    /// Held across a whole switch, so switches never interleave.
    conversations: tokio::sync::Mutex<LruCache<ConversationKey, Conversation<S>>>,
    active: Mutex<Option<Conversation<S>>>,
    active_key: Arc<Mutex<Option<ConversationKey>>>,
    listeners: Arc<Mutex<Listeners>>,
}

impl<S: MessageStore + 'static> ConversationSession<S> {
    /// Create a session for `local` with nothing open.
    pub fn new(local: ParticipantId, store: Arc<S>, config: ChatConfig) -> Self {
        Self::with_clock(local, store, config, WallClock::system())
    }

    /// Create a session whose engines read time from `clock`.
    pub fn with_clock(
        local: ParticipantId,
        store: Arc<S>,
        config: ChatConfig,
        clock: WallClock,
    ) -> Self {
        let capacity = config.session_cache_capacity;
        Self {
            inner: Arc::new(SessionInner {
                local,
                store,
                config,
                clock,
                conversations: tokio::sync::Mutex::new(LruCache::new(capacity)),
                active: Mutex::new(None),
                active_key: Arc::new(Mutex::new(None)),
                listeners: Arc::new(Mutex::new(Listeners::default())),
            }),
        }
    }

    /// The participant this session acts for.
    pub fn local(&self) -> &ParticipantId {
        &self.inner.local
    }

    /// Key of the open conversation, if any.
    pub fn active_key(&self) -> Option<ConversationKey> {
        lock(&self.inner.active_key).clone()
    }

    /// Register a listener for session events.
    pub fn subscribe(&self, listener: impl FnMut(&SessionEvent) + Send + 'static) -> ListenerId {
        let mut listeners = lock(&self.inner.listeners);
        let id = listeners.next;
        listeners.next += 1;
        listeners.entries.push((id, Box::new(listener)));
        id
    }

    /// Remove a listener. Returns whether it was registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = lock(&self.inner.listeners);
        let before = listeners.entries.len();
        listeners.entries.retain(|(listener_id, _)| *listener_id != id);
        listeners.entries.len() != before
    }

    /// Open the conversation with `peer`, making it the active one.
    ///
    /// Switching to the conversation that is already active does nothing.
    /// On success a [`SessionEvent::Ready`] carrying the current list is
    /// emitted. On failure no conversation is active.
    pub async fn switch_to(&self, peer: &ParticipantId) -> Result<ConversationKey, ClientError> {
        let key = ConversationKey::derive(&self.inner.local, peer)?;
        let mut conversations = self.inner.conversations.lock().await;

        if self.active_key().as_ref() == Some(&key) {
            return Ok(key);
        }

        *lock(&self.inner.active_key) = None;
        let previous = lock(&self.inner.active).take();
        if let Some(previous) = previous {
            previous.detach().await;
        }

        let conversation = match conversations.get(&key) {
            Some(conversation) => conversation.clone(),
            None => {
                let conversation = self.open(key.clone());
                if let Some((evicted_key, evicted)) =
                    conversations.insert(key.clone(), conversation.clone())
                {
                    debug!(conversation = %evicted_key.fingerprint(), "evicted from session cache");
                    evicted.detach().await;
                }
                conversation
            }
        };

        if let Err(err) = self.activate(&conversation).await {
            conversation.detach().await;
            return Err(err);
        }

        *lock(&self.inner.active) = Some(conversation.clone());
        *lock(&self.inner.active_key) = Some(key.clone());
        let messages = conversation.engine.messages();
        info!(
            conversation = %key.fingerprint(),
            local = %self.inner.local,
            count = messages.len(),
            cached = conversations.len(),
            "conversation active"
        );
        lock(&self.inner.listeners).emit(&SessionEvent::Ready {
            key: key.clone(),
            messages,
        });
        Ok(key)
    }

    /// Leave the active conversation and stop all background work.
    pub async fn close(&self) {
        let mut conversations = self.inner.conversations.lock().await;
        *lock(&self.inner.active_key) = None;
        lock(&self.inner.active).take();
        for (key, conversation) in conversations.drain() {
            conversation.detach().await;
            debug!(conversation = %key.fingerprint(), "closed");
        }
    }

    /// Send `text` in the active conversation.
    ///
    /// Ends the local typing burst first. The send completes on the
    /// conversation it started in even if the user switches away.
    pub async fn send(&self, text: &str) -> Result<Message, ClientError> {
        let conversation = self.active()?;
        conversation.typing.stop().await;
        conversation.engine.send(text).await
    }

    /// Re-send a failed message in the active conversation.
    pub async fn retry(&self, id: &MessageId) -> Result<Message, ClientError> {
        self.active()?.engine.retry(id).await
    }

    /// Mark the active conversation read up to `upto`.
    pub async fn mark_read(&self, upto: &MessageId) -> Result<Vec<MessageId>, ClientError> {
        self.active()?.engine.mark_read(upto).await
    }

    /// Report a local keystroke in the active conversation.
    pub async fn keystroke(&self) -> Result<(), ClientError> {
        self.active()?.typing.keystroke().await;
        Ok(())
    }

    /// Messages of the active conversation.
    pub fn messages(&self) -> Result<Vec<Message>, ClientError> {
        Ok(self.active()?.engine.messages())
    }

    /// Whether the peer in the active conversation is typing.
    pub fn peer_is_typing(&self) -> Result<bool, ClientError> {
        Ok(self.active()?.typing.peer_is_typing())
    }

    fn active(&self) -> Result<Conversation<S>, ClientError> {
        lock(&self.inner.active)
            .clone()
            .ok_or(ClientError::NoActiveConversation)
    }

    /// Build a conversation whose events are forwarded only while it is
    /// the active one.
    fn open(&self, key: ConversationKey) -> Conversation<S> {
        let inner = &self.inner;
        let engine = SyncEngine::with_clock(
            key.clone(),
            inner.local.clone(),
            Arc::clone(&inner.store),
            &inner.config,
            inner.clock,
        );
        let typing = TypingSignal::with_clock(
            key.clone(),
            inner.local.clone(),
            Arc::clone(&inner.store),
            &inner.config,
            inner.clock,
        );

        let active_key = Arc::clone(&inner.active_key);
        let listeners = Arc::clone(&inner.listeners);
        let engine_key = key.clone();
        engine.subscribe(move |messages| {
            if lock(&active_key).as_ref() != Some(&engine_key) {
                return;
            }
            lock(&listeners).emit(&SessionEvent::Messages {
                key: engine_key.clone(),
                messages: messages.to_vec(),
            });
        });

        let active_key = Arc::clone(&inner.active_key);
        let listeners = Arc::clone(&inner.listeners);
        typing.subscribe(move |participant, is_typing| {
            if lock(&active_key).as_ref() != Some(&key) {
                return;
            }
            lock(&listeners).emit(&SessionEvent::PeerTyping {
                key: key.clone(),
                participant: participant.clone(),
                is_typing,
            });
        });

        Conversation { engine, typing }
    }

    async fn activate(&self, conversation: &Conversation<S>) -> Result<(), ClientError> {
        conversation.engine.attach().await?;
        conversation.typing.attach().await?;
        conversation.engine.load().await?;
        Ok(())
    }
}
