//! # duet-chat-client
//!
//! Realtime sync for two-party conversations.
//!
//! This is the library applications use to show and send messages. It
//! drives the pure logic in duet-chat-core against a [`MessageStore`].
//!
//! ## Features
//!
//! - **Optimistic sends**: messages appear as pending at once and are
//!   reconciled with the store's echo without duplicates
//! - **Stable ordering**: the list is always sorted by `(created_at, id)`
//! - **Receipts**: delivery and read state flow back to the sender
//! - **Typing presence**: debounced locally, expired remotely
//! - **Pluggable stores**: in-memory, flat JSON files, or polling any store
//!
//! ## Example
//!
//! ```ignore
//! use duet_chat_client::{ChatConfig, ConversationSession, MemoryStore};
//!
//! let store = Arc::new(MemoryStore::new());
//! let session = ConversationSession::new(alice, store, ChatConfig::default());
//! session.subscribe(|event| println!("{event:?}"));
//!
//! session.switch_to(&bob).await?;
//! session.send("hello").await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod session;
pub mod store;
pub mod typing;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use clock::WallClock;
pub use config::{ChatConfig, ConfigError};
pub use engine::{ListenerId, SyncEngine};
pub use error::ClientError;
pub use session::{ConversationSession, SessionEvent};
pub use store::{KvStore, MemoryStore, MessageStore, PollingStore, StoreFeed};
pub use typing::TypingSignal;

/// Lock a std mutex, recovering the data if a listener panicked while
/// holding it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
