//! # chat-core
//!
//! Pure logic for duet (no I/O, instant tests).
//!
//! This crate implements the ordering, reconciliation and presence rules of
//! a two-party conversation without any storage, network or timers.
//!
//! ## Design Philosophy
//!
//! All modules in this crate are **pure** - they take input (including the
//! current time) and produce output without side effects. This enables:
//! - Instant unit tests (no mocks, no async)
//! - Deterministic behavior (same input → same output)
//! - Easy reasoning about reconciliation and state transitions
//!
//! The actual I/O (store writes, subscriptions, timers) is performed by
//! `chat-client`, which drives these types and executes the actions they
//! return.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod clock;
pub mod format;
pub mod timeline;
pub mod typing;

pub use cache::LruCache;
pub use clock::LocalClock;
pub use format::relative_label;
pub use timeline::{
    AckOutcome, AmbiguousEcho, MergeOutcome, ReadOutcome, ReconcilePolicy, Reconciled, Timeline,
    TimelineError, DEFAULT_PENDING_TIMEOUT_MS, DEFAULT_RECONCILIATION_WINDOW_MS,
};
pub use typing::{
    PeerTyping, TypingAction, TypingEvent, TypingState, DEFAULT_TYPING_FRESHNESS_MS,
    DEFAULT_TYPING_IDLE_MS,
};
