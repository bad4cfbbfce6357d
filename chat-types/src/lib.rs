//! # chat-types
//!
//! Shared types for the duet two-party messaging core.
//!
//! This crate provides the foundational types used across all duet crates:
//! - [`ParticipantId`], [`MessageId`], [`ConversationKey`], [`Timestamp`] - Identity and ordering types
//! - [`Message`], [`StoreMessage`], [`DeliveryState`] - Local and persisted messages
//! - [`IdError`], [`StoreError`] - Error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod ids;
mod message;

pub use error::{IdError, StoreError};
pub use ids::{ConversationKey, MessageId, ParticipantId, Timestamp, MAX_PARTICIPANT_ID_LEN};
pub use message::{DeliveryState, Message, StoreMessage, TypingUpdate};
