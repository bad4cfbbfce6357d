//! Client error type.

use duet_chat_core::TimelineError;
use duet_chat_types::{IdError, MessageId, StoreError};
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Store error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Invalid identifier.
    #[error("invalid identifier: {0}")]
    Id(#[from] IdError),

    /// Message text was blank after trimming.
    #[error("message text is empty")]
    EmptyMessage,

    /// No message with this id in the conversation.
    #[error("unknown message: {0}")]
    UnknownMessage(MessageId),

    /// Only failed messages can be re-sent.
    #[error("message {0} has not failed")]
    NotRetryable(MessageId),

    /// The session has no open conversation.
    #[error("no active conversation")]
    NoActiveConversation,
}

impl From<TimelineError> for ClientError {
    fn from(err: TimelineError) -> Self {
        match err {
            TimelineError::UnknownMessage(id) => Self::UnknownMessage(id),
            TimelineError::NotFailed(id) => Self::NotRetryable(id),
        }
    }
}
