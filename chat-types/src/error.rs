//! Error types for duet.

use thiserror::Error;

use crate::ParticipantId;

/// Errors raised when constructing identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdError {
    /// Participant id was empty after trimming.
    #[error("participant id must not be empty")]
    EmptyParticipant,

    /// Participant id exceeds the maximum length.
    #[error("participant id too long: {len} bytes (max {max})")]
    ParticipantTooLong {
        /// Actual length in bytes.
        len: usize,
        /// Maximum allowed length.
        max: usize,
    },

    /// A conversation needs two distinct participants.
    #[error("participant {0} cannot start a conversation with itself")]
    SelfConversation(ParticipantId),

    /// A stored conversation key does not match its participants.
    #[error("conversation key {0:?} does not match its participants")]
    KeyMismatch(String),
}

/// Errors surfaced by a message store backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Transient transport failure; the write may be re-sent by the user.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The backend refused the write (validation, quota, ...).
    #[error("store rejected write: {0}")]
    Rejected(String),

    /// The referenced message does not exist in the store.
    #[error("unknown message: {0}")]
    UnknownMessage(String),

    /// Local persistence failed.
    #[error("store I/O error: {0}")]
    Io(String),

    /// Stored data could not be encoded or decoded.
    #[error("store serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Whether the failure is transient (a later attempt may succeed).
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = StoreError::Rejected("text too long".into());
        assert_eq!(err.to_string(), "store rejected write: text too long");
    }

    #[test]
    fn transient_classification() {
        assert!(StoreError::Unavailable("offline".into()).is_transient());
        assert!(!StoreError::Rejected("nope".into()).is_transient());
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<StoreError>();
        assert_send_sync::<IdError>();
    }
}
