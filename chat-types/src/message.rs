//! Messages as seen locally and as persisted by a store.

use serde::{Deserialize, Serialize};

use crate::{ConversationKey, MessageId, ParticipantId, Timestamp};

/// Lifecycle stage of a message.
///
/// States only advance by rank; `Read` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    /// Created locally, not yet acknowledged by the store.
    Pending,
    /// Persisted by the store.
    Sent,
    /// Observed by the peer's client.
    Delivered,
    /// Marked read by the recipient.
    Read,
    /// The store rejected or timed out the write.
    Failed,
}

impl DeliveryState {
    /// Whether no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Read | Self::Failed)
    }

    /// Whether the store has confirmed persistence.
    pub fn is_confirmed(&self) -> bool {
        matches!(self, Self::Sent | Self::Delivered | Self::Read)
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Sent => 1,
            Self::Delivered => 2,
            Self::Read => 3,
            Self::Failed => 4,
        }
    }

    /// The state after learning about `observed`.
    ///
    /// Never moves backwards and never leaves a terminal state. `Failed`
    /// can only be entered from `Pending`.
    pub fn advance(self, observed: DeliveryState) -> DeliveryState {
        if self.is_terminal() {
            return self;
        }
        match observed {
            Self::Failed if self == Self::Pending => Self::Failed,
            Self::Failed => self,
            other if other.rank() > self.rank() => other,
            _ => self,
        }
    }
}

/// A message in the local, ordered view of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Current identifier (canonical once the store has confirmed it).
    pub id: MessageId,
    /// Client-generated id of a locally originated message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_id: Option<MessageId>,
    /// Conversation this message belongs to.
    pub conversation_key: ConversationKey,
    /// Author of the message.
    pub sender_id: ParticipantId,
    /// Message body.
    pub text: String,
    /// Logical creation time.
    pub created_at: Timestamp,
    /// Lifecycle stage.
    pub delivery_state: DeliveryState,
}

impl Message {
    /// Create a locally originated, pending message.
    pub fn pending(
        conversation_key: ConversationKey,
        sender_id: ParticipantId,
        text: impl Into<String>,
        created_at: Timestamp,
    ) -> Self {
        let id = MessageId::new();
        Self {
            local_id: Some(id.clone()),
            id,
            conversation_key,
            sender_id,
            text: text.into(),
            created_at,
            delivery_state: DeliveryState::Pending,
        }
    }

    /// Build a local entry from a store record.
    pub fn from_store(record: &StoreMessage) -> Self {
        Self {
            id: record.id.clone(),
            local_id: None,
            conversation_key: record.conversation_key.clone(),
            sender_id: record.sender_id.clone(),
            text: record.text.clone(),
            created_at: record.created_at,
            delivery_state: record.delivery_state(),
        }
    }

    /// Total order key: `created_at`, then `id`.
    pub fn order_key(&self) -> (Timestamp, &MessageId) {
        (self.created_at, &self.id)
    }

    /// Whether the message was written by `participant`.
    pub fn is_from(&self, participant: &ParticipantId) -> bool {
        &self.sender_id == participant
    }
}

/// A message as persisted by a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreMessage {
    /// Canonical identifier assigned by the store.
    pub id: MessageId,
    /// Conversation this message belongs to.
    pub conversation_key: ConversationKey,
    /// Author of the message.
    pub sender_id: ParticipantId,
    /// Message body.
    pub text: String,
    /// Store-assigned creation time.
    pub created_at: Timestamp,
    /// The peer's client has observed the message.
    #[serde(default)]
    pub delivered: bool,
    /// The recipient has read the message.
    #[serde(default)]
    pub read: bool,
}

impl StoreMessage {
    /// Delivery state implied by the store flags.
    pub fn delivery_state(&self) -> DeliveryState {
        if self.read {
            DeliveryState::Read
        } else if self.delivered {
            DeliveryState::Delivered
        } else {
            DeliveryState::Sent
        }
    }
}

/// A typing-presence update delivered by a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingUpdate {
    /// Participant whose state changed.
    pub participant: ParticipantId,
    /// Whether they are typing.
    pub is_typing: bool,
}
