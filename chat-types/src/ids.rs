//! Identity and ordering types for duet.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::IdError;

/// Maximum length of a participant identifier in bytes.
pub const MAX_PARTICIPANT_ID_LEN: usize = 256;

/// Identifier of one participant (a user account).
///
/// Always non-empty after trimming and at most [`MAX_PARTICIPANT_ID_LEN`] bytes.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ParticipantId(String);

impl ParticipantId {
    /// Create a participant id, trimming surrounding whitespace.
    pub fn new(raw: impl AsRef<str>) -> Result<Self, IdError> {
        let trimmed = raw.as_ref().trim();
        if trimmed.is_empty() {
            return Err(IdError::EmptyParticipant);
        }
        if trimmed.len() > MAX_PARTICIPANT_ID_LEN {
            return Err(IdError::ParticipantTooLong {
                len: trimmed.len(),
                max: MAX_PARTICIPANT_ID_LEN,
            });
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Borrow the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ParticipantId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ParticipantId> for String {
    fn from(id: ParticipantId) -> Self {
        id.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ParticipantId({})", self.0)
    }
}

/// Opaque message identifier.
///
/// Locally created messages get a UUID v4; stores may assign any string as
/// the canonical identifier. Ordering is lexicographic on the string and is
/// only used to break `created_at` ties.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Create a new random (UUID v4) message id.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Wrap an identifier assigned by a store.
    pub fn from_canonical(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Borrow the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", self.0)
    }
}

/// Stable identity of a 1:1 conversation.
///
/// Derived from the two participant ids: both are sorted and each is
/// length-prefixed before concatenation, so `derive(a, b) == derive(b, a)`
/// and two different unordered pairs can never produce the same key.
///
/// Deserializing re-derives the key from its participants and rejects a
/// canonical form that disagrees.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "StoredConversationKey")]
pub struct ConversationKey {
    canonical: String,
    low: ParticipantId,
    high: ParticipantId,
}

/// Wire form of [`ConversationKey`], checked on the way in.
#[derive(Deserialize)]
struct StoredConversationKey {
    canonical: String,
    low: ParticipantId,
    high: ParticipantId,
}

impl TryFrom<StoredConversationKey> for ConversationKey {
    type Error = IdError;

    fn try_from(stored: StoredConversationKey) -> Result<Self, Self::Error> {
        let key = Self::derive(&stored.low, &stored.high)?;
        if key.canonical != stored.canonical {
            return Err(IdError::KeyMismatch(stored.canonical));
        }
        Ok(key)
    }
}

impl ConversationKey {
    /// Derive the key for the conversation between `a` and `b`.
    pub fn derive(a: &ParticipantId, b: &ParticipantId) -> Result<Self, IdError> {
        if a == b {
            return Err(IdError::SelfConversation(a.clone()));
        }
        let (low, high) = if a < b { (a, b) } else { (b, a) };
        let canonical = format!(
            "{}:{}{}:{}",
            low.as_str().len(),
            low.as_str(),
            high.as_str().len(),
            high.as_str()
        );
        Ok(Self {
            canonical,
            low: low.clone(),
            high: high.clone(),
        })
    }

    /// The canonical string form, usable as a storage key.
    pub fn as_str(&self) -> &str {
        &self.canonical
    }

    /// Both participants, in canonical (sorted) order.
    pub fn participants(&self) -> (&ParticipantId, &ParticipantId) {
        (&self.low, &self.high)
    }

    /// Check whether `id` takes part in this conversation.
    pub fn contains(&self, id: &ParticipantId) -> bool {
        &self.low == id || &self.high == id
    }

    /// The other participant, if `id` belongs to this conversation.
    pub fn other(&self, id: &ParticipantId) -> Option<&ParticipantId> {
        if &self.low == id {
            Some(&self.high)
        } else if &self.high == id {
            Some(&self.low)
        } else {
            None
        }
    }

    /// Short SHA-256 fingerprint for logs, URL-safe base64.
    pub fn fingerprint(&self) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(b"duet-conversation-key-v1");
        hasher.update(self.canonical.as_bytes());
        let digest = hasher.finalize();
        URL_SAFE_NO_PAD.encode(&digest[..9])
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

impl fmt::Debug for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConversationKey({})", self.fingerprint())
    }
}

/// Logical timestamp in milliseconds since the Unix epoch.
///
/// Local timestamps are produced by a per-sender logical clock, so two
/// messages from the same sender never share a value.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Create a timestamp from milliseconds since the epoch.
    pub fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Milliseconds since the epoch.
    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// The next representable timestamp.
    pub fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// This timestamp moved `millis` forward, saturating.
    pub fn add_millis(&self, millis: u64) -> Self {
        Self(self.0.saturating_add(millis))
    }

    /// Absolute distance to `other` in milliseconds.
    pub fn abs_diff(&self, other: Timestamp) -> u64 {
        self.0.abs_diff(other.0)
    }

    /// Milliseconds elapsed from `self` until `later` (zero if `later` is earlier).
    pub fn millis_until(&self, later: Timestamp) -> u64 {
        later.0.saturating_sub(self.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(s: &str) -> ParticipantId {
        ParticipantId::new(s).unwrap()
    }

    #[test]
    fn participant_id_is_trimmed() {
        assert_eq!(pid("  alice ").as_str(), "alice");
    }

    #[test]
    fn participant_id_rejects_blank() {
        assert!(matches!(
            ParticipantId::new("   "),
            Err(IdError::EmptyParticipant)
        ));
    }

    #[test]
    fn participant_id_rejects_oversized() {
        let long = "x".repeat(MAX_PARTICIPANT_ID_LEN + 1);
        assert!(matches!(
            ParticipantId::new(long),
            Err(IdError::ParticipantTooLong { .. })
        ));
    }

    #[test]
    fn participant_id_deserialize_validates() {
        let ok: ParticipantId = serde_json::from_str("\"bob\"").unwrap();
        assert_eq!(ok.as_str(), "bob");
        assert!(serde_json::from_str::<ParticipantId>("\"\"").is_err());
    }

    #[test]
    fn key_is_commutative() {
        let a = pid("alice");
        let b = pid("bob");
        assert_eq!(
            ConversationKey::derive(&a, &b).unwrap(),
            ConversationKey::derive(&b, &a).unwrap()
        );
    }

    #[test]
    fn key_rejects_self_conversation() {
        let a = pid("alice");
        assert!(matches!(
            ConversationKey::derive(&a, &a),
            Err(IdError::SelfConversation(_))
        ));
    }

    #[test]
    fn key_deserialize_rederives_from_participants() {
        let key = ConversationKey::derive(&pid("alice"), &pid("bob")).unwrap();
        let json = serde_json::to_string(&key).unwrap();
        let back: ConversationKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);

        let forged = r#"{"canonical":"5:alice5:carol","low":"alice","high":"bob"}"#;
        assert!(serde_json::from_str::<ConversationKey>(forged).is_err());

        let lonely = r#"{"canonical":"5:alice5:alice","low":"alice","high":"alice"}"#;
        assert!(serde_json::from_str::<ConversationKey>(lonely).is_err());
    }

    #[test]
    fn key_does_not_collide_on_naive_concatenation() {
        // "ab" + "c" and "a" + "bc" concatenate identically without length prefixes.
        let k1 = ConversationKey::derive(&pid("ab"), &pid("c")).unwrap();
        let k2 = ConversationKey::derive(&pid("a"), &pid("bc")).unwrap();
        assert_ne!(k1, k2);
        assert_ne!(k1.as_str(), k2.as_str());
    }

    #[test]
    fn key_does_not_collide_with_separator_in_ids() {
        let k1 = ConversationKey::derive(&pid("1:a"), &pid("b")).unwrap();
        let k2 = ConversationKey::derive(&pid("a"), &pid("1:b")).unwrap();
        assert_ne!(k1.as_str(), k2.as_str());
    }

    #[test]
    fn key_reports_other_participant() {
        let a = pid("alice");
        let b = pid("bob");
        let key = ConversationKey::derive(&a, &b).unwrap();
        assert_eq!(key.other(&a), Some(&b));
        assert_eq!(key.other(&b), Some(&a));
        assert_eq!(key.other(&pid("carol")), None);
        assert!(key.contains(&a));
        assert!(!key.contains(&pid("carol")));
    }

    #[test]
    fn fingerprint_is_stable_and_short() {
        let key = ConversationKey::derive(&pid("alice"), &pid("bob")).unwrap();
        let again = ConversationKey::derive(&pid("bob"), &pid("alice")).unwrap();
        assert_eq!(key.fingerprint(), again.fingerprint());
        assert_eq!(key.fingerprint().len(), 12); // 9 bytes = 12 base64 chars
    }

    #[test]
    fn message_id_is_uuid_v4() {
        let id = MessageId::new();
        let parsed = uuid::Uuid::parse_str(id.as_str()).unwrap();
        assert_eq!(parsed.get_version_num(), 4);
    }

    #[test]
    fn message_id_orders_lexicographically() {
        assert!(MessageId::from_canonical("a") < MessageId::from_canonical("b"));
        assert!(MessageId::from_canonical("10") < MessageId::from_canonical("9"));
    }

    #[test]
    fn timestamp_next_saturates() {
        assert_eq!(Timestamp::from_millis(u64::MAX).next().as_millis(), u64::MAX);
        assert_eq!(Timestamp::from_millis(5).next().as_millis(), 6);
    }

    #[test]
    fn timestamp_distance_helpers() {
        let early = Timestamp::from_millis(1_000);
        let late = Timestamp::from_millis(4_000);
        assert_eq!(early.abs_diff(late), 3_000);
        assert_eq!(late.abs_diff(early), 3_000);
        assert_eq!(early.millis_until(late), 3_000);
        assert_eq!(late.millis_until(early), 0);
        assert_eq!(early.add_millis(500), Timestamp::from_millis(1_500));
    }
}
