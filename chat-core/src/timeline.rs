//! Ordered, deduplicated message list for one conversation.
//!
//! The timeline is the pure half of the sync engine. It owns the list and
//! implements every mutation: optimistic inserts, store acknowledgements,
//! snapshot merges with echo reconciliation, read marking and pending
//! expiry. Time is passed in by the caller; nothing here sleeps or does I/O.
//!
//! Invariant: after every public method returns, the list is sorted by
//! (`created_at`, `id`) and holds at most one entry per id.

use std::collections::HashSet;

use duet_chat_types::{
    ConversationKey, DeliveryState, Message, MessageId, ParticipantId, StoreMessage, Timestamp,
};
use thiserror::Error;

/// Default width of the reconciliation window.
pub const DEFAULT_RECONCILIATION_WINDOW_MS: u64 = 3_000;

/// Default age after which an unconfirmed pending message fails.
pub const DEFAULT_PENDING_TIMEOUT_MS: u64 = 3_000;

/// Timing bounds used when matching echoes and expiring pending entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcilePolicy {
    /// Maximum distance between a local entry and its remote echo.
    pub window_ms: u64,
    /// Age after which a pending entry absent from the store fails.
    pub pending_timeout_ms: u64,
}

impl Default for ReconcilePolicy {
    fn default() -> Self {
        Self {
            window_ms: DEFAULT_RECONCILIATION_WINDOW_MS,
            pending_timeout_ms: DEFAULT_PENDING_TIMEOUT_MS,
        }
    }
}

/// Timeline errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimelineError {
    /// No message with this id in the timeline.
    #[error("unknown message: {0}")]
    UnknownMessage(MessageId),

    /// The message exists but is not in the `Failed` state.
    #[error("message {0} has not failed")]
    NotFailed(MessageId),
}

/// A local entry that absorbed a remote echo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciled {
    /// Client-generated id of the local entry.
    pub local_id: MessageId,
    /// Canonical id adopted from the store.
    pub canonical_id: MessageId,
}

/// An echo that matched more than one local entry.
///
/// The earliest-created candidate wins; this is reported so the caller can
/// log it as a data-quality signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmbiguousEcho {
    /// Canonical id of the remote record.
    pub canonical_id: MessageId,
    /// Local id of the entry that was chosen.
    pub chosen: MessageId,
    /// Number of entries that matched.
    pub candidates: usize,
}

/// Result of merging a store snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Remote messages that were not known locally.
    pub inserted: Vec<MessageId>,
    /// Local entries folded together with their remote echo.
    pub reconciled: Vec<Reconciled>,
    /// Known messages whose timestamp or delivery state changed.
    pub updated: Vec<MessageId>,
    /// Pending entries that expired while absent from the store.
    pub failed: Vec<MessageId>,
    /// Echoes that matched more than one local entry.
    pub ambiguous: Vec<AmbiguousEcho>,
    /// Records skipped because they belong to another conversation.
    pub foreign: usize,
}

impl MergeOutcome {
    /// Whether the visible list changed.
    pub fn changed(&self) -> bool {
        !self.inserted.is_empty()
            || !self.reconciled.is_empty()
            || !self.updated.is_empty()
            || !self.failed.is_empty()
    }
}

/// Result of applying a store acknowledgement to a local send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    /// The pending entry adopted the canonical id.
    Confirmed {
        /// Canonical id.
        id: MessageId,
    },
    /// A snapshot echo had already been merged; any stale copy was dropped.
    AlreadyConfirmed {
        /// Canonical id.
        id: MessageId,
    },
    /// The local id was gone; an entry was matched through the window.
    Reconciled {
        /// Canonical id.
        id: MessageId,
        /// Set when more than one entry matched.
        ambiguous: Option<AmbiguousEcho>,
    },
    /// No local entry matched; the record was inserted as-is.
    Inserted {
        /// Canonical id.
        id: MessageId,
    },
    /// The local entry had already failed, or the record is foreign.
    Ignored,
}

/// Result of marking messages read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadOutcome {
    /// Messages that transitioned to `Read`.
    pub marked: Vec<MessageId>,
    /// Newest marked message, to persist as the store's read marker.
    pub store_marker: Option<MessageId>,
}

/// The ordered message list of one conversation.
#[derive(Debug, Clone)]
pub struct Timeline {
    key: ConversationKey,
    local: ParticipantId,
    policy: ReconcilePolicy,
    messages: Vec<Message>,
}

impl Timeline {
    /// Create an empty timeline for `key`, viewed by `local`.
    pub fn new(key: ConversationKey, local: ParticipantId, policy: ReconcilePolicy) -> Self {
        Self {
            key,
            local,
            policy,
            messages: Vec::new(),
        }
    }

    /// The conversation this timeline belongs to.
    pub fn key(&self) -> &ConversationKey {
        &self.key
    }

    /// The participant viewing this timeline.
    pub fn local(&self) -> &ParticipantId {
        &self.local
    }

    /// Timing bounds in use.
    pub fn policy(&self) -> ReconcilePolicy {
        self.policy
    }

    /// The ordered messages.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Number of messages.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Check if the timeline is empty.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Look up a message by its current id.
    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| &m.id == id)
    }

    /// Look up a locally originated message by its client-generated id.
    pub fn find_local(&self, local_id: &MessageId) -> Option<&Message> {
        self.messages
            .iter()
            .find(|m| m.local_id.as_ref() == Some(local_id))
    }

    /// Check the ordering invariant.
    pub fn is_ordered(&self) -> bool {
        self.messages
            .windows(2)
            .all(|pair| pair[0].order_key() < pair[1].order_key())
    }

    /// Insert a locally created message in sorted position.
    pub fn insert_local(&mut self, message: Message) {
        let at = self
            .messages
            .partition_point(|m| m.order_key() < message.order_key());
        self.messages.insert(at, message);
    }

    /// Apply the store's acknowledgement of the local send `local_id`.
    pub fn acknowledge(&mut self, local_id: &MessageId, record: &StoreMessage) -> AckOutcome {
        if record.conversation_key != self.key {
            return AckOutcome::Ignored;
        }

        // A snapshot delivered the echo before the acknowledgement.
        if &record.id != local_id && self.position(&record.id).is_some() {
            if let Some(stale) = self.position(local_id) {
                self.messages.remove(stale);
            }
            if let Some(idx) = self.position(&record.id) {
                self.messages[idx]
                    .local_id
                    .get_or_insert_with(|| local_id.clone());
                self.adopt(idx, record);
            }
            self.sort();
            return AckOutcome::AlreadyConfirmed {
                id: record.id.clone(),
            };
        }

        if let Some(idx) = self.position(local_id) {
            if self.messages[idx].delivery_state == DeliveryState::Failed {
                return AckOutcome::Ignored;
            }
            self.adopt(idx, record);
            self.sort();
            return AckOutcome::Confirmed {
                id: record.id.clone(),
            };
        }

        // The entry was bound to another echo of the same text.
        let snapshot_ids = HashSet::from([&record.id]);
        if let Some((idx, candidates)) = self.match_echo(record, &snapshot_ids) {
            let ambiguous = self.ambiguity(record, idx, candidates);
            self.adopt(idx, record);
            self.sort();
            return AckOutcome::Reconciled {
                id: record.id.clone(),
                ambiguous,
            };
        }

        self.messages.push(Message::from_store(record));
        self.sort();
        AckOutcome::Inserted {
            id: record.id.clone(),
        }
    }

    /// Mark a pending message failed.
    ///
    /// Returns `false` if the message is unknown or no longer pending.
    pub fn fail(&mut self, id: &MessageId) -> bool {
        match self.messages.iter_mut().find(|m| &m.id == id) {
            Some(m) if m.delivery_state == DeliveryState::Pending => {
                m.delivery_state = DeliveryState::Failed;
                true
            }
            _ => false,
        }
    }

    /// Remove a failed entry so its text can be sent again as a new message.
    pub fn discard_failed(&mut self, id: &MessageId) -> Result<Message, TimelineError> {
        let idx = self
            .position(id)
            .ok_or_else(|| TimelineError::UnknownMessage(id.clone()))?;
        if self.messages[idx].delivery_state != DeliveryState::Failed {
            return Err(TimelineError::NotFailed(id.clone()));
        }
        Ok(self.messages.remove(idx))
    }

    /// Merge a full or incremental snapshot from the store.
    ///
    /// Union by id. A record with an unknown id is folded into a local,
    /// not-yet-canonical entry from the same sender with identical text
    /// whose timestamp lies within the reconciliation window; otherwise it
    /// is inserted. Pending entries older than the pending timeout that the
    /// snapshot does not confirm become `Failed`.
    pub fn apply_snapshot(&mut self, records: &[StoreMessage], now: Timestamp) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();

        let mut seen = HashSet::new();
        let mut ordered: Vec<&StoreMessage> = Vec::with_capacity(records.len());
        for record in records {
            if record.conversation_key != self.key {
                outcome.foreign += 1;
                continue;
            }
            if seen.insert(&record.id) {
                ordered.push(record);
            }
        }
        // Earliest echoes pair with the earliest optimistic entries.
        ordered.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));

        let snapshot_ids: HashSet<&MessageId> = ordered.iter().copied().map(|r| &r.id).collect();
        let mut confirmed: HashSet<MessageId> = HashSet::new();

        for record in ordered {
            if let Some(idx) = self.position(&record.id) {
                if self.adopt(idx, record) {
                    outcome.updated.push(record.id.clone());
                }
                confirmed.insert(record.id.clone());
                continue;
            }

            if let Some((idx, candidates)) = self.match_echo(record, &snapshot_ids) {
                if let Some(ambiguous) = self.ambiguity(record, idx, candidates) {
                    outcome.ambiguous.push(ambiguous);
                }
                let local_id = self.messages[idx]
                    .local_id
                    .clone()
                    .unwrap_or_else(|| self.messages[idx].id.clone());
                self.adopt(idx, record);
                outcome.reconciled.push(Reconciled {
                    local_id,
                    canonical_id: record.id.clone(),
                });
                confirmed.insert(record.id.clone());
                continue;
            }

            self.messages.push(Message::from_store(record));
            outcome.inserted.push(record.id.clone());
            confirmed.insert(record.id.clone());
        }

        outcome.failed = self.expire_where(now, |m| !confirmed.contains(&m.id));
        self.sort();
        outcome
    }

    /// Mark peer messages up to `upto` (inclusive, by `created_at`) read.
    ///
    /// Idempotent: a boundary that is already read marks nothing and yields
    /// no store marker.
    pub fn mark_read(&mut self, upto: &MessageId) -> Result<ReadOutcome, TimelineError> {
        let boundary = self
            .get(upto)
            .map(|m| m.created_at)
            .ok_or_else(|| TimelineError::UnknownMessage(upto.clone()))?;

        let mut outcome = ReadOutcome::default();
        for message in self.messages.iter_mut() {
            if message.created_at > boundary {
                break;
            }
            if message.sender_id == self.local || message.delivery_state.is_terminal() {
                continue;
            }
            message.delivery_state = DeliveryState::Read;
            outcome.marked.push(message.id.clone());
        }
        outcome.store_marker = outcome.marked.last().cloned();
        Ok(outcome)
    }

    /// Record that the local client has observed the peer's messages.
    ///
    /// Peer messages still at `Sent` become `Delivered`; their ids are
    /// returned so the store can be told.
    pub fn mark_observed(&mut self) -> Vec<MessageId> {
        let mut observed = Vec::new();
        for message in self.messages.iter_mut() {
            if message.sender_id != self.local && message.delivery_state == DeliveryState::Sent {
                message.delivery_state = DeliveryState::Delivered;
                observed.push(message.id.clone());
            }
        }
        observed
    }

    fn position(&self, id: &MessageId) -> Option<usize> {
        self.messages.iter().position(|m| &m.id == id)
    }

    fn sort(&mut self) {
        self.messages.sort_by(|a, b| a.order_key().cmp(&b.order_key()));
    }

    /// Adopt the store's id, timestamp and delivery state. Failed entries
    /// are left alone. Returns whether anything changed.
    fn adopt(&mut self, idx: usize, record: &StoreMessage) -> bool {
        let entry = &mut self.messages[idx];
        if entry.delivery_state == DeliveryState::Failed {
            return false;
        }
        let state = entry.delivery_state.advance(record.delivery_state());
        let changed = entry.id != record.id
            || entry.created_at != record.created_at
            || entry.delivery_state != state;
        entry.id = record.id.clone();
        entry.created_at = record.created_at;
        entry.delivery_state = state;
        changed
    }

    /// Find the local entry a remote echo belongs to.
    ///
    /// Candidates are locally originated, `Pending` or `Sent`, not yet bound
    /// to a canonical id, from the same sender, with identical text, within
    /// the window, and not themselves present in the snapshot. The earliest
    /// candidate wins. Returns its index and the candidate count.
    fn match_echo(
        &self,
        record: &StoreMessage,
        snapshot_ids: &HashSet<&MessageId>,
    ) -> Option<(usize, usize)> {
        let window = self.policy.window_ms;
        let mut best: Option<usize> = None;
        let mut count = 0;
        for (idx, m) in self.messages.iter().enumerate() {
            let unbound = m.local_id.as_ref() == Some(&m.id);
            let open = matches!(
                m.delivery_state,
                DeliveryState::Pending | DeliveryState::Sent
            );
            if unbound
                && open
                && m.sender_id == record.sender_id
                && m.text == record.text
                && m.created_at.abs_diff(record.created_at) <= window
                && !snapshot_ids.contains(&m.id)
            {
                count += 1;
                let earlier = best.map_or(true, |b| {
                    m.order_key() < self.messages[b].order_key()
                });
                if earlier {
                    best = Some(idx);
                }
            }
        }
        best.map(|idx| (idx, count))
    }

    fn ambiguity(
        &self,
        record: &StoreMessage,
        idx: usize,
        candidates: usize,
    ) -> Option<AmbiguousEcho> {
        (candidates > 1).then(|| AmbiguousEcho {
            canonical_id: record.id.clone(),
            chosen: self.messages[idx].id.clone(),
            candidates,
        })
    }

    fn expire_where(
        &mut self,
        now: Timestamp,
        eligible: impl Fn(&Message) -> bool,
    ) -> Vec<MessageId> {
        let timeout = self.policy.pending_timeout_ms;
        let mut failed = Vec::new();
        for message in self.messages.iter_mut() {
            if message.delivery_state == DeliveryState::Pending
                && message.created_at.millis_until(now) >= timeout
                && eligible(&*message)
            {
                message.delivery_state = DeliveryState::Failed;
                failed.push(message.id.clone());
            }
        }
        failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(s: &str) -> ParticipantId {
        ParticipantId::new(s).unwrap()
    }

    fn ts(ms: u64) -> Timestamp {
        Timestamp::from_millis(ms)
    }

    fn key() -> ConversationKey {
        ConversationKey::derive(&pid("alice"), &pid("bob")).unwrap()
    }

    fn timeline() -> Timeline {
        Timeline::new(key(), pid("alice"), ReconcilePolicy::default())
    }

    fn local(text: &str, at: u64) -> Message {
        Message::pending(key(), pid("alice"), text, ts(at))
    }

    fn record(id: &str, sender: &str, text: &str, at: u64) -> StoreMessage {
        StoreMessage {
            id: MessageId::from_canonical(id),
            conversation_key: key(),
            sender_id: pid(sender),
            text: text.into(),
            created_at: ts(at),
            delivered: false,
            read: false,
        }
    }

    fn states(t: &Timeline) -> Vec<DeliveryState> {
        t.messages().iter().map(|m| m.delivery_state).collect()
    }

    // ===========================================
    // Ordering
    // ===========================================

    #[test]
    fn local_inserts_stay_ordered() {
        let mut t = timeline();
        for at in [500, 100, 300, 100, 900, 0] {
            t.insert_local(local("x", at));
            assert!(t.is_ordered());
        }
        assert_eq!(t.len(), 6);
    }

    #[test]
    fn equal_timestamps_break_ties_by_id() {
        let mut t = timeline();
        t.apply_snapshot(
            &[
                record("b", "bob", "two", 100),
                record("a", "bob", "one", 100),
            ],
            ts(100),
        );
        let ids: Vec<_> = t.messages().iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn remote_entries_insert_in_sorted_position() {
        let mut t = timeline();
        t.insert_local(local("mine", 200));
        t.apply_snapshot(&[record("r1", "bob", "before", 100)], ts(250));
        t.apply_snapshot(&[record("r2", "bob", "after", 300)], ts(350));
        let texts: Vec<_> = t.messages().iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["before", "mine", "after"]);
        assert!(t.is_ordered());
    }

    // ===========================================
    // Acknowledgement
    // ===========================================

    #[test]
    fn ack_confirms_pending_in_place() {
        let mut t = timeline();
        let msg = local("hi", 1_000);
        let local_id = msg.id.clone();
        t.insert_local(msg);

        let outcome = t.acknowledge(&local_id, &record("srv-1", "alice", "hi", 1_020));

        assert_eq!(
            outcome,
            AckOutcome::Confirmed {
                id: MessageId::from_canonical("srv-1")
            }
        );
        assert_eq!(t.len(), 1);
        let entry = &t.messages()[0];
        assert_eq!(entry.id.as_str(), "srv-1");
        assert_eq!(entry.local_id.as_ref(), Some(&local_id));
        assert_eq!(entry.created_at, ts(1_020));
        assert_eq!(entry.delivery_state, DeliveryState::Sent);
    }

    #[test]
    fn ack_with_same_id_keeps_identifier() {
        let mut t = timeline();
        let msg = local("hi", 1_000);
        let local_id = msg.id.clone();
        t.insert_local(msg);

        let mut echo = record(local_id.as_str(), "alice", "hi", 1_000);
        echo.id = local_id.clone();
        t.acknowledge(&local_id, &echo);

        assert_eq!(t.messages()[0].id, local_id);
        assert_eq!(t.messages()[0].delivery_state, DeliveryState::Sent);
    }

    #[test]
    fn ack_after_snapshot_echo_does_not_duplicate() {
        let mut t = timeline();
        let msg = local("hi", 1_000);
        let local_id = msg.id.clone();
        t.insert_local(msg);

        let echo = record("srv-1", "alice", "hi", 1_050);
        t.apply_snapshot(&[echo.clone()], ts(1_060));
        let outcome = t.acknowledge(&local_id, &echo);

        assert!(matches!(outcome, AckOutcome::AlreadyConfirmed { .. }));
        assert_eq!(t.len(), 1);
        assert_eq!(t.messages()[0].delivery_state, DeliveryState::Sent);
    }

    #[test]
    fn ack_drops_stale_copy_when_echo_was_inserted_separately() {
        let mut t = Timeline::new(
            key(),
            pid("alice"),
            ReconcilePolicy {
                window_ms: 10,
                pending_timeout_ms: 60_000,
            },
        );
        let msg = local("hi", 1_000);
        let local_id = msg.id.clone();
        t.insert_local(msg);

        // Server timestamp far outside the window: inserted as a new entry.
        let echo = record("srv-1", "alice", "hi", 9_000);
        t.apply_snapshot(&[echo.clone()], ts(1_100));
        assert_eq!(t.len(), 2);

        t.acknowledge(&local_id, &echo);
        assert_eq!(t.len(), 1);
        assert_eq!(t.messages()[0].local_id.as_ref(), Some(&local_id));
    }

    #[test]
    fn ack_for_failed_entry_is_ignored() {
        let mut t = timeline();
        let msg = local("hi", 1_000);
        let local_id = msg.id.clone();
        t.insert_local(msg);
        assert!(t.fail(&local_id));

        let outcome = t.acknowledge(&local_id, &record("srv-1", "alice", "hi", 1_000));
        assert_eq!(outcome, AckOutcome::Ignored);
        assert_eq!(t.messages()[0].delivery_state, DeliveryState::Failed);
    }

    #[test]
    fn ack_for_unknown_send_inserts_record() {
        let mut t = timeline();
        let outcome = t.acknowledge(&MessageId::new(), &record("srv-9", "alice", "hey", 10));
        assert!(matches!(outcome, AckOutcome::Inserted { .. }));
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn ack_from_other_conversation_is_ignored() {
        let mut t = timeline();
        let mut foreign = record("x", "alice", "hi", 1);
        foreign.conversation_key = ConversationKey::derive(&pid("alice"), &pid("carol")).unwrap();
        assert_eq!(t.acknowledge(&MessageId::new(), &foreign), AckOutcome::Ignored);
        assert!(t.is_empty());
    }

    // ===========================================
    // Snapshot reconciliation
    // ===========================================

    #[test]
    fn echo_within_window_folds_into_pending() {
        let mut t = timeline();
        let msg = local("hi", 1_000);
        let local_id = msg.id.clone();
        t.insert_local(msg);

        let outcome = t.apply_snapshot(&[record("srv-1", "alice", "hi", 2_500)], ts(2_600));

        assert_eq!(t.len(), 1, "echo must not be shown twice");
        assert_eq!(
            outcome.reconciled,
            vec![Reconciled {
                local_id,
                canonical_id: MessageId::from_canonical("srv-1")
            }]
        );
        assert_eq!(t.messages()[0].delivery_state, DeliveryState::Sent);
        assert_eq!(t.messages()[0].created_at, ts(2_500));
    }

    #[test]
    fn echo_outside_window_is_a_separate_message() {
        let mut t = timeline();
        t.insert_local(local("hi", 1_000));
        let outcome = t.apply_snapshot(&[record("srv-1", "alice", "hi", 4_001)], ts(1_500));
        assert_eq!(outcome.inserted.len(), 1);
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn echo_with_different_text_or_sender_is_not_folded() {
        let mut t = timeline();
        t.insert_local(local("hi", 1_000));
        t.apply_snapshot(
            &[
                record("r1", "alice", "hi!", 1_000),
                record("r2", "bob", "hi", 1_000),
            ],
            ts(1_100),
        );
        assert_eq!(t.len(), 3);
        assert_eq!(
            t.messages()
                .iter()
                .filter(|m| m.delivery_state == DeliveryState::Pending)
                .count(),
            1
        );
    }

    #[test]
    fn snapshot_union_is_idempotent() {
        let mut t = timeline();
        let snapshot = vec![
            record("r1", "bob", "one", 10),
            record("r2", "bob", "two", 20),
        ];
        let first = t.apply_snapshot(&snapshot, ts(30));
        assert!(first.changed());
        let second = t.apply_snapshot(&snapshot, ts(30));
        assert!(!second.changed());
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn duplicate_records_in_one_snapshot_merge_once() {
        let mut t = timeline();
        let r = record("r1", "bob", "one", 10);
        t.apply_snapshot(&[r.clone(), r], ts(30));
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn foreign_records_are_skipped() {
        let mut t = timeline();
        let mut foreign = record("x", "carol", "psst", 5);
        foreign.conversation_key = ConversationKey::derive(&pid("alice"), &pid("carol")).unwrap();
        let outcome = t.apply_snapshot(&[foreign], ts(10));
        assert_eq!(outcome.foreign, 1);
        assert!(t.is_empty());
    }

    #[test]
    fn incremental_snapshot_keeps_earlier_messages() {
        let mut t = timeline();
        t.apply_snapshot(&[record("r1", "bob", "one", 10)], ts(10));
        t.apply_snapshot(&[record("r2", "bob", "two", 20)], ts(20));
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn peer_repeating_text_is_never_folded() {
        let mut t = timeline();
        t.apply_snapshot(&[record("r1", "bob", "ok", 10)], ts(10));
        t.apply_snapshot(&[record("r2", "bob", "ok", 20)], ts(20));
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn two_rapid_identical_sends_stay_distinct() {
        let mut t = timeline();
        let first = local("same text", 1_000);
        let second = local("same text", 1_050);
        let (first_id, second_id) = (first.id.clone(), second.id.clone());
        t.insert_local(first);
        t.insert_local(second);

        let outcome = t.apply_snapshot(
            &[
                record("srv-b", "alice", "same text", 1_060),
                record("srv-a", "alice", "same text", 1_010),
            ],
            ts(1_100),
        );

        assert_eq!(t.len(), 2);
        assert_eq!(outcome.reconciled.len(), 2);
        // Earliest echo pairs with the earliest optimistic entry.
        assert_eq!(t.find_local(&first_id).unwrap().id.as_str(), "srv-a");
        assert_eq!(t.find_local(&second_id).unwrap().id.as_str(), "srv-b");
        assert!(t.is_ordered());
    }

    #[test]
    fn ambiguous_echo_picks_earliest_pending() {
        let mut t = timeline();
        let first = local("dup", 1_000);
        let first_id = first.id.clone();
        t.insert_local(first);
        t.insert_local(local("dup", 1_200));

        let outcome = t.apply_snapshot(&[record("srv-1", "alice", "dup", 1_100)], ts(1_300));

        assert_eq!(outcome.ambiguous.len(), 1);
        assert_eq!(outcome.ambiguous[0].candidates, 2);
        assert_eq!(t.find_local(&first_id).unwrap().id.as_str(), "srv-1");
        assert_eq!(
            t.messages()
                .iter()
                .filter(|m| m.delivery_state == DeliveryState::Pending)
                .count(),
            1
        );
    }

    #[test]
    fn confirmed_entry_never_absorbs_a_later_echo() {
        let mut t = timeline();
        let first = local("ok", 1_000);
        let first_id = first.id.clone();
        t.insert_local(first);
        t.acknowledge(&first_id, &record("srv-1", "alice", "ok", 1_000));

        let second = local("ok", 1_500);
        let second_id = second.id.clone();
        t.insert_local(second);

        // Incremental snapshot carrying only the second echo.
        t.apply_snapshot(&[record("srv-2", "alice", "ok", 1_500)], ts(1_600));

        assert_eq!(t.len(), 2);
        assert_eq!(t.find_local(&first_id).unwrap().id.as_str(), "srv-1");
        assert_eq!(t.find_local(&second_id).unwrap().id.as_str(), "srv-2");
    }

    #[test]
    fn store_flags_advance_delivery_state() {
        let mut t = timeline();
        let msg = local("hi", 1_000);
        let local_id = msg.id.clone();
        t.insert_local(msg);
        let mut echo = record("srv-1", "alice", "hi", 1_000);
        t.acknowledge(&local_id, &echo);

        echo.delivered = true;
        t.apply_snapshot(&[echo.clone()], ts(1_100));
        assert_eq!(states(&t), vec![DeliveryState::Delivered]);

        echo.read = true;
        t.apply_snapshot(&[echo.clone()], ts(1_200));
        assert_eq!(states(&t), vec![DeliveryState::Read]);

        // Stale snapshot never moves the state back.
        echo.read = false;
        echo.delivered = false;
        let outcome = t.apply_snapshot(&[echo], ts(1_300));
        assert!(!outcome.changed());
        assert_eq!(states(&t), vec![DeliveryState::Read]);
    }

    // ===========================================
    // Pending expiry
    // ===========================================

    #[test]
    fn pending_absent_after_timeout_fails() {
        let mut t = timeline();
        let msg = local("hi", 0);
        let id = msg.id.clone();
        t.insert_local(msg);

        let early = t.apply_snapshot(&[], ts(2_999));
        assert!(early.failed.is_empty());

        let late = t.apply_snapshot(&[], ts(3_000));
        assert_eq!(late.failed, vec![id]);
        assert_eq!(states(&t), vec![DeliveryState::Failed]);
    }

    #[test]
    fn pending_confirmed_by_snapshot_does_not_fail() {
        let mut t = timeline();
        t.insert_local(local("hi", 0));
        let outcome = t.apply_snapshot(&[record("srv-1", "alice", "hi", 100)], ts(10_000));
        assert!(outcome.failed.is_empty());
        assert_eq!(states(&t), vec![DeliveryState::Sent]);
    }

    #[test]
    fn failed_entry_does_not_absorb_echo() {
        let mut t = timeline();
        let msg = local("hi", 0);
        let id = msg.id.clone();
        t.insert_local(msg);
        t.fail(&id);

        t.apply_snapshot(&[record("srv-1", "alice", "hi", 10)], ts(20));
        assert_eq!(t.len(), 2);
        assert_eq!(t.get(&id).unwrap().delivery_state, DeliveryState::Failed);
    }

    #[test]
    fn fail_only_affects_pending() {
        let mut t = timeline();
        t.apply_snapshot(&[record("r1", "bob", "yo", 10)], ts(10));
        assert!(!t.fail(&MessageId::from_canonical("r1")));
        assert!(!t.fail(&MessageId::from_canonical("missing")));
    }

    #[test]
    fn discard_failed_removes_only_failed_entries() {
        let mut t = timeline();
        let failed = local("lost", 100);
        let failed_id = failed.id.clone();
        let pending = local("waiting", 200);
        let pending_id = pending.id.clone();
        t.insert_local(failed);
        t.insert_local(pending);
        t.fail(&failed_id);

        assert_eq!(
            t.discard_failed(&pending_id),
            Err(TimelineError::NotFailed(pending_id.clone()))
        );
        let removed = t.discard_failed(&failed_id).unwrap();
        assert_eq!(removed.text, "lost");
        assert_eq!(t.len(), 1);
        assert_eq!(
            t.discard_failed(&failed_id),
            Err(TimelineError::UnknownMessage(failed_id))
        );
    }

    // ===========================================
    // Read marking
    // ===========================================

    #[test]
    fn mark_read_covers_peer_messages_up_to_boundary() {
        let mut t = timeline();
        t.apply_snapshot(
            &[
                record("p1", "bob", "one", 10),
                record("a1", "alice", "mine", 15),
                record("p2", "bob", "two", 20),
                record("p3", "bob", "three", 30),
            ],
            ts(30),
        );

        let outcome = t.mark_read(&MessageId::from_canonical("p2")).unwrap();

        assert_eq!(
            outcome.marked,
            vec![
                MessageId::from_canonical("p1"),
                MessageId::from_canonical("p2")
            ]
        );
        assert_eq!(outcome.store_marker, Some(MessageId::from_canonical("p2")));
        assert_eq!(
            states(&t),
            vec![
                DeliveryState::Read,
                DeliveryState::Sent,
                DeliveryState::Read,
                DeliveryState::Sent
            ]
        );
    }

    #[test]
    fn mark_read_is_idempotent() {
        let mut t = timeline();
        t.apply_snapshot(
            &[record("p1", "bob", "one", 10), record("p2", "bob", "two", 20)],
            ts(30),
        );
        let boundary = MessageId::from_canonical("p2");

        t.mark_read(&boundary).unwrap();
        let after_once = t.messages().to_vec();
        let again = t.mark_read(&boundary).unwrap();

        assert!(again.marked.is_empty());
        assert_eq!(again.store_marker, None);
        assert_eq!(t.messages(), after_once.as_slice());
    }

    #[test]
    fn mark_read_on_own_message_marks_earlier_peer_messages() {
        let mut t = timeline();
        t.apply_snapshot(
            &[record("p1", "bob", "q?", 10), record("a1", "alice", "a.", 20)],
            ts(30),
        );
        let outcome = t.mark_read(&MessageId::from_canonical("a1")).unwrap();
        assert_eq!(outcome.store_marker, Some(MessageId::from_canonical("p1")));
    }

    #[test]
    fn mark_read_unknown_boundary_errors() {
        let mut t = timeline();
        let missing = MessageId::from_canonical("nope");
        assert_eq!(
            t.mark_read(&missing),
            Err(TimelineError::UnknownMessage(missing))
        );
    }

    #[test]
    fn mark_observed_advances_peer_sent_only() {
        let mut t = timeline();
        t.insert_local(local("mine", 5));
        t.apply_snapshot(&[record("p1", "bob", "one", 10)], ts(10));

        let observed = t.mark_observed();
        assert_eq!(observed, vec![MessageId::from_canonical("p1")]);
        assert_eq!(
            states(&t),
            vec![DeliveryState::Pending, DeliveryState::Delivered]
        );
        assert!(t.mark_observed().is_empty());
    }

    // ===========================================
    // Ordering property over a mixed sequence
    // ===========================================

    #[test]
    fn ordering_holds_after_every_mutation() {
        let mut t = timeline();
        let mut now = 0;
        let mut pending = Vec::new();
        for i in 0..20u64 {
            now += 37;
            let msg = local(&format!("m{}", i % 3), now);
            pending.push((msg.id.clone(), msg.text.clone(), now));
            t.insert_local(msg);
            assert!(t.is_ordered());

            if i % 4 == 0 {
                t.apply_snapshot(
                    &[record(&format!("peer-{i}"), "bob", "yo", now.saturating_sub(500))],
                    ts(now),
                );
                assert!(t.is_ordered());
            }
            if i % 5 == 0 {
                let (id, text, at) = pending.remove(0);
                t.acknowledge(&id, &record(&format!("srv-{i}"), "alice", &text, at + 7));
                assert!(t.is_ordered());
            }
        }
    }
}
