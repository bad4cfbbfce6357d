//! Typing-presence state machines.
//!
//! [`TypingState`] debounces the local user's keystrokes: a burst of
//! keystrokes produces exactly one "typing" publication when it starts and
//! one "idle" publication once the keyboard has been quiet for the idle
//! timeout. [`PeerTyping`] tracks what peers last reported and treats stale
//! reports as idle, so a dropped "idle" publication cannot leave an
//! indicator stuck on.
//!
//! Both are pure: the caller supplies the time and performs the returned
//! actions.

use std::collections::HashMap;

use duet_chat_types::{ParticipantId, Timestamp};

/// Default quiet period after which the local user counts as idle.
pub const DEFAULT_TYPING_IDLE_MS: u64 = 2_000;

/// Default age after which a peer's "typing" report is ignored.
pub const DEFAULT_TYPING_FRESHNESS_MS: u64 = 5_000;

/// Local typing state machine - NO I/O, just state transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TypingState {
    /// Not typing.
    #[default]
    Idle,
    /// Typing; goes idle at `deadline` unless another keystroke arrives.
    Typing {
        /// When the idle timeout expires.
        deadline: Timestamp,
    },
}

/// Inputs to the local typing state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypingEvent {
    /// The user pressed a key.
    Keystroke {
        /// Current time.
        now: Timestamp,
    },
    /// A timer fired.
    Tick {
        /// Current time.
        now: Timestamp,
    },
    /// Typing ended explicitly (message sent, conversation left).
    Stop,
}

/// Actions for the caller to execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypingAction {
    /// Publish the local typing state.
    Publish {
        /// Whether the user is typing.
        is_typing: bool,
    },
    /// Make sure a timer fires at `deadline`.
    ArmTimer {
        /// When to deliver the next [`TypingEvent::Tick`].
        deadline: Timestamp,
    },
    /// Any pending timer can be dropped.
    CancelTimer,
}

impl TypingState {
    /// Create a state machine in the Idle state.
    pub fn new() -> Self {
        Self::Idle
    }

    /// Process an event and return the new state plus actions to execute.
    pub fn on_event(self, event: TypingEvent, idle_ms: u64) -> (Self, Vec<TypingAction>) {
        match (self, event) {
            (Self::Idle, TypingEvent::Keystroke { now }) => {
                let deadline = now.add_millis(idle_ms);
                (
                    Self::Typing { deadline },
                    vec![
                        TypingAction::Publish { is_typing: true },
                        TypingAction::ArmTimer { deadline },
                    ],
                )
            }
            // Each keystroke pushes the deadline out; nothing is published.
            (Self::Typing { .. }, TypingEvent::Keystroke { now }) => {
                let deadline = now.add_millis(idle_ms);
                (
                    Self::Typing { deadline },
                    vec![TypingAction::ArmTimer { deadline }],
                )
            }
            (Self::Typing { deadline }, TypingEvent::Tick { now }) if now >= deadline => (
                Self::Idle,
                vec![TypingAction::Publish { is_typing: false }],
            ),
            (Self::Typing { .. }, TypingEvent::Stop) => (
                Self::Idle,
                vec![
                    TypingAction::Publish { is_typing: false },
                    TypingAction::CancelTimer,
                ],
            ),
            // Early ticks and idle events change nothing.
            (state, _) => (state, vec![]),
        }
    }

    /// Check if currently typing.
    pub fn is_typing(&self) -> bool {
        matches!(self, Self::Typing { .. })
    }

    /// The pending idle deadline, if typing.
    pub fn deadline(&self) -> Option<Timestamp> {
        match self {
            Self::Typing { deadline } => Some(*deadline),
            Self::Idle => None,
        }
    }
}

/// Last report received from one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TypingEntry {
    is_typing: bool,
    updated_at: Timestamp,
}

/// Inbound typing state per peer, last-write-wins with expiry.
#[derive(Debug, Clone)]
pub struct PeerTyping {
    freshness_ms: u64,
    peers: HashMap<ParticipantId, TypingEntry>,
}

impl PeerTyping {
    /// Create a tracker that ignores reports older than `freshness_ms`.
    pub fn new(freshness_ms: u64) -> Self {
        Self {
            freshness_ms,
            peers: HashMap::new(),
        }
    }

    /// Record a report from `peer`.
    ///
    /// Reports older than the stored one are dropped. Returns whether the
    /// effective state (as seen by [`is_typing`](Self::is_typing)) changed.
    pub fn update(&mut self, peer: &ParticipantId, is_typing: bool, now: Timestamp) -> bool {
        if let Some(existing) = self.peers.get(peer) {
            if now < existing.updated_at {
                return false;
            }
        }
        let before = self.is_typing(peer, now);
        self.peers.insert(
            peer.clone(),
            TypingEntry {
                is_typing,
                updated_at: now,
            },
        );
        before != is_typing
    }

    /// Whether `peer` is typing at `now`.
    pub fn is_typing(&self, peer: &ParticipantId, now: Timestamp) -> bool {
        self.peers
            .get(peer)
            .map_or(false, |entry| self.is_fresh_typing(entry, now))
    }

    /// When the oldest live "typing" report goes stale.
    pub fn next_expiry(&self, now: Timestamp) -> Option<Timestamp> {
        self.peers
            .values()
            .filter(|entry| self.is_fresh_typing(entry, now))
            .map(|entry| entry.updated_at.add_millis(self.freshness_ms))
            .min()
    }

    /// Turn stale "typing" reports into idle ones.
    ///
    /// Returns the peers whose indicator went off.
    pub fn prune(&mut self, now: Timestamp) -> Vec<ParticipantId> {
        let freshness = self.freshness_ms;
        let mut expired = Vec::new();
        for (peer, entry) in self.peers.iter_mut() {
            if entry.is_typing && entry.updated_at.millis_until(now) >= freshness {
                entry.is_typing = false;
                expired.push(peer.clone());
            }
        }
        expired.sort();
        expired
    }

    /// Forget every peer.
    pub fn clear(&mut self) {
        self.peers.clear();
    }

    fn is_fresh_typing(&self, entry: &TypingEntry, now: Timestamp) -> bool {
        entry.is_typing && entry.updated_at.millis_until(now) < self.freshness_ms
    }
}
