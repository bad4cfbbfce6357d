//! Per-sender logical clock.
//!
//! Wall clocks drift and can repeat values when two messages are created in
//! the same millisecond. The logical clock folds a sequence component into
//! the timestamp: every value it hands out is strictly greater than the last
//! one, and strictly greater than any timestamp it has observed from the
//! store. Local messages therefore always sort after what the sender had
//! already seen, whatever the peer's clock says.

use duet_chat_types::Timestamp;

/// Monotonic timestamp source for locally created messages.
#[derive(Debug, Clone, Default)]
pub struct LocalClock {
    last: Option<Timestamp>,
}

impl LocalClock {
    /// Create a clock that has not issued or observed anything yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue the timestamp for a new local message.
    ///
    /// Returns `now` unless that would not be strictly after the last issued
    /// or observed value, in which case the last value plus one.
    pub fn next(&mut self, now: Timestamp) -> Timestamp {
        let issued = match self.last {
            Some(last) if now <= last => last.next(),
            _ => now,
        };
        self.last = Some(issued);
        issued
    }

    /// Record a timestamp seen on a merged message.
    pub fn observe(&mut self, seen: Timestamp) {
        if self.last.map_or(true, |last| seen > last) {
            self.last = Some(seen);
        }
    }

    /// The most recent issued or observed timestamp.
    pub fn last(&self) -> Option<Timestamp> {
        self.last
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(ms: u64) -> Timestamp {
        Timestamp::from_millis(ms)
    }

    #[test]
    fn follows_wall_clock_when_it_advances() {
        let mut clock = LocalClock::new();
        assert_eq!(clock.next(ts(100)), ts(100));
        assert_eq!(clock.next(ts(250)), ts(250));
    }

    #[test]
    fn same_millisecond_gets_distinct_values() {
        let mut clock = LocalClock::new();
        let a = clock.next(ts(100));
        let b = clock.next(ts(100));
        let c = clock.next(ts(100));
        assert!(a < b && b < c);
    }

    #[test]
    fn wall_clock_stepping_back_keeps_monotonic() {
        let mut clock = LocalClock::new();
        clock.next(ts(1_000));
        let after_skew = clock.next(ts(400));
        assert_eq!(after_skew, ts(1_001));
    }

    #[test]
    fn observed_remote_time_pushes_clock_forward() {
        let mut clock = LocalClock::new();
        clock.next(ts(100));
        // Peer's clock runs ahead of ours.
        clock.observe(ts(5_000));
        assert_eq!(clock.next(ts(200)), ts(5_001));
    }

    #[test]
    fn observing_older_time_is_ignored() {
        let mut clock = LocalClock::new();
        clock.next(ts(900));
        clock.observe(ts(10));
        assert_eq!(clock.last(), Some(ts(900)));
    }
}
