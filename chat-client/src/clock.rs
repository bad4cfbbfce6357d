//! Wall-clock source that follows the tokio timer.
//!
//! Anchors a wall-clock reading to a `tokio::time::Instant`, so elapsed time
//! comes from the runtime. Under `tokio::time::pause` the clock only moves
//! when the test advances it.

use std::time::{SystemTime, UNIX_EPOCH};

use duet_chat_types::Timestamp;
use tokio::time::Instant;

/// Millisecond wall clock driven by the tokio runtime.
#[derive(Debug, Clone, Copy)]
pub struct WallClock {
    origin: Timestamp,
    start: Instant,
}

impl WallClock {
    /// Anchor to the current system time.
    pub fn system() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Self::starting_at(Timestamp::from_millis(millis))
    }

    /// Anchor to a fixed origin.
    pub fn starting_at(origin: Timestamp) -> Self {
        Self {
            origin,
            start: Instant::now(),
        }
    }

    /// The current time.
    pub fn now(&self) -> Timestamp {
        self.origin.add_millis(self.start.elapsed().as_millis() as u64)
    }
}

impl Default for WallClock {
    fn default() -> Self {
        Self::system()
    }
}
