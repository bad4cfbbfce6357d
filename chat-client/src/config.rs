//! Configuration for the sync client.
//!
//! Configuration is loaded from a TOML file (default: `duet.toml`). Every
//! field is optional and falls back to its default.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Timing and capacity settings shared by every component of a session.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChatConfig {
    /// Maximum distance between an optimistic entry and its remote echo
    /// (default: 3000ms).
    #[serde(default = "default_reconciliation_window_ms")]
    pub reconciliation_window_ms: u64,
    /// Bound on a store write before the message fails (default: 3000ms).
    /// Also the age after which a pending entry missing from a snapshot fails.
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    /// Quiet period after the last keystroke before publishing idle
    /// (default: 2000ms).
    #[serde(default = "default_typing_idle_ms")]
    pub typing_idle_ms: u64,
    /// Age after which a peer's typing report is ignored (default: 5000ms).
    #[serde(default = "default_typing_freshness_ms")]
    pub typing_freshness_ms: u64,
    /// Conversations kept warm by a session (default: 8).
    #[serde(default = "default_session_cache_capacity")]
    pub session_cache_capacity: usize,
    /// Fetch interval of the polling backend (default: 1000ms).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

// Default value functions
fn default_reconciliation_window_ms() -> u64 {
    duet_chat_core::DEFAULT_RECONCILIATION_WINDOW_MS
}

fn default_send_timeout_ms() -> u64 {
    duet_chat_core::DEFAULT_PENDING_TIMEOUT_MS
}

fn default_typing_idle_ms() -> u64 {
    duet_chat_core::DEFAULT_TYPING_IDLE_MS
}

fn default_typing_freshness_ms() -> u64 {
    duet_chat_core::DEFAULT_TYPING_FRESHNESS_MS
}

fn default_session_cache_capacity() -> usize {
    8
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            reconciliation_window_ms: default_reconciliation_window_ms(),
            send_timeout_ms: default_send_timeout_ms(),
            typing_idle_ms: default_typing_idle_ms(),
            typing_freshness_ms: default_typing_freshness_ms(),
            session_cache_capacity: default_session_cache_capacity(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl ChatConfig {
    /// Load and validate configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or holds a zero
    /// duration or capacity.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check that every duration and capacity is non-zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fields = [
            ("reconciliation_window_ms", self.reconciliation_window_ms),
            ("send_timeout_ms", self.send_timeout_ms),
            ("typing_idle_ms", self.typing_idle_ms),
            ("typing_freshness_ms", self.typing_freshness_ms),
            ("session_cache_capacity", self.session_cache_capacity as u64),
            ("poll_interval_ms", self.poll_interval_ms),
        ];
        match fields.iter().find(|(_, value)| *value == 0) {
            Some((field, _)) => Err(ConfigError::Invalid {
                field: *field,
                reason: "must be greater than zero",
            }),
            None => Ok(()),
        }
    }

    /// Set the reconciliation window.
    pub fn with_reconciliation_window_ms(mut self, ms: u64) -> Self {
        self.reconciliation_window_ms = ms;
        self
    }

    /// Set the send timeout.
    pub fn with_send_timeout_ms(mut self, ms: u64) -> Self {
        self.send_timeout_ms = ms;
        self
    }

    /// Set the typing idle timeout.
    pub fn with_typing_idle_ms(mut self, ms: u64) -> Self {
        self.typing_idle_ms = ms;
        self
    }

    /// Set the peer typing freshness bound.
    pub fn with_typing_freshness_ms(mut self, ms: u64) -> Self {
        self.typing_freshness_ms = ms;
        self
    }

    /// Set the session cache capacity.
    pub fn with_session_cache_capacity(mut self, capacity: usize) -> Self {
        self.session_cache_capacity = capacity;
        self
    }

    /// Set the polling interval.
    pub fn with_poll_interval_ms(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    /// Send timeout as a [`Duration`].
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    /// Polling interval as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Reconciliation bounds for the timeline.
    pub fn reconcile_policy(&self) -> duet_chat_core::ReconcilePolicy {
        duet_chat_core::ReconcilePolicy {
            window_ms: self.reconciliation_window_ms,
            pending_timeout_ms: self.send_timeout_ms,
        }
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
    /// A field holds an unusable value.
    #[error("invalid config field {field}: {reason}")]
    Invalid {
        /// Name of the offending field.
        field: &'static str,
        /// What is wrong with it.
        reason: &'static str,
    },
}
