//! Recognized configuration options and their defaults.

use std::time::Duration;

use crate::supervisor::BackoffConfig;

/// Tuning knobs for the ledger runtime. All fields have defaults reachable
/// via [`LedgerConfig::default()`]; `with_*` setters override individual
/// options.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Dispatcher retry cadence: a new message is originated (or the
    /// outstanding one presumed lost) every tick.
    ///
    /// Default: 2 seconds.
    pub tick_interval: Duration,

    /// How long an entity worker waits without traffic before passivating.
    /// State is already durable, so passivation needs no flush.
    ///
    /// Default: 60 seconds.
    pub idle_timeout: Duration,

    /// Number of read-side partitions. Must be stable for the lifetime of
    /// the event log: changing it remaps `tag_for` and strands existing
    /// per-tag checkpoints.
    ///
    /// Default: 18.
    pub number_of_tags: u32,

    /// Restart pacing for supervised tag consumers.
    pub backoff: BackoffConfig,

    /// Cadence of the singleton heartbeat that keeps tag consumers alive.
    ///
    /// Default: 5 seconds.
    pub heartbeat_interval: Duration,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(2),
            idle_timeout: Duration::from_secs(60),
            number_of_tags: 18,
            backoff: BackoffConfig::default(),
            heartbeat_interval: Duration::from_secs(5),
        }
    }
}

impl LedgerConfig {
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_number_of_tags(mut self, number_of_tags: u32) -> Self {
        self.number_of_tags = number_of_tags;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }
}
