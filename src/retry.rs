//! Reconnect delay utilities.
//!
//! The policy in this module is transport-agnostic: it maps a retry attempt
//! number to a delay using a fixed escalation table and decides when the
//! realtime transport should give up.

use std::time::Duration;

use tracing::debug;

/// Default escalation table, in milliseconds.
pub const DEFAULT_RECONNECT_DELAYS_MS: [u64; 7] = [200, 300, 500, 1000, 1200, 1500, 2000];

/// Policy controlling realtime reconnect attempts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Ordered delay table. Attempts past the end reuse the last entry.
    pub delays: Vec<Duration>,
    /// Maximum number of reconnect attempts before the transport closes.
    ///
    /// `usize::MAX` retries forever.
    pub max_retry: usize,
}

impl ReconnectPolicy {
    /// Creates a policy with a custom delay table and unbounded retries.
    pub fn with_delays(delays: Vec<Duration>) -> Self {
        Self {
            delays,
            max_retry: usize::MAX,
        }
    }

    /// Sets the maximum number of reconnect attempts.
    pub fn with_max_retry(mut self, max_retry: usize) -> Self {
        self.max_retry = max_retry;
        self
    }

    /// Returns `true` once `attempts` reconnects have been used up.
    pub fn is_exhausted(&self, attempts: usize) -> bool {
        attempts >= self.max_retry
    }

    /// Computes the delay before the given reconnect attempt.
    ///
    /// `attempt` is 0-based. A positive `retry_hint_ms` (the `retry` field of
    /// the last received message) overrides the table for this attempt only.
    pub fn delay_for_attempt(&self, attempt: usize, retry_hint_ms: i64) -> Duration {
        if retry_hint_ms > 0 {
            return Duration::from_millis(retry_hint_ms as u64);
        }

        let delay = self
            .delays
            .get(attempt)
            .or_else(|| self.delays.last())
            .copied()
            .unwrap_or_default();
        debug!(
            event = "reconnect_delay_selected",
            attempt,
            delay_ms = delay.as_millis() as u64
        );
        delay
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::with_delays(
            DEFAULT_RECONNECT_DELAYS_MS
                .iter()
                .map(|ms| Duration::from_millis(*ms))
                .collect(),
        )
    }
}
