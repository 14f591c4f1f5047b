//! Sale-window configuration.

use std::time::Duration;

/// Configuration for a single sale window and the engine that serves it.
///
/// Every parameter the engine consumes is enumerated here; the server binary
/// populates overrides from flags and environment variables.
#[derive(Debug, Clone)]
pub struct SaleConfig {
    /// Number of items offered in each sale window (`N`).
    pub items_per_window: usize,
    /// Maximum confirmed purchases per user per window (`L_user`).
    pub per_user_limit: u64,
    /// How long a reservation holds an item before it expires (`T_hold`).
    pub hold_duration: Duration,
    /// Interval between expiry-sweeper runs (`S`).
    pub sweep_interval: Duration,
    /// Length of a sale window.
    pub window_length: Duration,
    /// Grace period granted to in-flight requests when a generation drains.
    pub drain_grace: Duration,
    /// Maximum time to await a durable-write acknowledgement.
    pub ack_timeout: Duration,
    /// How long terminal reservation records are retained past expiry
    /// before the sweeper garbage-collects them.
    pub terminal_retention: Duration,
}

impl Default for SaleConfig {
    fn default() -> Self {
        Self {
            items_per_window: 10_000,
            per_user_limit: 10,
            hold_duration: Duration::from_secs(3),
            sweep_interval: Duration::from_secs(5),
            window_length: Duration::from_secs(3600),
            drain_grace: Duration::from_millis(500),
            ack_timeout: Duration::from_secs(2),
            terminal_retention: Duration::from_secs(3600),
        }
    }
}

impl SaleConfig {
    /// Validates the configuration.
    ///
    /// Engine construction treats a validation failure as fatal for the
    /// affected generation.
    ///
    /// # Errors
    ///
    /// Returns an error when any parameter is zero where a positive value is
    /// required.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.items_per_window == 0 {
            anyhow::bail!("items_per_window must be positive");
        }
        if self.per_user_limit == 0 {
            anyhow::bail!("per_user_limit must be positive");
        }
        if self.hold_duration.is_zero() {
            anyhow::bail!("hold_duration must be positive");
        }
        if self.sweep_interval.is_zero() {
            anyhow::bail!("sweep_interval must be positive");
        }
        if self.window_length.is_zero() {
            anyhow::bail!("window_length must be positive");
        }
        Ok(())
    }

    /// Computes the window identifier containing the given instant.
    ///
    /// Windows are numbered from the Unix epoch in units of
    /// `window_length`, so identifiers are stable across restarts.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub fn window_id_at(&self, now_millis: i64) -> i64 {
        let len = self.window_length.as_millis() as i64;
        now_millis.div_euclid(len)
    }

    /// Start instant (UTC millis) of the given window.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub fn window_start(&self, window_id: i64) -> i64 {
        window_id * self.window_length.as_millis() as i64
    }
}
