//! Per-user purchase quota enforcement.
//!
//! Counters track *confirmed* purchases for the current window. The
//! increment happens before the registry's sell CAS in the purchase path,
//! so the cap is enforced before any slot commits; a failed sell is undone
//! with the conditional decrement. The counter for a user is monotonically
//! nondecreasing except through that rollback.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::error::SaleError;

/// Map from user id to an atomic confirmed-purchase counter.
///
/// The map shape is protected by `DashMap`'s sharding; counter updates are
/// CAS loops on the shared atomic, taken after the map guard is dropped.
pub struct QuotaTable {
    limit: u64,
    counters: DashMap<i64, Arc<AtomicU64>>,
}

impl QuotaTable {
    /// Creates a quota table enforcing `limit` purchases per user.
    #[must_use]
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            counters: DashMap::new(),
        }
    }

    /// The configured per-user cap.
    #[must_use]
    pub fn limit(&self) -> u64 {
        self.limit
    }

    fn counter(&self, user_id: i64) -> Arc<AtomicU64> {
        // Entry API serializes racing creations of the same user's counter;
        // the guard is dropped before any CAS loop runs.
        Arc::clone(
            self.counters
                .entry(user_id)
                .or_insert_with(|| Arc::new(AtomicU64::new(0)))
                .value(),
        )
    }

    /// Attempts to claim one purchase slot for the user.
    ///
    /// Creates the counter at 1 on first purchase; otherwise CAS-loops from
    /// `c` to `c + 1` provided `c < limit`. Returns the new count on
    /// success.
    ///
    /// # Errors
    ///
    /// Returns `UserLimitExceeded` when the increment would cross the cap.
    pub fn try_increment(&self, user_id: i64) -> Result<u64, SaleError> {
        let counter = self.counter(user_id);
        let mut current = counter.load(Ordering::Acquire);
        loop {
            if current >= self.limit {
                return Err(SaleError::UserLimitExceeded {
                    user_id,
                    limit: self.limit,
                });
            }
            match counter.compare_exchange(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(current + 1),
                Err(observed) => current = observed,
            }
        }
    }

    /// Rolls back an increment that paired with a failed purchase step.
    ///
    /// CAS from `expected` to `expected - 1`; returns whether this call won.
    /// If another thread already moved the counter past `expected`, the
    /// decrement deliberately no-ops so two concurrent failures cannot
    /// double-decrement.
    pub fn decrement_if_equals(&self, user_id: i64, expected: u64) -> bool {
        if expected == 0 {
            return false;
        }
        let Some(counter) = self.counters.get(&user_id).map(|c| Arc::clone(c.value())) else {
            return false;
        };
        counter
            .compare_exchange(expected, expected - 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Current confirmed-purchase count for a user (0 when absent).
    #[must_use]
    pub fn count(&self, user_id: i64) -> u64 {
        self.counters
            .get(&user_id)
            .map_or(0, |c| c.load(Ordering::Acquire))
    }

    /// Whether the user has provably exhausted the cap. Best-effort read
    /// for the reserve-path pre-check.
    #[must_use]
    pub fn is_exhausted(&self, user_id: i64) -> bool {
        self.count(user_id) >= self.limit
    }

    /// Sum of all per-user counters. At quiescence this equals the
    /// engine's `sold_total`.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.counters
            .iter()
            .map(|entry| entry.value().load(Ordering::Acquire))
            .sum()
    }

    /// Number of users with a counter entry.
    #[must_use]
    pub fn user_count(&self) -> usize {
        self.counters.len()
    }
}

impl std::fmt::Debug for QuotaTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaTable")
            .field("limit", &self.limit)
            .field("users", &self.counters.len())
            .finish()
    }
}
