//! The sale engine: two-phase reserve/purchase protocol and recovery.
//!
//! One engine instance serves one sale window. It exclusively owns the item
//! registry, reservation table, and quota table; the durable store receives
//! value copies of facts and is never called while any structural guard is
//! held. Every fallible step has a paired compensating action, so a request
//! either commits fully or leaves no trace.

pub mod generation;
pub mod sweeper;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use flashsale_core::clock::Clock;
use flashsale_core::registry::ItemCounts;
use flashsale_core::reservation::Reservation;
use flashsale_core::store::{PurchaseFact, ReservationFact};
use flashsale_core::{
    DurableStore, ItemRegistry, ItemStatus, QuotaTable, ReservationState, ReservationTable,
    SaleConfig, SaleError,
};

/// Point-in-time engine vitals for health reporting and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineStats {
    /// Window this engine serves.
    pub window_id: i64,
    /// Items offered in the window.
    pub items: usize,
    /// Registry status tallies.
    pub counts: ItemCounts,
    /// Confirmed purchases.
    pub sold_total: u64,
    /// Reservation records currently in the table (any state).
    pub reservations: usize,
    /// Users with a quota entry.
    pub users: usize,
}

/// Counters from one sweeper pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SweepStats {
    /// Expired reservations cancelled this pass.
    pub cancelled: usize,
    /// Stale terminal records garbage-collected.
    pub removed: usize,
    /// Malformed records dropped.
    pub dropped: usize,
}

/// Counters from recovery replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecoveryStats {
    /// Purchases restored to `Sold`.
    pub purchases: usize,
    /// Reservations restored to `Active`/`Reserved`.
    pub reservations: usize,
    /// Persisted rows that failed validation and were dropped.
    pub dropped: usize,
}

/// The reservation and purchase engine for a single sale window.
pub struct SaleEngine {
    config: SaleConfig,
    window_id: i64,
    registry: ItemRegistry,
    reservations: ReservationTable,
    quotas: QuotaTable,
    sold_total: AtomicU64,
    store: Arc<dyn DurableStore>,
    clock: Arc<dyn Clock>,
}

impl SaleEngine {
    /// Builds an engine for `window_id` with all items available.
    ///
    /// # Errors
    ///
    /// Returns an error when the configuration fails validation; the
    /// affected generation treats this as fatal.
    pub fn new(
        config: SaleConfig,
        window_id: i64,
        store: Arc<dyn DurableStore>,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Arc<Self>> {
        config.validate()?;
        let registry = ItemRegistry::new(config.items_per_window);
        let quotas = QuotaTable::new(config.per_user_limit);
        Ok(Arc::new(Self {
            config,
            window_id,
            registry,
            reservations: ReservationTable::new(),
            quotas,
            sold_total: AtomicU64::new(0),
            store,
            clock,
        }))
    }

    /// Window this engine serves.
    #[must_use]
    pub fn window_id(&self) -> i64 {
        self.window_id
    }

    /// Number of confirmed purchases.
    #[must_use]
    pub fn sold_total(&self) -> u64 {
        self.sold_total.load(Ordering::Acquire)
    }

    /// Engine configuration.
    #[must_use]
    pub fn config(&self) -> &SaleConfig {
        &self.config
    }

    /// Snapshot of engine vitals.
    #[must_use]
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            window_id: self.window_id,
            items: self.registry.len(),
            counts: self.registry.counts(),
            sold_total: self.sold_total(),
            reservations: self.reservations.len(),
            users: self.quotas.user_count(),
        }
    }

    /// Registry status of one item. Test and diagnostics surface.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` when the index is out of range.
    pub fn item_status(&self, index: usize) -> Result<ItemStatus, SaleError> {
        self.registry.status(index)
    }

    /// Confirmed-purchase count for a user.
    #[must_use]
    pub fn user_purchases(&self, user_id: i64) -> u64 {
        self.quotas.count(user_id)
    }

    fn check_item_id(&self, item_id: i64) -> Result<usize, SaleError> {
        usize::try_from(item_id)
            .ok()
            .filter(|index| *index < self.registry.len())
            .ok_or_else(|| {
                SaleError::invalid_input(format!(
                    "item_id {item_id} out of range (0..{})",
                    self.registry.len()
                ))
            })
    }

    async fn append_reservation_acked(&self, fact: ReservationFact) -> anyhow::Result<()> {
        let timeout = self.config.ack_timeout;
        match tokio::time::timeout(timeout, self.store.append_reservation(fact)).await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!(
                "reservation durable ack timed out after {timeout:?}"
            )),
        }
    }

    async fn append_purchase_acked(&self, fact: PurchaseFact) -> anyhow::Result<()> {
        let timeout = self.config.ack_timeout;
        match tokio::time::timeout(timeout, self.store.append_purchase(fact)).await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!(
                "purchase durable ack timed out after {timeout:?}"
            )),
        }
    }

    /// Reserves `item_id` for `user_id` and returns the reservation code.
    ///
    /// The sell-out pre-check reads the confirmed-purchase counter, so a
    /// reserve may slip past the theoretical sell-out moment while a
    /// purchase is mid-flight; the purchase path corrects it.
    ///
    /// # Errors
    ///
    /// `InvalidInput` for out-of-range ids; `AllItemsPurchased`,
    /// `UserLimitExceeded`, `ItemAlreadyReserved`, `ItemAlreadySold` on
    /// contention; `Internal` after a durable-write failure (all in-memory
    /// effects rolled back).
    pub async fn reserve(&self, user_id: i64, item_id: i64) -> Result<Uuid, SaleError> {
        let index = self.check_item_id(item_id)?;

        if self.sold_total() >= self.registry.len() as u64 {
            return Err(SaleError::AllItemsPurchased);
        }
        if self.quotas.is_exhausted(user_id) {
            return Err(SaleError::UserLimitExceeded {
                user_id,
                limit: self.quotas.limit(),
            });
        }

        if !self.registry.try_reserve(index)? {
            return Err(match self.registry.status(index)? {
                ItemStatus::Sold => SaleError::ItemAlreadySold { item_index: index },
                _ => SaleError::ItemAlreadyReserved { item_index: index },
            });
        }

        let now = self.clock.now_millis();
        #[allow(clippy::cast_possible_wrap)]
        let expires_at = now + self.config.hold_duration.as_millis() as i64;
        let code = Uuid::new_v4();

        let record = match self
            .reservations
            .insert(Reservation::new(code, user_id, index, now, expires_at))
        {
            Ok(record) => record,
            Err(err) => {
                let _ = self.registry.release(index);
                return Err(err);
            }
        };

        let fact = ReservationFact {
            code,
            user_id,
            item_index: item_id,
            created_at: now,
            expires_at,
        };
        if let Err(err) = self.append_reservation_acked(fact).await {
            // Compensate both tiers: drop the record, free the slot.
            record.transition(ReservationState::Active, ReservationState::Cancelled);
            self.reservations.remove(&code);
            let _ = self.registry.release(index);
            error!(%code, item_index = index, error = %err, "reservation durable write failed, rolled back");
            return Err(SaleError::Internal(err));
        }

        metrics::counter!("flashsale_reservations_created_total").increment(1);
        debug!(%code, user_id, item_index = index, "reservation created");
        Ok(code)
    }

    /// Confirms the purchase identified by `code`.
    ///
    /// Protocol order is load-bearing: the quota increment precedes the
    /// registry sell CAS so the cap is enforced before any slot commits,
    /// and the durable append is awaited before the reservation record is
    /// retired. Each failure undoes exactly the steps that preceded it.
    ///
    /// # Errors
    ///
    /// `ReservationNotFound`, `ReservationExpired`,
    /// `ReservationAlreadyCompleted`, `UserLimitExceeded` per their
    /// conditions; `Internal` after a durable failure (state restored to
    /// pre-call form).
    #[allow(clippy::cast_possible_wrap)]
    pub async fn purchase(&self, code: Uuid) -> Result<(), SaleError> {
        let Some(record) = self.reservations.lookup(&code) else {
            return Err(SaleError::ReservationNotFound);
        };

        match record.state() {
            ReservationState::Purchased => return Err(SaleError::ReservationAlreadyCompleted),
            ReservationState::Cancelled => return Err(SaleError::ReservationExpired),
            ReservationState::Active => {}
        }

        let now = self.clock.now_millis();
        if record.is_expired(now) {
            self.cancel_record(&record);
            return Err(SaleError::ReservationExpired);
        }

        let user_id = record.user_id;
        let index = record.item_index;

        let new_count = self.quotas.try_increment(user_id)?;

        if !self.registry.try_sell(index)? {
            self.quotas.decrement_if_equals(user_id, new_count);
            // A racing expiry cancelled this reservation and released the
            // slot (it may even be re-reserved already); anything else is
            // an inconsistency the caller cannot fix.
            if record.state() == ReservationState::Cancelled {
                return Err(SaleError::ReservationExpired);
            }
            return Err(match self.registry.status(index)? {
                ItemStatus::Available => SaleError::ReservationExpired,
                status => SaleError::Internal(anyhow::anyhow!(
                    "item {index} was {status:?} at sell time for active reservation {code}"
                )),
            });
        }

        if !record.transition(ReservationState::Active, ReservationState::Purchased) {
            // The sweeper cancelled the code between the sell CAS and here.
            self.quotas.decrement_if_equals(user_id, new_count);
            let _ = self.registry.unsell(index);
            let _ = self.registry.release(index);
            return Err(SaleError::ReservationExpired);
        }

        let fact = PurchaseFact {
            window_id: self.window_id,
            item_index: index as i64,
            user_id,
            purchased_at: now,
        };
        if let Err(err) = self.append_purchase_acked(fact).await {
            // Reverse in the documented order: reservation state, item
            // status, quota counter.
            record.transition(ReservationState::Purchased, ReservationState::Active);
            let _ = self.registry.unsell(index);
            self.quotas.decrement_if_equals(user_id, new_count);
            error!(%code, item_index = index, error = %err, "purchase durable write failed, rolled back");
            return Err(SaleError::Internal(err));
        }

        self.sold_total.fetch_add(1, Ordering::AcqRel);
        self.reservations.remove(&code);
        metrics::counter!("flashsale_purchases_confirmed_total").increment(1);
        debug!(%code, user_id, item_index = index, "purchase confirmed");
        Ok(())
    }

    /// Cancels an `Active` reservation and frees its item. Idempotent: the
    /// state CAS absorbs races with the request path and the sweeper.
    pub fn cancel(&self, code: &Uuid) -> bool {
        match self.reservations.lookup(code) {
            Some(record) => self.cancel_record(&record),
            None => false,
        }
    }

    fn cancel_record(&self, record: &Arc<Reservation>) -> bool {
        if !record.transition(ReservationState::Active, ReservationState::Cancelled) {
            return false;
        }
        if self.registry.release(record.item_index).is_err() {
            // Out-of-range index can only come from a corrupt store row
            // that slipped past recovery validation.
            warn!(code = %record.code, item_index = record.item_index, "cancelled reservation pointed at invalid item");
        }
        metrics::counter!("flashsale_reservations_cancelled_total").increment(1);
        debug!(code = %record.code, item_index = record.item_index, "reservation cancelled");
        true
    }

    /// One expiry-sweeper pass: cancel expired actives, drop stale
    /// terminal records.
    #[allow(clippy::cast_possible_wrap)]
    pub fn sweep(&self) -> SweepStats {
        let now = self.clock.now_millis();
        let retention = self.config.terminal_retention.as_millis() as i64;
        let snapshot = self.reservations.sweep_snapshot(now, retention);

        let mut stats = SweepStats::default();
        for record in snapshot.expired {
            if record.item_index >= self.registry.len() {
                warn!(code = %record.code, item_index = record.item_index, "dropping reservation with out-of-range item");
                record.transition(ReservationState::Active, ReservationState::Cancelled);
                self.reservations.remove(&record.code);
                stats.dropped += 1;
                continue;
            }
            if self.cancel_record(&record) {
                stats.cancelled += 1;
            }
        }
        for code in snapshot.stale {
            if self.reservations.remove(&code).is_some() {
                stats.removed += 1;
            }
        }

        if stats.cancelled > 0 || stats.removed > 0 || stats.dropped > 0 {
            debug!(
                cancelled = stats.cancelled,
                removed = stats.removed,
                dropped = stats.dropped,
                "sweep pass complete"
            );
        }
        stats
    }

    /// Replays persisted facts into a fresh engine.
    ///
    /// Purchases first (item `Sold`, user counter, `sold_total`), then
    /// still-live reservations for items that remain available. Replay is
    /// idempotent: re-applying the same log changes nothing.
    ///
    /// # Errors
    ///
    /// Propagates store read failures; the generation manager discards the
    /// engine in that case.
    pub async fn recover(&self) -> anyhow::Result<RecoveryStats> {
        let mut stats = RecoveryStats::default();

        let purchases = self.store.recover_purchases(self.window_id).await?;
        for (item_id, user_id) in purchases {
            let Some(index) = usize::try_from(item_id)
                .ok()
                .filter(|index| *index < self.registry.len())
            else {
                warn!(item_id, user_id, "dropping persisted purchase with out-of-range item");
                stats.dropped += 1;
                continue;
            };
            if self.registry.restore_sold(index)? {
                if let Err(err) = self.quotas.try_increment(user_id) {
                    // Counter above the cap in the log; keep the sold item,
                    // surface the anomaly.
                    warn!(user_id, error = %err, "persisted purchases exceed user limit");
                }
                self.sold_total.fetch_add(1, Ordering::AcqRel);
                stats.purchases += 1;
            }
        }

        let now = self.clock.now_millis();
        let facts = self.store.recover_active_reservations(now).await?;
        for fact in facts {
            let Some(index) = usize::try_from(fact.item_index)
                .ok()
                .filter(|index| *index < self.registry.len())
            else {
                warn!(code = %fact.code, item_index = fact.item_index, "dropping persisted reservation with out-of-range item");
                stats.dropped += 1;
                continue;
            };
            if self.reservations.lookup(&fact.code).is_some() {
                // Already applied by an earlier replay of the same log.
                continue;
            }
            if !self.registry.try_reserve(index)? {
                // Sold in the meantime, or an earlier fact holds the slot.
                continue;
            }
            let record = Reservation::restored(
                fact.code,
                fact.user_id,
                index,
                fact.created_at,
                fact.expires_at,
            );
            if self.reservations.insert(record).is_err() {
                let _ = self.registry.release(index);
                stats.dropped += 1;
                continue;
            }
            stats.reservations += 1;
        }

        info!(
            window_id = self.window_id,
            purchases = stats.purchases,
            reservations = stats.reservations,
            dropped = stats.dropped,
            "recovery replay complete"
        );
        Ok(stats)
    }
}

impl std::fmt::Debug for SaleEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SaleEngine")
            .field("window_id", &self.window_id)
            .field("stats", &self.stats())
            .finish()
    }
}
