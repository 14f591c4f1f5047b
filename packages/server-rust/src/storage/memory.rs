//! In-memory store backend.
//!
//! Keeps the same two logical tables as the SQL backend: an append-only
//! reservation log and one row per item per window. Suitable for tests and
//! single-process runs where durability across restarts is not required;
//! state survives generation rotation because the store outlives engines.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use flashsale_core::store::{DurableStore, PurchaseFact, ReservationFact};
use flashsale_core::UnixMillis;

use super::StoreBackend;

#[derive(Debug, Clone, Copy)]
struct SaleItemRow {
    purchased: bool,
    purchased_by: i64,
    purchased_at: UnixMillis,
}

/// Lock-free-ish in-memory rendition of the persisted layout.
///
/// The reservation log is a mutexed vec (append-only, contention is one
/// push per reserve); item rows live in a `DashMap` keyed by
/// `(window_id, item_index)`.
pub struct MemoryStore {
    reservations: Mutex<Vec<ReservationFact>>,
    sale_items: DashMap<(i64, i64), SaleItemRow>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            reservations: Mutex::new(Vec::new()),
            sale_items: DashMap::new(),
        }
    }

    /// Number of reservation facts appended so far.
    #[must_use]
    pub fn reservation_count(&self) -> usize {
        self.reservations.lock().len()
    }

    /// Number of purchased rows across all windows.
    #[must_use]
    pub fn purchased_count(&self) -> usize {
        self.sale_items.iter().filter(|row| row.purchased).count()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("reservations", &self.reservation_count())
            .field("rows", &self.sale_items.len())
            .finish()
    }
}

#[async_trait]
impl StoreBackend for MemoryStore {
    async fn write_reservations(&self, batch: &[ReservationFact]) -> anyhow::Result<()> {
        self.reservations.lock().extend_from_slice(batch);
        Ok(())
    }

    async fn write_purchase(&self, fact: &PurchaseFact) -> anyhow::Result<()> {
        let key = (fact.window_id, fact.item_index);
        let Some(mut row) = self.sale_items.get_mut(&key) else {
            anyhow::bail!(
                "no sale row for window {} item {}",
                fact.window_id,
                fact.item_index
            );
        };
        if row.purchased {
            anyhow::bail!(
                "item {} in window {} already purchased",
                fact.item_index,
                fact.window_id
            );
        }
        row.purchased = true;
        row.purchased_by = fact.user_id;
        row.purchased_at = fact.purchased_at;
        Ok(())
    }

    async fn ensure_window(&self, window_id: i64, items: i64) -> anyhow::Result<()> {
        for item in 0..items {
            self.sale_items
                .entry((window_id, item))
                .or_insert(SaleItemRow {
                    purchased: false,
                    purchased_by: 0,
                    purchased_at: 0,
                });
        }
        Ok(())
    }

    async fn load_active_reservations(
        &self,
        now: UnixMillis,
    ) -> anyhow::Result<Vec<ReservationFact>> {
        Ok(self
            .reservations
            .lock()
            .iter()
            .filter(|fact| fact.expires_at > now)
            .cloned()
            .collect())
    }

    async fn load_purchases(&self, window_id: i64) -> anyhow::Result<Vec<(i64, i64)>> {
        Ok(self
            .sale_items
            .iter()
            .filter(|entry| entry.key().0 == window_id && entry.value().purchased)
            .map(|entry| (entry.key().1, entry.value().purchased_by))
            .collect())
    }
}

/// Write-through rendition for tests and ephemeral runs: every engine
/// append is applied immediately.
#[async_trait]
impl DurableStore for MemoryStore {
    async fn append_reservation(&self, fact: ReservationFact) -> anyhow::Result<()> {
        StoreBackend::write_reservations(self, std::slice::from_ref(&fact)).await
    }

    async fn append_purchase(&self, fact: PurchaseFact) -> anyhow::Result<()> {
        StoreBackend::write_purchase(self, &fact).await
    }

    async fn seed_window(&self, window_id: i64, items: i64) -> anyhow::Result<()> {
        StoreBackend::ensure_window(self, window_id, items).await
    }

    async fn recover_active_reservations(
        &self,
        now: UnixMillis,
    ) -> anyhow::Result<Vec<ReservationFact>> {
        StoreBackend::load_active_reservations(self, now).await
    }

    async fn recover_purchases(&self, window_id: i64) -> anyhow::Result<Vec<(i64, i64)>> {
        StoreBackend::load_purchases(self, window_id).await
    }
}
