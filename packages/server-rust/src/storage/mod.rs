//! Durable-store backends.
//!
//! Two layers, mirroring the engine's view of persistence:
//!
//! - [`StoreBackend`]: the raw writer a concrete database implements.
//!   Reservation writes take whole batches; purchase writes are per-row
//!   conditional updates whose success must map back to one caller.
//! - [`DurableStore`] (from `flashsale-core`): what the engine consumes.
//!   [`BatchingStore`] adapts any backend to it with size/interval
//!   batching; [`MemoryStore`] also implements it directly (write-through)
//!   for tests and ephemeral runs.

mod batcher;
mod memory;
#[cfg(feature = "postgres")]
mod postgres;

pub use batcher::{BatchConfig, BatchingStore};
pub use memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;

use async_trait::async_trait;
use flashsale_core::store::{PurchaseFact, ReservationFact};
use flashsale_core::UnixMillis;

/// Raw persistence writer a database backend implements.
///
/// Used as `Arc<dyn StoreBackend>` behind [`BatchingStore`].
#[async_trait]
pub trait StoreBackend: Send + Sync {
    /// Appends a batch of reservation facts atomically.
    async fn write_reservations(&self, batch: &[ReservationFact]) -> anyhow::Result<()>;

    /// Records one purchase conditionally: the item's row must not already
    /// be marked purchased. A row that is (or that does not exist) is a
    /// conflict and must error.
    async fn write_purchase(&self, fact: &PurchaseFact) -> anyhow::Result<()>;

    /// Creates the window's item rows if absent. Idempotent.
    async fn ensure_window(&self, window_id: i64, items: i64) -> anyhow::Result<()>;

    /// Reads every persisted reservation with `expires_at > now`.
    async fn load_active_reservations(
        &self,
        now: UnixMillis,
    ) -> anyhow::Result<Vec<ReservationFact>>;

    /// Reads every confirmed purchase `(item_index, user_id)` in the window.
    async fn load_purchases(&self, window_id: i64) -> anyhow::Result<Vec<(i64, i64)>>;
}
