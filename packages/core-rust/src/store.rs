//! Durable-store contract.
//!
//! The engine owns all in-memory state and hands the store value copies of
//! the facts it must survive: reservation creations and purchase confirms.
//! Implementations batch appends however they like; the engine only assumes
//! bounded acknowledgement latency and awaits every append before answering
//! the caller.
//!
//! Used as `Arc<dyn DurableStore>`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::UnixMillis;

/// Persisted copy of a reservation at creation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationFact {
    /// Reservation code.
    pub code: Uuid,
    /// Reserving user.
    pub user_id: i64,
    /// Index of the held item.
    pub item_index: i64,
    /// Creation instant, UTC millis.
    pub created_at: UnixMillis,
    /// Expiry deadline, UTC millis.
    pub expires_at: UnixMillis,
}

/// Persisted copy of a confirmed purchase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseFact {
    /// Sale window the purchase belongs to.
    pub window_id: i64,
    /// Index of the purchased item.
    pub item_index: i64,
    /// Buying user.
    pub user_id: i64,
    /// Confirmation instant, UTC millis.
    pub purchased_at: UnixMillis,
}

/// Append-only persistence for sale facts, with recovery reads.
///
/// `append_*` resolve once the fact is durably acknowledged; the engine's
/// two-phase protocol treats a resolved future as the commit point and an
/// error as the trigger for compensating rollback. Neither call may be made
/// while holding any engine lock.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Durably appends a reservation fact.
    async fn append_reservation(&self, fact: ReservationFact) -> anyhow::Result<()>;

    /// Durably records a purchase.
    ///
    /// For stores with a row per item per window, this is the conditional
    /// update of the item's row; a row already marked purchased is a
    /// conflict and must surface as an error.
    async fn append_purchase(&self, fact: PurchaseFact) -> anyhow::Result<()>;

    /// Ensures the window's item rows exist so purchase updates have a
    /// target. Idempotent.
    async fn seed_window(&self, window_id: i64, items: i64) -> anyhow::Result<()>;

    /// Returns every persisted reservation whose deadline is after `now`.
    async fn recover_active_reservations(
        &self,
        now: UnixMillis,
    ) -> anyhow::Result<Vec<ReservationFact>>;

    /// Returns every confirmed purchase `(item_index, user_id)` in the
    /// window.
    async fn recover_purchases(&self, window_id: i64) -> anyhow::Result<Vec<(i64, i64)>>;

    /// Flushes any buffered writes immediately. Called on shutdown; a
    /// write-through store has nothing to do.
    async fn hard_flush(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
