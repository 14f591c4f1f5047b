//! Reservation records and the code-keyed reservation table.
//!
//! The table's structural protection comes from `DashMap`'s internal
//! sharding; the per-record lifecycle state is a CAS-driven atomic on the
//! record itself, independent of any structural lock. Callers must never
//! invoke the item registry or durable store while holding a table guard;
//! every method here returns owned `Arc`s so nothing forces them to.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

use crate::clock::UnixMillis;
use crate::error::SaleError;

const ACTIVE: u32 = 0;
const PURCHASED: u32 = 1;
const CANCELLED: u32 = 2;

/// Lifecycle state of a reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationState {
    /// Holding an item, awaiting purchase or expiry.
    Active,
    /// Purchase committed in memory, awaiting (or past) durable confirm.
    Purchased,
    /// Expired or explicitly cancelled.
    Cancelled,
}

impl ReservationState {
    fn decode(raw: u32) -> Self {
        match raw {
            ACTIVE => Self::Active,
            PURCHASED => Self::Purchased,
            CANCELLED => Self::Cancelled,
            other => unreachable!("corrupt reservation state word: {other}"),
        }
    }

    fn encode(self) -> u32 {
        match self {
            Self::Active => ACTIVE,
            Self::Purchased => PURCHASED,
            Self::Cancelled => CANCELLED,
        }
    }

    /// Whether a record in this state may be removed from the table.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Purchased | Self::Cancelled)
    }
}

/// A time-limited claim by one user on one item.
///
/// Immutable except for the `state` word, which only moves through CAS.
#[derive(Debug)]
pub struct Reservation {
    /// Opaque 128-bit code identifying this reservation.
    pub code: Uuid,
    /// The reserving user.
    pub user_id: i64,
    /// Index of the held item.
    pub item_index: usize,
    /// Creation instant, UTC millis.
    pub created_at: UnixMillis,
    /// Expiry deadline, UTC millis (`created_at + hold_duration`).
    pub expires_at: UnixMillis,
    state: AtomicU32,
}

impl Reservation {
    /// Builds a fresh `Active` reservation.
    #[must_use]
    pub fn new(
        code: Uuid,
        user_id: i64,
        item_index: usize,
        created_at: UnixMillis,
        expires_at: UnixMillis,
    ) -> Self {
        Self {
            code,
            user_id,
            item_index,
            created_at,
            expires_at,
            state: AtomicU32::new(ACTIVE),
        }
    }

    /// Rebuilds a reservation from a persisted fact during recovery.
    #[must_use]
    pub fn restored(
        code: Uuid,
        user_id: i64,
        item_index: usize,
        created_at: UnixMillis,
        expires_at: UnixMillis,
    ) -> Self {
        // Recovered reservations re-enter the table as Active; the sweeper
        // re-evaluates their deadline on its next tick.
        Self::new(code, user_id, item_index, created_at, expires_at)
    }

    /// Current lifecycle state. Plain atomic load.
    #[must_use]
    pub fn state(&self) -> ReservationState {
        ReservationState::decode(self.state.load(Ordering::Acquire))
    }

    /// CAS the state from `from` to `to`. Returns whether this call won.
    pub fn transition(&self, from: ReservationState, to: ReservationState) -> bool {
        self.state
            .compare_exchange(from.encode(), to.encode(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Whether the deadline has passed at `now`.
    #[must_use]
    pub fn is_expired(&self, now: UnixMillis) -> bool {
        self.expires_at <= now
    }
}

/// Work collected by one sweeper pass over the table.
#[derive(Debug, Default)]
pub struct SweepSnapshot {
    /// Reservations that were `Active` past their deadline at snapshot time.
    pub expired: Vec<Arc<Reservation>>,
    /// Codes of terminal records past the retention threshold.
    pub stale: Vec<Uuid>,
}

/// Mapping from reservation code to record.
pub struct ReservationTable {
    records: DashMap<Uuid, Arc<Reservation>>,
}

impl ReservationTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }

    /// Number of records currently in the table (any state).
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the table holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Inserts a fresh record. The caller must already hold a winning
    /// registry `try_reserve` for `record.item_index`.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if the code is already present. With v4 codes this
    /// indicates a collision or a protocol bug, not a caller mistake.
    pub fn insert(&self, record: Reservation) -> Result<Arc<Reservation>, SaleError> {
        let code = record.code;
        let record = Arc::new(record);
        match self.records.entry(code) {
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&record));
                Ok(record)
            }
            Entry::Occupied(_) => {
                tracing::warn!(%code, "reservation code collision");
                Err(SaleError::Internal(anyhow::anyhow!(
                    "reservation code collision: {code}"
                )))
            }
        }
    }

    /// Looks up a record by code. Returns an owned handle so the caller
    /// holds no structural lock afterwards.
    #[must_use]
    pub fn lookup(&self, code: &Uuid) -> Option<Arc<Reservation>> {
        self.records.get(code).map(|entry| Arc::clone(entry.value()))
    }

    /// CAS the record's state. Returns `false` when the record is absent or
    /// the `from` state did not hold.
    pub fn transition(
        &self,
        code: &Uuid,
        from: ReservationState,
        to: ReservationState,
    ) -> bool {
        match self.lookup(code) {
            Some(record) => record.transition(from, to),
            None => false,
        }
    }

    /// Removes a record, permitted only in a terminal state.
    ///
    /// Returns the removed record, or `None` when the code is absent or the
    /// record is still `Active` (in which case it stays).
    pub fn remove(&self, code: &Uuid) -> Option<Arc<Reservation>> {
        self.records
            .remove_if(code, |_, record| record.state().is_terminal())
            .map(|(_, record)| record)
    }

    /// Collects one sweep's worth of work without holding structural locks
    /// across the result.
    ///
    /// `expired` holds records still `Active` past their deadline; `stale`
    /// holds terminal records whose deadline passed more than
    /// `retention_millis` ago. The two sets are disjoint by construction.
    #[must_use]
    pub fn sweep_snapshot(&self, now: UnixMillis, retention_millis: i64) -> SweepSnapshot {
        let mut snapshot = SweepSnapshot::default();
        for entry in self.records.iter() {
            let record = entry.value();
            match record.state() {
                ReservationState::Active => {
                    if record.is_expired(now) {
                        snapshot.expired.push(Arc::clone(record));
                    }
                }
                state if state.is_terminal() => {
                    if record.expires_at + retention_millis <= now {
                        snapshot.stale.push(record.code);
                    }
                }
                _ => {}
            }
        }
        snapshot
    }

    /// Visits every record. Used by recovery-consistency checks and tests.
    pub fn for_each(&self, mut f: impl FnMut(&Arc<Reservation>)) {
        for entry in self.records.iter() {
            f(entry.value());
        }
    }
}

impl Default for ReservationTable {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ReservationTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReservationTable")
            .field("len", &self.records.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_record(user_id: i64, item_index: usize, now: UnixMillis) -> Reservation {
        Reservation::new(Uuid::new_v4(), user_id, item_index, now, now + 3_000)
    }

    #[test]
    fn insert_and_lookup_round_trip() {
        let table = ReservationTable::new();
        let record = make_record(1, 0, 1_000);
        let code = record.code;

        let inserted = table.insert(record).unwrap();
        assert_eq!(inserted.state(), ReservationState::Active);

        let found = table.lookup(&code).unwrap();
        assert_eq!(found.user_id, 1);
        assert_eq!(found.item_index, 0);
        assert_eq!(found.expires_at, 4_000);
    }

    #[test]
    fn lookup_unknown_code_is_none() {
        let table = ReservationTable::new();
        assert!(table.lookup(&Uuid::new_v4()).is_none());
    }

    #[test]
    fn duplicate_code_is_rejected() {
        let table = ReservationTable::new();
        let code = Uuid::new_v4();
        table
            .insert(Reservation::new(code, 1, 0, 0, 3_000))
            .unwrap();

        let err = table
            .insert(Reservation::new(code, 2, 1, 0, 3_000))
            .unwrap_err();
        assert!(matches!(err, SaleError::Internal(_)));
    }

    #[test]
    fn transition_is_cas_gated() {
        let table = ReservationTable::new();
        let record = make_record(1, 0, 0);
        let code = record.code;
        table.insert(record).unwrap();

        // Wrong `from` loses.
        assert!(!table.transition(&code, ReservationState::Purchased, ReservationState::Active));

        assert!(table.transition(&code, ReservationState::Active, ReservationState::Purchased));
        assert_eq!(table.lookup(&code).unwrap().state(), ReservationState::Purchased);

        // A second identical transition loses: the state already moved.
        assert!(!table.transition(&code, ReservationState::Active, ReservationState::Purchased));
    }

    #[test]
    fn concurrent_cancel_and_purchase_have_one_winner() {
        let table = std::sync::Arc::new(ReservationTable::new());
        let record = make_record(1, 0, 0);
        let code = record.code;
        table.insert(record).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let table = std::sync::Arc::clone(&table);
                std::thread::spawn(move || {
                    let to = if i % 2 == 0 {
                        ReservationState::Purchased
                    } else {
                        ReservationState::Cancelled
                    };
                    table.transition(&code, ReservationState::Active, to)
                })
            })
            .collect();

        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);
        assert!(table.lookup(&code).unwrap().state().is_terminal());
    }

    #[test]
    fn remove_refuses_active_records() {
        let table = ReservationTable::new();
        let record = make_record(1, 0, 0);
        let code = record.code;
        table.insert(record).unwrap();

        assert!(table.remove(&code).is_none());
        assert!(table.lookup(&code).is_some());

        table.transition(&code, ReservationState::Active, ReservationState::Cancelled);
        assert!(table.remove(&code).is_some());
        assert!(table.lookup(&code).is_none());
    }

    #[test]
    fn sweep_snapshot_partitions_expired_and_stale() {
        let table = ReservationTable::new();
        let retention = 3_600_000;
        let now = 10_000;

        // Active and expired.
        let expired = make_record(1, 0, now - 5_000);
        let expired_code = expired.code;
        table.insert(expired).unwrap();

        // Active, still inside its hold.
        let live = make_record(2, 1, now - 1_000);
        table.insert(live).unwrap();

        // Cancelled long ago: stale.
        let old = Reservation::new(Uuid::new_v4(), 3, 2, 0, 1_000 - retention);
        let old_code = old.code;
        table.insert(old).unwrap();
        table.transition(&old_code, ReservationState::Active, ReservationState::Cancelled);

        // Cancelled recently: kept for late-purchase diagnostics.
        let recent = make_record(4, 3, now - 4_000);
        let recent_code = recent.code;
        table.insert(recent).unwrap();
        table.transition(&recent_code, ReservationState::Active, ReservationState::Cancelled);

        let snapshot = table.sweep_snapshot(now, retention);

        let expired_codes: Vec<Uuid> = snapshot.expired.iter().map(|r| r.code).collect();
        assert_eq!(expired_codes, vec![expired_code]);
        assert_eq!(snapshot.stale, vec![old_code]);
    }

    #[test]
    fn expiry_boundary_is_inclusive() {
        let record = make_record(1, 0, 0);
        assert!(!record.is_expired(2_999));
        assert!(record.is_expired(3_000));
        assert!(record.is_expired(3_001));
    }
}
