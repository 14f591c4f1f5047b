//! Lock-free item registry.
//!
//! A fixed array of atomic status words arbitrates slot contention. Every
//! transition is a single compare-and-set, so no observer can ever see a
//! lost or skipped edge: `Available -> Reserved -> Sold` forward, with the
//! back-edges `Reserved -> Available` (expiry/cancel) and `Sold -> Reserved`
//! (purchase rollback).

use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::SaleError;

const AVAILABLE: u32 = 0;
const RESERVED: u32 = 1;
const SOLD: u32 = 2;

/// Status of a single sale item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemStatus {
    /// The item can be reserved.
    Available,
    /// A reservation currently holds the item.
    Reserved,
    /// The item has been sold (possibly pending durable confirmation).
    Sold,
}

impl ItemStatus {
    fn decode(raw: u32) -> Self {
        match raw {
            AVAILABLE => Self::Available,
            RESERVED => Self::Reserved,
            SOLD => Self::Sold,
            other => unreachable!("corrupt item status word: {other}"),
        }
    }

    fn encode(self) -> u32 {
        match self {
            Self::Available => AVAILABLE,
            Self::Reserved => RESERVED,
            Self::Sold => SOLD,
        }
    }
}

/// Aggregate status counts across the registry, for health reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ItemCounts {
    /// Items currently available.
    pub available: usize,
    /// Items currently reserved.
    pub reserved: usize,
    /// Items currently sold.
    pub sold: usize,
}

/// Fixed-size array of atomic item statuses.
///
/// The registry is the source of truth for slot contention: whichever call
/// wins the CAS owns the transition. All operations are non-blocking and
/// constant-time.
pub struct ItemRegistry {
    slots: Box<[AtomicU32]>,
}

impl ItemRegistry {
    /// Creates a registry of `len` items, all `Available`.
    #[must_use]
    pub fn new(len: usize) -> Self {
        let slots = (0..len).map(|_| AtomicU32::new(AVAILABLE)).collect();
        Self { slots }
    }

    /// Number of items in the registry.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the registry holds no items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn slot(&self, index: usize) -> Result<&AtomicU32, SaleError> {
        self.slots.get(index).ok_or_else(|| {
            SaleError::invalid_input(format!(
                "item index {index} out of range (0..{})",
                self.slots.len()
            ))
        })
    }

    fn cas(&self, index: usize, from: ItemStatus, to: ItemStatus) -> Result<bool, SaleError> {
        let slot = self.slot(index)?;
        Ok(slot
            .compare_exchange(from.encode(), to.encode(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok())
    }

    /// Attempts `Available -> Reserved`. Returns whether this call won.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` when the index is out of range.
    pub fn try_reserve(&self, index: usize) -> Result<bool, SaleError> {
        self.cas(index, ItemStatus::Available, ItemStatus::Reserved)
    }

    /// Attempts `Reserved -> Sold`. Returns whether this call won.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` when the index is out of range.
    pub fn try_sell(&self, index: usize) -> Result<bool, SaleError> {
        self.cas(index, ItemStatus::Reserved, ItemStatus::Sold)
    }

    /// Attempts `Reserved -> Available` (expiry or cancellation).
    ///
    /// Must not touch a `Sold` slot; the CAS guarantees it cannot.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` when the index is out of range.
    pub fn release(&self, index: usize) -> Result<bool, SaleError> {
        self.cas(index, ItemStatus::Reserved, ItemStatus::Available)
    }

    /// Attempts `Sold -> Reserved` (purchase rollback).
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` when the index is out of range.
    pub fn unsell(&self, index: usize) -> Result<bool, SaleError> {
        self.cas(index, ItemStatus::Sold, ItemStatus::Reserved)
    }

    /// Current status of the item. Plain atomic load.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` when the index is out of range.
    pub fn status(&self, index: usize) -> Result<ItemStatus, SaleError> {
        Ok(ItemStatus::decode(self.slot(index)?.load(Ordering::Acquire)))
    }

    /// Forces a slot to `Sold` during recovery replay.
    ///
    /// Returns `true` when the slot changed (idempotent: a slot already
    /// `Sold` is left alone and reported unchanged). Only recovery, which
    /// runs before the generation accepts requests, may use this.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` when the index is out of range.
    pub fn restore_sold(&self, index: usize) -> Result<bool, SaleError> {
        let slot = self.slot(index)?;
        Ok(slot.swap(SOLD, Ordering::AcqRel) != SOLD)
    }

    /// Scans the registry and tallies statuses. O(len); health reporting
    /// only, not an authoritative counter.
    #[must_use]
    pub fn counts(&self) -> ItemCounts {
        let mut counts = ItemCounts::default();
        for slot in &self.slots {
            match ItemStatus::decode(slot.load(Ordering::Acquire)) {
                ItemStatus::Available => counts.available += 1,
                ItemStatus::Reserved => counts.reserved += 1,
                ItemStatus::Sold => counts.sold += 1,
            }
        }
        counts
    }
}

impl std::fmt::Debug for ItemRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ItemRegistry")
            .field("len", &self.slots.len())
            .field("counts", &self.counts())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use proptest::prelude::*;

    use super::*;

    #[test]
    fn new_registry_is_all_available() {
        let registry = ItemRegistry::new(4);
        assert_eq!(registry.len(), 4);
        for i in 0..4 {
            assert_eq!(registry.status(i).unwrap(), ItemStatus::Available);
        }
        assert_eq!(
            registry.counts(),
            ItemCounts { available: 4, reserved: 0, sold: 0 }
        );
    }

    #[test]
    fn forward_lifecycle() {
        let registry = ItemRegistry::new(1);

        assert!(registry.try_reserve(0).unwrap());
        assert_eq!(registry.status(0).unwrap(), ItemStatus::Reserved);

        assert!(registry.try_sell(0).unwrap());
        assert_eq!(registry.status(0).unwrap(), ItemStatus::Sold);
    }

    #[test]
    fn double_reserve_loses() {
        let registry = ItemRegistry::new(1);
        assert!(registry.try_reserve(0).unwrap());
        assert!(!registry.try_reserve(0).unwrap());
    }

    #[test]
    fn sell_requires_reserved() {
        let registry = ItemRegistry::new(1);
        assert!(!registry.try_sell(0).unwrap());

        registry.try_reserve(0).unwrap();
        assert!(registry.try_sell(0).unwrap());
        assert!(!registry.try_sell(0).unwrap());
    }

    #[test]
    fn release_returns_item_to_available() {
        let registry = ItemRegistry::new(1);
        registry.try_reserve(0).unwrap();

        assert!(registry.release(0).unwrap());
        assert_eq!(registry.status(0).unwrap(), ItemStatus::Available);
    }

    #[test]
    fn release_never_touches_sold() {
        let registry = ItemRegistry::new(1);
        registry.try_reserve(0).unwrap();
        registry.try_sell(0).unwrap();

        assert!(!registry.release(0).unwrap());
        assert_eq!(registry.status(0).unwrap(), ItemStatus::Sold);
    }

    #[test]
    fn unsell_rolls_back_to_reserved() {
        let registry = ItemRegistry::new(1);
        registry.try_reserve(0).unwrap();
        registry.try_sell(0).unwrap();

        assert!(registry.unsell(0).unwrap());
        assert_eq!(registry.status(0).unwrap(), ItemStatus::Reserved);

        // And the slot can be released or re-sold afterwards.
        assert!(registry.try_sell(0).unwrap());
    }

    #[test]
    fn out_of_range_index_is_invalid_input() {
        let registry = ItemRegistry::new(2);
        assert!(matches!(
            registry.try_reserve(2),
            Err(SaleError::InvalidInput { .. })
        ));
        assert!(matches!(registry.status(7), Err(SaleError::InvalidInput { .. })));
    }

    #[test]
    fn restore_sold_is_idempotent() {
        let registry = ItemRegistry::new(1);

        assert!(registry.restore_sold(0).unwrap());
        assert_eq!(registry.status(0).unwrap(), ItemStatus::Sold);

        // Second replay of the same fact reports no change.
        assert!(!registry.restore_sold(0).unwrap());
        assert_eq!(registry.status(0).unwrap(), ItemStatus::Sold);
    }

    #[test]
    fn concurrent_reserves_have_exactly_one_winner() {
        let registry = Arc::new(ItemRegistry::new(1));
        let threads = 16;

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || registry.try_reserve(0).unwrap())
            })
            .collect();

        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();

        assert_eq!(wins, 1);
        assert_eq!(registry.status(0).unwrap(), ItemStatus::Reserved);
    }

    #[test]
    fn concurrent_mixed_transitions_keep_status_legal() {
        let registry = Arc::new(ItemRegistry::new(8));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for i in 0..8 {
                        match (t + i) % 4 {
                            0 => drop(registry.try_reserve(i)),
                            1 => drop(registry.try_sell(i)),
                            2 => drop(registry.release(i)),
                            _ => drop(registry.unsell(i)),
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        // Whatever interleaving happened, every slot decodes to a legal status.
        let counts = registry.counts();
        assert_eq!(counts.available + counts.reserved + counts.sold, 8);
    }

    proptest! {
        /// Any sequence of transition attempts leaves the slot in a status
        /// reachable through legal edges, and winners are only reported for
        /// CAS calls whose `from` status actually held.
        #[test]
        fn transition_sequences_respect_the_state_machine(ops in prop::collection::vec(0u8..4, 1..64)) {
            let registry = ItemRegistry::new(1);
            let mut model = ItemStatus::Available;

            for op in ops {
                let (won, from, to) = match op {
                    0 => (registry.try_reserve(0).unwrap(), ItemStatus::Available, ItemStatus::Reserved),
                    1 => (registry.try_sell(0).unwrap(), ItemStatus::Reserved, ItemStatus::Sold),
                    2 => (registry.release(0).unwrap(), ItemStatus::Reserved, ItemStatus::Available),
                    _ => (registry.unsell(0).unwrap(), ItemStatus::Sold, ItemStatus::Reserved),
                };

                prop_assert_eq!(won, model == from);
                if won {
                    model = to;
                }
                prop_assert_eq!(registry.status(0).unwrap(), model);
            }
        }
    }
}
