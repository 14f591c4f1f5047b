//! FlashSale Core -- the concurrent foundation of the flash-sale service.
//!
//! This crate provides the lock-free building blocks the sale engine is
//! assembled from:
//!
//! - **Registry** ([`registry`]): fixed array of atomic item statuses,
//!   CAS-only transitions
//! - **Reservations** ([`reservation`]): code-keyed reservation records with
//!   CAS-driven lifecycle state
//! - **Quotas** ([`quota`]): per-user confirmed-purchase counters with a
//!   conditional rollback
//! - **Store** ([`store`]): the durable-persistence contract and persisted
//!   fact types
//! - **Clock** ([`clock`]): injectable time source for deterministic tests
//! - **Config** ([`config`]): every engine parameter, with validated defaults
//! - **Errors** ([`error`]): one variant per observable outcome

pub mod clock;
pub mod config;
pub mod error;
pub mod quota;
pub mod registry;
pub mod reservation;
pub mod store;

// Clock
pub use clock::{Clock, ManualClock, SystemClock, UnixMillis};

// Config
pub use config::SaleConfig;

// Errors
pub use error::SaleError;

// Quotas
pub use quota::QuotaTable;

// Registry
pub use registry::{ItemCounts, ItemRegistry, ItemStatus};

// Reservations
pub use reservation::{Reservation, ReservationState, ReservationTable, SweepSnapshot};

// Store
pub use store::{DurableStore, PurchaseFact, ReservationFact};
