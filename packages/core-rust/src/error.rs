//! Error taxonomy for the sale engine.
//!
//! Every outcome a caller can observe is a variant here; the HTTP layer maps
//! variants to status codes. Conflict-family errors are safe to retry from
//! the client's perspective (the state they collided with may change).

/// Errors returned by the sale engine and its collaborators.
#[derive(Debug, thiserror::Error)]
pub enum SaleError {
    /// Malformed or out-of-range request input.
    #[error("invalid input: {reason}")]
    InvalidInput {
        /// Human-readable description of what was rejected.
        reason: String,
    },

    /// Another reservation currently holds the item.
    #[error("item {item_index} is already reserved")]
    ItemAlreadyReserved {
        /// Index of the contested item.
        item_index: usize,
    },

    /// The item has already been sold.
    #[error("item {item_index} is already sold")]
    ItemAlreadySold {
        /// Index of the sold item.
        item_index: usize,
    },

    /// Every item in the window has a confirmed purchase.
    #[error("all items have been purchased")]
    AllItemsPurchased,

    /// The user reached the per-window purchase cap.
    #[error("user {user_id} reached the purchase limit of {limit}")]
    UserLimitExceeded {
        /// User whose cap was hit.
        user_id: i64,
        /// The configured cap.
        limit: u64,
    },

    /// No reservation exists for the presented code.
    #[error("reservation not found")]
    ReservationNotFound,

    /// The reservation expired before the purchase was attempted.
    #[error("reservation expired")]
    ReservationExpired,

    /// The reservation was already confirmed (or is mid-confirmation).
    #[error("reservation already completed")]
    ReservationAlreadyCompleted,

    /// The serving generation is draining; retry against the next one.
    #[error("sale window is rotating, retry shortly")]
    Draining,

    /// Durable-write or other infrastructure failure. All engine state has
    /// been rolled back before this is returned.
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl SaleError {
    /// Whether this is a contention-family outcome (HTTP 409 class) where a
    /// retry may observe a different result.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::ItemAlreadyReserved { .. }
                | Self::ItemAlreadySold { .. }
                | Self::AllItemsPurchased
                | Self::UserLimitExceeded { .. }
                | Self::ReservationNotFound
                | Self::ReservationExpired
                | Self::ReservationAlreadyCompleted
        )
    }

    /// Convenience constructor for input rejections.
    #[must_use]
    pub fn invalid_input(reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            reason: reason.into(),
        }
    }
}
