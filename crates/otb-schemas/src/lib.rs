//! otb-schemas
//!
//! Shared records for the order bridge: production orders, their lifecycle
//! status, and the append-only production log. No IO lives here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

mod status;

pub use status::{OrderStatus, TransitionError, UnknownStatus};

/// Longest item name accepted by order entry and storage.
pub const MAX_ITEM_LEN: usize = 100;

/// Largest quantity that fits the device's signed 16-bit quantity register.
pub const MAX_QUANTITY: i32 = i16::MAX as i32;

// ---------------------------------------------------------------------------
// Order
// ---------------------------------------------------------------------------

/// A production order as stored by the order store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    /// Storage-assigned identifier.
    pub id: i64,
    pub item: String,
    pub quantity: i32,
    pub created_at: DateTime<Utc>,
    pub status: OrderStatus,
    /// Reason for the most recent failure, if any.
    pub last_error: Option<String>,
}

impl Order {
    /// Move this order to `next`, enforcing the lifecycle edges.
    ///
    /// On error the order is left unchanged.
    pub fn advance(&mut self, next: OrderStatus) -> Result<(), TransitionError> {
        self.status = self.status.transition(next)?;
        Ok(())
    }

    /// `InProgress -> Failed`, recording `reason` in `last_error`.
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), TransitionError> {
        self.advance(OrderStatus::Failed)?;
        self.last_error = Some(reason.into());
        Ok(())
    }
}

/// Input to `OrderStore::create`, validated before it reaches storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewOrder {
    pub item: String,
    pub quantity: i32,
}

impl NewOrder {
    /// Trim and validate order-entry input.
    ///
    /// Rules: item is non-empty after trimming and at most
    /// [`MAX_ITEM_LEN`] characters; quantity is in `1..=MAX_QUANTITY`.
    pub fn new(item: &str, quantity: i32) -> Result<Self, InvalidOrder> {
        let item = item.trim();
        if item.is_empty() {
            return Err(InvalidOrder::EmptyItem);
        }
        if item.chars().count() > MAX_ITEM_LEN {
            return Err(InvalidOrder::ItemTooLong);
        }
        if quantity <= 0 || quantity > MAX_QUANTITY {
            return Err(InvalidOrder::Quantity(quantity));
        }
        Ok(Self {
            item: item.to_string(),
            quantity,
        })
    }
}

/// Why order-entry input was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidOrder {
    EmptyItem,
    ItemTooLong,
    Quantity(i32),
}

impl std::fmt::Display for InvalidOrder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvalidOrder::EmptyItem => write!(f, "item must not be empty"),
            InvalidOrder::ItemTooLong => {
                write!(f, "item must be at most {MAX_ITEM_LEN} characters")
            }
            InvalidOrder::Quantity(q) => {
                write!(f, "quantity {q} outside 1..={MAX_QUANTITY}")
            }
        }
    }
}

impl std::error::Error for InvalidOrder {}

// ---------------------------------------------------------------------------
// Production log
// ---------------------------------------------------------------------------

/// One observed change in an order's produced count. Append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductionLog {
    pub id: i64,
    pub order_id: i64,
    pub timestamp: DateTime<Utc>,
    pub produced_count: i32,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewProductionLog {
    pub order_id: i64,
    pub timestamp: DateTime<Utc>,
    pub produced_count: i32,
    pub message: Option<String>,
}
