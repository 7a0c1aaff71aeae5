//! Inventory reservations.
//!
//! A reservation is a time-bounded claim on stock tied to one order. It moves
//! from `active` to exactly one of `confirmed`, `released` or `expired` and
//! never back.
//!
//! Two kinds of hold exist:
//!
//! - **Deducted** holds are created inside the order transaction, which has
//!   already decremented the product's stock. Releasing or expiring one puts
//!   the quantity back on the shelf.
//! - **Soft** holds are manual holds placed outside an order transaction.
//!   Stock is untouched until the hold is confirmed; while active and
//!   unexpired, the hold is subtracted from availability.

use crate::error::OrderError;
use crate::ids::{OrderId, ProductId, ReservationId, StockKey, VariantId};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifetime of a hold created by the order transaction.
pub const ORDER_RESERVATION_TTL: Duration = Duration::minutes(30);

/// Lifetime of a manual (side-channel) hold.
pub const MANUAL_HOLD_TTL: Duration = Duration::hours(2);

/// Reservation status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    /// Holding stock
    Active,
    /// Stock permanently consumed
    Confirmed,
    /// Hold given back
    Released,
    /// Hold lapsed and was swept
    Expired,
}

impl ReservationStatus {
    /// Only `active → confirmed | released | expired` is allowed.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Active, Self::Confirmed | Self::Released | Self::Expired)
        )
    }

    /// Stored representation
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Confirmed => "confirmed",
            Self::Released => "released",
            Self::Expired => "expired",
        }
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReservationStatus {
    type Err = OrderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "confirmed" => Ok(Self::Confirmed),
            "released" => Ok(Self::Released),
            "expired" => Ok(Self::Expired),
            other => Err(OrderError::Validation(format!(
                "unknown reservation status '{other}'"
            ))),
        }
    }
}

/// A stock hold.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryReservation {
    /// Reservation id
    pub id: ReservationId,
    /// Product
    pub product_id: ProductId,
    /// Variant, if any
    pub variant_id: Option<VariantId>,
    /// Order the hold belongs to
    pub order_id: OrderId,
    /// Units held
    pub quantity: i32,
    /// Status
    pub status: ReservationStatus,
    /// Whether stock was already decremented for this hold
    pub stock_deducted: bool,
    /// When an active hold lapses
    pub expires_at: DateTime<Utc>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last status change
    pub updated_at: DateTime<Utc>,
}

impl InventoryReservation {
    /// Stock key of the hold
    #[must_use]
    pub const fn key(&self) -> StockKey {
        StockKey::new(self.product_id, self.variant_id)
    }

    /// Active and past its expiry
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.status == ReservationStatus::Active && self.expires_at < now
    }
}

/// A hold about to be inserted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewReservation {
    /// Product
    pub product_id: ProductId,
    /// Variant, if any
    pub variant_id: Option<VariantId>,
    /// Order the hold belongs to
    pub order_id: OrderId,
    /// Units held
    pub quantity: i32,
    /// Whether stock was already decremented
    pub stock_deducted: bool,
    /// Expiry
    pub expires_at: DateTime<Utc>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [ReservationStatus; 4] = [
        ReservationStatus::Active,
        ReservationStatus::Confirmed,
        ReservationStatus::Released,
        ReservationStatus::Expired,
    ];

    #[test]
    fn reservations_only_leave_active() {
        for from in ALL {
            for to in ALL {
                let expected = from == ReservationStatus::Active && to != ReservationStatus::Active;
                assert_eq!(from.can_transition_to(to), expected, "{from} -> {to}");
            }
        }
    }

    #[test]
    fn ttls_match_hold_kinds() {
        assert_eq!(ORDER_RESERVATION_TTL.num_minutes(), 30);
        assert_eq!(MANUAL_HOLD_TTL.num_hours(), 2);
    }
}
