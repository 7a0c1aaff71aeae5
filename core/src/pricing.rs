//! Order totals, platform commission and escrow.
//!
//! All arithmetic is done in [`Decimal`]. Commission is rounded half away
//! from zero to two decimal places; the seller amount is whatever is left, so
//! `commission + seller_amount == total` holds exactly.

use crate::catalog::SubscriptionPlan;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Scale money amounts are rounded to.
pub const MONEY_SCALE: u32 = 2;

/// Monetary fields of an order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderTotals {
    /// Sum of line totals
    pub subtotal: Decimal,
    /// Shipping charge
    pub shipping: Decimal,
    /// Tax charge
    pub tax: Decimal,
    /// `subtotal + shipping + tax`
    pub total: Decimal,
    /// Platform cut
    pub commission: Decimal,
    /// `total - commission`
    pub seller_amount: Decimal,
}

impl SubscriptionPlan {
    /// Platform commission rate for this plan. Unknown plans pay the highest rate.
    #[must_use]
    pub fn commission_rate(&self) -> Decimal {
        match self {
            Self::Professional => dec!(0.02),
            Self::Business => dec!(0.01),
            Self::Enterprise => dec!(0.005),
            Self::Starter | Self::Unknown(_) => dec!(0.03),
        }
    }

    /// Days funds are held after confirmation. Higher plans wait less.
    #[must_use]
    pub const fn escrow_days(&self) -> i32 {
        match self {
            Self::Business | Self::Enterprise => 3,
            Self::Professional => 5,
            Self::Starter | Self::Unknown(_) => 7,
        }
    }
}

/// Shipping and tax rates.
///
/// Both are zero for now; this is the seam where a rate engine plugs in.
pub trait ChargeCalculator: Send + Sync {
    /// Shipping charge for an order with this subtotal
    fn shipping(&self, subtotal: Decimal) -> Decimal;
    /// Tax charge for an order with this subtotal
    fn tax(&self, subtotal: Decimal) -> Decimal;
}

/// Charges nothing for shipping or tax.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCharges;

impl ChargeCalculator for NoCharges {
    fn shipping(&self, _subtotal: Decimal) -> Decimal {
        Decimal::ZERO
    }

    fn tax(&self, _subtotal: Decimal) -> Decimal {
        Decimal::ZERO
    }
}

/// Commission on `total` at `rate`, rounded to cents.
#[must_use]
pub fn commission(total: Decimal, rate: Decimal) -> Decimal {
    (total * rate).round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// Compute order totals from line totals.
#[must_use]
pub fn calculate_totals<I>(
    line_totals: I,
    plan: &SubscriptionPlan,
    charges: &dyn ChargeCalculator,
) -> OrderTotals
where
    I: IntoIterator<Item = Decimal>,
{
    let subtotal: Decimal = line_totals.into_iter().sum();
    let shipping = charges.shipping(subtotal);
    let tax = charges.tax(subtotal);
    let total = subtotal + shipping + tax;
    let commission = commission(total, plan.commission_rate());

    OrderTotals {
        subtotal,
        shipping,
        tax,
        total,
        commission,
        seller_amount: total - commission,
    }
}
