//! Orders, order items and the order status state machine.
//!
//! An order is created in [`OrderStatus::Pending`] and only ever changes
//! through [`Order::transition`]. Orders are never deleted: cancellation and
//! refund are terminal statuses.
//!
//! ```text
//! pending ──► confirmed ──► processing ──► shipped ──► delivered
//!    │            │              │            │            │
//!    └────────────┴──────────────┴─► cancelled└─► refunded ◄┘
//! ```

use crate::catalog::{Address, ProductAttributes};
use crate::error::OrderError;
use crate::ids::{
    OrderId, OrderItemId, ProductId, StockKey, StorefrontId, UserId, VariantId, WarehouseId,
};
use crate::pricing::OrderTotals;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Status
// ============================================================================

/// Order lifecycle status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Created, awaiting payment or seller confirmation
    Pending,
    /// Paid/accepted; stock permanently consumed
    Confirmed,
    /// Seller is preparing the shipment
    Processing,
    /// Handed to the carrier
    Shipped,
    /// Received by the buyer
    Delivered,
    /// Cancelled (terminal)
    Cancelled,
    /// Refunded (terminal)
    Refunded,
}

impl OrderStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [Self; 7] = [
        Self::Pending,
        Self::Confirmed,
        Self::Processing,
        Self::Shipped,
        Self::Delivered,
        Self::Cancelled,
        Self::Refunded,
    ];

    /// Statuses reachable from `self` in one step.
    #[must_use]
    pub const fn allowed_transitions(self) -> &'static [Self] {
        match self {
            Self::Pending => &[Self::Confirmed, Self::Cancelled],
            Self::Confirmed => &[Self::Processing, Self::Cancelled],
            Self::Processing => &[Self::Shipped, Self::Cancelled],
            Self::Shipped => &[Self::Delivered, Self::Refunded],
            Self::Delivered => &[Self::Refunded],
            Self::Cancelled | Self::Refunded => &[],
        }
    }

    /// Whether `self → next` is a legal transition.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        self.allowed_transitions().contains(&next)
    }

    /// Terminal statuses accept no further transitions.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Refunded)
    }

    /// Stored representation
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Processing => "processing",
            Self::Shipped => "shipped",
            Self::Delivered => "delivered",
            Self::Cancelled => "cancelled",
            Self::Refunded => "refunded",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = OrderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| OrderError::Validation(format!("unknown order status '{s}'")))
    }
}

/// Payment status as tracked by this engine (the gateway itself is external).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    /// Awaiting capture
    Pending,
    /// Cash on delivery, collected by the carrier
    CodPending,
    /// Captured
    Completed,
    /// Capture failed
    Failed,
    /// Returned to the buyer
    Refunded,
}

impl PaymentStatus {
    /// Stored representation
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::CodPending => "cod_pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Refunded => "refunded",
        }
    }
}

impl FromStr for PaymentStatus {
    type Err = OrderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "cod_pending" => Ok(Self::CodPending),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "refunded" => Ok(Self::Refunded),
            other => Err(OrderError::Validation(format!(
                "unknown payment status '{other}'"
            ))),
        }
    }
}

/// How the buyer pays.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    /// Card via the payment gateway
    Card,
    /// Cash collected on delivery
    CashOnDelivery,
    /// Bank transfer
    BankTransfer,
}

impl PaymentMethod {
    /// Payment status a fresh order starts with
    #[must_use]
    pub const fn initial_status(self) -> PaymentStatus {
        match self {
            Self::CashOnDelivery => PaymentStatus::CodPending,
            Self::Card | Self::BankTransfer => PaymentStatus::Pending,
        }
    }

    /// Stored representation
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Card => "card",
            Self::CashOnDelivery => "cash_on_delivery",
            Self::BankTransfer => "bank_transfer",
        }
    }
}

impl FromStr for PaymentMethod {
    type Err = OrderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "card" => Ok(Self::Card),
            "cash_on_delivery" => Ok(Self::CashOnDelivery),
            "bank_transfer" => Ok(Self::BankTransfer),
            other => Err(OrderError::Validation(format!(
                "unknown payment method '{other}'"
            ))),
        }
    }
}

// ============================================================================
// Order
// ============================================================================

/// A line of a committed order, frozen at purchase time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    /// Line id
    pub id: OrderItemId,
    /// Owning order
    pub order_id: OrderId,
    /// Product
    pub product_id: ProductId,
    /// Variant, if any
    pub variant_id: Option<VariantId>,
    /// Product name at purchase time
    pub product_name: String,
    /// SKU at purchase time
    pub product_sku: Option<String>,
    /// Attributes at purchase time
    pub attributes: ProductAttributes,
    /// Units
    pub quantity: i32,
    /// Unit price at purchase time
    pub price_per_unit: Decimal,
    /// `price_per_unit × quantity`
    pub total_price: Decimal,
    /// Warehouse assigned at purchase time
    pub warehouse_id: Option<WarehouseId>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl OrderItem {
    /// Stock key of the line
    #[must_use]
    pub const fn key(&self) -> StockKey {
        StockKey::new(self.product_id, self.variant_id)
    }
}

/// A committed purchase.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    /// Order id
    pub id: OrderId,
    /// Human-readable unique number
    pub order_number: String,
    /// Storefront selling
    pub storefront_id: StorefrontId,
    /// Buyer
    pub customer_id: UserId,
    /// Lifecycle status
    pub status: OrderStatus,
    /// Payment status
    pub payment_status: PaymentStatus,
    /// Payment method
    pub payment_method: PaymentMethod,
    /// Gateway transaction id once captured
    pub payment_transaction_id: Option<String>,
    /// Money fields
    pub totals: OrderTotals,
    /// ISO currency code
    pub currency: String,
    /// Days funds are held after confirmation
    pub escrow_days: i32,
    /// When funds are released to the seller
    pub escrow_release_date: Option<DateTime<Utc>>,
    /// Where to ship
    pub shipping_address: Address,
    /// Where to bill
    pub billing_address: Address,
    /// Seller pickup address
    pub pickup_address: Option<Address>,
    /// Carrier/service code
    pub shipping_method: Option<String>,
    /// Carrier tracking number
    pub tracking_number: Option<String>,
    /// Notes from the buyer
    pub customer_notes: Option<String>,
    /// Notes from the seller
    pub seller_notes: Option<String>,
    /// Why the order was cancelled
    pub cancellation_reason: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last mutation time
    pub updated_at: DateTime<Utc>,
    /// Set on `confirmed`
    pub confirmed_at: Option<DateTime<Utc>>,
    /// Set on `shipped`
    pub shipped_at: Option<DateTime<Utc>>,
    /// Set on `delivered`
    pub delivered_at: Option<DateTime<Utc>>,
    /// Set on `cancelled`
    pub cancelled_at: Option<DateTime<Utc>>,
    /// Set on `refunded`
    pub refunded_at: Option<DateTime<Utc>>,
    /// Set when payment is captured
    pub payment_completed_at: Option<DateTime<Utc>>,
    /// Lines
    pub items: Vec<OrderItem>,
}

/// Extra inputs some transitions need.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransitionDetails {
    /// Required when moving to `shipped`
    pub tracking_number: Option<String>,
    /// Seller notes to store
    pub notes: Option<String>,
    /// Cancellation reason
    pub reason: Option<String>,
}

impl Order {
    /// Apply a status transition and stamp its timestamp.
    ///
    /// The order is left untouched when the transition is rejected.
    ///
    /// # Errors
    ///
    /// - [`OrderError::InvalidStatusTransition`] if `to` is not reachable from the current status
    /// - [`OrderError::Validation`] if `to` is `shipped` and no tracking number was given
    pub fn transition(
        &mut self,
        to: OrderStatus,
        details: TransitionDetails,
        now: DateTime<Utc>,
    ) -> Result<(), OrderError> {
        if !self.status.can_transition_to(to) {
            return Err(OrderError::InvalidStatusTransition {
                from: self.status,
                to,
            });
        }

        let tracking_number = details
            .tracking_number
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());
        if to == OrderStatus::Shipped && tracking_number.is_none() {
            return Err(OrderError::Validation(
                "tracking number is required to ship an order".to_string(),
            ));
        }

        match to {
            OrderStatus::Confirmed => {
                self.confirmed_at = Some(now);
                self.escrow_release_date = Some(now + Duration::days(i64::from(self.escrow_days)));
            }
            OrderStatus::Shipped => {
                self.shipped_at = Some(now);
                self.tracking_number = tracking_number;
            }
            OrderStatus::Delivered => self.delivered_at = Some(now),
            OrderStatus::Cancelled => {
                self.cancelled_at = Some(now);
                self.cancellation_reason = details.reason;
            }
            OrderStatus::Refunded => {
                self.refunded_at = Some(now);
                self.payment_status = PaymentStatus::Refunded;
            }
            OrderStatus::Pending | OrderStatus::Processing => {}
        }

        if let Some(notes) = details.notes {
            self.seller_notes = Some(notes);
        }
        self.status = to;
        self.updated_at = now;
        Ok(())
    }

    /// Record a captured payment.
    pub fn mark_paid(&mut self, transaction_id: String, now: DateTime<Utc>) {
        self.payment_status = PaymentStatus::Completed;
        self.payment_transaction_id = Some(transaction_id);
        self.payment_completed_at = Some(now);
        self.updated_at = now;
    }
}

/// Header of an order about to be inserted. Money fields start at zero.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewOrder {
    /// Human-readable unique number
    pub order_number: String,
    /// Storefront selling
    pub storefront_id: StorefrontId,
    /// Buyer
    pub customer_id: UserId,
    /// Payment method
    pub payment_method: PaymentMethod,
    /// ISO currency code
    pub currency: String,
    /// Escrow length from the storefront plan
    pub escrow_days: i32,
    /// Where to ship
    pub shipping_address: Address,
    /// Where to bill
    pub billing_address: Address,
    /// Seller pickup address
    pub pickup_address: Option<Address>,
    /// Carrier/service code
    pub shipping_method: Option<String>,
    /// Notes from the buyer
    pub customer_notes: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// Order line about to be inserted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewOrderItem {
    /// Owning order
    pub order_id: OrderId,
    /// Product
    pub product_id: ProductId,
    /// Variant, if any
    pub variant_id: Option<VariantId>,
    /// Product name snapshot
    pub product_name: String,
    /// SKU snapshot
    pub product_sku: Option<String>,
    /// Attribute snapshot
    pub attributes: ProductAttributes,
    /// Units
    pub quantity: i32,
    /// Unit price snapshot
    pub price_per_unit: Decimal,
    /// Line total
    pub total_price: Decimal,
    /// Warehouse snapshot
    pub warehouse_id: Option<WarehouseId>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Listing
// ============================================================================

/// Default page size for [`OrderFilter`].
pub const DEFAULT_PAGE_SIZE: i64 = 20;

/// Filter for order listing. All criteria are combined with AND.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OrderFilter {
    /// Orders of one storefront
    pub storefront_id: Option<StorefrontId>,
    /// Orders of one buyer
    pub customer_id: Option<UserId>,
    /// Orders of all storefronts owned by one seller
    pub seller_id: Option<UserId>,
    /// Orders in one status
    pub status: Option<OrderStatus>,
    /// Created at or after
    pub created_from: Option<DateTime<Utc>>,
    /// Created before
    pub created_to: Option<DateTime<Utc>>,
    /// Total at least
    pub min_total: Option<Decimal>,
    /// Total at most
    pub max_total: Option<Decimal>,
    /// Exact order number
    pub order_number: Option<String>,
    /// Exact tracking number
    pub tracking_number: Option<String>,
    /// Page size (`None` means [`DEFAULT_PAGE_SIZE`])
    pub limit: Option<i64>,
    /// Rows to skip
    pub offset: Option<i64>,
}

impl OrderFilter {
    /// Page size clamped to `1..=max_limit`
    #[must_use]
    pub fn page_limit(&self, max_limit: i64) -> i64 {
        self.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, max_limit.max(1))
    }

    /// Offset, never negative
    #[must_use]
    pub fn page_offset(&self) -> i64 {
        self.offset.unwrap_or(0).max(0)
    }
}

/// One page of orders plus the total number of matches.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderPage {
    /// Orders on this page, newest first
    pub orders: Vec<Order>,
    /// Matches across all pages
    pub total: i64,
}

/// Aggregate figures over a set of orders.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderStats {
    /// Number of orders per status
    pub count_by_status: BTreeMap<OrderStatus, i64>,
    /// Orders counted
    pub total_orders: i64,
    /// Sum of totals, excluding cancelled and refunded orders
    pub gross_revenue: Decimal,
    /// Sum of commission, excluding cancelled and refunded orders
    pub total_commission: Decimal,
    /// `gross_revenue / revenue orders`, zero when there are none
    pub average_order_value: Decimal,
}

impl OrderStats {
    /// Fold one order into the figures.
    pub fn record(&mut self, status: OrderStatus, totals: &OrderTotals) {
        *self.count_by_status.entry(status).or_insert(0) += 1;
        self.total_orders += 1;
        if !status.is_terminal() {
            self.gross_revenue += totals.total;
            self.total_commission += totals.commission;
        }
        let revenue_orders: i64 = self
            .count_by_status
            .iter()
            .filter(|(status, _)| !status.is_terminal())
            .map(|(_, count)| *count)
            .sum();
        self.average_order_value = if revenue_orders == 0 {
            Decimal::ZERO
        } else {
            (self.gross_revenue / Decimal::from(revenue_orders)).round_dp(2)
        };
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).single().expect("valid time")
    }

    fn order(status: OrderStatus) -> Order {
        Order {
            id: OrderId::new(1),
            order_number: "ORD-1-2-0".into(),
            storefront_id: StorefrontId::new(1),
            customer_id: UserId::new(2),
            status,
            payment_status: PaymentStatus::Pending,
            payment_method: PaymentMethod::Card,
            payment_transaction_id: None,
            totals: OrderTotals::default(),
            currency: "RSD".into(),
            escrow_days: 7,
            escrow_release_date: None,
            shipping_address: Address::default(),
            billing_address: Address::default(),
            pickup_address: None,
            shipping_method: None,
            tracking_number: None,
            customer_notes: None,
            seller_notes: None,
            cancellation_reason: None,
            created_at: now(),
            updated_at: now(),
            confirmed_at: None,
            shipped_at: None,
            delivered_at: None,
            cancelled_at: None,
            refunded_at: None,
            payment_completed_at: None,
            items: vec![],
        }
    }

    fn allowed(from: OrderStatus, to: OrderStatus) -> bool {
        use OrderStatus::{Cancelled, Confirmed, Delivered, Pending, Processing, Refunded, Shipped};
        matches!(
            (from, to),
            (Pending, Confirmed | Cancelled)
                | (Confirmed, Processing | Cancelled)
                | (Processing, Shipped | Cancelled)
                | (Shipped, Delivered | Refunded)
                | (Delivered, Refunded)
        )
    }

    #[test]
    fn transition_table_covers_all_pairs() {
        for from in OrderStatus::ALL {
            for to in OrderStatus::ALL {
                let mut subject = order(from);
                let before = subject.clone();
                let details = TransitionDetails {
                    tracking_number: Some("TRK-1".into()),
                    ..TransitionDetails::default()
                };
                let result = subject.transition(to, details, now());

                if allowed(from, to) {
                    assert!(result.is_ok(), "{from} -> {to} should be allowed");
                    assert_eq!(subject.status, to);
                } else {
                    assert!(
                        matches!(result, Err(OrderError::InvalidStatusTransition { .. })),
                        "{from} -> {to} should be rejected"
                    );
                    assert_eq!(subject, before, "{from} -> {to} must not mutate the order");
                }
            }
        }
    }

    #[test]
    fn shipping_requires_tracking_number() {
        let mut subject = order(OrderStatus::Processing);
        let result = subject.transition(OrderStatus::Shipped, TransitionDetails::default(), now());
        assert!(matches!(result, Err(OrderError::Validation(_))));
        assert_eq!(subject.status, OrderStatus::Processing);
        assert!(subject.shipped_at.is_none());

        subject
            .transition(
                OrderStatus::Shipped,
                TransitionDetails {
                    tracking_number: Some(" TRK-9 ".into()),
                    ..TransitionDetails::default()
                },
                now(),
            )
            .expect("ship");
        assert_eq!(subject.tracking_number.as_deref(), Some("TRK-9"));
        assert_eq!(subject.shipped_at, Some(now()));
    }

    #[test]
    fn confirmation_derives_escrow_release_date() {
        let mut subject = order(OrderStatus::Pending);
        subject.escrow_days = 3;
        subject
            .transition(OrderStatus::Confirmed, TransitionDetails::default(), now())
            .expect("confirm");
        assert_eq!(subject.confirmed_at, Some(now()));
        assert_eq!(subject.escrow_release_date, Some(now() + Duration::days(3)));
    }

    #[test]
    fn terminal_statuses_have_no_exits() {
        assert!(OrderStatus::Cancelled.allowed_transitions().is_empty());
        assert!(OrderStatus::Refunded.allowed_transitions().is_empty());
        assert!(OrderStatus::Cancelled.is_terminal());
        assert!(!OrderStatus::Delivered.is_terminal());
    }

    #[test]
    fn status_parses_from_stored_form() {
        for status in OrderStatus::ALL {
            assert_eq!(status.as_str().parse::<OrderStatus>().ok(), Some(status));
        }
        assert!("archived".parse::<OrderStatus>().is_err());
    }

    #[test]
    fn stats_exclude_terminal_orders_from_revenue() {
        let mut stats = OrderStats::default();
        let totals = |total| OrderTotals {
            subtotal: total,
            total,
            commission: total * dec!(0.03),
            seller_amount: total - total * dec!(0.03),
            ..OrderTotals::default()
        };
        stats.record(OrderStatus::Delivered, &totals(dec!(100)));
        stats.record(OrderStatus::Pending, &totals(dec!(50)));
        stats.record(OrderStatus::Cancelled, &totals(dec!(999)));

        assert_eq!(stats.total_orders, 3);
        assert_eq!(stats.gross_revenue, dec!(150));
        assert_eq!(stats.average_order_value, dec!(75.00));
        assert_eq!(stats.count_by_status.get(&OrderStatus::Cancelled), Some(&1));
    }

    #[test]
    fn page_limit_is_clamped() {
        let filter = OrderFilter {
            limit: Some(1000),
            offset: Some(-5),
            ..OrderFilter::default()
        };
        assert_eq!(filter.page_limit(100), 100);
        assert_eq!(filter.page_offset(), 0);
        assert_eq!(OrderFilter::default().page_limit(100), DEFAULT_PAGE_SIZE);
    }
}
