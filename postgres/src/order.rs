//! Orders, order lines, listing and statistics.

use crate::error::decode_error;
use crate::{PgTransaction, column, map_error};
use chrono::{DateTime, Utc};
use fulfillment_core::catalog::{Address, ProductAttributes};
use fulfillment_core::ids::{
    OrderId, OrderItemId, ProductId, StorefrontId, UserId, VariantId, WarehouseId,
};
use fulfillment_core::order::{
    NewOrder, NewOrderItem, Order, OrderFilter, OrderItem, OrderPage, OrderStats, OrderStatus,
};
use fulfillment_core::pricing::OrderTotals;
use fulfillment_core::store::{OrderStore, StoreResult};
use fulfillment_core::StoreError;
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder};
use std::collections::HashMap;
use std::str::FromStr;

const ORDER_COLUMNS: &str = "o.id, o.order_number, o.storefront_id, o.customer_id, o.status, \
     o.payment_status, o.payment_method, o.payment_transaction_id, o.subtotal_amount, \
     o.shipping_amount, o.tax_amount, o.total_amount, o.commission_amount, o.seller_amount, \
     o.currency, o.escrow_days, o.escrow_release_date, o.shipping_address, o.billing_address, \
     o.pickup_address, o.shipping_method, o.tracking_number, o.customer_notes, o.seller_notes, \
     o.cancellation_reason, o.created_at, o.updated_at, o.confirmed_at, o.shipped_at, \
     o.delivered_at, o.cancelled_at, o.refunded_at, o.payment_completed_at";

const ITEM_COLUMNS: &str = "id, order_id, product_id, variant_id, product_name, product_sku, \
     attributes, quantity, price_per_unit, total_price, warehouse_id, created_at";

impl PgTransaction {
    async fn order(&mut self, id: OrderId, lock: &str) -> StoreResult<Order> {
        let sql = format!("SELECT {ORDER_COLUMNS} FROM storefront_orders o WHERE o.id = $1 {lock}");
        let row = sqlx::query(&sql)
            .bind(id.get())
            .fetch_optional(self.conn())
            .await
            .map_err(map_error)?
            .ok_or_else(|| StoreError::not_found("order", id))?;
        let order = order_from_row(&row)?;
        self.with_lines(vec![order])
            .await?
            .pop()
            .ok_or_else(|| StoreError::not_found("order", id))
    }

    async fn with_lines(&mut self, mut orders: Vec<Order>) -> StoreResult<Vec<Order>> {
        if orders.is_empty() {
            return Ok(orders);
        }
        let ids: Vec<i64> = orders.iter().map(|order| order.id.get()).collect();
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM storefront_order_items WHERE order_id = ANY($1) ORDER BY id"
        );
        let rows = sqlx::query(&sql)
            .bind(&ids)
            .fetch_all(self.conn())
            .await
            .map_err(map_error)?;

        let mut lines: HashMap<OrderId, Vec<OrderItem>> = HashMap::new();
        for row in &rows {
            let item = item_from_row(row)?;
            lines.entry(item.order_id).or_default().push(item);
        }
        for order in &mut orders {
            order.items = lines.remove(&order.id).unwrap_or_default();
        }
        Ok(orders)
    }
}

impl OrderStore for PgTransaction {
    async fn insert_order(&mut self, order: &NewOrder) -> StoreResult<Order> {
        let sql = format!(
            "INSERT INTO storefront_orders AS o ( \
                 order_number, storefront_id, customer_id, status, payment_status, payment_method, \
                 currency, escrow_days, shipping_address, billing_address, pickup_address, \
                 shipping_method, customer_notes, created_at, updated_at) \
             VALUES ($1, $2, $3, 'pending', $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $13) \
             RETURNING {ORDER_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(&order.order_number)
            .bind(order.storefront_id.get())
            .bind(order.customer_id.get())
            .bind(order.payment_method.initial_status().as_str())
            .bind(order.payment_method.as_str())
            .bind(&order.currency)
            .bind(order.escrow_days)
            .bind(Json(&order.shipping_address))
            .bind(Json(&order.billing_address))
            .bind(order.pickup_address.as_ref().map(Json))
            .bind(&order.shipping_method)
            .bind(&order.customer_notes)
            .bind(order.created_at)
            .fetch_one(self.conn())
            .await
            .map_err(map_error)?;
        order_from_row(&row)
    }

    async fn insert_order_item(&mut self, item: &NewOrderItem) -> StoreResult<OrderItem> {
        let sql = format!(
            "INSERT INTO storefront_order_items ( \
                 order_id, product_id, variant_id, product_name, product_sku, attributes, \
                 quantity, price_per_unit, total_price, warehouse_id, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
             RETURNING {ITEM_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(item.order_id.get())
            .bind(item.product_id.get())
            .bind(item.variant_id.map(VariantId::get))
            .bind(&item.product_name)
            .bind(&item.product_sku)
            .bind(Json(&item.attributes))
            .bind(item.quantity)
            .bind(item.price_per_unit)
            .bind(item.total_price)
            .bind(item.warehouse_id.map(WarehouseId::get))
            .bind(item.created_at)
            .fetch_one(self.conn())
            .await
            .map_err(map_error)?;
        item_from_row(&row)
    }

    async fn update_order_totals(
        &mut self,
        order_id: OrderId,
        totals: &OrderTotals,
    ) -> StoreResult<()> {
        let updated = sqlx::query(
            "UPDATE storefront_orders SET subtotal_amount = $2, shipping_amount = $3, tax_amount = $4, \
             total_amount = $5, commission_amount = $6, seller_amount = $7 WHERE id = $1",
        )
        .bind(order_id.get())
        .bind(totals.subtotal)
        .bind(totals.shipping)
        .bind(totals.tax)
        .bind(totals.total)
        .bind(totals.commission)
        .bind(totals.seller_amount)
        .execute(self.conn())
        .await
        .map_err(map_error)?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::not_found("order", order_id));
        }
        Ok(())
    }

    async fn lock_order(&mut self, id: OrderId) -> StoreResult<Order> {
        self.order(id, "FOR UPDATE").await
    }

    async fn get_order(&mut self, id: OrderId) -> StoreResult<Order> {
        self.order(id, "").await
    }

    async fn save_order_state(&mut self, order: &Order) -> StoreResult<()> {
        let updated = sqlx::query(
            "UPDATE storefront_orders SET status = $2, payment_status = $3, payment_transaction_id = $4, \
             escrow_release_date = $5, tracking_number = $6, seller_notes = $7, cancellation_reason = $8, \
             updated_at = $9, confirmed_at = $10, shipped_at = $11, delivered_at = $12, \
             cancelled_at = $13, refunded_at = $14, payment_completed_at = $15 \
             WHERE id = $1",
        )
        .bind(order.id.get())
        .bind(order.status.as_str())
        .bind(order.payment_status.as_str())
        .bind(&order.payment_transaction_id)
        .bind(order.escrow_release_date)
        .bind(&order.tracking_number)
        .bind(&order.seller_notes)
        .bind(&order.cancellation_reason)
        .bind(order.updated_at)
        .bind(order.confirmed_at)
        .bind(order.shipped_at)
        .bind(order.delivered_at)
        .bind(order.cancelled_at)
        .bind(order.refunded_at)
        .bind(order.payment_completed_at)
        .execute(self.conn())
        .await
        .map_err(map_error)?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::not_found("order", order.id));
        }
        Ok(())
    }

    async fn list_orders(
        &mut self,
        filter: &OrderFilter,
        max_limit: i64,
    ) -> StoreResult<OrderPage> {
        let mut count = QueryBuilder::<Postgres>::new(
            "SELECT COUNT(*) AS total FROM storefront_orders o JOIN storefronts s ON s.id = o.storefront_id",
        );
        push_filter(&mut count, filter);
        let row = count
            .build()
            .fetch_one(self.conn())
            .await
            .map_err(map_error)?;
        let total: i64 = column(&row, "total")?;

        let mut page = QueryBuilder::<Postgres>::new(format!(
            "SELECT {ORDER_COLUMNS} FROM storefront_orders o JOIN storefronts s ON s.id = o.storefront_id"
        ));
        push_filter(&mut page, filter);
        page.push(" ORDER BY o.created_at DESC, o.id DESC LIMIT ")
            .push_bind(filter.page_limit(max_limit))
            .push(" OFFSET ")
            .push_bind(filter.page_offset());
        let rows = page
            .build()
            .fetch_all(self.conn())
            .await
            .map_err(map_error)?;

        let orders = rows.iter().map(order_from_row).collect::<StoreResult<Vec<_>>>()?;
        let orders = self.with_lines(orders).await?;
        Ok(OrderPage { orders, total })
    }

    async fn order_stats(&mut self, filter: &OrderFilter) -> StoreResult<OrderStats> {
        let mut query = QueryBuilder::<Postgres>::new(
            "SELECT o.status, COUNT(*) AS orders, \
             COALESCE(SUM(o.total_amount), 0) AS revenue, \
             COALESCE(SUM(o.commission_amount), 0) AS commission \
             FROM storefront_orders o JOIN storefronts s ON s.id = o.storefront_id",
        );
        push_filter(&mut query, filter);
        query.push(" GROUP BY o.status");
        let rows = query
            .build()
            .fetch_all(self.conn())
            .await
            .map_err(map_error)?;

        let mut stats = OrderStats::default();
        let mut revenue_orders = 0_i64;
        for row in &rows {
            let status = parse_column::<OrderStatus>(row, "status")?;
            let orders: i64 = column(row, "orders")?;
            stats.count_by_status.insert(status, orders);
            stats.total_orders += orders;
            if !status.is_terminal() {
                revenue_orders += orders;
                stats.gross_revenue += column::<Decimal>(row, "revenue")?;
                stats.total_commission += column::<Decimal>(row, "commission")?;
            }
        }
        if revenue_orders > 0 {
            stats.average_order_value =
                (stats.gross_revenue / Decimal::from(revenue_orders)).round_dp(2);
        }
        Ok(stats)
    }

    async fn find_unbacked_pending_orders(
        &mut self,
        created_before: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<OrderId>> {
        let rows = sqlx::query(
            "SELECT o.id FROM storefront_orders o \
             WHERE o.status = 'pending' AND o.created_at < $1 \
               AND EXISTS (SELECT 1 FROM inventory_reservations r WHERE r.order_id = o.id) \
               AND NOT EXISTS (SELECT 1 FROM inventory_reservations r \
                               WHERE r.order_id = o.id AND r.status = 'active') \
             ORDER BY o.created_at, o.id LIMIT $2",
        )
        .bind(created_before)
        .bind(limit)
        .fetch_all(self.conn())
        .await
        .map_err(map_error)?;
        rows.iter()
            .map(|row| column(row, "id").map(OrderId::new))
            .collect()
    }
}

/// Append the WHERE clause for `filter`. Every value is a bind parameter.
fn push_filter(query: &mut QueryBuilder<'_, Postgres>, filter: &OrderFilter) {
    query.push(" WHERE TRUE");
    if let Some(id) = filter.storefront_id {
        query.push(" AND o.storefront_id = ").push_bind(id.get());
    }
    if let Some(id) = filter.customer_id {
        query.push(" AND o.customer_id = ").push_bind(id.get());
    }
    if let Some(id) = filter.seller_id {
        query.push(" AND s.owner_id = ").push_bind(id.get());
    }
    if let Some(status) = filter.status {
        query.push(" AND o.status = ").push_bind(status.as_str());
    }
    if let Some(from) = filter.created_from {
        query.push(" AND o.created_at >= ").push_bind(from);
    }
    if let Some(to) = filter.created_to {
        query.push(" AND o.created_at < ").push_bind(to);
    }
    if let Some(min) = filter.min_total {
        query.push(" AND o.total_amount >= ").push_bind(min);
    }
    if let Some(max) = filter.max_total {
        query.push(" AND o.total_amount <= ").push_bind(max);
    }
    if let Some(number) = &filter.order_number {
        query.push(" AND o.order_number = ").push_bind(number.clone());
    }
    if let Some(tracking) = &filter.tracking_number {
        query.push(" AND o.tracking_number = ").push_bind(tracking.clone());
    }
}

fn parse_column<T>(row: &PgRow, name: &str) -> StoreResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw: String = column(row, name)?;
    raw.parse().map_err(|error| decode_error(name, error))
}

fn order_from_row(row: &PgRow) -> StoreResult<Order> {
    let Json(shipping_address): Json<Address> = column(row, "shipping_address")?;
    let Json(billing_address): Json<Address> = column(row, "billing_address")?;
    let pickup_address: Option<Json<Address>> = column(row, "pickup_address")?;
    Ok(Order {
        id: OrderId::new(column(row, "id")?),
        order_number: column(row, "order_number")?,
        storefront_id: StorefrontId::new(column(row, "storefront_id")?),
        customer_id: UserId::new(column(row, "customer_id")?),
        status: parse_column(row, "status")?,
        payment_status: parse_column(row, "payment_status")?,
        payment_method: parse_column(row, "payment_method")?,
        payment_transaction_id: column(row, "payment_transaction_id")?,
        totals: OrderTotals {
            subtotal: column(row, "subtotal_amount")?,
            shipping: column(row, "shipping_amount")?,
            tax: column(row, "tax_amount")?,
            total: column(row, "total_amount")?,
            commission: column(row, "commission_amount")?,
            seller_amount: column(row, "seller_amount")?,
        },
        currency: column(row, "currency")?,
        escrow_days: column(row, "escrow_days")?,
        escrow_release_date: column(row, "escrow_release_date")?,
        shipping_address,
        billing_address,
        pickup_address: pickup_address.map(|Json(address)| address),
        shipping_method: column(row, "shipping_method")?,
        tracking_number: column(row, "tracking_number")?,
        customer_notes: column(row, "customer_notes")?,
        seller_notes: column(row, "seller_notes")?,
        cancellation_reason: column(row, "cancellation_reason")?,
        created_at: column(row, "created_at")?,
        updated_at: column(row, "updated_at")?,
        confirmed_at: column(row, "confirmed_at")?,
        shipped_at: column(row, "shipped_at")?,
        delivered_at: column(row, "delivered_at")?,
        cancelled_at: column(row, "cancelled_at")?,
        refunded_at: column(row, "refunded_at")?,
        payment_completed_at: column(row, "payment_completed_at")?,
        items: Vec::new(),
    })
}

fn item_from_row(row: &PgRow) -> StoreResult<OrderItem> {
    let Json(attributes): Json<ProductAttributes> = column(row, "attributes")?;
    let variant_id: Option<i64> = column(row, "variant_id")?;
    let warehouse_id: Option<i64> = column(row, "warehouse_id")?;
    Ok(OrderItem {
        id: OrderItemId::new(column(row, "id")?),
        order_id: OrderId::new(column(row, "order_id")?),
        product_id: ProductId::new(column(row, "product_id")?),
        variant_id: variant_id.map(VariantId::new),
        product_name: column(row, "product_name")?,
        product_sku: column(row, "product_sku")?,
        attributes,
        quantity: column(row, "quantity")?,
        price_per_unit: column(row, "price_per_unit")?,
        total_price: column(row, "total_price")?,
        warehouse_id: warehouse_id.map(WarehouseId::new),
        created_at: column(row, "created_at")?,
    })
}
