//! Inventory reservations.

use crate::{PgTransaction, column, map_error};
use crate::error::decode_error;
use chrono::{DateTime, Utc};
use fulfillment_core::ids::{OrderId, ProductId, ReservationId, StockKey, VariantId};
use fulfillment_core::reservation::{InventoryReservation, NewReservation, ReservationStatus};
use fulfillment_core::store::{ReservationStore, StoreResult};
use fulfillment_core::StoreError;
use sqlx::postgres::PgRow;

const COLUMNS: &str = "id, product_id, variant_id, order_id, quantity, status, stock_deducted, \
     expires_at, created_at, updated_at";

/// Lock order shared by every multi-row read, so two transactions never
/// wait on each other's holds in opposite order.
const KEY_ORDER: &str = "ORDER BY product_id, variant_id NULLS FIRST, id";

impl ReservationStore for PgTransaction {
    async fn insert_reservation(
        &mut self,
        reservation: &NewReservation,
    ) -> StoreResult<InventoryReservation> {
        let sql = format!(
            "INSERT INTO inventory_reservations \
             (product_id, variant_id, order_id, quantity, status, stock_deducted, expires_at, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, 'active', $5, $6, $7, $7) RETURNING {COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(reservation.product_id.get())
            .bind(reservation.variant_id.map(VariantId::get))
            .bind(reservation.order_id.get())
            .bind(reservation.quantity)
            .bind(reservation.stock_deducted)
            .bind(reservation.expires_at)
            .bind(reservation.created_at)
            .fetch_one(self.conn())
            .await
            .map_err(map_error)?;
        reservation_from_row(&row)
    }

    async fn lock_reservation(&mut self, id: ReservationId) -> StoreResult<InventoryReservation> {
        let sql = format!("SELECT {COLUMNS} FROM inventory_reservations WHERE id = $1 FOR UPDATE");
        let row = sqlx::query(&sql)
            .bind(id.get())
            .fetch_optional(self.conn())
            .await
            .map_err(map_error)?
            .ok_or_else(|| StoreError::not_found("reservation", id))?;
        reservation_from_row(&row)
    }

    async fn lock_order_reservations(
        &mut self,
        order_id: OrderId,
    ) -> StoreResult<Vec<InventoryReservation>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM inventory_reservations WHERE order_id = $1 {KEY_ORDER} FOR UPDATE"
        );
        let rows = sqlx::query(&sql)
            .bind(order_id.get())
            .fetch_all(self.conn())
            .await
            .map_err(map_error)?;
        rows.iter().map(reservation_from_row).collect()
    }

    async fn lock_expired_reservations(
        &mut self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<InventoryReservation>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM inventory_reservations \
             WHERE status = 'active' AND expires_at < $1 \
             {KEY_ORDER} LIMIT $2 FOR UPDATE SKIP LOCKED"
        );
        let rows = sqlx::query(&sql)
            .bind(now)
            .bind(limit.max(0))
            .fetch_all(self.conn())
            .await
            .map_err(map_error)?;
        rows.iter().map(reservation_from_row).collect()
    }

    async fn set_reservation_status(
        &mut self,
        id: ReservationId,
        status: ReservationStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let updated = sqlx::query(
            "UPDATE inventory_reservations SET status = $2, updated_at = $3 WHERE id = $1",
        )
        .bind(id.get())
        .bind(status.as_str())
        .bind(now)
        .execute(self.conn())
        .await
        .map_err(map_error)?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::not_found("reservation", id));
        }
        Ok(())
    }

    async fn soft_held_quantity(&mut self, key: StockKey, now: DateTime<Utc>) -> StoreResult<i64> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(quantity), 0)::BIGINT AS held FROM inventory_reservations \
             WHERE product_id = $1 AND variant_id IS NOT DISTINCT FROM $2 \
               AND status = 'active' AND NOT stock_deducted AND expires_at > $3",
        )
        .bind(key.product_id.get())
        .bind(key.variant_id.map(VariantId::get))
        .bind(now)
        .fetch_one(self.conn())
        .await
        .map_err(map_error)?;
        column(&row, "held")
    }
}

fn reservation_from_row(row: &PgRow) -> StoreResult<InventoryReservation> {
    let status: String = column(row, "status")?;
    let variant_id: Option<i64> = column(row, "variant_id")?;
    Ok(InventoryReservation {
        id: ReservationId::new(column(row, "id")?),
        product_id: ProductId::new(column(row, "product_id")?),
        variant_id: variant_id.map(VariantId::new),
        order_id: OrderId::new(column(row, "order_id")?),
        quantity: column(row, "quantity")?,
        status: status
            .parse::<ReservationStatus>()
            .map_err(|error| decode_error("status", error))?,
        stock_deducted: column(row, "stock_deducted")?,
        expires_at: column(row, "expires_at")?,
        created_at: column(row, "created_at")?,
        updated_at: column(row, "updated_at")?,
    })
}
