//! Storefront and product rows.

use crate::error::decode_error;
use crate::{PgTransaction, column, map_error};
use fulfillment_core::catalog::{
    Address, ProductAttributes, ProductSnapshot, Storefront, SubscriptionPlan,
};
use fulfillment_core::ids::{ProductId, StockKey, StorefrontId, UserId, VariantId, WarehouseId};
use fulfillment_core::store::{CatalogStore, StoreResult};
use fulfillment_core::StoreError;
use sqlx::postgres::PgRow;
use sqlx::types::Json;

const STOREFRONT_COLUMNS: &str =
    "SELECT id, owner_id, name, is_active, subscription_plan, address FROM storefronts WHERE id = $1";

const PRODUCT_SELECT: &str = r"
    SELECT p.id AS product_id, NULL::BIGINT AS variant_id, p.storefront_id, p.name, p.sku,
           p.price, p.stock_quantity, p.is_active, p.attributes, p.warehouse_id
    FROM storefront_products p
    WHERE p.id = $1";

const VARIANT_SELECT: &str = r"
    SELECT p.id AS product_id, v.id AS variant_id, p.storefront_id, p.name,
           COALESCE(v.sku, p.sku) AS sku, COALESCE(v.price, p.price) AS price,
           v.stock_quantity, (p.is_active AND v.is_active) AS is_active,
           p.attributes || v.attributes AS attributes, p.warehouse_id
    FROM storefront_product_variants v
    JOIN storefront_products p ON p.id = v.product_id
    WHERE p.id = $1 AND v.id = $2";

impl PgTransaction {
    async fn storefront(&mut self, id: StorefrontId, lock: &str) -> StoreResult<Storefront> {
        let sql = format!("{STOREFRONT_COLUMNS} {lock}");
        let row = sqlx::query(&sql)
            .bind(id.get())
            .fetch_optional(self.conn())
            .await
            .map_err(map_error)?
            .ok_or_else(|| StoreError::not_found("storefront", id))?;
        storefront_from_row(&row)
    }

    async fn product(
        &mut self,
        product_id: ProductId,
        variant_id: Option<VariantId>,
        lock: bool,
    ) -> StoreResult<ProductSnapshot> {
        let row = match variant_id {
            None => {
                let sql = format!("{PRODUCT_SELECT} {}", if lock { "FOR UPDATE" } else { "" });
                sqlx::query(&sql)
                    .bind(product_id.get())
                    .fetch_optional(self.conn())
                    .await
                    .map_err(map_error)?
                    .ok_or_else(|| StoreError::not_found("product", product_id))?
            }
            Some(variant) => {
                // The variant row carries the stock. The product row is locked
                // first, in its own statement, so every key of one product takes
                // the product row before anything else.
                if lock {
                    sqlx::query("SELECT id FROM storefront_products WHERE id = $1 FOR SHARE")
                        .bind(product_id.get())
                        .fetch_optional(self.conn())
                        .await
                        .map_err(map_error)?
                        .ok_or_else(|| StoreError::not_found("product", product_id))?;
                }
                let suffix = if lock { "FOR UPDATE OF v" } else { "" };
                let sql = format!("{VARIANT_SELECT} {suffix}");
                sqlx::query(&sql)
                    .bind(product_id.get())
                    .bind(variant.get())
                    .fetch_optional(self.conn())
                    .await
                    .map_err(map_error)?
                    .ok_or_else(|| StoreError::not_found("variant", variant))?
            }
        };
        product_from_row(&row)
    }
}

impl CatalogStore for PgTransaction {
    async fn lock_storefront_shared(&mut self, id: StorefrontId) -> StoreResult<Storefront> {
        self.storefront(id, "FOR SHARE").await
    }

    async fn get_storefront(&mut self, id: StorefrontId) -> StoreResult<Storefront> {
        self.storefront(id, "").await
    }

    async fn lock_product(
        &mut self,
        product_id: ProductId,
        variant_id: Option<VariantId>,
    ) -> StoreResult<ProductSnapshot> {
        self.product(product_id, variant_id, true).await
    }

    async fn get_product(
        &mut self,
        product_id: ProductId,
        variant_id: Option<VariantId>,
    ) -> StoreResult<ProductSnapshot> {
        self.product(product_id, variant_id, false).await
    }

    async fn adjust_stock(&mut self, key: StockKey, delta: i32) -> StoreResult<i32> {
        let row = match key.variant_id {
            None => sqlx::query(
                "UPDATE storefront_products SET stock_quantity = stock_quantity + $2 \
                 WHERE id = $1 RETURNING stock_quantity",
            )
            .bind(key.product_id.get())
            .bind(delta)
            .fetch_optional(self.conn())
            .await
            .map_err(map_error)?
            .ok_or_else(|| StoreError::not_found("product", key.product_id))?,
            Some(variant) => sqlx::query(
                "UPDATE storefront_product_variants SET stock_quantity = stock_quantity + $3 \
                 WHERE product_id = $1 AND id = $2 RETURNING stock_quantity",
            )
            .bind(key.product_id.get())
            .bind(variant.get())
            .bind(delta)
            .fetch_optional(self.conn())
            .await
            .map_err(map_error)?
            .ok_or_else(|| StoreError::not_found("variant", variant))?,
        };
        column(&row, "stock_quantity")
    }
}

fn storefront_from_row(row: &PgRow) -> StoreResult<Storefront> {
    let plan: String = column(row, "subscription_plan")?;
    let address: Option<Json<Address>> = column(row, "address")?;
    Ok(Storefront {
        id: StorefrontId::new(column(row, "id")?),
        owner_id: UserId::new(column(row, "owner_id")?),
        name: column(row, "name")?,
        is_active: column(row, "is_active")?,
        subscription_plan: SubscriptionPlan::parse(&plan),
        address: address.map(|Json(address)| address),
    })
}

fn product_from_row(row: &PgRow) -> StoreResult<ProductSnapshot> {
    let attributes: serde_json::Value = column(row, "attributes")?;
    let attributes: ProductAttributes =
        serde_json::from_value(attributes).map_err(|error| decode_error("attributes", error))?;
    let variant_id: Option<i64> = column(row, "variant_id")?;
    let warehouse_id: Option<i64> = column(row, "warehouse_id")?;
    Ok(ProductSnapshot {
        product_id: ProductId::new(column(row, "product_id")?),
        variant_id: variant_id.map(VariantId::new),
        storefront_id: StorefrontId::new(column(row, "storefront_id")?),
        name: column(row, "name")?,
        sku: column(row, "sku")?,
        price: column(row, "price")?,
        stock_quantity: column(row, "stock_quantity")?,
        is_active: column(row, "is_active")?,
        attributes,
        warehouse_id: warehouse_id.map(WarehouseId::new),
    })
}
