//! Shopping carts.

use crate::{PgTransaction, column, map_error};
use chrono::{DateTime, Utc};
use fulfillment_core::cart::{CartItem, CartOwner, NewCartItem, ShoppingCart};
use fulfillment_core::ids::{CartId, CartItemId, ProductId, StorefrontId, UserId, VariantId};
use fulfillment_core::store::{CartStore, StoreResult};
use fulfillment_core::StoreError;
use sqlx::postgres::PgRow;
use std::collections::HashMap;

const CART_COLUMNS: &str = "id, user_id, session_id, storefront_id, created_at, updated_at";

const ITEM_COLUMNS: &str =
    "id, cart_id, product_id, variant_id, quantity, price_per_unit, total_price, created_at, updated_at";

impl PgTransaction {
    /// Attach lines to carts read without them.
    async fn with_items(&mut self, mut carts: Vec<ShoppingCart>) -> StoreResult<Vec<ShoppingCart>> {
        if carts.is_empty() {
            return Ok(carts);
        }
        let ids: Vec<i64> = carts.iter().map(|cart| cart.id.get()).collect();
        let sql = format!("SELECT {ITEM_COLUMNS} FROM shopping_cart_items WHERE cart_id = ANY($1) ORDER BY id");
        let rows = sqlx::query(&sql)
            .bind(&ids)
            .fetch_all(self.conn())
            .await
            .map_err(map_error)?;

        let mut lines: HashMap<CartId, Vec<CartItem>> = HashMap::new();
        for row in &rows {
            let item = item_from_row(row)?;
            lines.entry(item.cart_id).or_default().push(item);
        }
        for cart in &mut carts {
            cart.items = lines.remove(&cart.id).unwrap_or_default();
        }
        Ok(carts)
    }

    async fn single_cart(&mut self, row: Option<PgRow>) -> StoreResult<Option<ShoppingCart>> {
        let Some(row) = row else {
            return Ok(None);
        };
        let cart = cart_from_row(&row)?;
        Ok(self.with_items(vec![cart]).await?.pop())
    }
}

impl CartStore for PgTransaction {
    async fn lock_cart(&mut self, id: CartId) -> StoreResult<ShoppingCart> {
        let sql = format!("SELECT {CART_COLUMNS} FROM shopping_carts WHERE id = $1 FOR UPDATE");
        let row = sqlx::query(&sql)
            .bind(id.get())
            .fetch_optional(self.conn())
            .await
            .map_err(map_error)?;
        self.single_cart(row)
            .await?
            .ok_or_else(|| StoreError::not_found("cart", id))
    }

    async fn lock_owner_cart(
        &mut self,
        owner: &CartOwner,
        storefront_id: StorefrontId,
    ) -> StoreResult<Option<ShoppingCart>> {
        let query = match owner {
            CartOwner::User(user) => sqlx::query(
                "SELECT id, user_id, session_id, storefront_id, created_at, updated_at \
                 FROM shopping_carts WHERE user_id = $1 AND storefront_id = $2 FOR UPDATE",
            )
            .bind(user.get()),
            CartOwner::Session(token) => sqlx::query(
                "SELECT id, user_id, session_id, storefront_id, created_at, updated_at \
                 FROM shopping_carts WHERE session_id = $1 AND storefront_id = $2 FOR UPDATE",
            )
            .bind(token.clone()),
        };
        let row = query
            .bind(storefront_id.get())
            .fetch_optional(self.conn())
            .await
            .map_err(map_error)?;
        self.single_cart(row).await
    }

    async fn insert_cart(
        &mut self,
        owner: &CartOwner,
        storefront_id: StorefrontId,
        now: DateTime<Utc>,
    ) -> StoreResult<ShoppingCart> {
        let sql = format!(
            "INSERT INTO shopping_carts (user_id, session_id, storefront_id, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $4) RETURNING {CART_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(owner.user_id().map(UserId::get))
            .bind(owner.session_id())
            .bind(storefront_id.get())
            .bind(now)
            .fetch_one(self.conn())
            .await
            .map_err(map_error)?;
        cart_from_row(&row)
    }

    async fn insert_cart_item(
        &mut self,
        cart_id: CartId,
        item: &NewCartItem,
        now: DateTime<Utc>,
    ) -> StoreResult<CartItem> {
        let touched = sqlx::query("UPDATE shopping_carts SET updated_at = $2 WHERE id = $1")
            .bind(cart_id.get())
            .bind(now)
            .execute(self.conn())
            .await
            .map_err(map_error)?;
        if touched.rows_affected() == 0 {
            return Err(StoreError::not_found("cart", cart_id));
        }

        let sql = format!(
            "INSERT INTO shopping_cart_items \
             (cart_id, product_id, variant_id, quantity, price_per_unit, total_price, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $7) RETURNING {ITEM_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(cart_id.get())
            .bind(item.product_id.get())
            .bind(item.variant_id.map(VariantId::get))
            .bind(item.quantity)
            .bind(item.price_per_unit)
            .bind(item.total_price())
            .bind(now)
            .fetch_one(self.conn())
            .await
            .map_err(map_error)?;
        item_from_row(&row)
    }

    async fn update_cart_item(&mut self, item: &CartItem) -> StoreResult<()> {
        let updated = sqlx::query(
            "UPDATE shopping_cart_items \
             SET quantity = $3, price_per_unit = $4, total_price = $5, updated_at = $6 \
             WHERE id = $1 AND cart_id = $2",
        )
        .bind(item.id.get())
        .bind(item.cart_id.get())
        .bind(item.quantity)
        .bind(item.price_per_unit)
        .bind(item.total_price)
        .bind(item.updated_at)
        .execute(self.conn())
        .await
        .map_err(map_error)?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::not_found("cart item", item.id));
        }
        Ok(())
    }

    async fn delete_cart_item(
        &mut self,
        cart_id: CartId,
        item_id: CartItemId,
    ) -> StoreResult<bool> {
        let deleted = sqlx::query("DELETE FROM shopping_cart_items WHERE id = $1 AND cart_id = $2")
            .bind(item_id.get())
            .bind(cart_id.get())
            .execute(self.conn())
            .await
            .map_err(map_error)?;
        Ok(deleted.rows_affected() > 0)
    }

    async fn clear_cart(&mut self, cart_id: CartId) -> StoreResult<u64> {
        // A failed DELETE would abort the whole transaction; the savepoint
        // keeps the caller's transaction usable.
        sqlx::query("SAVEPOINT clear_cart")
            .execute(self.conn())
            .await
            .map_err(map_error)?;
        let deleted = sqlx::query("DELETE FROM shopping_cart_items WHERE cart_id = $1")
            .bind(cart_id.get())
            .execute(self.conn())
            .await;

        match deleted {
            Ok(done) => {
                sqlx::query("RELEASE SAVEPOINT clear_cart")
                    .execute(self.conn())
                    .await
                    .map_err(map_error)?;
                Ok(done.rows_affected())
            }
            Err(error) => {
                sqlx::query("ROLLBACK TO SAVEPOINT clear_cart")
                    .execute(self.conn())
                    .await
                    .map_err(map_error)?;
                Err(map_error(error))
            }
        }
    }

    async fn delete_cart(&mut self, cart_id: CartId) -> StoreResult<()> {
        sqlx::query("DELETE FROM shopping_carts WHERE id = $1")
            .bind(cart_id.get())
            .execute(self.conn())
            .await
            .map_err(map_error)?;
        Ok(())
    }

    async fn list_user_carts(&mut self, user_id: UserId) -> StoreResult<Vec<ShoppingCart>> {
        let sql = format!("SELECT {CART_COLUMNS} FROM shopping_carts WHERE user_id = $1 ORDER BY id");
        let rows = sqlx::query(&sql)
            .bind(user_id.get())
            .fetch_all(self.conn())
            .await
            .map_err(map_error)?;
        let carts = rows.iter().map(cart_from_row).collect::<StoreResult<Vec<_>>>()?;
        self.with_items(carts).await
    }
}

fn cart_from_row(row: &PgRow) -> StoreResult<ShoppingCart> {
    let user_id: Option<i64> = column(row, "user_id")?;
    let session_id: Option<String> = column(row, "session_id")?;
    let owner = match (user_id, session_id) {
        (Some(user), _) => CartOwner::User(UserId::new(user)),
        (None, Some(session)) => CartOwner::Session(session),
        (None, None) => {
            return Err(StoreError::Database(
                "cart row has neither user_id nor session_id".to_string(),
            ));
        }
    };
    Ok(ShoppingCart {
        id: CartId::new(column(row, "id")?),
        owner,
        storefront_id: StorefrontId::new(column(row, "storefront_id")?),
        items: Vec::new(),
        created_at: column(row, "created_at")?,
        updated_at: column(row, "updated_at")?,
    })
}

fn item_from_row(row: &PgRow) -> StoreResult<CartItem> {
    let variant_id: Option<i64> = column(row, "variant_id")?;
    Ok(CartItem {
        id: CartItemId::new(column(row, "id")?),
        cart_id: CartId::new(column(row, "cart_id")?),
        product_id: ProductId::new(column(row, "product_id")?),
        variant_id: variant_id.map(VariantId::new),
        quantity: column(row, "quantity")?,
        price_per_unit: column(row, "price_per_unit")?,
        total_price: column(row, "total_price")?,
        created_at: column(row, "created_at")?,
        updated_at: column(row, "updated_at")?,
    })
}
