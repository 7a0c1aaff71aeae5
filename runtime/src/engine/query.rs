//! Read paths.

use super::{OrderEngine, log_failure};
use crate::transaction::discard;
use fulfillment_core::error::StoreResultExt;
use fulfillment_core::ids::{OrderId, UserId};
use fulfillment_core::order::{Order, OrderFilter, OrderPage, OrderStats};
use fulfillment_core::store::{CatalogStore, Database, OrderStore};
use fulfillment_core::{OrderError, Result};

impl<D: Database> OrderEngine<D> {
    /// Read an order. Only its buyer and the owner of its storefront may.
    ///
    /// # Errors
    ///
    /// [`OrderError::AccessDenied`] for anyone else, [`OrderError::NotFound`]
    /// if the order does not exist.
    pub async fn get_order(&self, order_id: OrderId, requester_id: UserId) -> Result<Order> {
        let mut tx = self.db.begin().await.context("begin read")?;
        let result: Result<Order> = async {
            let order = tx.get_order(order_id).await.context("read order")?;
            if order.customer_id == requester_id {
                return Ok(order);
            }
            let storefront = tx
                .get_storefront(order.storefront_id)
                .await
                .context("read storefront")?;
            if storefront.owner_id == requester_id {
                Ok(order)
            } else {
                Err(OrderError::AccessDenied)
            }
        }
        .await;
        discard(tx).await;

        if let Err(error) = &result {
            log_failure("get_order", error);
        }
        result
    }

    /// Filtered listing, newest first. Page size defaults to 20 and is capped
    /// at the configured maximum.
    ///
    /// # Errors
    ///
    /// [`OrderError::Validation`] for an inverted amount or date range, store
    /// errors otherwise.
    pub async fn list_orders(&self, filter: &OrderFilter) -> Result<OrderPage> {
        check_ranges(filter)?;
        let mut tx = self.db.begin().await.context("begin listing")?;
        let result = tx
            .list_orders(filter, self.config.list_max_limit)
            .await
            .context("list orders");
        discard(tx).await;
        result
    }

    /// Counts and revenue figures over every order matching `filter`.
    ///
    /// Paging fields of the filter are ignored.
    ///
    /// # Errors
    ///
    /// As for [`Self::list_orders`].
    pub async fn order_stats(&self, filter: &OrderFilter) -> Result<OrderStats> {
        check_ranges(filter)?;
        let mut tx = self.db.begin().await.context("begin stats")?;
        let result = tx.order_stats(filter).await.context("order stats");
        discard(tx).await;
        result
    }
}

fn check_ranges(filter: &OrderFilter) -> Result<()> {
    if let (Some(min), Some(max)) = (filter.min_total, filter.max_total) {
        if min > max {
            return Err(OrderError::Validation(format!(
                "min_total {min} is greater than max_total {max}"
            )));
        }
    }
    if let (Some(from), Some(to)) = (filter.created_from, filter.created_to) {
        if from > to {
            return Err(OrderError::Validation(
                "created_from is after created_to".to_string(),
            ));
        }
    }
    Ok(())
}
