//! Catalog collaborator: product lookups and inventory counter updates.
//!
//! This service is the only component that mutates `inventory` and
//! `reserved_inventory`. Every counter mutation is a single conditional
//! `UPDATE` with its guard in the `WHERE` clause, so concurrent requests
//! can never read-modify-write the counters into an inconsistent state.

use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::db::DbPool;
use crate::entities::{product, Product, ProductModel};
use crate::errors::ServiceError;

#[derive(Clone)]
pub struct CatalogService {
    db: DbPool,
}

impl CatalogService {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }

    pub async fn get_product(&self, product_id: Uuid) -> Result<ProductModel, ServiceError> {
        Product::find_by_id(product_id)
            .one(&self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", product_id)))
    }

    /// Claims `quantity` units for a cart.
    ///
    /// The guard `inventory - reserved_inventory >= quantity` rides in the
    /// statement itself; zero rows affected means the stock was taken by a
    /// concurrent request (or the product is gone).
    #[instrument(skip(self))]
    pub async fn reserve_stock(&self, product_id: Uuid, quantity: i32) -> Result<(), ServiceError> {
        let result = Product::update_many()
            .col_expr(
                product::Column::ReservedInventory,
                Expr::col(product::Column::ReservedInventory).add(quantity),
            )
            .col_expr(product::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(product::Column::Id.eq(product_id))
            .filter(
                Expr::col(product::Column::Inventory)
                    .gte(Expr::col(product::Column::ReservedInventory).add(quantity)),
            )
            .exec(&self.db)
            .await?;

        if result.rows_affected == 0 {
            let product = self.get_product(product_id).await?;
            return Err(ServiceError::InsufficientStock(format!(
                "Only {} units of '{}' available",
                product.available(),
                product.name
            )));
        }
        Ok(())
    }

    /// Releases a cart's claim on `quantity` units.
    ///
    /// The reservation counter never goes below zero: if fewer than
    /// `quantity` units are currently reserved the counter is cleared and
    /// the discrepancy logged.
    #[instrument(skip(self))]
    pub async fn release_reservation(
        &self,
        product_id: Uuid,
        quantity: i32,
    ) -> Result<(), ServiceError> {
        let result = Product::update_many()
            .col_expr(
                product::Column::ReservedInventory,
                Expr::col(product::Column::ReservedInventory).sub(quantity),
            )
            .col_expr(product::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(product::Column::Id.eq(product_id))
            .filter(product::Column::ReservedInventory.gte(quantity))
            .exec(&self.db)
            .await?;

        if result.rows_affected == 0 {
            // Product missing is fine to surface; a short reservation
            // counter is floored instead.
            let product = self.get_product(product_id).await?;
            warn!(
                %product_id,
                reserved = product.reserved_inventory,
                requested = quantity,
                "releasing more than reserved; flooring counter at zero"
            );
            Product::update_many()
                .col_expr(product::Column::ReservedInventory, Expr::value(0))
                .col_expr(product::Column::UpdatedAt, Expr::value(Utc::now()))
                .filter(product::Column::Id.eq(product_id))
                .exec(&self.db)
                .await?;
        }
        Ok(())
    }

    /// Converts a reservation into a sale: both counters drop by
    /// `quantity`. Returns the remaining inventory for low-stock checks.
    #[instrument(skip(self))]
    pub async fn commit_sale(&self, product_id: Uuid, quantity: i32) -> Result<i32, ServiceError> {
        let result = Product::update_many()
            .col_expr(
                product::Column::Inventory,
                Expr::col(product::Column::Inventory).sub(quantity),
            )
            .col_expr(
                product::Column::ReservedInventory,
                Expr::col(product::Column::ReservedInventory).sub(quantity),
            )
            .col_expr(product::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(product::Column::Id.eq(product_id))
            .filter(product::Column::Inventory.gte(quantity))
            .filter(product::Column::ReservedInventory.gte(quantity))
            .exec(&self.db)
            .await?;

        if result.rows_affected == 0 {
            let product = self.get_product(product_id).await?;
            return Err(ServiceError::InsufficientStock(format!(
                "Only {} units of '{}' available",
                product.available(),
                product.name
            )));
        }

        let product = self.get_product(product_id).await?;
        Ok(product.inventory)
    }

    /// Returns previously sold units to stock after a cancellation or
    /// refund. Inventory grows by `quantity`; any outstanding reservation
    /// shrinks by the same amount, floored at zero.
    #[instrument(skip(self))]
    pub async fn return_stock(&self, product_id: Uuid, quantity: i32) -> Result<(), ServiceError> {
        let result = Product::update_many()
            .col_expr(
                product::Column::Inventory,
                Expr::col(product::Column::Inventory).add(quantity),
            )
            .col_expr(
                product::Column::ReservedInventory,
                Expr::col(product::Column::ReservedInventory).sub(quantity),
            )
            .col_expr(product::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(product::Column::Id.eq(product_id))
            .filter(product::Column::ReservedInventory.gte(quantity))
            .exec(&self.db)
            .await?;

        if result.rows_affected == 0 {
            // Too few units reserved to decrement; other carts may own
            // whatever reservation remains, so only inventory is restored.
            let result = Product::update_many()
                .col_expr(
                    product::Column::Inventory,
                    Expr::col(product::Column::Inventory).add(quantity),
                )
                .col_expr(product::Column::UpdatedAt, Expr::value(Utc::now()))
                .filter(product::Column::Id.eq(product_id))
                .exec(&self.db)
                .await?;

            if result.rows_affected == 0 {
                // A product deleted after being sold cannot take its stock
                // back; cancellation still proceeds.
                warn!(%product_id, "skipping stock return for missing product");
            }
        }
        Ok(())
    }
}
