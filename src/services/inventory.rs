use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter};
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::{
    entities::product::{self, Entity as ProductEntity},
    errors::{ServiceError, StockShortage},
};

/// One line of a stock reservation batch.
#[derive(Debug, Clone, Copy)]
pub struct StockDemand {
    pub product_id: Uuid,
    pub quantity: i32,
}

/// Atomic check-and-decrement of product stock.
///
/// All operations run on the caller's connection, which for checkout is the
/// order transaction: stock decrements and order inserts commit or roll back
/// together. The decrement itself is a guarded conditional update
/// (`stock = stock - q WHERE stock >= q`), so two transactions racing for
/// the last units cannot both succeed — the database, not an in-process
/// lock, is the ordering authority, and the guard holds across multiple
/// server processes.
#[derive(Clone, Default)]
pub struct InventoryLedger;

impl InventoryLedger {
    pub fn new() -> Self {
        Self
    }

    /// Reserves stock for the whole batch, all-or-nothing.
    ///
    /// Re-reads every product, rejects the batch with a structured
    /// [`ServiceError::OutOfStock`] naming each shortfall, then applies the
    /// guarded decrements. A guard miss (stock consumed by a concurrent
    /// commit between read and write) also surfaces as `OutOfStock`; the
    /// caller rolls back the surrounding transaction, undoing any earlier
    /// decrements of the batch.
    #[instrument(skip(self, conn, demands), fields(batch_size = demands.len()))]
    pub async fn reserve<C: ConnectionTrait>(
        &self,
        conn: &C,
        demands: &[StockDemand],
    ) -> Result<(), ServiceError> {
        if demands.is_empty() {
            return Err(ServiceError::InvalidInput(
                "Stock reservation requires at least one item".to_string(),
            ));
        }
        if let Some(bad) = demands.iter().find(|d| d.quantity < 1) {
            return Err(ServiceError::InvalidInput(format!(
                "Quantity must be at least 1 for product {}",
                bad.product_id
            )));
        }

        let ids: Vec<Uuid> = demands.iter().map(|d| d.product_id).collect();
        let products = ProductEntity::find()
            .filter(product::Column::Id.is_in(ids))
            .all(conn)
            .await?;

        let mut shortages = Vec::new();
        for demand in demands {
            let current = products.iter().find(|p| p.id == demand.product_id);
            match current {
                None => {
                    return Err(ServiceError::NotFound(format!(
                        "Product {} not found",
                        demand.product_id
                    )));
                }
                Some(p) if p.stock < demand.quantity => {
                    shortages.push(StockShortage {
                        product_id: demand.product_id,
                        requested: demand.quantity,
                        available: p.stock,
                    });
                }
                Some(_) => {}
            }
        }
        if !shortages.is_empty() {
            warn!(shortage_count = shortages.len(), "Stock batch rejected");
            return Err(ServiceError::OutOfStock { shortages });
        }

        for demand in demands {
            let result = ProductEntity::update_many()
                .col_expr(
                    product::Column::Stock,
                    Expr::col(product::Column::Stock).sub(demand.quantity),
                )
                .col_expr(product::Column::UpdatedAt, Expr::value(Utc::now()))
                .filter(product::Column::Id.eq(demand.product_id))
                .filter(product::Column::Stock.gte(demand.quantity))
                .exec(conn)
                .await?;

            if result.rows_affected != 1 {
                // Lost the race to a concurrent commit; report the quantity
                // that is actually left.
                let available = ProductEntity::find_by_id(demand.product_id)
                    .one(conn)
                    .await?
                    .map(|p| p.stock)
                    .unwrap_or(0);
                warn!(
                    product_id = %demand.product_id,
                    requested = demand.quantity,
                    available,
                    "Guarded stock decrement missed"
                );
                return Err(ServiceError::out_of_stock(
                    demand.product_id,
                    demand.quantity,
                    available,
                ));
            }
        }

        Ok(())
    }

    /// Returns previously decremented stock. Operational restock only; the
    /// cancellation workflow deliberately does not call this.
    #[instrument(skip(self, conn))]
    pub async fn release<C: ConnectionTrait>(
        &self,
        conn: &C,
        product_id: Uuid,
        quantity: i32,
    ) -> Result<(), ServiceError> {
        if quantity < 1 {
            return Err(ServiceError::InvalidInput(
                "Release quantity must be at least 1".to_string(),
            ));
        }

        let result = ProductEntity::update_many()
            .col_expr(
                product::Column::Stock,
                Expr::col(product::Column::Stock).add(quantity),
            )
            .col_expr(product::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(product::Column::Id.eq(product_id))
            .exec(conn)
            .await?;

        if result.rows_affected != 1 {
            return Err(ServiceError::NotFound(format!(
                "Product {} not found",
                product_id
            )));
        }
        Ok(())
    }
}
