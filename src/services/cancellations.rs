use chrono::Utc;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;
use validator::Validate;

use crate::{
    entities::{
        order::{self, Entity as OrderEntity, OrderStatus},
        order_item::{self, Entity as OrderItemEntity},
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::orders::{OrderResponse, OrderService},
};

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RequestCancellationInput {
    #[validate(length(min = 1, max = 2000, message = "Cancellation reason is required"))]
    pub reason: String,
    #[validate(length(min = 1, max = 500, message = "Refund account details are required"))]
    pub refund_account: String,
}

/// Cancellation workflow: records a shopper's refund request as a
/// state-gated order transition.
///
/// Recording the request is all this does — no refund is executed and no
/// stock is returned; both are operational decisions made by fulfillment
/// staff, who move the order to `Cancelled` via [`confirm_cancellation`].
///
/// [`confirm_cancellation`]: CancellationService::confirm_cancellation
#[derive(Clone)]
pub struct CancellationService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    orders: Arc<OrderService>,
}

impl CancellationService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        orders: Arc<OrderService>,
    ) -> Self {
        Self {
            db,
            event_sender,
            orders,
        }
    }

    /// Records a cancellation request on one of the caller's orders.
    ///
    /// Ownership mismatch (`Forbidden`) and a non-cancellable status
    /// (`InvalidStatus`) are distinct from `NotFound`, so the caller can say
    /// "already fulfilled" rather than "no such order".
    #[instrument(skip(self, input), fields(user_id = %user_id, order_id = %order_id))]
    pub async fn request_cancellation(
        &self,
        user_id: Uuid,
        order_id: Uuid,
        input: RequestCancellationInput,
    ) -> Result<OrderResponse, ServiceError> {
        input.validate()?;

        let order = OrderEntity::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        if order.user_id != user_id {
            return Err(ServiceError::Forbidden(
                "Order belongs to another user".to_string(),
            ));
        }
        if !order.status.is_cancellable() {
            return Err(ServiceError::InvalidStatus(format!(
                "Order {} is {} and can no longer be cancelled",
                order_id, order.status
            )));
        }

        let updated = self
            .orders
            .transition_status(order_id, OrderStatus::CancellationRequested, |active| {
                active.cancel_reason = Set(Some(input.reason.clone()));
                active.refund_account = Set(Some(input.refund_account.clone()));
                active.cancel_requested_at = Set(Some(Utc::now()));
            })
            .await?;

        info!(order_id = %order_id, "Cancellation request recorded");
        self.event_sender
            .send_or_log(Event::CancellationRequested { order_id, user_id })
            .await;

        self.with_items(updated).await
    }

    /// Operational step: closes out a requested cancellation.
    /// Deliberately does not restock or execute a refund.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn confirm_cancellation(&self, order_id: Uuid) -> Result<OrderResponse, ServiceError> {
        let updated = self
            .orders
            .transition_status(order_id, OrderStatus::Cancelled, |_| {})
            .await?;

        self.event_sender
            .send_or_log(Event::OrderCancelled(order_id))
            .await;

        self.with_items(updated).await
    }

    async fn with_items(&self, order: order::Model) -> Result<OrderResponse, ServiceError> {
        let items = OrderItemEntity::find()
            .filter(order_item::Column::OrderId.eq(order.id))
            .all(&*self.db)
            .await?;
        Ok(crate::services::orders::model_to_response(order, items))
    }
}
