use async_trait::async_trait;
use tracing::info;

use crate::{
    entities::{order, order_item},
    errors::ServiceError,
};

/// Post-commit invoice collaborator.
///
/// The orchestrator notifies this after the checkout transaction commits;
/// implementations render and email a receipt. A dispatch failure is logged
/// by the caller and never unwinds the order — the order row is the durable
/// source of truth, the invoice a best-effort derivative.
#[async_trait]
pub trait InvoiceDispatcher: Send + Sync {
    async fn dispatch(
        &self,
        order: &order::Model,
        items: &[order_item::Model],
    ) -> Result<(), ServiceError>;
}

/// Default dispatcher: logs the invoice summary. Real deployments swap in a
/// renderer/mailer implementation behind the same trait.
#[derive(Clone, Default)]
pub struct LoggingInvoiceDispatcher;

#[async_trait]
impl InvoiceDispatcher for LoggingInvoiceDispatcher {
    async fn dispatch(
        &self,
        order: &order::Model,
        items: &[order_item::Model],
    ) -> Result<(), ServiceError> {
        info!(
            order_number = %order.order_number,
            user_id = %order.user_id,
            total = %order.total,
            currency = %order.currency,
            line_count = items.len(),
            "Invoice dispatched"
        );
        Ok(())
    }
}
