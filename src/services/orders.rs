use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
    TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::{
    config::AppConfig,
    entities::{
        cart::{self, Entity as CartEntity},
        cart_item::{self, Entity as CartItemEntity},
        order::{self, Entity as OrderEntity, OrderStatus},
        order_item::{self, Entity as OrderItemEntity},
        product::{self, Entity as ProductEntity},
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::{
        inventory::{InventoryLedger, StockDemand},
        invoicing::InvoiceDispatcher,
        order_numbers::OrderNumberGenerator,
        payments::{PaymentReference, PaymentVerifier},
    },
};

/// Exact line arithmetic; quantities are validated positive at the boundary.
fn line_total(unit_price: Decimal, quantity: i32) -> Decimal {
    unit_price * Decimal::from(quantity)
}

/// One requested line of a checkout.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct OrderItemInput {
    pub product_id: Uuid,
    #[validate(range(min = 1, message = "Quantity must be at least 1"))]
    pub quantity: i32,
    pub selected_size: Option<String>,
    pub selected_color: Option<String>,
}

/// Postal address, stored as a JSON snapshot on the order.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct Address {
    #[validate(length(min = 1, message = "Recipient name is required"))]
    pub recipient: String,
    #[validate(length(min = 1, message = "Address line is required"))]
    pub line1: String,
    pub line2: Option<String>,
    #[validate(length(min = 1, message = "City is required"))]
    pub city: String,
    pub province: Option<String>,
    #[validate(length(min = 1, message = "Postal code is required"))]
    pub postal_code: String,
    #[validate(length(min = 2, max = 2, message = "Country code must be 2 characters"))]
    pub country_code: String,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateOrderRequest {
    pub user_id: Uuid,
    pub items: Vec<OrderItemInput>,
    /// Absent for pay-on-delivery / deferred payment flows; the order is
    /// then created as `PendingPayment`.
    pub payment: Option<PaymentReference>,
    pub shipping_address: Option<Address>,
    pub billing_address: Option<Address>,
    #[validate(length(max = 2000, message = "Notes must be at most 2000 characters"))]
    pub notes: Option<String>,
    /// Falls back to the configured default currency.
    #[validate(length(min = 3, max = 3, message = "Currency must be 3 characters"))]
    pub currency: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderItemResponse {
    pub id: Uuid,
    pub product_id: Uuid,
    pub product_name: String,
    pub sku: String,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub line_total: Decimal,
    pub selected_size: Option<String>,
    pub selected_color: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResponse {
    pub id: Uuid,
    pub order_number: String,
    pub user_id: Uuid,
    pub status: OrderStatus,
    pub currency: String,
    pub subtotal: Decimal,
    pub shipping_fee: Decimal,
    pub tax_amount: Decimal,
    pub total: Decimal,
    pub placed_at: DateTime<Utc>,
    pub fulfilled_at: Option<DateTime<Utc>>,
    pub shipping_address: Option<String>,
    pub billing_address: Option<String>,
    pub notes: Option<String>,
    pub gateway_order_id: Option<String>,
    pub payment_id: Option<String>,
    pub items: Vec<OrderItemResponse>,
}

/// Checkout orchestrator and order repository.
///
/// `create_order` composes cart validation, payment verification, inventory
/// decrement and order persistence into one atomic operation; listing and
/// the fulfillment transition live here too. Readers only ever see an order
/// whose stock was decremented, and no stock is decremented without a
/// persisted order — one transaction boundary covers both.
#[derive(Clone)]
pub struct OrderService {
    db: Arc<DatabaseConnection>,
    config: Arc<AppConfig>,
    event_sender: Arc<EventSender>,
    ledger: InventoryLedger,
    verifier: PaymentVerifier,
    order_numbers: OrderNumberGenerator,
    invoice_dispatcher: Arc<dyn InvoiceDispatcher>,
}

impl OrderService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        config: Arc<AppConfig>,
        event_sender: Arc<EventSender>,
        invoice_dispatcher: Arc<dyn InvoiceDispatcher>,
    ) -> Self {
        let verifier = PaymentVerifier::new(config.payment_secret.clone());
        Self {
            db,
            config,
            event_sender,
            ledger: InventoryLedger::new(),
            verifier,
            order_numbers: OrderNumberGenerator::new(),
            invoice_dispatcher,
        }
    }

    /// Converts the requested items into a committed, paid (or
    /// pending-payment), inventory-consistent order.
    ///
    /// Resubmitting the same payment reference returns the already-committed
    /// order instead of creating a duplicate.
    #[instrument(skip(self, request), fields(user_id = %request.user_id, item_count = request.items.len()))]
    pub async fn create_order(
        &self,
        request: CreateOrderRequest,
    ) -> Result<OrderResponse, ServiceError> {
        self.validate_request(&request)?;

        // Payment check comes first: a forged reference must not reach the
        // idempotency probe, and a bad signature means no order row and no
        // stock movement at all.
        let status = match &request.payment {
            Some(payment) => {
                if !self.verifier.verify(payment)? {
                    return Err(ServiceError::PaymentInvalid(format!(
                        "Signature mismatch for gateway order {}",
                        payment.gateway_order_id
                    )));
                }
                OrderStatus::Paid
            }
            None => OrderStatus::PendingPayment,
        };

        // Idempotency probe: a retried client call with a payment reference
        // we already bound to an order must not double-decrement stock. The
        // existing order is returned only to its owner; anyone else reusing
        // the reference gets a Conflict, never another user's order.
        if let Some(payment) = &request.payment {
            if let Some(existing) = self.find_by_payment_id(&payment.payment_id).await? {
                if existing.user_id != request.user_id {
                    warn!(
                        payment_id = %payment.payment_id,
                        "Payment reference already bound to another user's order"
                    );
                    return Err(ServiceError::Conflict(format!(
                        "Payment {} is already bound to an order",
                        payment.payment_id
                    )));
                }
                info!(
                    order_id = %existing.id,
                    payment_id = %payment.payment_id,
                    "Duplicate payment reference; returning existing order"
                );
                return Ok(existing);
            }
        }

        // Price from the current catalog, never from the client.
        let lines = self.resolve_lines(&request.items).await?;
        let subtotal: Decimal = lines
            .iter()
            .map(|(p, input)| line_total(p.price, input.quantity))
            .sum();
        let shipping_fee = self.config.shipping_fee;
        let tax_amount = (subtotal * self.config.tax_rate).round_dp(2);
        let total = subtotal + shipping_fee + tax_amount;

        let currency = request
            .currency
            .clone()
            .unwrap_or_else(|| self.config.default_currency.clone());
        let order_id = Uuid::new_v4();
        let order_number = self.order_numbers.generate();
        let now = Utc::now();

        let demands: Vec<StockDemand> = request
            .items
            .iter()
            .map(|i| StockDemand {
                product_id: i.product_id,
                quantity: i.quantity,
            })
            .collect();

        // The transaction boundary: stock decrement, order + item inserts
        // and cart clearing commit or roll back together.
        let txn = self.db.begin().await.map_err(|e| {
            error!(error = %e, "Failed to start checkout transaction");
            ServiceError::DatabaseError(e)
        })?;

        self.ledger.reserve(&txn, &demands).await?;

        let order_active = order::ActiveModel {
            id: Set(order_id),
            order_number: Set(order_number.clone()),
            user_id: Set(request.user_id),
            status: Set(status),
            currency: Set(currency),
            subtotal: Set(subtotal),
            shipping_fee: Set(shipping_fee),
            tax_amount: Set(tax_amount),
            total: Set(total),
            placed_at: Set(now),
            fulfilled_at: Set(None),
            shipping_address: Set(encode_address(request.shipping_address.as_ref())?),
            billing_address: Set(encode_address(request.billing_address.as_ref())?),
            notes: Set(request.notes.clone()),
            gateway_order_id: Set(request.payment.as_ref().map(|p| p.gateway_order_id.clone())),
            payment_id: Set(request.payment.as_ref().map(|p| p.payment_id.clone())),
            payment_signature: Set(request.payment.as_ref().map(|p| p.signature.clone())),
            cancel_reason: Set(None),
            refund_account: Set(None),
            cancel_requested_at: Set(None),
            created_at: Set(now),
            updated_at: Set(Some(now)),
            version: Set(1),
        };

        let order_model = match order_active.insert(&txn).await {
            Ok(model) => model,
            Err(e) => {
                // A concurrent retry may have won the unique payment_id
                // race; roll back and return the committed winner.
                drop(txn);
                if let Some(payment) = &request.payment {
                    if let Some(existing) = self.find_by_payment_id(&payment.payment_id).await? {
                        if existing.user_id != request.user_id {
                            return Err(ServiceError::Conflict(format!(
                                "Payment {} is already bound to an order",
                                payment.payment_id
                            )));
                        }
                        warn!(
                            payment_id = %payment.payment_id,
                            "Lost idempotency race; returning existing order"
                        );
                        return Ok(existing);
                    }
                }
                error!(error = %e, order_id = %order_id, "Failed to insert order");
                return Err(ServiceError::DatabaseError(e));
            }
        };

        let mut item_models = Vec::with_capacity(lines.len());
        for (product, input) in &lines {
            let item = order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                product_id: Set(product.id),
                product_name: Set(product.name.clone()),
                sku: Set(product.sku.clone()),
                quantity: Set(input.quantity),
                unit_price: Set(product.price),
                line_total: Set(line_total(product.price, input.quantity)),
                selected_size: Set(input.selected_size.clone()),
                selected_color: Set(input.selected_color.clone()),
                created_at: Set(now),
            };
            item_models.push(item.insert(&txn).await?);
        }

        // Clear the purchased lines from the cart inside the same
        // transaction, so no observer sees decremented stock next to a cart
        // that still lists the purchased items.
        self.clear_cart_lines(&txn, request.user_id, &demands)
            .await?;

        txn.commit().await.map_err(|e| {
            error!(error = %e, order_id = %order_id, "Failed to commit checkout transaction");
            ServiceError::DatabaseError(e)
        })?;

        info!(
            order_id = %order_id,
            order_number = %order_number,
            status = %order_model.status,
            total = %order_model.total,
            "Order committed"
        );

        // Post-commit, best-effort: collaborators cannot unwind the order.
        self.event_sender
            .send_or_log(Event::OrderCreated(order_id))
            .await;
        for demand in &demands {
            self.event_sender
                .send_or_log(Event::StockDecremented {
                    product_id: demand.product_id,
                    quantity: demand.quantity,
                    order_id,
                })
                .await;
        }
        self.notify_invoice(order_model.clone(), item_models.clone());

        Ok(model_to_response(order_model, item_models))
    }

    /// Retrieves one of the caller's orders with its line items.
    #[instrument(skip(self), fields(user_id = %user_id, order_id = %order_id))]
    pub async fn get_order(
        &self,
        user_id: Uuid,
        order_id: Uuid,
    ) -> Result<OrderResponse, ServiceError> {
        let order = OrderEntity::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        if order.user_id != user_id {
            return Err(ServiceError::Forbidden(
                "Order belongs to another user".to_string(),
            ));
        }

        let items = OrderItemEntity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .all(&*self.db)
            .await?;
        Ok(model_to_response(order, items))
    }

    /// Lists the caller's orders, newest first, with line items.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn list_orders(&self, user_id: Uuid) -> Result<Vec<OrderResponse>, ServiceError> {
        let orders = OrderEntity::find()
            .filter(order::Column::UserId.eq(user_id))
            .order_by_desc(order::Column::PlacedAt)
            .find_with_related(OrderItemEntity)
            .all(&*self.db)
            .await?;

        Ok(orders
            .into_iter()
            .map(|(order, items)| model_to_response(order, items))
            .collect())
    }

    /// Records a verified payment on a pending order (deferred payment
    /// flow). Transitions `PendingPayment -> Paid`.
    #[instrument(skip(self, payment), fields(order_id = %order_id))]
    pub async fn record_payment(
        &self,
        order_id: Uuid,
        payment: PaymentReference,
    ) -> Result<OrderResponse, ServiceError> {
        if !self.verifier.verify(&payment)? {
            return Err(ServiceError::PaymentInvalid(format!(
                "Signature mismatch for gateway order {}",
                payment.gateway_order_id
            )));
        }

        // A payment reference binds to exactly one order; a retry against
        // the same order is idempotent, reuse elsewhere is a Conflict rather
        // than a unique-index failure.
        if let Some(existing) = self.find_by_payment_id(&payment.payment_id).await? {
            if existing.id == order_id {
                return Ok(existing);
            }
            return Err(ServiceError::Conflict(format!(
                "Payment {} is already bound to an order",
                payment.payment_id
            )));
        }

        let order = self
            .transition_status(order_id, OrderStatus::Paid, |active| {
                active.gateway_order_id = Set(Some(payment.gateway_order_id.clone()));
                active.payment_id = Set(Some(payment.payment_id.clone()));
                active.payment_signature = Set(Some(payment.signature.clone()));
            })
            .await?;

        let items = OrderItemEntity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .all(&*self.db)
            .await?;
        Ok(model_to_response(order, items))
    }

    /// Marks a paid order fulfilled, stamping `fulfilled_at`.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn mark_fulfilled(&self, order_id: Uuid) -> Result<OrderResponse, ServiceError> {
        let order = self
            .transition_status(order_id, OrderStatus::Fulfilled, |active| {
                active.fulfilled_at = Set(Some(Utc::now()));
            })
            .await?;

        self.event_sender
            .send_or_log(Event::OrderFulfilled(order_id))
            .await;

        let items = OrderItemEntity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .all(&*self.db)
            .await?;
        Ok(model_to_response(order, items))
    }

    /// Applies a state-machine-checked status transition with a version
    /// bump. `mutate` sets any transition-specific fields.
    pub(crate) async fn transition_status<F>(
        &self,
        order_id: Uuid,
        new_status: OrderStatus,
        mutate: F,
    ) -> Result<order::Model, ServiceError>
    where
        F: FnOnce(&mut order::ActiveModel),
    {
        let txn = self.db.begin().await?;

        let order = OrderEntity::find_by_id(order_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        let old_status = order.status;
        if !old_status.can_transition_to(new_status) {
            return Err(ServiceError::InvalidStatus(format!(
                "Cannot transition order {} from {} to {}",
                order_id, old_status, new_status
            )));
        }

        let version = order.version;
        let mut active: order::ActiveModel = order.into();
        active.status = Set(new_status);
        active.updated_at = Set(Some(Utc::now()));
        active.version = Set(version + 1);
        mutate(&mut active);

        let updated = active.update(&txn).await?;
        txn.commit().await?;

        info!(order_id = %order_id, %old_status, %new_status, "Order status updated");

        self.event_sender
            .send_or_log(Event::OrderStatusChanged {
                order_id,
                old_status,
                new_status,
            })
            .await;

        Ok(updated)
    }

    fn validate_request(&self, request: &CreateOrderRequest) -> Result<(), ServiceError> {
        request.validate()?;
        if request.items.is_empty() {
            return Err(ServiceError::InvalidInput(
                "Order must contain at least one item".to_string(),
            ));
        }
        for item in &request.items {
            item.validate()?;
        }
        if let Some(address) = &request.shipping_address {
            address.validate()?;
        }
        if let Some(address) = &request.billing_address {
            address.validate()?;
        }
        Ok(())
    }

    /// Resolves each requested product to its current catalog row.
    async fn resolve_lines(
        &self,
        items: &[OrderItemInput],
    ) -> Result<Vec<(product::Model, OrderItemInput)>, ServiceError> {
        let ids: Vec<Uuid> = items.iter().map(|i| i.product_id).collect();
        let products = ProductEntity::find()
            .filter(product::Column::Id.is_in(ids))
            .all(&*self.db)
            .await?;

        let mut lines = Vec::with_capacity(items.len());
        for input in items {
            let product = products
                .iter()
                .find(|p| p.id == input.product_id)
                .ok_or_else(|| {
                    ServiceError::NotFound(format!("Product {} not found", input.product_id))
                })?;
            if !product.is_active {
                return Err(ServiceError::InvalidInput(format!(
                    "Product {} is not available",
                    product.id
                )));
            }
            lines.push((product.clone(), input.clone()));
        }
        Ok(lines)
    }

    async fn find_by_payment_id(
        &self,
        payment_id: &str,
    ) -> Result<Option<OrderResponse>, ServiceError> {
        let order = OrderEntity::find()
            .filter(order::Column::PaymentId.eq(payment_id))
            .one(&*self.db)
            .await?;
        match order {
            Some(order) => {
                let items = OrderItemEntity::find()
                    .filter(order_item::Column::OrderId.eq(order.id))
                    .all(&*self.db)
                    .await?;
                Ok(Some(model_to_response(order, items)))
            }
            None => Ok(None),
        }
    }

    /// Deletes the purchased product lines from the user's cart. Runs inside
    /// the checkout transaction. Lines the user added for other products
    /// stay untouched.
    async fn clear_cart_lines<C: sea_orm::ConnectionTrait>(
        &self,
        conn: &C,
        user_id: Uuid,
        demands: &[StockDemand],
    ) -> Result<(), ServiceError> {
        let cart = CartEntity::find()
            .filter(cart::Column::UserId.eq(user_id))
            .one(conn)
            .await?;
        let Some(cart) = cart else {
            // Checkout without a stored cart (direct buy) is fine.
            return Ok(());
        };

        let product_ids: Vec<Uuid> = demands.iter().map(|d| d.product_id).collect();
        CartItemEntity::delete_many()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .filter(cart_item::Column::ProductId.is_in(product_ids))
            .exec(conn)
            .await?;
        Ok(())
    }

    /// Fire-and-forget invoice notification. Failure is logged, never
    /// propagated; the committed order is the source of truth.
    fn notify_invoice(&self, order: order::Model, items: Vec<order_item::Model>) {
        let dispatcher = self.invoice_dispatcher.clone();
        let event_sender = self.event_sender.clone();
        let order_id = order.id;
        tokio::spawn(async move {
            event_sender
                .send_or_log(Event::InvoiceRequested(order_id))
                .await;
            if let Err(e) = dispatcher.dispatch(&order, &items).await {
                warn!(order_id = %order_id, error = %e, "Invoice dispatch failed");
            }
        });
    }
}

fn encode_address(address: Option<&Address>) -> Result<Option<String>, ServiceError> {
    address
        .map(|a| {
            serde_json::to_string(a)
                .map_err(|e| ServiceError::InvalidInput(format!("Unserializable address: {}", e)))
        })
        .transpose()
}

pub(crate) fn model_to_response(
    order: order::Model,
    items: Vec<order_item::Model>,
) -> OrderResponse {
    OrderResponse {
        id: order.id,
        order_number: order.order_number,
        user_id: order.user_id,
        status: order.status,
        currency: order.currency,
        subtotal: order.subtotal,
        shipping_fee: order.shipping_fee,
        tax_amount: order.tax_amount,
        total: order.total,
        placed_at: order.placed_at,
        fulfilled_at: order.fulfilled_at,
        shipping_address: order.shipping_address,
        billing_address: order.billing_address,
        notes: order.notes,
        gateway_order_id: order.gateway_order_id,
        payment_id: order.payment_id,
        items: items
            .into_iter()
            .map(|item| OrderItemResponse {
                id: item.id,
                product_id: item.product_id,
                product_name: item.product_name,
                sku: item.sku,
                quantity: item.quantity,
                unit_price: item.unit_price,
                line_total: item.line_total,
                selected_size: item.selected_size,
                selected_color: item.selected_color,
            })
            .collect(),
    }
}
