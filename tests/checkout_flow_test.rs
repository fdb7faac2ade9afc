//! Integration tests for the checkout flow: cart to committed order,
//! totals, stock consistency, idempotency and payment failures.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use common::TestApp;
use rust_decimal_macros::dec;
use uuid::Uuid;

use fulfillment_core::{
    entities::{order, order_item, OrderStatus},
    errors::ServiceError,
    services::carts::AddItemInput,
    services::invoicing::InvoiceDispatcher,
    services::orders::{Address, CreateOrderRequest, OrderItemInput},
};

fn order_request(user_id: Uuid, items: Vec<OrderItemInput>) -> CreateOrderRequest {
    CreateOrderRequest {
        user_id,
        items,
        payment: None,
        shipping_address: Some(test_address()),
        billing_address: None,
        notes: None,
        currency: Some("USD".to_string()),
    }
}

fn test_address() -> Address {
    Address {
        recipient: "Test Shopper".to_string(),
        line1: "42 Harbor Street".to_string(),
        line2: None,
        city: "Portland".to_string(),
        province: Some("OR".to_string()),
        postal_code: "97201".to_string(),
        country_code: "US".to_string(),
        phone: None,
    }
}

fn line(product_id: Uuid, quantity: i32) -> OrderItemInput {
    OrderItemInput {
        product_id,
        quantity,
        selected_size: None,
        selected_color: None,
    }
}

#[tokio::test]
async fn checkout_decrements_stock_and_computes_totals() {
    let app = TestApp::new().await;
    let user_id = Uuid::new_v4();
    let product = app.seed_product("P1", dec!(50.00), 5).await;

    let mut request = order_request(user_id, vec![line(product.id, 2)]);
    request.payment = Some(app.signed_payment("gw_1", "pay_1"));

    let order = app.state.orders.create_order(request).await.unwrap();

    assert_eq!(order.subtotal, dec!(100.00));
    assert_eq!(order.shipping_fee, dec!(10.00));
    assert_eq!(order.tax_amount, dec!(8.75));
    assert_eq!(order.total, dec!(118.75));
    assert_eq!(
        order.total,
        order.subtotal + order.shipping_fee + order.tax_amount
    );
    assert_eq!(order.status, OrderStatus::Paid);
    assert_eq!(order.items.len(), 1);
    assert_eq!(order.items[0].quantity, 2);
    assert_eq!(order.items[0].unit_price, dec!(50.00));
    assert_eq!(order.items[0].line_total, dec!(100.00));
    assert!(order.order_number.starts_with("ORD-"));

    assert_eq!(app.stock_of(product.id).await, 3);
}

#[tokio::test]
async fn checkout_without_payment_is_pending() {
    let app = TestApp::new().await;
    let user_id = Uuid::new_v4();
    let product = app.seed_product("P2", dec!(19.99), 3).await;

    let order = app
        .state
        .orders
        .create_order(order_request(user_id, vec![line(product.id, 1)]))
        .await
        .unwrap();

    assert_eq!(order.status, OrderStatus::PendingPayment);
    assert!(order.payment_id.is_none());
    assert_eq!(app.stock_of(product.id).await, 2);
}

#[tokio::test]
async fn checkout_snapshots_product_name_and_price() {
    let app = TestApp::new().await;
    let user_id = Uuid::new_v4();
    let product = app.seed_product("SNAP-1", dec!(25.00), 10).await;

    let order = app
        .state
        .orders
        .create_order(order_request(user_id, vec![line(product.id, 1)]))
        .await
        .unwrap();

    // Mutate the catalog after purchase; the order keeps its snapshot.
    use sea_orm::{ActiveModelTrait, Set};
    let mut live: fulfillment_core::entities::product::ActiveModel = product.clone().into();
    live.name = Set("Renamed Product".to_string());
    live.price = Set(dec!(99.00));
    live.update(&*app.state.db).await.unwrap();

    let reread = app.state.orders.get_order(user_id, order.id).await.unwrap();
    assert_eq!(reread.items[0].product_name, "Product SNAP-1");
    assert_eq!(reread.items[0].unit_price, dec!(25.00));
}

#[tokio::test]
async fn checkout_clears_purchased_cart_lines() {
    let app = TestApp::new().await;
    let user_id = Uuid::new_v4();
    let bought = app.seed_product("CART-A", dec!(10.00), 5).await;
    let kept = app.seed_product("CART-B", dec!(5.00), 5).await;

    for (product, qty) in [(&bought, 2), (&kept, 1)] {
        app.state
            .carts
            .add_item(
                user_id,
                AddItemInput {
                    product_id: product.id,
                    quantity: qty,
                    selected_size: None,
                    selected_color: None,
                },
            )
            .await
            .unwrap();
    }

    app.state
        .orders
        .create_order(order_request(user_id, vec![line(bought.id, 2)]))
        .await
        .unwrap();

    let (_, items) = app.state.carts.get_cart(user_id).await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].product_id, kept.id);
}

#[tokio::test]
async fn duplicate_payment_reference_returns_existing_order() {
    let app = TestApp::new().await;
    let user_id = Uuid::new_v4();
    let product = app.seed_product("IDEM-1", dec!(50.00), 5).await;

    let payment = app.signed_payment("gw_idem", "pay_idem");
    let mut first = order_request(user_id, vec![line(product.id, 2)]);
    first.payment = Some(payment.clone());
    let mut retry = order_request(user_id, vec![line(product.id, 2)]);
    retry.payment = Some(payment);

    let order_a = app.state.orders.create_order(first).await.unwrap();
    let order_b = app.state.orders.create_order(retry).await.unwrap();

    assert_eq!(order_a.id, order_b.id);
    assert_eq!(order_a.order_number, order_b.order_number);
    // Stock decremented exactly once.
    assert_eq!(app.stock_of(product.id).await, 3);
    assert_eq!(app.state.orders.list_orders(user_id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn reused_payment_reference_never_leaks_anothers_order() {
    let app = TestApp::new().await;
    let victim = Uuid::new_v4();
    let attacker = Uuid::new_v4();
    let product = app.seed_product("LEAK-1", dec!(50.00), 5).await;

    let mut request = order_request(victim, vec![line(product.id, 2)]);
    request.payment = Some(app.signed_payment("gw_victim", "pay_victim"));
    let victims_order = app.state.orders.create_order(request).await.unwrap();

    // A forged signature over a known payment id dies at verification,
    // before the duplicate-payment lookup can run.
    let mut forged = order_request(attacker, vec![line(product.id, 1)]);
    forged.payment = Some(fulfillment_core::services::payments::PaymentReference {
        gateway_order_id: "gw_other".to_string(),
        payment_id: "pay_victim".to_string(),
        signature: "f".repeat(64),
    });
    let err = app.state.orders.create_order(forged).await.unwrap_err();
    assert_matches!(err, ServiceError::PaymentInvalid(_));

    // Even a correctly signed reuse of the reference by a different user is
    // a Conflict, not a window into the owner's order.
    let mut signed_reuse = order_request(attacker, vec![line(product.id, 1)]);
    signed_reuse.payment = Some(app.signed_payment("gw_victim", "pay_victim"));
    let err = app.state.orders.create_order(signed_reuse).await.unwrap_err();
    assert_matches!(err, ServiceError::Conflict(_));

    // The attacker holds no orders and the owner's order is untouched.
    assert!(app.state.orders.list_orders(attacker).await.unwrap().is_empty());
    let reread = app
        .state
        .orders
        .get_order(victim, victims_order.id)
        .await
        .unwrap();
    assert_eq!(reread.id, victims_order.id);
    assert_eq!(app.stock_of(product.id).await, 3);
}

#[tokio::test]
async fn invalid_signature_aborts_before_any_write() {
    let app = TestApp::new().await;
    let user_id = Uuid::new_v4();
    let product = app.seed_product("SIG-1", dec!(50.00), 5).await;

    let mut request = order_request(user_id, vec![line(product.id, 2)]);
    request.payment = Some(fulfillment_core::services::payments::PaymentReference {
        gateway_order_id: "gw_bad".to_string(),
        payment_id: "pay_bad".to_string(),
        signature: "0".repeat(64),
    });

    let err = app.state.orders.create_order(request).await.unwrap_err();
    assert_matches!(err, ServiceError::PaymentInvalid(_));

    assert_eq!(app.stock_of(product.id).await, 5);
    assert!(app.state.orders.list_orders(user_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn multi_item_shortage_rolls_back_everything() {
    let app = TestApp::new().await;
    let user_id = Uuid::new_v4();
    let plenty = app.seed_product("MULTI-A", dec!(10.00), 5).await;
    let scarce = app.seed_product("MULTI-B", dec!(10.00), 1).await;

    let err = app
        .state
        .orders
        .create_order(order_request(
            user_id,
            vec![line(plenty.id, 2), line(scarce.id, 3)],
        ))
        .await
        .unwrap_err();

    match err {
        ServiceError::OutOfStock { shortages } => {
            assert_eq!(shortages.len(), 1);
            assert_eq!(shortages[0].product_id, scarce.id);
            assert_eq!(shortages[0].requested, 3);
            assert_eq!(shortages[0].available, 1);
        }
        other => panic!("expected OutOfStock, got {:?}", other),
    }

    // No partial decrement, no order row.
    assert_eq!(app.stock_of(plenty.id).await, 5);
    assert_eq!(app.stock_of(scarce.id).await, 1);
    assert!(app.state.orders.list_orders(user_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn input_validation_rejects_before_transaction() {
    let app = TestApp::new().await;
    let user_id = Uuid::new_v4();
    let product = app.seed_product("VAL-1", dec!(10.00), 5).await;

    // Empty items
    let err = app
        .state
        .orders
        .create_order(order_request(user_id, vec![]))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InvalidInput(_));

    // Zero quantity
    let err = app
        .state
        .orders
        .create_order(order_request(user_id, vec![line(product.id, 0)]))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));

    // Bad currency code
    let mut request = order_request(user_id, vec![line(product.id, 1)]);
    request.currency = Some("DOLLARS".to_string());
    let err = app.state.orders.create_order(request).await.unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));

    // Unknown product
    let err = app
        .state
        .orders
        .create_order(order_request(user_id, vec![line(Uuid::new_v4(), 1)]))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::NotFound(_));

    assert_eq!(app.stock_of(product.id).await, 5);
}

#[tokio::test]
async fn get_order_enforces_ownership() {
    let app = TestApp::new().await;
    let owner = Uuid::new_v4();
    let stranger = Uuid::new_v4();
    let product = app.seed_product("OWN-1", dec!(10.00), 5).await;

    let order = app
        .state
        .orders
        .create_order(order_request(owner, vec![line(product.id, 1)]))
        .await
        .unwrap();

    assert_matches!(
        app.state.orders.get_order(stranger, order.id).await,
        Err(ServiceError::Forbidden(_))
    );
    assert_matches!(
        app.state.orders.get_order(owner, Uuid::new_v4()).await,
        Err(ServiceError::NotFound(_))
    );
    assert!(app.state.orders.get_order(owner, order.id).await.is_ok());
}

#[tokio::test]
async fn list_orders_is_newest_first_and_scoped_to_user() {
    let app = TestApp::new().await;
    let user_a = Uuid::new_v4();
    let user_b = Uuid::new_v4();
    let product = app.seed_product("LIST-1", dec!(10.00), 50).await;

    for _ in 0..3 {
        app.state
            .orders
            .create_order(order_request(user_a, vec![line(product.id, 1)]))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    app.state
        .orders
        .create_order(order_request(user_b, vec![line(product.id, 1)]))
        .await
        .unwrap();

    let orders = app.state.orders.list_orders(user_a).await.unwrap();
    assert_eq!(orders.len(), 3);
    assert!(orders.windows(2).all(|w| w[0].placed_at >= w[1].placed_at));
    assert!(orders.iter().all(|o| o.user_id == user_a));
}

/// Dispatcher that counts calls and fails every time.
#[derive(Clone, Default)]
struct FailingDispatcher {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl InvoiceDispatcher for FailingDispatcher {
    async fn dispatch(
        &self,
        _order: &order::Model,
        _items: &[order_item::Model],
    ) -> Result<(), ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ServiceError::ExternalServiceError(
            "invoice renderer unavailable".to_string(),
        ))
    }
}

#[tokio::test]
async fn invoice_failure_never_unwinds_the_order() {
    let dispatcher = FailingDispatcher::default();
    let app = TestApp::with_invoice_dispatcher(Arc::new(dispatcher.clone())).await;
    let user_id = Uuid::new_v4();
    let product = app.seed_product("INV-1", dec!(30.00), 2).await;

    let order = app
        .state
        .orders
        .create_order(order_request(user_id, vec![line(product.id, 1)]))
        .await
        .unwrap();

    // Give the fire-and-forget dispatch task a moment to run.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 1);

    // The order stands despite the dispatch failure.
    let reread = app.state.orders.get_order(user_id, order.id).await.unwrap();
    assert_eq!(reread.id, order.id);
    assert_eq!(app.stock_of(product.id).await, 1);
}

#[tokio::test]
async fn record_payment_moves_pending_to_paid() {
    let app = TestApp::new().await;
    let user_id = Uuid::new_v4();
    let product = app.seed_product("DEFER-1", dec!(40.00), 4).await;

    let order = app
        .state
        .orders
        .create_order(order_request(user_id, vec![line(product.id, 1)]))
        .await
        .unwrap();
    assert_eq!(order.status, OrderStatus::PendingPayment);

    let payment = app.signed_payment("gw_defer", "pay_defer");
    let paid = app
        .state
        .orders
        .record_payment(order.id, payment)
        .await
        .unwrap();
    assert_eq!(paid.status, OrderStatus::Paid);
    assert_eq!(paid.payment_id.as_deref(), Some("pay_defer"));

    // Paying twice is an invalid transition, not a double charge.
    let payment = app.signed_payment("gw_defer", "pay_defer_2");
    assert_matches!(
        app.state.orders.record_payment(order.id, payment).await,
        Err(ServiceError::InvalidStatus(_))
    );
}

#[tokio::test]
async fn record_payment_rejects_reference_bound_elsewhere() {
    let app = TestApp::new().await;
    let user_id = Uuid::new_v4();
    let product = app.seed_product("BOUND-1", dec!(15.00), 6).await;

    let mut paid_request = order_request(user_id, vec![line(product.id, 1)]);
    paid_request.payment = Some(app.signed_payment("gw_bound", "pay_bound"));
    let paid_order = app.state.orders.create_order(paid_request).await.unwrap();

    let pending = app
        .state
        .orders
        .create_order(order_request(user_id, vec![line(product.id, 1)]))
        .await
        .unwrap();
    assert_eq!(pending.status, OrderStatus::PendingPayment);

    // The reference already belongs to the paid order; recording it on the
    // pending one is a structured Conflict, not a unique-index failure.
    let reused = app.signed_payment("gw_bound", "pay_bound");
    let err = app
        .state
        .orders
        .record_payment(pending.id, reused)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::Conflict(_));

    // Retrying against the order that owns the reference is idempotent.
    let retry = app.signed_payment("gw_bound", "pay_bound");
    let same = app
        .state
        .orders
        .record_payment(paid_order.id, retry)
        .await
        .unwrap();
    assert_eq!(same.id, paid_order.id);
    assert_eq!(same.status, OrderStatus::Paid);
}
