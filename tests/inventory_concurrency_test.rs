//! Concurrency tests: contended checkouts must never oversell, and a
//! rejected batch must leave no trace.

mod common;

use common::TestApp;
use rust_decimal_macros::dec;
use sea_orm::TransactionTrait;
use uuid::Uuid;

use fulfillment_core::{
    errors::ServiceError,
    services::inventory::{InventoryLedger, StockDemand},
    services::orders::{CreateOrderRequest, OrderItemInput},
};

fn request(user_id: Uuid, product_id: Uuid, quantity: i32) -> CreateOrderRequest {
    CreateOrderRequest {
        user_id,
        items: vec![OrderItemInput {
            product_id,
            quantity,
            selected_size: None,
            selected_color: None,
        }],
        payment: None,
        shipping_address: None,
        billing_address: None,
        notes: None,
        currency: None,
    }
}

#[tokio::test]
async fn two_contenders_for_the_last_unit() {
    let app = TestApp::new().await;
    let product = app.seed_product("RACE-1", dec!(20.00), 1).await;

    let orders = app.state.orders.clone();
    let a = {
        let orders = orders.clone();
        let product_id = product.id;
        tokio::spawn(async move { orders.create_order(request(Uuid::new_v4(), product_id, 1)).await })
    };
    let b = {
        let orders = orders.clone();
        let product_id = product.id;
        tokio::spawn(async move { orders.create_order(request(Uuid::new_v4(), product_id, 1)).await })
    };

    let results = [a.await.unwrap(), b.await.unwrap()];
    let successes = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(successes, 1, "exactly one checkout may win the last unit");

    for result in &results {
        if let Err(err) = result {
            match err {
                ServiceError::OutOfStock { shortages } => {
                    assert_eq!(shortages.len(), 1);
                    assert!(
                        shortages[0].available >= 0,
                        "reported availability must never be negative"
                    );
                }
                other => panic!("loser must see OutOfStock, got {:?}", other),
            }
        }
    }

    assert_eq!(app.stock_of(product.id).await, 0);
}

#[tokio::test]
async fn committed_quantities_never_exceed_stock() {
    let app = TestApp::new().await;
    let product = app.seed_product("RACE-N", dec!(5.00), 10).await;

    let mut tasks = Vec::new();
    for _ in 0..20 {
        let orders = app.state.orders.clone();
        let product_id = product.id;
        tasks.push(tokio::spawn(async move {
            orders
                .create_order(request(Uuid::new_v4(), product_id, 1))
                .await
                .is_ok()
        }));
    }

    let mut successes = 0;
    for task in tasks {
        if task.await.unwrap() {
            successes += 1;
        }
    }

    assert_eq!(successes, 10, "exactly stock-many checkouts succeed");
    assert_eq!(app.stock_of(product.id).await, 0);
}

#[tokio::test]
async fn ledger_rejection_inside_transaction_leaves_no_trace() {
    let app = TestApp::new().await;
    let plenty = app.seed_product("LED-A", dec!(1.00), 10).await;
    let scarce = app.seed_product("LED-B", dec!(1.00), 2).await;

    let ledger = InventoryLedger::new();
    let txn = app.state.db.begin().await.unwrap();
    let err = ledger
        .reserve(
            &txn,
            &[
                StockDemand {
                    product_id: plenty.id,
                    quantity: 4,
                },
                StockDemand {
                    product_id: scarce.id,
                    quantity: 3,
                },
            ],
        )
        .await
        .unwrap_err();
    drop(txn); // roll back

    match err {
        ServiceError::OutOfStock { shortages } => {
            assert_eq!(shortages.len(), 1);
            assert_eq!(shortages[0].product_id, scarce.id);
            assert_eq!(shortages[0].available, 2);
        }
        other => panic!("expected OutOfStock, got {:?}", other),
    }

    assert_eq!(app.stock_of(plenty.id).await, 10);
    assert_eq!(app.stock_of(scarce.id).await, 2);
}

#[tokio::test]
async fn ledger_reserve_and_release_round_trip() {
    let app = TestApp::new().await;
    let product = app.seed_product("LED-RT", dec!(1.00), 5).await;

    let ledger = InventoryLedger::new();
    let txn = app.state.db.begin().await.unwrap();
    ledger
        .reserve(
            &txn,
            &[StockDemand {
                product_id: product.id,
                quantity: 5,
            }],
        )
        .await
        .unwrap();
    txn.commit().await.unwrap();
    assert_eq!(app.stock_of(product.id).await, 0);

    // Operational restock
    ledger.release(&*app.state.db, product.id, 5).await.unwrap();
    assert_eq!(app.stock_of(product.id).await, 5);
}
