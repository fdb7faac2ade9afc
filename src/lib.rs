//! Order-fulfillment core.
//!
//! Turns a shopper's cart into a durable, paid, inventory-consistent order
//! and supports the cancellation/refund-request workflow afterwards. Money,
//! stock counts and idempotency stay consistent under concurrent requests,
//! partial failures and retried client calls: the checkout transaction
//! covers stock decrement, order persistence and cart clearing as one
//! all-or-nothing boundary.
//!
//! Catalog browsing, search, authentication and UI concerns are external
//! collaborators — this crate consumes their outputs (a user id, desired
//! line items, a payment reference) and produces committed orders plus
//! events they can act on.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

// Core modules
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod migrator;
pub mod services;

use sea_orm::DatabaseConnection;
use std::sync::Arc;

use services::{
    cancellations::CancellationService, carts::CartService, invoicing::InvoiceDispatcher,
    invoicing::LoggingInvoiceDispatcher, orders::OrderService,
};

/// Wires the fulfillment services over a shared connection pool, config and
/// event channel. Embedding applications hang this off their own state.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: Arc<config::AppConfig>,
    pub event_sender: Arc<events::EventSender>,
    pub carts: CartService,
    pub orders: Arc<OrderService>,
    pub cancellations: CancellationService,
}

impl AppState {
    /// Builds the service graph with the default logging invoice dispatcher.
    pub fn new(
        db: Arc<DatabaseConnection>,
        config: Arc<config::AppConfig>,
        event_sender: Arc<events::EventSender>,
    ) -> Self {
        Self::with_invoice_dispatcher(db, config, event_sender, Arc::new(LoggingInvoiceDispatcher))
    }

    /// Builds the service graph with a caller-provided invoice collaborator.
    pub fn with_invoice_dispatcher(
        db: Arc<DatabaseConnection>,
        config: Arc<config::AppConfig>,
        event_sender: Arc<events::EventSender>,
        invoice_dispatcher: Arc<dyn InvoiceDispatcher>,
    ) -> Self {
        let carts = CartService::new(db.clone(), event_sender.clone());
        let orders = Arc::new(OrderService::new(
            db.clone(),
            config.clone(),
            event_sender.clone(),
            invoice_dispatcher,
        ));
        let cancellations =
            CancellationService::new(db.clone(), event_sender.clone(), orders.clone());
        Self {
            db,
            config,
            event_sender,
            carts,
            orders,
            cancellations,
        }
    }
}
