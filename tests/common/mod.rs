use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sea_orm::{ActiveModelTrait, Set};
use uuid::Uuid;

use fulfillment_core::{
    config::AppConfig,
    db,
    entities::product,
    events,
    services::invoicing::InvoiceDispatcher,
    services::payments::{PaymentReference, PaymentVerifier},
    AppState,
};

pub const TEST_PAYMENT_SECRET: &str = "test_payment_secret_key_for_tests_only";

/// Harness wiring the service graph over an in-memory SQLite database.
pub struct TestApp {
    pub state: AppState,
    _event_task: tokio::task::JoinHandle<()>,
}

pub fn test_config() -> AppConfig {
    let mut cfg = AppConfig::new("sqlite::memory:", TEST_PAYMENT_SECRET);
    // A shared in-memory database needs a single pooled connection.
    cfg.db_max_connections = 1;
    cfg.db_min_connections = 1;
    cfg.auto_migrate = true;
    cfg.shipping_fee = dec!(10.00);
    cfg.tax_rate = dec!(0.0875);
    cfg
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_dispatcher(test_config(), None).await
    }

    #[allow(dead_code)]
    pub async fn with_config(cfg: AppConfig) -> Self {
        Self::with_dispatcher(cfg, None).await
    }

    #[allow(dead_code)]
    pub async fn with_invoice_dispatcher(dispatcher: Arc<dyn InvoiceDispatcher>) -> Self {
        Self::with_dispatcher(test_config(), Some(dispatcher)).await
    }

    async fn with_dispatcher(
        cfg: AppConfig,
        dispatcher: Option<Arc<dyn InvoiceDispatcher>>,
    ) -> Self {
        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("db connect");

        let (sender, rx) = events::channel(cfg.event_buffer_size);
        let event_task = tokio::spawn(events::process_events(rx));

        let db = Arc::new(pool);
        let config = Arc::new(cfg);
        let sender = Arc::new(sender);
        let state = match dispatcher {
            Some(d) => AppState::with_invoice_dispatcher(db, config, sender, d),
            None => AppState::new(db, config, sender),
        };

        Self {
            state,
            _event_task: event_task,
        }
    }

    /// Inserts a product with the given price and stock.
    pub async fn seed_product(&self, sku: &str, price: Decimal, stock: i32) -> product::Model {
        let now = Utc::now();
        let model = product::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(format!("Product {}", sku)),
            sku: Set(sku.to_string()),
            description: Set(None),
            price: Set(price),
            currency: Set("USD".to_string()),
            stock: Set(stock),
            is_active: Set(true),
            created_at: Set(now),
            updated_at: Set(now),
        };
        model.insert(&*self.state.db).await.expect("seed product")
    }

    /// Current stock for a product.
    pub async fn stock_of(&self, product_id: Uuid) -> i32 {
        use sea_orm::EntityTrait;
        product::Entity::find_by_id(product_id)
            .one(&*self.state.db)
            .await
            .expect("query product")
            .expect("product exists")
            .stock
    }

    /// Builds a payment reference whose signature the verifier accepts.
    pub fn signed_payment(&self, gateway_order_id: &str, payment_id: &str) -> PaymentReference {
        let signature = PaymentVerifier::new(TEST_PAYMENT_SECRET)
            .sign(gateway_order_id, payment_id)
            .expect("sign payment");
        PaymentReference {
            gateway_order_id: gateway_order_id.to_string(),
            payment_id: payment_id.to_string(),
            signature,
        }
    }
}
