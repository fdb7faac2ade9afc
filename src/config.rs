use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::env as std_env;
use std::path::Path;
use thiserror::Error;
use tracing::info;
use validator::Validate;

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const CONFIG_DIR: &str = "config";
const DEFAULT_CURRENCY: &str = "USD";
const DEFAULT_EVENT_BUFFER: usize = 100;
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 10;
const DEFAULT_DB_MIN_CONNECTIONS: u32 = 1;

/// Application configuration with validation.
///
/// Money-affecting knobs (shipping fee, tax rate) live here so the checkout
/// orchestrator never hardcodes amounts.
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// Run migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    /// Shared secret for the payment gateway signature scheme
    #[validate(length(min = 16, message = "Payment secret must be at least 16 characters"))]
    pub payment_secret: String,

    /// Flat shipping fee applied to every order
    #[serde(default = "default_shipping_fee")]
    pub shipping_fee: Decimal,

    /// Tax rate as a fraction (0.0875 = 8.75%)
    #[serde(default = "default_tax_rate")]
    pub tax_rate: Decimal,

    /// Default currency for orders that do not specify one
    #[serde(default = "default_currency")]
    pub default_currency: String,

    /// Buffer size of the event channel
    #[serde(default = "default_event_buffer")]
    pub event_buffer_size: usize,

    /// Deployment environment: development, test, production
    #[serde(default = "default_environment")]
    pub environment: String,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit logs as JSON (production collectors)
    #[serde(default)]
    pub log_json: bool,
}

fn default_db_max_connections() -> u32 {
    DEFAULT_DB_MAX_CONNECTIONS
}

fn default_db_min_connections() -> u32 {
    DEFAULT_DB_MIN_CONNECTIONS
}

fn default_shipping_fee() -> Decimal {
    Decimal::ZERO
}

fn default_tax_rate() -> Decimal {
    Decimal::ZERO
}

fn default_currency() -> String {
    DEFAULT_CURRENCY.to_string()
}

fn default_event_buffer() -> usize {
    DEFAULT_EVENT_BUFFER
}

fn default_environment() -> String {
    DEFAULT_ENV.to_string()
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

impl AppConfig {
    /// Constructs a configuration directly, bypassing file/env layering.
    /// Used by tests and embedding applications.
    pub fn new(database_url: impl Into<String>, payment_secret: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            db_max_connections: DEFAULT_DB_MAX_CONNECTIONS,
            db_min_connections: DEFAULT_DB_MIN_CONNECTIONS,
            auto_migrate: false,
            payment_secret: payment_secret.into(),
            shipping_fee: Decimal::ZERO,
            tax_rate: Decimal::ZERO,
            default_currency: DEFAULT_CURRENCY.to_string(),
            event_buffer_size: DEFAULT_EVENT_BUFFER,
            environment: "test".to_string(),
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            log_json: false,
        }
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

/// Loads application configuration.
///
/// Layers configuration sources in this order:
/// 1. Default config (config/default.toml)
/// 2. Environment-specific config (config/{env}.toml)
/// 3. Environment variables (APP_*)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    let environment = std_env::var("APP_ENVIRONMENT").unwrap_or_else(|_| DEFAULT_ENV.to_string());

    let mut builder = Config::builder();

    let default_path = Path::new(CONFIG_DIR).join("default.toml");
    if default_path.exists() {
        builder = builder.add_source(File::from(default_path));
    }

    let env_path = Path::new(CONFIG_DIR).join(format!("{environment}.toml"));
    if env_path.exists() {
        builder = builder.add_source(File::from(env_path));
    }

    let settings = builder
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let config: AppConfig = settings.try_deserialize()?;
    config.validate()?;

    info!(environment = %config.environment, "Configuration loaded");
    Ok(config)
}

/// Initializes tracing using the provided log level as the default filter.
/// `RUST_LOG` overrides when set and non-empty.
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("fulfillment_core={level}");
    let filter_directive = std_env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    if json {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .json()
            .try_init();
    } else {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn new_fills_sane_defaults() {
        let cfg = AppConfig::new("sqlite::memory:", "test_payment_secret_key");
        assert_eq!(cfg.default_currency, "USD");
        assert_eq!(cfg.shipping_fee, Decimal::ZERO);
        assert!(!cfg.is_production());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn short_payment_secret_is_rejected() {
        let cfg = AppConfig::new("sqlite::memory:", "short");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn money_knobs_accept_exact_decimals() {
        let mut cfg = AppConfig::new("sqlite::memory:", "test_payment_secret_key");
        cfg.shipping_fee = dec!(10.00);
        cfg.tax_rate = dec!(0.0875);
        assert_eq!(cfg.shipping_fee + cfg.shipping_fee, dec!(20.00));
    }
}
