use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::env;
use std::path::Path;
use thiserror::Error;
use tracing::{error, info};

const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const CONFIG_DIR: &str = "config";

/// Application configuration loaded from config files and `APP__*`
/// environment variables.
#[derive(Clone, Debug, Deserialize)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// HTTP bind host
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP bind port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Deployment environment (development, staging, production)
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Log level for the default tracing filter
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit logs as JSON
    #[serde(default)]
    pub log_json: bool,

    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// Create missing tables at startup
    #[serde(default)]
    pub auto_migrate: bool,

    /// ISO currency code used for charges
    #[serde(default = "default_currency")]
    pub currency: String,

    /// Tax rate applied to the discounted subtotal
    #[serde(default = "default_tax_rate")]
    pub tax_rate: f64,

    /// Flat shipping rate; overridden to zero by free-shipping discounts
    #[serde(default = "default_shipping_flat_rate")]
    pub shipping_flat_rate: f64,

    /// Inventory level at or below which a low-stock notification fires
    #[serde(default = "default_low_stock_threshold")]
    pub low_stock_threshold: i32,

    /// Base URL of the payment gateway API
    #[serde(default = "default_payment_gateway_url")]
    pub payment_gateway_url: String,

    /// API key sent to the payment gateway
    #[serde(default)]
    pub payment_gateway_secret: Option<String>,

    /// Shared secret for verifying inbound payment webhooks
    #[serde(default)]
    pub payment_webhook_secret: Option<String>,

    /// Maximum accepted age of a webhook timestamp, in seconds
    #[serde(default = "default_webhook_tolerance")]
    pub payment_webhook_tolerance_secs: u64,

    /// Optional URL receiving low-stock notifications; logged only if unset
    #[serde(default)]
    pub low_stock_notify_url: Option<String>,

    /// Comma-separated list of allowed CORS origins
    #[serde(default)]
    pub cors_allowed_origins: Option<String>,
}

impl AppConfig {
    pub fn new(database_url: String, host: String, port: u16, environment: String) -> Self {
        Self {
            database_url,
            host,
            port,
            environment,
            log_level: default_log_level(),
            log_json: false,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            auto_migrate: false,
            currency: default_currency(),
            tax_rate: default_tax_rate(),
            shipping_flat_rate: default_shipping_flat_rate(),
            low_stock_threshold: default_low_stock_threshold(),
            payment_gateway_url: default_payment_gateway_url(),
            payment_gateway_secret: None,
            payment_webhook_secret: None,
            payment_webhook_tolerance_secs: default_webhook_tolerance(),
            low_stock_notify_url: None,
            cors_allowed_origins: None,
        }
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    pub fn is_development(&self) -> bool {
        self.environment == "development" || self.environment == "test"
    }

    /// Tax rate as a decimal, e.g. 0.08 for 8%.
    pub fn tax_rate_decimal(&self) -> Decimal {
        Decimal::from_f64_retain(self.tax_rate).unwrap_or(Decimal::ZERO)
    }

    /// Flat shipping cost as a decimal.
    pub fn shipping_flat_rate_decimal(&self) -> Decimal {
        Decimal::from_f64_retain(self.shipping_flat_rate).unwrap_or(Decimal::ZERO)
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_environment() -> String {
    DEFAULT_ENV.to_string()
}
fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}
fn default_db_max_connections() -> u32 {
    10
}
fn default_db_min_connections() -> u32 {
    1
}
fn default_currency() -> String {
    "usd".to_string()
}
fn default_tax_rate() -> f64 {
    0.08
}
fn default_shipping_flat_rate() -> f64 {
    5.00
}
fn default_low_stock_threshold() -> i32 {
    10
}
fn default_payment_gateway_url() -> String {
    "https://api.stripe.com".to_string()
}
fn default_webhook_tolerance() -> u64 {
    300
}

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ConfigError),
}

/// Loads application configuration.
///
/// Layers configuration sources in this order:
/// 1. Default config (config/default.toml)
/// 2. Environment-specific config (config/{env}.toml)
/// 3. Environment variables (APP__*)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !Path::new(CONFIG_DIR).exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            CONFIG_DIR
        );
    }

    let config = Config::builder()
        .set_default("database_url", "sqlite://storefront.db?mode=rwc")?
        .set_default("environment", DEFAULT_ENV)?
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let app_config: AppConfig = config.try_deserialize()?;
    info!("Configuration loaded successfully");
    Ok(app_config)
}

/// Initializes tracing using the provided log level as the default filter.
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("storefront_api={},tower_http=debug", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    if json {
        let _ = fmt().with_env_filter(EnvFilter::new(filter_directive)).json().try_init();
    } else {
        let _ = fmt().with_env_filter(EnvFilter::new(filter_directive)).try_init();
    }
}
