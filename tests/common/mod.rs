//! Shared harness for integration tests: an application state backed by an
//! in-memory SQLite database, a stub payment gateway, and a recording
//! low-stock notifier.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    Router,
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, Set};
use serde_json::Value;
use storefront_api::{
    auth::{USER_ID_HEADER, USER_ROLE_HEADER},
    config::AppConfig,
    db,
    entities::{address, discount, product, AddressModel, DiscountModel, DiscountType, ProductModel},
    errors::ServiceError,
    events::{self, EventSender},
    notifications::LowStockNotifier,
    payments::{self, ChargeReceipt, PaymentGateway, WebhookVerifier},
    services::AppServices,
    AppState,
};
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

pub const TEST_WEBHOOK_SECRET: &str = "whsec_integration_test_secret";

/// Payment gateway stub that records charges and refunds and can be told
/// to decline.
pub struct StubPaymentGateway {
    charges: Mutex<Vec<(Decimal, String)>>,
    refunds: Mutex<Vec<String>>,
    decline: AtomicBool,
    counter: AtomicUsize,
}

impl StubPaymentGateway {
    pub fn new() -> Self {
        Self {
            charges: Mutex::new(Vec::new()),
            refunds: Mutex::new(Vec::new()),
            decline: AtomicBool::new(false),
            counter: AtomicUsize::new(0),
        }
    }

    pub fn set_decline(&self, decline: bool) {
        self.decline.store(decline, Ordering::SeqCst);
    }

    pub fn charges(&self) -> Vec<(Decimal, String)> {
        self.charges.lock().unwrap().clone()
    }

    pub fn refunds(&self) -> Vec<String> {
        self.refunds.lock().unwrap().clone()
    }
}

#[async_trait]
impl PaymentGateway for StubPaymentGateway {
    async fn charge(
        &self,
        amount: Decimal,
        _currency: &str,
        payment_method_token: &str,
    ) -> Result<ChargeReceipt, ServiceError> {
        if self.decline.load(Ordering::SeqCst) {
            return Err(ServiceError::PaymentFailed("Card declined".to_string()));
        }
        self.charges
            .lock()
            .unwrap()
            .push((amount, payment_method_token.to_string()));
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        Ok(ChargeReceipt {
            payment_intent_id: format!("pi_test_{}", n),
        })
    }

    async fn refund(&self, payment_intent_id: &str) -> Result<(), ServiceError> {
        self.refunds
            .lock()
            .unwrap()
            .push(payment_intent_id.to_string());
        Ok(())
    }
}

/// Notifier that records every alert instead of delivering it.
#[derive(Default)]
pub struct RecordingNotifier {
    alerts: Mutex<Vec<(Uuid, String, i32)>>,
}

impl RecordingNotifier {
    pub fn alerts(&self) -> Vec<(Uuid, String, i32)> {
        self.alerts.lock().unwrap().clone()
    }
}

#[async_trait]
impl LowStockNotifier for RecordingNotifier {
    async fn notify_low_stock(&self, product_id: Uuid, product_name: &str, current_stock: i32) {
        self.alerts
            .lock()
            .unwrap()
            .push((product_id, product_name.to_string(), current_stock));
    }
}

pub struct TestApp {
    router: Router,
    pub state: Arc<AppState>,
    pub gateway: Arc<StubPaymentGateway>,
    pub notifier: Arc<RecordingNotifier>,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    /// Construct a new test application with a fresh in-memory database.
    pub async fn new() -> Self {
        let mut cfg = AppConfig::new(
            "sqlite::memory:".to_string(),
            "127.0.0.1".to_string(),
            18_080,
            "test".to_string(),
        );
        // A single connection keeps every query on the same in-memory
        // database.
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;
        cfg.auto_migrate = true;
        cfg.payment_webhook_secret = Some(TEST_WEBHOOK_SECRET.to_string());

        let pool = db::establish_connection(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");

        let (event_tx, event_rx) = mpsc::channel(256);
        let event_sender = EventSender::new(event_tx);
        let event_task = tokio::spawn(events::process_events(event_rx));

        let gateway = Arc::new(StubPaymentGateway::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let config = Arc::new(cfg);

        let services = AppServices::new(
            pool.clone(),
            config.clone(),
            event_sender.clone(),
            gateway.clone(),
            notifier.clone(),
        );

        let webhook_verifier = config
            .payment_webhook_secret
            .clone()
            .map(|secret| WebhookVerifier::new(secret, config.payment_webhook_tolerance_secs));

        let state = Arc::new(AppState {
            db: pool,
            config,
            event_sender,
            services,
            webhook_verifier,
        });

        let router = storefront_api::handlers::routes().with_state(state.clone());

        Self {
            router,
            state,
            gateway,
            notifier,
            _event_task: event_task,
        }
    }

    /// Send a request against the router, optionally as a given user.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        user: Option<Uuid>,
    ) -> axum::response::Response {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(user_id) = user {
            builder = builder.header(USER_ID_HEADER, user_id.to_string());
        }

        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(serde_json::to_vec(&json).expect("serialize json request body"))
            }
            None => Body::empty(),
        };

        let request = builder.body(body).expect("failed to build request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }

    /// Send a request carrying the admin role header.
    pub async fn request_as_admin(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        user: Uuid,
    ) -> axum::response::Response {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(USER_ID_HEADER, user.to_string())
            .header(USER_ROLE_HEADER, "admin");

        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(serde_json::to_vec(&json).expect("serialize json request body"))
            }
            None => Body::empty(),
        };

        let request = builder.body(body).expect("failed to build request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }

    /// Post a signed webhook payload.
    pub async fn post_webhook(&self, body: &Value, signature: Option<String>) -> axum::response::Response {
        let bytes = serde_json::to_vec(body).expect("serialize webhook body");
        self.post_webhook_raw(bytes, signature).await
    }

    /// Post raw webhook bytes, signing them unless a signature is given.
    pub async fn post_webhook_raw(
        &self,
        bytes: Vec<u8>,
        signature: Option<String>,
    ) -> axum::response::Response {
        let signature = signature.unwrap_or_else(|| {
            payments::signature_header(TEST_WEBHOOK_SECRET, Utc::now().timestamp(), &bytes)
        });

        let request = Request::builder()
            .method(Method::POST)
            .uri("/webhooks/payments")
            .header("content-type", "application/json")
            .header("stripe-signature", signature)
            .body(Body::from(bytes))
            .expect("failed to build webhook request");

        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during webhook request")
    }

    pub async fn seed_product(
        &self,
        name: &str,
        category: Option<&str>,
        price: Decimal,
        inventory: i32,
    ) -> ProductModel {
        let now = Utc::now();
        product::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(name.to_string()),
            description: Set(None),
            category: Set(category.map(|c| c.to_string())),
            price: Set(price),
            inventory: Set(inventory),
            reserved_inventory: Set(0),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&self.state.db)
        .await
        .expect("seed product")
    }

    pub async fn seed_discount(&self, seed: DiscountSeed) -> DiscountModel {
        let now = Utc::now();
        discount::ActiveModel {
            id: Set(Uuid::new_v4()),
            code: Set(seed.code),
            discount_type: Set(seed.discount_type),
            value: Set(seed.value),
            is_active: Set(seed.is_active),
            valid_from: Set(seed.valid_from),
            valid_to: Set(seed.valid_to),
            usage_limit: Set(seed.usage_limit),
            times_used: Set(seed.times_used),
            min_purchase_amount: Set(seed.min_purchase_amount),
            target_products: Set(if seed.target_products.is_empty() {
                None
            } else {
                Some(serde_json::json!(seed.target_products))
            }),
            target_categories: Set(if seed.target_categories.is_empty() {
                None
            } else {
                Some(serde_json::json!(seed.target_categories))
            }),
            is_automatic: Set(seed.is_automatic),
            is_free_shipping: Set(seed.is_free_shipping),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&self.state.db)
        .await
        .expect("seed discount")
    }

    pub async fn seed_default_address(&self, user_id: Uuid) -> AddressModel {
        address::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(user_id),
            line1: Set("1 Market St".to_string()),
            line2: Set(None),
            city: Set("San Francisco".to_string()),
            region: Set(Some("CA".to_string())),
            postal_code: Set("94105".to_string()),
            country: Set("US".to_string()),
            is_default_shipping: Set(true),
            is_default_billing: Set(true),
            created_at: Set(Utc::now()),
        }
        .insert(&self.state.db)
        .await
        .expect("seed address")
    }

    pub async fn get_product(&self, product_id: Uuid) -> ProductModel {
        self.state
            .services
            .catalog
            .get_product(product_id)
            .await
            .expect("product exists")
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self._event_task.abort();
    }
}

/// Seed data for a discount row; defaults describe an unrestricted,
/// active, manual discount.
pub struct DiscountSeed {
    pub code: String,
    pub discount_type: DiscountType,
    pub value: Decimal,
    pub is_active: bool,
    pub valid_from: Option<chrono::DateTime<Utc>>,
    pub valid_to: Option<chrono::DateTime<Utc>>,
    pub usage_limit: Option<i32>,
    pub times_used: i32,
    pub min_purchase_amount: Option<Decimal>,
    pub target_products: Vec<Uuid>,
    pub target_categories: Vec<String>,
    pub is_automatic: bool,
    pub is_free_shipping: bool,
}

impl DiscountSeed {
    pub fn new(code: &str, discount_type: DiscountType, value: Decimal) -> Self {
        Self {
            code: code.to_string(),
            discount_type,
            value,
            is_active: true,
            valid_from: None,
            valid_to: None,
            usage_limit: None,
            times_used: 0,
            min_purchase_amount: None,
            target_products: Vec::new(),
            target_categories: Vec::new(),
            is_automatic: false,
            is_free_shipping: false,
        }
    }
}

/// Reads the response body as JSON.
pub async fn response_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read response body");
    serde_json::from_slice(&bytes).expect("response body is json")
}

/// Asserts the status and returns the parsed body.
pub async fn assert_json(response: axum::response::Response, expected: StatusCode) -> Value {
    assert_eq!(response.status(), expected);
    response_json(response).await
}

/// Parses a JSON money field (serialized as a string) into a Decimal.
pub fn money(value: &Value) -> Decimal {
    value
        .as_str()
        .unwrap_or_else(|| panic!("expected money string, got {}", value))
        .parse()
        .expect("money field parses as decimal")
}
