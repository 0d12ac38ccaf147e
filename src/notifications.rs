//! Low-stock alerting.
//!
//! Alerts are fire-and-forget side effects of a committed sale. They run
//! on a spawned task so a slow or failing notification channel can never
//! delay or fail the checkout that triggered it.

use async_trait::async_trait;
use reqwest::Client;
use tracing::{error, warn};
use uuid::Uuid;

/// Destination for low-stock alerts.
#[async_trait]
pub trait LowStockNotifier: Send + Sync {
    async fn notify_low_stock(&self, product_id: Uuid, product_name: &str, current_stock: i32);
}

/// Default notifier: emits a structured warning log.
pub struct LogNotifier;

#[async_trait]
impl LowStockNotifier for LogNotifier {
    async fn notify_low_stock(&self, product_id: Uuid, product_name: &str, current_stock: i32) {
        warn!(%product_id, product_name, current_stock, "product stock below threshold");
    }
}

/// Posts alerts to an external endpoint (ops chat, inventory dashboard).
pub struct HttpNotifier {
    client: Client,
    url: String,
}

impl HttpNotifier {
    pub fn new(url: String) -> Self {
        Self {
            client: Client::new(),
            url,
        }
    }
}

#[async_trait]
impl LowStockNotifier for HttpNotifier {
    async fn notify_low_stock(&self, product_id: Uuid, product_name: &str, current_stock: i32) {
        let payload = serde_json::json!({
            "product_id": product_id,
            "product_name": product_name,
            "current_stock": current_stock,
        });

        if let Err(e) = self.client.post(&self.url).json(&payload).send().await {
            error!(%product_id, "failed to deliver low stock alert: {}", e);
        }
    }
}
