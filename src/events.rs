use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Events emitted by the checkout and order-lifecycle services.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    // Cart events
    CartItemAdded {
        cart_id: Uuid,
        product_id: Uuid,
        quantity: i32,
    },
    CartItemRemoved {
        cart_id: Uuid,
        product_id: Uuid,
    },
    DiscountApplied {
        cart_id: Uuid,
        discount_id: Uuid,
        code: String,
    },

    // Order events
    OrderCreated {
        order_id: Uuid,
        user_id: Uuid,
        total: Decimal,
    },
    OrderStatusChanged {
        order_id: Uuid,
        old_status: String,
        new_status: String,
    },
    OrderCanceled(Uuid),
    OrderRefunded(Uuid),

    // Payment events
    PaymentCaptured {
        order_id: Uuid,
        payment_intent_id: String,
        amount: Decimal,
    },
    PaymentWebhookReceived {
        event_type: String,
        payment_intent_id: String,
        received_at: DateTime<Utc>,
    },

    // Inventory events
    LowStockDetected {
        product_id: Uuid,
        current_stock: i32,
    },
}

/// Cloneable handle for publishing events onto the in-process channel.
#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event, surfacing channel failures to the caller.
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends an event, logging instead of failing when the channel is
    /// closed. Event delivery is best-effort and never fails the
    /// originating operation.
    pub async fn send_or_log(&self, event: Event) {
        if let Err(e) = self.send(event).await {
            warn!("Dropping event: {}", e);
        }
    }
}

/// Background loop draining the event channel.
///
/// Today events only feed structured logs; external fan-out (message
/// queues, outbound webhooks) would hang off this loop.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match &event {
            Event::OrderCreated {
                order_id,
                user_id,
                total,
            } => {
                info!(%order_id, %user_id, %total, "order created");
            }
            Event::OrderStatusChanged {
                order_id,
                old_status,
                new_status,
            } => {
                info!(%order_id, old_status, new_status, "order status changed");
            }
            Event::LowStockDetected {
                product_id,
                current_stock,
            } => {
                warn!(%product_id, current_stock, "low stock detected");
            }
            other => {
                debug!(event = ?other, "event processed");
            }
        }
    }

    info!("Event channel closed; processing loop exiting");
}
