//! Order lifecycle: retrieval, status transitions, cancellation, refunds,
//! and payment webhook application.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, QueryOrder, Set};
use serde::Serialize;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::db::DbPool;
use crate::entities::{
    order, order_item, DiscountType, Order, OrderItem, OrderItemModel, OrderModel, OrderStatus,
};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::payments::{PaymentEvent, PaymentEventKind, PaymentGateway};
use crate::services::CatalogService;

/// Order as returned to clients, with its frozen line items.
#[derive(Debug, Clone, Serialize)]
pub struct OrderView {
    pub id: Uuid,
    pub user_id: Uuid,
    pub status: OrderStatus,
    pub subtotal: Decimal,
    pub discount_code: Option<String>,
    pub discount_type: Option<DiscountType>,
    pub discount_amount: Decimal,
    pub shipping_cost: Decimal,
    pub tax_amount: Decimal,
    pub total_price: Decimal,
    pub shipping_address: serde_json::Value,
    pub billing_address: serde_json::Value,
    pub payment_intent_id: Option<String>,
    pub items: Vec<OrderItemView>,
    pub created_at: chrono::DateTime<Utc>,
    pub updated_at: chrono::DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderItemView {
    pub product_id: Uuid,
    pub product_name: String,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub line_total: Decimal,
}

impl OrderView {
    pub fn from_parts(order: OrderModel, items: Vec<OrderItemModel>) -> Self {
        Self {
            id: order.id,
            user_id: order.user_id,
            status: order.status,
            subtotal: order.subtotal,
            discount_code: order.discount_code,
            discount_type: order.discount_type,
            discount_amount: order.discount_amount,
            shipping_cost: order.shipping_cost,
            tax_amount: order.tax_amount,
            total_price: order.total_price,
            shipping_address: order.shipping_address,
            billing_address: order.billing_address,
            payment_intent_id: order.payment_intent_id,
            items: items
                .into_iter()
                .map(|i| OrderItemView {
                    product_id: i.product_id,
                    product_name: i.product_name,
                    quantity: i.quantity,
                    unit_price: i.unit_price,
                    line_total: i.unit_price * Decimal::from(i.quantity),
                })
                .collect(),
            created_at: order.created_at,
            updated_at: order.updated_at,
        }
    }
}

#[derive(Clone)]
pub struct OrderService {
    db: DbPool,
    catalog: CatalogService,
    gateway: Arc<dyn PaymentGateway>,
    events: EventSender,
}

impl OrderService {
    pub fn new(
        db: DbPool,
        catalog: CatalogService,
        gateway: Arc<dyn PaymentGateway>,
        events: EventSender,
    ) -> Self {
        Self {
            db,
            catalog,
            gateway,
            events,
        }
    }

    /// Lists the caller's orders, newest first.
    #[instrument(skip(self))]
    pub async fn list_orders(&self, user_id: Uuid) -> Result<Vec<OrderView>, ServiceError> {
        let orders = Order::find()
            .filter(order::Column::UserId.eq(user_id))
            .order_by_desc(order::Column::CreatedAt)
            .all(&self.db)
            .await?;

        let mut views = Vec::with_capacity(orders.len());
        for order in orders {
            let items = self.load_items(order.id).await?;
            views.push(OrderView::from_parts(order, items));
        }
        Ok(views)
    }

    /// Fetches one order; the caller must own it or be an admin.
    #[instrument(skip(self))]
    pub async fn get_order(
        &self,
        order_id: Uuid,
        actor: AuthUser,
    ) -> Result<OrderView, ServiceError> {
        let order = self.fetch_owned(order_id, actor).await?;
        let items = self.load_items(order.id).await?;
        Ok(OrderView::from_parts(order, items))
    }

    /// Moves an order to a new status. Terminal states admit no further
    /// transitions.
    #[instrument(skip(self))]
    pub async fn update_status(
        &self,
        order_id: Uuid,
        new_status: OrderStatus,
        actor: AuthUser,
    ) -> Result<OrderView, ServiceError> {
        let order = self.fetch_owned(order_id, actor).await?;
        if order.status.is_terminal() {
            return Err(ServiceError::Conflict(format!(
                "Order is {} and cannot change status",
                order.status.as_str()
            )));
        }

        let order = self.set_status(order, new_status).await?;
        let items = self.load_items(order.id).await?;
        Ok(OrderView::from_parts(order, items))
    }

    /// Cancels an order and returns its units to stock.
    #[instrument(skip(self))]
    pub async fn cancel_order(
        &self,
        order_id: Uuid,
        actor: AuthUser,
    ) -> Result<OrderView, ServiceError> {
        let order = self.fetch_owned(order_id, actor).await?;
        if order.status.is_terminal() {
            return Err(ServiceError::Conflict(format!(
                "Order is already {}",
                order.status.as_str()
            )));
        }

        let items = self.load_items(order.id).await?;
        for item in &items {
            self.catalog
                .return_stock(item.product_id, item.quantity)
                .await?;
        }

        let order = self.set_status(order, OrderStatus::Canceled).await?;
        self.events.send_or_log(Event::OrderCanceled(order.id)).await;
        Ok(OrderView::from_parts(order, items))
    }

    /// Refunds a paid order through the gateway and restocks its items.
    #[instrument(skip(self))]
    pub async fn refund(&self, order_id: Uuid, actor: AuthUser) -> Result<OrderView, ServiceError> {
        let order = self.fetch_owned(order_id, actor).await?;
        if !order.status.is_paid() {
            return Err(ServiceError::Conflict(format!(
                "Order in status {} cannot be refunded",
                order.status.as_str()
            )));
        }
        let payment_intent_id = order.payment_intent_id.clone().ok_or_else(|| {
            ServiceError::Conflict("Order has no payment reference to refund".to_string())
        })?;

        self.gateway.refund(&payment_intent_id).await?;

        let items = self.load_items(order.id).await?;
        for item in &items {
            self.catalog
                .return_stock(item.product_id, item.quantity)
                .await?;
        }

        let order = self.set_status(order, OrderStatus::Refunded).await?;
        self.events.send_or_log(Event::OrderRefunded(order.id)).await;
        Ok(OrderView::from_parts(order, items))
    }

    /// Applies a verified payment webhook event.
    ///
    /// Events referencing an unknown payment intent are logged and
    /// acknowledged; the gateway may deliver them before or after the
    /// order exists, and redelivery is its problem to manage.
    #[instrument(skip(self, event))]
    pub async fn apply_payment_event(&self, event: &PaymentEvent) -> Result<(), ServiceError> {
        self.events
            .send_or_log(Event::PaymentWebhookReceived {
                event_type: event.event_type.clone(),
                payment_intent_id: event.payment_intent_id.clone().unwrap_or_default(),
                received_at: Utc::now(),
            })
            .await;

        let new_status = match event.kind {
            PaymentEventKind::Succeeded => OrderStatus::Processing,
            PaymentEventKind::Failed => OrderStatus::Failed,
            PaymentEventKind::Other => {
                info!(event_type = %event.event_type, "ignoring unhandled webhook event type");
                return Ok(());
            }
        };

        let Some(intent_id) = event.payment_intent_id.as_deref() else {
            info!(event_type = %event.event_type, "webhook event carries no payment intent id");
            return Ok(());
        };

        let Some(order) = Order::find()
            .filter(order::Column::PaymentIntentId.eq(intent_id))
            .one(&self.db)
            .await?
        else {
            info!(payment_intent_id = intent_id, "webhook references unknown payment intent");
            return Ok(());
        };

        if order.status.is_terminal() || order.status == new_status {
            return Ok(());
        }
        self.set_status(order, new_status).await?;
        Ok(())
    }

    async fn fetch_owned(
        &self,
        order_id: Uuid,
        actor: AuthUser,
    ) -> Result<OrderModel, ServiceError> {
        let order = Order::find_by_id(order_id)
            .one(&self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;
        if !actor.can_act_on(order.user_id) {
            return Err(ServiceError::Forbidden(
                "You do not have access to this order".to_string(),
            ));
        }
        Ok(order)
    }

    async fn load_items(&self, order_id: Uuid) -> Result<Vec<OrderItemModel>, ServiceError> {
        let items = OrderItem::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .all(&self.db)
            .await?;
        Ok(items)
    }

    async fn set_status(
        &self,
        order: OrderModel,
        new_status: OrderStatus,
    ) -> Result<OrderModel, ServiceError> {
        let old_status = order.status;
        let mut active: order::ActiveModel = order.into();
        active.status = Set(new_status);
        active.updated_at = Set(Utc::now());
        let order = active.update(&self.db).await?;

        self.events
            .send_or_log(Event::OrderStatusChanged {
                order_id: order.id,
                old_status: old_status.as_str().to_string(),
                new_status: new_status.as_str().to_string(),
            })
            .await;
        Ok(order)
    }
}
