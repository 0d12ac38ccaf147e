//! Checkout: converts a cart into a paid order.
//!
//! Ordering is the whole point here. Steps before the charge only read,
//! except the guarded discount-usage claim, which a declined payment
//! hands back; a failure anywhere up to the charge therefore leaves no
//! trace. The charge itself is the commit point: everything after it
//! (inventory decrements, order row, cart wipe) runs on the strength of
//! an already-captured payment. A crash inside that window is
//! recoverable through the payment reference recorded on the charge.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, Set, TransactionTrait};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::db::DbPool;
use crate::entities::{
    address, cart, cart_item, order, order_item, Address, AddressModel, Cart, CartItem,
    DiscountModel, OrderStatus,
};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::notifications::LowStockNotifier;
use crate::payments::PaymentGateway;
use crate::services::discounts::{evaluate, CartProfile, DiscountService};
use crate::services::orders::OrderView;
use crate::services::{CatalogService, UserLocks};

#[derive(Clone)]
pub struct CheckoutService {
    db: DbPool,
    config: Arc<AppConfig>,
    catalog: CatalogService,
    discounts: DiscountService,
    locks: UserLocks,
    gateway: Arc<dyn PaymentGateway>,
    notifier: Arc<dyn LowStockNotifier>,
    events: EventSender,
}

/// Line item snapshot taken while pricing the order.
struct PricedLine {
    product_id: Uuid,
    product_name: String,
    category: Option<String>,
    unit_price: Decimal,
    quantity: i32,
}

impl CheckoutService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: DbPool,
        config: Arc<AppConfig>,
        catalog: CatalogService,
        discounts: DiscountService,
        locks: UserLocks,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn LowStockNotifier>,
        events: EventSender,
    ) -> Self {
        Self {
            db,
            config,
            catalog,
            discounts,
            locks,
            gateway,
            notifier,
            events,
        }
    }

    /// Runs the full checkout sequence for the user's cart.
    #[instrument(skip(self, payment_method_token))]
    pub async fn create_order(
        &self,
        user_id: Uuid,
        payment_method_token: &str,
        shipping_address_id: Option<Uuid>,
        billing_address_id: Option<Uuid>,
    ) -> Result<OrderView, ServiceError> {
        let _guard = self.locks.acquire(user_id).await;

        // 1. Resolve addresses before anything else; both fall back to the
        //    user's defaults.
        let shipping = self
            .resolve_address(user_id, shipping_address_id, AddressKind::Shipping)
            .await?;
        let billing = self
            .resolve_address(user_id, billing_address_id, AddressKind::Billing)
            .await?;

        // 2. The cart must exist and hold at least one item.
        let cart = Cart::find()
            .filter(cart::Column::UserId.eq(user_id))
            .one(&self.db)
            .await?
            .ok_or_else(|| ServiceError::Conflict("Cart is empty".to_string()))?;
        let items = CartItem::find()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .all(&self.db)
            .await?;
        if items.is_empty() {
            return Err(ServiceError::Conflict("Cart is empty".to_string()));
        }

        // 3. Snapshot product names and prices; a product deleted since it
        //    was added to the cart fails the checkout.
        let mut lines = Vec::with_capacity(items.len());
        let mut subtotal = Decimal::ZERO;
        for item in &items {
            let product = self.catalog.get_product(item.product_id).await?;
            subtotal += product.price * Decimal::from(item.quantity);
            lines.push(PricedLine {
                product_id: product.id,
                product_name: product.name,
                category: product.category,
                unit_price: product.price,
                quantity: item.quantity,
            });
        }

        // 4. Re-validate any attached discount. One that became ineligible
        //    since it was applied is dropped without failing the checkout.
        let mut applied_discount = self.revalidate_discount(&cart, &lines, subtotal).await?;

        // 5. Claim the discount use before pricing. The guarded increment
        //    is what actually enforces the usage limit; a checkout that
        //    loses the last remaining use to a concurrent one drops the
        //    discount the same way a failed re-validation does.
        if let Some((discount, _)) = &applied_discount {
            if !self.discounts.claim_usage(discount).await? {
                debug!(
                    code = %discount.code,
                    "usage limit exhausted by a concurrent checkout; dropping"
                );
                applied_discount = None;
            }
        }
        let (discount_amount, free_shipping) = applied_discount
            .as_ref()
            .map(|(d, amount)| (*amount, d.is_free_shipping))
            .unwrap_or((Decimal::ZERO, false));

        // 6. Price the order.
        let shipping_cost = if free_shipping {
            Decimal::ZERO
        } else {
            self.config.shipping_flat_rate_decimal()
        };
        let tax_amount = ((subtotal - discount_amount) * self.config.tax_rate_decimal()).round_dp(2);
        let total_price = (subtotal - discount_amount) + shipping_cost + tax_amount;

        // 7. Capture the payment. The only write so far is the claimed
        //    discount use, which a decline hands back.
        let receipt = match self
            .gateway
            .charge(total_price, &self.config.currency, payment_method_token)
            .await
        {
            Ok(receipt) => receipt,
            Err(e) => {
                if let Some((discount, _)) = &applied_discount {
                    self.discounts.release_usage(discount.id).await?;
                }
                return Err(e);
            }
        };

        // 8. Convert reservations into sales, watching for low stock.
        for line in &lines {
            let remaining = match self.catalog.commit_sale(line.product_id, line.quantity).await {
                Ok(remaining) => remaining,
                Err(e) => {
                    // Payment is already captured; the stored reference is
                    // the handle for reconciling this order manually.
                    error!(
                        payment_intent_id = %receipt.payment_intent_id,
                        product_id = %line.product_id,
                        "inventory commit failed after payment capture: {}",
                        e
                    );
                    return Err(e);
                }
            };
            if remaining > 0 && remaining <= self.config.low_stock_threshold {
                self.notify_low_stock(line, remaining).await;
            }
        }

        // 9. Persist the order and empty the cart atomically.
        let now = Utc::now();
        let order_id = Uuid::new_v4();
        let shipping_json = serde_json::to_value(&shipping)
            .map_err(|e| ServiceError::InternalError(e.to_string()))?;
        let billing_json = serde_json::to_value(&billing)
            .map_err(|e| ServiceError::InternalError(e.to_string()))?;

        let txn = self.db.begin().await?;

        let order_model = order::ActiveModel {
            id: Set(order_id),
            user_id: Set(user_id),
            status: Set(OrderStatus::Processing),
            subtotal: Set(subtotal),
            discount_code: Set(applied_discount.as_ref().map(|(d, _)| d.code.clone())),
            discount_type: Set(applied_discount.as_ref().map(|(d, _)| d.discount_type)),
            discount_amount: Set(discount_amount),
            shipping_cost: Set(shipping_cost),
            tax_amount: Set(tax_amount),
            total_price: Set(total_price),
            shipping_address: Set(shipping_json),
            billing_address: Set(billing_json),
            payment_intent_id: Set(Some(receipt.payment_intent_id.clone())),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await?;

        let mut order_items = Vec::with_capacity(lines.len());
        for line in &lines {
            let item = order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                product_id: Set(line.product_id),
                product_name: Set(line.product_name.clone()),
                quantity: Set(line.quantity),
                unit_price: Set(line.unit_price),
                created_at: Set(now),
            }
            .insert(&txn)
            .await?;
            order_items.push(item);
        }

        CartItem::delete_many()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .exec(&txn)
            .await?;
        let mut cart_active: cart::ActiveModel = cart.into();
        cart_active.discount_id = Set(None);
        cart_active.updated_at = Set(now);
        cart_active.update(&txn).await?;

        txn.commit().await?;

        self.events
            .send_or_log(Event::PaymentCaptured {
                order_id,
                payment_intent_id: receipt.payment_intent_id,
                amount: total_price,
            })
            .await;
        self.events
            .send_or_log(Event::OrderCreated {
                order_id,
                user_id,
                total: total_price,
            })
            .await;

        Ok(OrderView::from_parts(order_model, order_items))
    }

    async fn revalidate_discount(
        &self,
        cart: &cart::Model,
        lines: &[PricedLine],
        subtotal: Decimal,
    ) -> Result<Option<(DiscountModel, Decimal)>, ServiceError> {
        let Some(discount_id) = cart.discount_id else {
            return Ok(None);
        };
        let Some(discount) = self.discounts.get_by_id(discount_id).await? else {
            debug!(%discount_id, "attached discount no longer exists; dropping");
            return Ok(None);
        };

        let profile = CartProfile {
            product_ids: lines.iter().map(|l| l.product_id).collect(),
            categories: lines.iter().filter_map(|l| l.category.clone()).collect(),
        };
        match evaluate(&discount, &profile, subtotal, Utc::now()) {
            Ok(amount) => Ok(Some((discount, amount))),
            Err(reason) => {
                debug!(
                    code = %discount.code,
                    ?reason,
                    "attached discount no longer eligible; dropping"
                );
                Ok(None)
            }
        }
    }

    async fn resolve_address(
        &self,
        user_id: Uuid,
        address_id: Option<Uuid>,
        kind: AddressKind,
    ) -> Result<AddressModel, ServiceError> {
        if let Some(id) = address_id {
            return Address::find_by_id(id)
                .filter(address::Column::UserId.eq(user_id))
                .one(&self.db)
                .await?
                .ok_or_else(|| ServiceError::NotFound(format!("Address {} not found", id)));
        }

        let default_filter = match kind {
            AddressKind::Shipping => address::Column::IsDefaultShipping.eq(true),
            AddressKind::Billing => address::Column::IsDefaultBilling.eq(true),
        };
        Address::find()
            .filter(address::Column::UserId.eq(user_id))
            .filter(default_filter)
            .one(&self.db)
            .await?
            .ok_or_else(|| {
                ServiceError::ValidationError(format!("A {} address is required", kind.label()))
            })
    }

    async fn notify_low_stock(&self, line: &PricedLine, remaining: i32) {
        self.events
            .send_or_log(Event::LowStockDetected {
                product_id: line.product_id,
                current_stock: remaining,
            })
            .await;

        let notifier = Arc::clone(&self.notifier);
        let product_id = line.product_id;
        let product_name = line.product_name.clone();
        tokio::spawn(async move {
            notifier
                .notify_low_stock(product_id, &product_name, remaining)
                .await;
        });
    }
}

#[derive(Clone, Copy)]
enum AddressKind {
    Shipping,
    Billing,
}

impl AddressKind {
    fn label(self) -> &'static str {
        match self {
            Self::Shipping => "shipping",
            Self::Billing => "billing",
        }
    }
}
