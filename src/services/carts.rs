//! Cart operations: line-item management and discount attachment.
//!
//! Every public operation takes the caller's per-user lock before touching
//! the cart, so two requests for the same user cannot interleave between
//! the inventory reservation and the line-item write.

use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, ModelTrait, QueryFilter, Set};
use serde::Serialize;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::db::DbPool;
use crate::entities::{cart, cart_item, product, Cart, CartItem, CartModel, Product};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::services::discounts::{evaluate, CartProfile, DiscountService};
use crate::services::{CatalogService, UserLocks};

/// Cart contents as returned to clients: priced line items, subtotal, and
/// any discount worth showing.
#[derive(Debug, Clone, Serialize)]
pub struct CartView {
    pub id: Uuid,
    pub user_id: Uuid,
    pub items: Vec<CartItemView>,
    pub subtotal: Decimal,
    /// Discount explicitly attached via `apply_discount`, evaluated against
    /// the current contents. Omitted when no longer eligible.
    pub discount: Option<DiscountView>,
    /// Best automatic discount currently eligible, surfaced for display.
    pub automatic_discount: Option<DiscountView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CartItemView {
    pub product_id: Uuid,
    pub product_name: String,
    pub unit_price: Decimal,
    pub quantity: i32,
    pub line_total: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiscountView {
    pub code: String,
    pub amount: Decimal,
    pub free_shipping: bool,
}

#[derive(Clone)]
pub struct CartService {
    db: DbPool,
    catalog: CatalogService,
    discounts: DiscountService,
    locks: UserLocks,
    events: EventSender,
}

impl CartService {
    pub fn new(
        db: DbPool,
        catalog: CatalogService,
        discounts: DiscountService,
        locks: UserLocks,
        events: EventSender,
    ) -> Self {
        Self {
            db,
            catalog,
            discounts,
            locks,
            events,
        }
    }

    /// Returns the user's cart with priced items and discount views.
    #[instrument(skip(self))]
    pub async fn get_cart(&self, user_id: Uuid) -> Result<CartView, ServiceError> {
        let _guard = self.locks.acquire(user_id).await;
        let cart = self.get_or_create_cart(user_id).await?;
        self.build_view(cart).await
    }

    /// Adds `quantity` units of a product, reserving the stock first.
    #[instrument(skip(self))]
    pub async fn add_item(
        &self,
        user_id: Uuid,
        product_id: Uuid,
        quantity: i32,
    ) -> Result<CartView, ServiceError> {
        if quantity < 1 {
            return Err(ServiceError::ValidationError(
                "Quantity must be at least 1".to_string(),
            ));
        }

        let _guard = self.locks.acquire(user_id).await;

        // Existence check first so a missing product is NotFound rather
        // than InsufficientStock.
        self.catalog.get_product(product_id).await?;
        self.catalog.reserve_stock(product_id, quantity).await?;

        let cart = self.get_or_create_cart(user_id).await?;
        let existing = CartItem::find()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .filter(cart_item::Column::ProductId.eq(product_id))
            .one(&self.db)
            .await?;

        match existing {
            Some(item) => {
                let new_quantity = item.quantity + quantity;
                let mut active: cart_item::ActiveModel = item.into();
                active.quantity = Set(new_quantity);
                active.updated_at = Set(Utc::now());
                active.update(&self.db).await?;
            }
            None => {
                let now = Utc::now();
                cart_item::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    cart_id: Set(cart.id),
                    product_id: Set(product_id),
                    quantity: Set(quantity),
                    created_at: Set(now),
                    updated_at: Set(now),
                }
                .insert(&self.db)
                .await?;
            }
        }

        self.events
            .send_or_log(Event::CartItemAdded {
                cart_id: cart.id,
                product_id,
                quantity,
            })
            .await;

        self.build_view(cart).await
    }

    /// Removes the whole line item for a product and releases its entire
    /// reservation.
    #[instrument(skip(self))]
    pub async fn remove_item(
        &self,
        user_id: Uuid,
        product_id: Uuid,
    ) -> Result<CartView, ServiceError> {
        let _guard = self.locks.acquire(user_id).await;

        let cart = Cart::find()
            .filter(cart::Column::UserId.eq(user_id))
            .one(&self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound("Cart not found".to_string()))?;

        let item = CartItem::find()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .filter(cart_item::Column::ProductId.eq(product_id))
            .one(&self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound("Product not in cart".to_string()))?;

        // The line goes first: no live line may ever point at an already
        // released reservation, or its eventual sale could oversell.
        let quantity = item.quantity;
        item.delete(&self.db).await?;
        self.catalog.release_reservation(product_id, quantity).await?;

        self.events
            .send_or_log(Event::CartItemRemoved {
                cart_id: cart.id,
                product_id,
            })
            .await;

        self.build_view(cart).await
    }

    /// Attaches a discount code to the cart.
    ///
    /// Eligibility is checked against the current contents; the usage
    /// counter is not consumed until checkout completes.
    #[instrument(skip(self))]
    pub async fn apply_discount(
        &self,
        user_id: Uuid,
        code: &str,
    ) -> Result<CartView, ServiceError> {
        let _guard = self.locks.acquire(user_id).await;

        let cart = self.get_or_create_cart(user_id).await?;
        let discount = self
            .discounts
            .find_by_code(code)
            .await?
            .ok_or_else(|| {
                ServiceError::ValidationError("Invalid or expired discount code".to_string())
            })?;

        let (profile, subtotal) = self.cart_profile(cart.id).await?;
        evaluate(&discount, &profile, subtotal, Utc::now())
            .map_err(|reason| ServiceError::Conflict(reason.message(code)))?;

        let discount_id = discount.id;
        let mut active: cart::ActiveModel = cart.into();
        active.discount_id = Set(Some(discount_id));
        active.updated_at = Set(Utc::now());
        let cart = active.update(&self.db).await?;

        self.events
            .send_or_log(Event::DiscountApplied {
                cart_id: cart.id,
                discount_id,
                code: code.to_string(),
            })
            .await;

        self.build_view(cart).await
    }

    pub(crate) async fn get_or_create_cart(&self, user_id: Uuid) -> Result<CartModel, ServiceError> {
        if let Some(cart) = Cart::find()
            .filter(cart::Column::UserId.eq(user_id))
            .one(&self.db)
            .await?
        {
            return Ok(cart);
        }

        let now = Utc::now();
        let cart = cart::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(user_id),
            discount_id: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&self.db)
        .await?;
        Ok(cart)
    }

    /// Loads items with their products and computes the eligibility
    /// profile and subtotal.
    async fn cart_profile(&self, cart_id: Uuid) -> Result<(CartProfile, Decimal), ServiceError> {
        let (items, subtotal) = self.priced_items(cart_id).await?;
        let profile = CartProfile {
            product_ids: items.iter().map(|i| i.product_id).collect(),
            categories: items.iter().filter_map(|i| i.category.clone()).collect(),
        };
        Ok((profile, subtotal))
    }

    async fn priced_items(&self, cart_id: Uuid) -> Result<(Vec<PricedItem>, Decimal), ServiceError> {
        let items = CartItem::find()
            .filter(cart_item::Column::CartId.eq(cart_id))
            .all(&self.db)
            .await?;

        let product_ids: Vec<Uuid> = items.iter().map(|i| i.product_id).collect();
        let products = Product::find()
            .filter(product::Column::Id.is_in(product_ids))
            .all(&self.db)
            .await?;

        let mut priced = Vec::with_capacity(items.len());
        for item in &items {
            match products.iter().find(|p| p.id == item.product_id) {
                Some(product) => priced.push(PricedItem {
                    product_id: product.id,
                    product_name: product.name.clone(),
                    category: product.category.clone(),
                    unit_price: product.price,
                    quantity: item.quantity,
                    line_total: product.price * Decimal::from(item.quantity),
                }),
                None => {
                    warn!(product_id = %item.product_id, "cart references missing product");
                }
            }
        }

        let subtotal = priced.iter().map(|i| i.line_total).sum();
        Ok((priced, subtotal))
    }

    async fn build_view(&self, cart: CartModel) -> Result<CartView, ServiceError> {
        let (items, subtotal) = self.priced_items(cart.id).await?;
        let profile = CartProfile {
            product_ids: items.iter().map(|i| i.product_id).collect(),
            categories: items.iter().filter_map(|i| i.category.clone()).collect(),
        };
        let now = Utc::now();

        let discount = match cart.discount_id {
            Some(discount_id) => match self.discounts.get_by_id(discount_id).await? {
                Some(d) => evaluate(&d, &profile, subtotal, now)
                    .ok()
                    .map(|amount| DiscountView {
                        code: d.code.clone(),
                        amount,
                        free_shipping: d.is_free_shipping,
                    }),
                None => None,
            },
            None => None,
        };

        let automatic_discount = self
            .discounts
            .best_automatic(&profile, subtotal, now)
            .await?
            .map(|(d, amount)| DiscountView {
                code: d.code,
                amount,
                free_shipping: d.is_free_shipping,
            });

        Ok(CartView {
            id: cart.id,
            user_id: cart.user_id,
            items: items
                .into_iter()
                .map(|i| CartItemView {
                    product_id: i.product_id,
                    product_name: i.product_name,
                    unit_price: i.unit_price,
                    quantity: i.quantity,
                    line_total: i.line_total,
                })
                .collect(),
            subtotal,
            discount,
            automatic_discount,
        })
    }
}

struct PricedItem {
    product_id: Uuid,
    product_name: String,
    category: Option<String>,
    unit_price: Decimal,
    quantity: i32,
    line_total: Decimal,
}
