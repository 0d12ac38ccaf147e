//! Cart endpoints. The cart is addressed implicitly by the authenticated
//! caller; there is no cart id in the URL.

use std::sync::Arc;

use axum::{
    extract::{Json, Path, State},
    response::IntoResponse,
    routing::{delete, get, post},
    Router,
};
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;

use crate::handlers::{created_response, success_response};
use crate::{auth::AuthUser, errors::ServiceError, AppState};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(get_cart))
        .route("/items", post(add_item))
        .route("/items/:product_id", delete(remove_item))
        .route("/discount", post(apply_discount))
}

#[derive(Debug, Deserialize, Validate)]
pub struct AddItemRequest {
    pub product_id: Uuid,
    #[validate(range(min = 1, message = "Quantity must be at least 1"))]
    pub quantity: i32,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ApplyDiscountRequest {
    #[validate(length(min = 1, message = "Discount code must not be empty"))]
    pub code: String,
}

/// Get the caller's cart with priced items
async fn get_cart(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
) -> Result<impl IntoResponse, ServiceError> {
    let cart = state.services.carts.get_cart(user.user_id).await?;
    Ok(success_response(cart))
}

/// Add a product to the cart, reserving stock
async fn add_item(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(payload): Json<AddItemRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    payload.validate()?;

    let cart = state
        .services
        .carts
        .add_item(user.user_id, payload.product_id, payload.quantity)
        .await?;

    Ok(created_response(cart))
}

/// Remove a product's line item and release its reservation
async fn remove_item(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(product_id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let cart = state
        .services
        .carts
        .remove_item(user.user_id, product_id)
        .await?;

    Ok(success_response(cart))
}

/// Attach a discount code to the cart
async fn apply_discount(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(payload): Json<ApplyDiscountRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    payload.validate()?;

    let cart = state
        .services
        .carts
        .apply_discount(user.user_id, payload.code.trim())
        .await?;

    Ok(success_response(cart))
}
