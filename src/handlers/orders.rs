//! Order endpoints: checkout, retrieval, and lifecycle transitions.

use std::sync::Arc;

use axum::{
    extract::{Json, Path, State},
    response::IntoResponse,
    routing::{get, patch, post},
    Router,
};
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;

use crate::entities::OrderStatus;
use crate::handlers::{created_response, success_response};
use crate::{auth::AuthUser, errors::ServiceError, AppState};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", post(create_order).get(list_orders))
        .route("/:id", get(get_order))
        .route("/:id/status", patch(update_status))
        .route("/:id/cancel", post(cancel_order))
        .route("/:id/refund", post(refund_order))
}

#[derive(Debug, Deserialize, Validate)]
pub struct CheckoutRequest {
    #[validate(length(min = 1, message = "A payment method is required"))]
    pub payment_method_token: String,
    pub shipping_address_id: Option<Uuid>,
    pub billing_address_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: OrderStatus,
}

/// Convert the caller's cart into a paid order
async fn create_order(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(payload): Json<CheckoutRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    payload.validate()?;

    let order = state
        .services
        .checkout
        .create_order(
            user.user_id,
            &payload.payment_method_token,
            payload.shipping_address_id,
            payload.billing_address_id,
        )
        .await?;

    Ok(created_response(order))
}

/// List the caller's orders, newest first
async fn list_orders(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
) -> Result<impl IntoResponse, ServiceError> {
    let orders = state.services.orders.list_orders(user.user_id).await?;
    Ok(success_response(orders))
}

/// Get one order
async fn get_order(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let order = state.services.orders.get_order(id, user).await?;
    Ok(success_response(order))
}

/// Move an order to a new status
async fn update_status(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateStatusRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let order = state
        .services
        .orders
        .update_status(id, payload.status, user)
        .await?;
    Ok(success_response(order))
}

/// Cancel an order and restock its items
async fn cancel_order(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let order = state.services.orders.cancel_order(id, user).await?;
    Ok(success_response(order))
}

/// Refund a paid order through the gateway
async fn refund_order(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let order = state.services.orders.refund(id, user).await?;
    Ok(success_response(order))
}
