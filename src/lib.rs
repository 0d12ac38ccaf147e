//! Storefront API Library
//!
//! Order-checkout and inventory-reservation core: carts, discounts, stock
//! reservation, payment capture, order lifecycle, and payment webhooks.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod auth;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod notifications;
pub mod payments;
pub mod services;

use std::sync::Arc;

use crate::payments::WebhookVerifier;

/// Shared application state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub db: db::DbPool,
    pub config: Arc<config::AppConfig>,
    pub event_sender: events::EventSender,
    pub services: services::AppServices,
    /// Present only when a webhook secret is configured.
    pub webhook_verifier: Option<WebhookVerifier>,
}
