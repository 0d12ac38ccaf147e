//! Service layer: business logic behind the HTTP handlers.

pub mod carts;
pub mod catalog;
pub mod checkout;
pub mod discounts;
pub mod orders;

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::db::DbPool;
use crate::events::EventSender;
use crate::notifications::LowStockNotifier;
use crate::payments::PaymentGateway;

pub use carts::CartService;
pub use catalog::CatalogService;
pub use checkout::CheckoutService;
pub use discounts::DiscountService;
pub use orders::OrderService;

/// Per-user async locks.
///
/// Cart mutations and checkout for the same user run one at a time; a
/// concurrent double checkout loses the race and finds the cart already
/// emptied. Locks for different users never contend.
#[derive(Clone, Default)]
pub struct UserLocks {
    inner: Arc<DashMap<Uuid, Arc<Mutex<()>>>>,
}

impl UserLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, user_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = self.inner.entry(user_id).or_default().clone();
        lock.lock_owned().await
    }
}

/// Aggregate of all services, wired once at startup and shared via
/// `AppState`.
#[derive(Clone)]
pub struct AppServices {
    pub catalog: CatalogService,
    pub discounts: DiscountService,
    pub carts: CartService,
    pub checkout: CheckoutService,
    pub orders: OrderService,
}

impl AppServices {
    pub fn new(
        db: DbPool,
        config: Arc<AppConfig>,
        events: EventSender,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn LowStockNotifier>,
    ) -> Self {
        let locks = UserLocks::new();
        let catalog = CatalogService::new(db.clone());
        let discounts = DiscountService::new(db.clone());
        let carts = CartService::new(
            db.clone(),
            catalog.clone(),
            discounts.clone(),
            locks.clone(),
            events.clone(),
        );
        let checkout = CheckoutService::new(
            db.clone(),
            config,
            catalog.clone(),
            discounts.clone(),
            locks,
            gateway.clone(),
            notifier,
            events.clone(),
        );
        let orders = OrderService::new(db, catalog.clone(), gateway, events);

        Self {
            catalog,
            discounts,
            carts,
            checkout,
            orders,
        }
    }
}
