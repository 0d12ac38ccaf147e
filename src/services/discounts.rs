//! Discount eligibility and amount computation.
//!
//! `evaluate` is pure: every eligibility rule and the amount math live
//! here, shared by explicit code application, the automatic-discount view
//! on cart retrieval, and checkout re-validation.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter, QueryOrder};
use tracing::instrument;
use uuid::Uuid;

use crate::db::DbPool;
use crate::entities::{discount, Discount, DiscountModel, DiscountType};
use crate::errors::ServiceError;

/// Why a discount does not apply to a cart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ineligibility {
    Inactive,
    NotYetValid,
    Expired,
    UsageLimitReached,
    MinimumNotMet(Decimal),
    NotApplicable,
}

impl Ineligibility {
    pub fn message(&self, code: &str) -> String {
        match self {
            Self::Inactive => format!("Discount '{}' is not active", code),
            Self::NotYetValid => format!("Discount '{}' is not valid yet", code),
            Self::Expired => format!("Discount '{}' has expired", code),
            Self::UsageLimitReached => {
                format!("Discount '{}' has reached its usage limit", code)
            }
            Self::MinimumNotMet(min) => format!(
                "Discount '{}' requires a minimum purchase of {}",
                code,
                min.round_dp(2)
            ),
            Self::NotApplicable => {
                format!("Discount '{}' does not apply to the items in the cart", code)
            }
        }
    }
}

/// Cart contents a discount is judged against.
#[derive(Debug, Clone, Default)]
pub struct CartProfile {
    pub product_ids: Vec<Uuid>,
    pub categories: Vec<String>,
}

/// Checks eligibility and computes the discount amount for a cart.
///
/// The amount is clamped to the subtotal and rounded to 2 decimal places.
pub fn evaluate(
    discount: &DiscountModel,
    cart: &CartProfile,
    subtotal: Decimal,
    now: DateTime<Utc>,
) -> Result<Decimal, Ineligibility> {
    if !discount.is_active {
        return Err(Ineligibility::Inactive);
    }
    if let Some(from) = discount.valid_from {
        if now < from {
            return Err(Ineligibility::NotYetValid);
        }
    }
    if let Some(to) = discount.valid_to {
        if now > to {
            return Err(Ineligibility::Expired);
        }
    }
    if let Some(limit) = discount.usage_limit {
        if discount.times_used >= limit {
            return Err(Ineligibility::UsageLimitReached);
        }
    }
    if let Some(min) = discount.min_purchase_amount {
        if subtotal < min {
            return Err(Ineligibility::MinimumNotMet(min));
        }
    }

    let target_products = discount.target_products();
    let target_categories = discount.target_categories();
    if !target_products.is_empty() || !target_categories.is_empty() {
        let product_match = cart
            .product_ids
            .iter()
            .any(|id| target_products.contains(id));
        let category_match = cart
            .categories
            .iter()
            .any(|c| target_categories.contains(c));
        if !product_match && !category_match {
            return Err(Ineligibility::NotApplicable);
        }
    }

    let amount = match discount.discount_type {
        DiscountType::Percentage => subtotal * discount.value / Decimal::from(100),
        DiscountType::Fixed => discount.value,
    };

    Ok(amount.min(subtotal).round_dp(2))
}

#[derive(Clone)]
pub struct DiscountService {
    db: DbPool,
}

impl DiscountService {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }

    pub async fn find_by_code(&self, code: &str) -> Result<Option<DiscountModel>, ServiceError> {
        let found = Discount::find()
            .filter(discount::Column::Code.eq(code))
            .one(&self.db)
            .await?;
        Ok(found)
    }

    pub async fn get_by_id(&self, discount_id: Uuid) -> Result<Option<DiscountModel>, ServiceError> {
        let found = Discount::find_by_id(discount_id).one(&self.db).await?;
        Ok(found)
    }

    /// Picks the automatic discount giving the largest amount for this
    /// cart. Ties go to the oldest discount, then the smallest id, so the
    /// choice is deterministic.
    #[instrument(skip(self, cart))]
    pub async fn best_automatic(
        &self,
        cart: &CartProfile,
        subtotal: Decimal,
        now: DateTime<Utc>,
    ) -> Result<Option<(DiscountModel, Decimal)>, ServiceError> {
        let candidates = Discount::find()
            .filter(discount::Column::IsAutomatic.eq(true))
            .filter(discount::Column::IsActive.eq(true))
            .order_by_asc(discount::Column::CreatedAt)
            .order_by_asc(discount::Column::Id)
            .all(&self.db)
            .await?;

        let mut best: Option<(DiscountModel, Decimal)> = None;
        for candidate in candidates {
            if let Ok(amount) = evaluate(&candidate, cart, subtotal, now) {
                // The list is already in tie-break order, so strictly
                // larger amounts win and equal amounts keep the earlier one.
                match &best {
                    Some((_, best_amount)) if amount <= *best_amount => {}
                    _ => best = Some((candidate, amount)),
                }
            }
        }
        Ok(best)
    }

    /// Claims one use of the discount ahead of payment capture.
    ///
    /// The usage-limit guard rides in the WHERE clause, so two checkouts
    /// racing for the last remaining use cannot both claim it. Returns
    /// `false` when the limit is already exhausted.
    pub async fn claim_usage(&self, discount: &DiscountModel) -> Result<bool, ServiceError> {
        let mut query = Discount::update_many()
            .col_expr(
                discount::Column::TimesUsed,
                Expr::col(discount::Column::TimesUsed).add(1),
            )
            .col_expr(discount::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(discount::Column::Id.eq(discount.id));
        if let Some(limit) = discount.usage_limit {
            query = query.filter(discount::Column::TimesUsed.lt(limit));
        }

        let result = query.exec(&self.db).await?;
        Ok(result.rows_affected > 0)
    }

    /// Returns a claimed use after a payment that did not complete.
    pub async fn release_usage(&self, discount_id: Uuid) -> Result<(), ServiceError> {
        Discount::update_many()
            .col_expr(
                discount::Column::TimesUsed,
                Expr::col(discount::Column::TimesUsed).sub(1),
            )
            .col_expr(discount::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(discount::Column::Id.eq(discount_id))
            .filter(discount::Column::TimesUsed.gt(0))
            .exec(&self.db)
            .await?;
        Ok(())
    }
}
