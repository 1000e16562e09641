//! Read-only promotion lookup used by the sell path to price `store_out`
//! movements. Promotions are owned externally; the ledger never writes them.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::{ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter};
use uuid::Uuid;

use crate::entities::promotion::{self, Entity as Promotion};
use crate::errors::ServiceError;

/// Loads the promotions in effect for a product at `at`. Window bounds are
/// half-open: `starts_at <= at < ends_at`.
pub async fn active_promotions<C: ConnectionTrait>(
    db: &C,
    product_id: Uuid,
    at: DateTime<Utc>,
) -> Result<Vec<promotion::Model>, ServiceError> {
    Promotion::find()
        .filter(promotion::Column::ProductId.eq(product_id))
        .filter(promotion::Column::Active.eq(true))
        .filter(promotion::Column::StartsAt.lte(at))
        .filter(promotion::Column::EndsAt.gt(at))
        .all(db)
        .await
        .map_err(ServiceError::db_error)
}

/// Picks the promotional price for one batch from a set of active
/// promotions: a batch-specific promotion wins over a product-wide one.
/// Returns `None` when no promotion applies.
pub fn promo_price_for_batch(promotions: &[promotion::Model], batch_id: Uuid) -> Option<Decimal> {
    promotions
        .iter()
        .find(|p| p.batch_id == Some(batch_id))
        .or_else(|| promotions.iter().find(|p| p.batch_id.is_none()))
        .map(|p| p.promo_price)
}
