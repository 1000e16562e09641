//! Background sweep that writes off expired batches. Each candidate batch is
//! handled in its own transaction and re-checked inside it, so one bad batch
//! never blocks the rest of the sweep.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, Set, TransactionTrait,
};
use serde::Serialize;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::db::DbPool;
use crate::entities::{
    batch::{self, derived_status, BatchStatus, Entity as Batch},
    stock_movement::{MovementType, StockLocation},
};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::services::stock_ledger::{append_movement, recompute_product_stock, MovementDraft};

/// Actor recorded on sweep-generated movements. The sweeper runs with no
/// human in the loop, so it carries a fixed system identity.
pub const SWEEPER_ACTOR_ID: Uuid = Uuid::nil();

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepOutcome {
    pub batches_expired: u64,
    pub quantity_written_off: i64,
    pub statuses_refreshed: u64,
}

#[derive(Clone)]
pub struct ExpirySweeper {
    db_pool: Arc<DbPool>,
    event_sender: EventSender,
    near_expiry_horizon_days: i64,
}

impl ExpirySweeper {
    pub fn new(
        db_pool: Arc<DbPool>,
        event_sender: EventSender,
        near_expiry_horizon_days: i64,
    ) -> Self {
        Self {
            db_pool,
            event_sender,
            near_expiry_horizon_days,
        }
    }

    /// Runs the sweep forever at the given interval. An interval of zero
    /// disables the loop entirely.
    pub async fn run(self, interval_secs: u64) {
        if interval_secs == 0 {
            info!("Expiry sweeper disabled by configuration");
            return;
        }
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        loop {
            ticker.tick().await;
            match self.sweep_expired().await {
                Ok(outcome) if outcome.batches_expired > 0 || outcome.statuses_refreshed > 0 => {
                    info!(
                        batches_expired = outcome.batches_expired,
                        quantity_written_off = outcome.quantity_written_off,
                        statuses_refreshed = outcome.statuses_refreshed,
                        "Expiry sweep finished"
                    );
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "Expiry sweep failed"),
            }
        }
    }

    /// One full sweep pass: write off every expired batch that still holds
    /// stock, then refresh the status of batches that have crossed into the
    /// near-expiry horizon.
    #[instrument(skip(self))]
    pub async fn sweep_expired(&self) -> Result<SweepOutcome, ServiceError> {
        let today = Utc::now().date_naive();
        let mut outcome = SweepOutcome::default();

        // Status is not part of the filter: a batch can already carry the
        // `expired` status (derived at its last write) while still holding
        // stock that has not been written off. Quantity is the ground truth.
        let candidates = Batch::find()
            .filter(batch::Column::ExpiryDate.lte(today))
            .filter(batch::Column::TotalQty.gt(0))
            .filter(batch::Column::Status.ne(BatchStatus::Reversed.as_str()))
            .all(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?;

        for candidate in candidates {
            match self.expire_batch(candidate.id).await {
                Ok(Some(written_off)) => {
                    outcome.batches_expired += 1;
                    outcome.quantity_written_off += written_off as i64;
                }
                Ok(None) => {}
                Err(e) => {
                    // Log and move on. The batch stays eligible and the next
                    // sweep picks it up again.
                    error!(
                        batch_id = %candidate.id,
                        error = %e,
                        "Failed to expire batch, continuing sweep"
                    );
                    counter!("ledger_sweep.batch_failures", 1);
                }
            }
        }

        outcome.statuses_refreshed = self.refresh_near_expiry_statuses(today).await?;

        counter!("ledger_sweep.batches_expired", outcome.batches_expired);
        counter!(
            "ledger_sweep.quantity_written_off",
            outcome.quantity_written_off.max(0) as u64
        );
        Ok(outcome)
    }

    /// Expires one batch in its own transaction. Returns the quantity
    /// written off, or `None` when a concurrent writer already emptied,
    /// expired, or reversed the batch between candidate selection and here.
    async fn expire_batch(&self, batch_id: Uuid) -> Result<Option<i32>, ServiceError> {
        let today = Utc::now().date_naive();
        let db = &*self.db_pool;
        let txn = db.begin().await.map_err(ServiceError::db_error)?;

        let b = match Batch::find_by_id(batch_id)
            .one(&txn)
            .await
            .map_err(ServiceError::db_error)?
        {
            Some(b) => b,
            None => return Ok(None),
        };

        let still_eligible = b.total_qty > 0
            && b.expiry_date.is_some_and(|d| d <= today)
            && b.status_enum() != BatchStatus::Reversed;
        if !still_eligible {
            return Ok(None);
        }

        let written_off = b.total_qty;

        let mut active: batch::ActiveModel = b.clone().into();
        active.godown_qty = Set(0);
        active.store_qty = Set(0);
        active.total_qty = Set(0);
        active.status = Set(BatchStatus::Expired.as_str().to_string());
        active.updated_at = Set(Utc::now());
        active.update(&txn).await.map_err(ServiceError::db_error)?;

        // One movement for the whole write-off. The from-location names
        // where most of the loss was felt; the split is preserved in the
        // before-snapshot and spelled out in the reason.
        let from = if b.store_qty > 0 {
            StockLocation::Store
        } else {
            StockLocation::Godown
        };
        let reason = format!(
            "Expired on {} (godown {}, store {})",
            b.expiry_date.map(|d| d.to_string()).unwrap_or_default(),
            b.godown_qty,
            b.store_qty
        );
        append_movement(
            &txn,
            MovementDraft {
                product_id: b.product_id,
                batch_id: Some(b.id),
                movement_type: MovementType::Expired,
                from_location: Some(from),
                to_location: None,
                quantity: written_off,
                unit_price: None,
                godown_before: b.godown_qty,
                store_before: b.store_qty,
                godown_after: 0,
                store_after: 0,
                reason: Some(reason),
                reference: None,
                performed_by: SWEEPER_ACTOR_ID,
            },
        )
        .await?;

        recompute_product_stock(&txn, b.product_id).await?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        warn!(
            batch_id = %batch_id,
            product_id = %b.product_id,
            quantity = written_off,
            "Wrote off expired batch"
        );
        self.event_sender
            .send_logged(Event::BatchExpired {
                product_id: b.product_id,
                batch_id,
                quantity_written_off: written_off,
                expired_on: b.expiry_date,
            })
            .await;

        Ok(Some(written_off))
    }

    /// Moves `active` batches whose expiry date has entered the horizon to
    /// `near_expiry`. Status is derived state, so this pass only writes rows
    /// whose stored value has fallen behind.
    async fn refresh_near_expiry_statuses(
        &self,
        today: chrono::NaiveDate,
    ) -> Result<u64, ServiceError> {
        let horizon_end = today + chrono::Duration::days(self.near_expiry_horizon_days);
        let stale = Batch::find()
            .filter(batch::Column::Status.eq(BatchStatus::Active.as_str()))
            .filter(batch::Column::ExpiryDate.lte(horizon_end))
            .all(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?;

        let mut refreshed = 0;
        for b in stale {
            let derived = derived_status(&b, self.near_expiry_horizon_days);
            if derived == BatchStatus::NearExpiry {
                let mut active: batch::ActiveModel = b.into();
                active.status = Set(BatchStatus::NearExpiry.as_str().to_string());
                active.updated_at = Set(Utc::now());
                active.update(&*self.db_pool).await.map_err(ServiceError::db_error)?;
                refreshed += 1;
            }
        }
        Ok(refreshed)
    }
}
