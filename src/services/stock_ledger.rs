//! The stock ledger service: every mutating operation opens one database
//! transaction spanning the batch writes, the movement-log append(s), and the
//! product-aggregate recomputation, so a failure anywhere leaves nothing
//! half-applied.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use futures::future::BoxFuture;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseTransaction, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Set, TransactionTrait,
};
use serde::Serialize;
use tokio::time::sleep;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::db::DbPool;
use crate::entities::{
    batch::{self, BatchStatus, Entity as Batch},
    product::{self, Entity as Product},
    stock_movement::{
        self, validate_movement, Entity as StockMovement, MovementType, StockLocation,
    },
};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::services::allocation::{allocate, AllocationPlan};
use crate::services::promotions::{active_promotions, promo_price_for_batch};

/// Bounded retry for optimistic-concurrency contention. Only `Conflict`
/// errors are retried.
const MAX_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF_MS: u64 = 50;

/// Inputs for a godown delivery.
#[derive(Debug, Clone)]
pub struct ReceiveStock {
    pub product_id: Uuid,
    pub quantity: i32,
    pub batch_number: Option<String>,
    pub invoice_ref: Option<String>,
    pub purchase_price: Option<Decimal>,
    pub selling_price: Option<Decimal>,
    pub manufacturing_date: Option<NaiveDate>,
    pub expiry_date: Option<NaiveDate>,
}

/// Manual correction to one batch: absolute targets or signed deltas,
/// always per location.
#[derive(Debug, Clone)]
pub enum StockAdjustment {
    Absolute {
        godown_qty: Option<i32>,
        store_qty: Option<i32>,
    },
    Delta {
        godown: i32,
        store: i32,
    },
}

/// Result of a sale: the per-batch movements and the unit price each batch
/// was sold at (prices can differ across batches when a promotion applies to
/// only some of them).
#[derive(Debug, Clone)]
pub struct SaleOutcome {
    pub movements: Vec<stock_movement::Model>,
    pub unit_prices_used: Vec<(Uuid, Decimal)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StockSummary {
    pub total_stock: i64,
    pub godown_stock: i64,
    pub store_stock: i64,
    pub low_stock_count: u64,
    pub out_of_stock_count: u64,
}

/// Orchestrates all mutating ledger operations.
#[derive(Clone)]
pub struct StockLedgerService {
    db_pool: Arc<DbPool>,
    event_sender: EventSender,
    near_expiry_horizon_days: i64,
}

impl StockLedgerService {
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

    /// Receives a godown delivery. An existing batch with the same
    /// (product, batch number) is topped up; otherwise a new batch is
    /// created with everything in the godown.
    #[instrument(skip(self, req), fields(product_id = %req.product_id, quantity = req.quantity))]
    pub async fn receive(
        &self,
        req: ReceiveStock,
        actor_id: Uuid,
    ) -> Result<batch::Model, ServiceError> {
        self.with_retry("receive", || Box::pin(self.receive_once(req.clone(), actor_id)))
            .await
    }

    /// Moves stock godown -> store, consuming godown-side batches FEFO.
    #[instrument(skip(self))]
    pub async fn transfer_to_store(
        &self,
        product_id: Uuid,
        quantity: i32,
        actor_id: Uuid,
        reason: Option<String>,
    ) -> Result<Vec<stock_movement::Model>, ServiceError> {
        self.with_retry("transfer_to_store", || {
            Box::pin(self.transfer_once(
                product_id,
                quantity,
                StockLocation::Godown,
                actor_id,
                reason.clone(),
            ))
        })
        .await
    }

    /// Moves stock store -> godown, consuming store-side batches FEFO.
    #[instrument(skip(self))]
    pub async fn transfer_to_godown(
        &self,
        product_id: Uuid,
        quantity: i32,
        actor_id: Uuid,
        reason: Option<String>,
    ) -> Result<Vec<stock_movement::Model>, ServiceError> {
        self.with_retry("transfer_to_godown", || {
            Box::pin(self.transfer_once(
                product_id,
                quantity,
                StockLocation::Store,
                actor_id,
                reason.clone(),
            ))
        })
        .await
    }

    /// Sells store-side stock, consuming batches FEFO and pricing each
    /// consumed batch (promotion, else batch selling price, else product
    /// base price).
    #[instrument(skip(self))]
    pub async fn sell(
        &self,
        product_id: Uuid,
        quantity: i32,
        actor_id: Uuid,
        order_ref: Option<String>,
    ) -> Result<SaleOutcome, ServiceError> {
        self.with_retry("sell", || {
            Box::pin(self.sell_once(product_id, quantity, actor_id, order_ref.clone()))
        })
        .await
    }

    /// Manually corrects one batch's quantities.
    #[instrument(skip(self))]
    pub async fn adjust(
        &self,
        batch_id: Uuid,
        adjustment: StockAdjustment,
        actor_id: Uuid,
        reason: String,
    ) -> Result<batch::Model, ServiceError> {
        self.with_retry("adjust", || {
            Box::pin(self.adjust_once(batch_id, adjustment.clone(), actor_id, reason.clone()))
        })
        .await
    }

    /// Zeroes a batch and marks it `reversed`. Terminal: a reversed batch
    /// cannot be un-reversed; a mistaken reversal is corrected by receiving
    /// a new batch.
    #[instrument(skip(self))]
    pub async fn reverse(
        &self,
        batch_id: Uuid,
        actor_id: Uuid,
        reason: String,
    ) -> Result<batch::Model, ServiceError> {
        self.with_retry("reverse", || {
            Box::pin(self.reverse_once(batch_id, actor_id, reason.clone()))
        })
        .await
    }

    /// Administrative hard delete of one batch, with the owning product's
    /// aggregate re-derived. Movements referencing the batch are kept.
    #[instrument(skip(self))]
    pub async fn delete_batch(&self, batch_id: Uuid) -> Result<(), ServiceError> {
        let db = &*self.db_pool;
        let txn = db.begin().await.map_err(ServiceError::db_error)?;

        let existing = Batch::find_by_id(batch_id)
            .one(&txn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("Batch {} not found", batch_id)))?;

        let product_id = existing.product_id;
        Batch::delete_by_id(batch_id)
            .exec(&txn)
            .await
            .map_err(ServiceError::db_error)?;
        recompute_product_stock(&txn, product_id).await?;

        txn.commit().await.map_err(ServiceError::db_error)?;
        info!(batch_id = %batch_id, product_id = %product_id, "Batch deleted");
        Ok(())
    }

    /// Movement history for a product, newest first.
    pub async fn get_history(
        &self,
        product_id: Uuid,
        limit: u64,
    ) -> Result<Vec<stock_movement::Model>, ServiceError> {
        StockMovement::find()
            .filter(stock_movement::Column::ProductId.eq(product_id))
            .order_by_desc(stock_movement::Column::CreatedAt)
            .limit(limit)
            .all(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)
    }

    /// Full audit trail for one batch, newest first.
    pub async fn get_batch_movements(
        &self,
        batch_id: Uuid,
    ) -> Result<Vec<stock_movement::Model>, ServiceError> {
        StockMovement::find()
            .filter(stock_movement::Column::BatchId.eq(batch_id))
            .order_by_desc(stock_movement::Column::CreatedAt)
            .all(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)
    }

    /// All batches of a product, earliest-expiring first.
    pub async fn get_batches(&self, product_id: Uuid) -> Result<Vec<batch::Model>, ServiceError> {
        Batch::find()
            .filter(batch::Column::ProductId.eq(product_id))
            .order_by_asc(batch::Column::ExpiryDate)
            .order_by_asc(batch::Column::CreatedAt)
            .all(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)
    }

    /// Aggregated stock position across all products. Read-only; two calls
    /// with no intervening writes return identical results.
    pub async fn get_stock_summary(&self) -> Result<StockSummary, ServiceError> {
        let products = Product::find()
            .all(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?;

        let mut summary = StockSummary {
            total_stock: 0,
            godown_stock: 0,
            store_stock: 0,
            low_stock_count: 0,
            out_of_stock_count: 0,
        };
        for p in &products {
            summary.total_stock += p.stock_total as i64;
            summary.godown_stock += p.stock_godown as i64;
            summary.store_stock += p.stock_store as i64;
            if p.is_out_of_stock() {
                summary.out_of_stock_count += 1;
            } else if p.is_low_stock() {
                summary.low_stock_count += 1;
            }
        }
        Ok(summary)
    }

    // ---- single-attempt operation bodies ----

    async fn receive_once(
        &self,
        req: ReceiveStock,
        actor_id: Uuid,
    ) -> Result<batch::Model, ServiceError> {
        require_positive(req.quantity)?;

        let db = &*self.db_pool;
        let txn = db.begin().await.map_err(ServiceError::db_error)?;

        let product = load_product(&txn, req.product_id).await?;
        let today = Utc::now().date_naive();

        let existing = match &req.batch_number {
            Some(number) => Batch::find()
                .filter(batch::Column::ProductId.eq(req.product_id))
                .filter(batch::Column::BatchNumber.eq(number.clone()))
                .filter(batch::Column::Status.ne(BatchStatus::Reversed.as_str()))
                .one(&txn)
                .await
                .map_err(ServiceError::db_error)?,
            None => None,
        };

        let (updated, godown_before, store_before) = match existing {
            Some(b) => {
                let godown_before = b.godown_qty;
                let store_before = b.store_qty;
                let new_godown = b.godown_qty + req.quantity;
                let new_total = new_godown + b.store_qty;

                let mut active: batch::ActiveModel = b.clone().into();
                active.godown_qty = Set(new_godown);
                active.total_qty = Set(new_total);
                active.original_qty = Set(b.original_qty + req.quantity);
                active.status = Set(BatchStatus::derive(
                    new_total,
                    b.expiry_date,
                    today,
                    self.near_expiry_horizon_days,
                )
                .as_str()
                .to_string());
                active.updated_at = Set(Utc::now());
                let updated = active.update(&txn).await.map_err(ServiceError::db_error)?;
                (updated, godown_before, store_before)
            }
            None => {
                let status = BatchStatus::derive(
                    req.quantity,
                    req.expiry_date,
                    today,
                    self.near_expiry_horizon_days,
                );
                let created = batch::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    product_id: Set(req.product_id),
                    batch_number: Set(req.batch_number.clone()),
                    invoice_ref: Set(req.invoice_ref.clone()),
                    godown_qty: Set(req.quantity),
                    store_qty: Set(0),
                    total_qty: Set(req.quantity),
                    original_qty: Set(req.quantity),
                    purchase_price: Set(req.purchase_price.unwrap_or(Decimal::ZERO)),
                    selling_price: Set(req.selling_price.unwrap_or(Decimal::ZERO)),
                    manufacturing_date: Set(req.manufacturing_date),
                    expiry_date: Set(req.expiry_date),
                    status: Set(status.as_str().to_string()),
                    created_at: Set(Utc::now()),
                    updated_at: Set(Utc::now()),
                }
                .insert(&txn)
                .await
                .map_err(ServiceError::db_error)?;
                (created, 0, 0)
            }
        };

        append_movement(
            &txn,
            MovementDraft {
                product_id: req.product_id,
                batch_id: Some(updated.id),
                movement_type: MovementType::GodownIn,
                from_location: None,
                to_location: Some(StockLocation::Godown),
                quantity: req.quantity,
                unit_price: Some(updated.purchase_price),
                godown_before,
                store_before,
                godown_after: updated.godown_qty,
                store_after: updated.store_qty,
                reason: None,
                reference: req.invoice_ref.clone(),
                performed_by: actor_id,
            },
        )
        .await?;

        recompute_product_stock(&txn, product.id).await?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(
            product_id = %req.product_id,
            batch_id = %updated.id,
            quantity = req.quantity,
            "Received stock into godown"
        );
        self.event_sender
            .send_logged(Event::StockReceived {
                product_id: req.product_id,
                batch_id: updated.id,
                quantity: req.quantity,
            })
            .await;

        Ok(updated)
    }

    async fn transfer_once(
        &self,
        product_id: Uuid,
        quantity: i32,
        from: StockLocation,
        actor_id: Uuid,
        reason: Option<String>,
    ) -> Result<Vec<stock_movement::Model>, ServiceError> {
        require_positive(quantity)?;

        let db = &*self.db_pool;
        let txn = db.begin().await.map_err(ServiceError::db_error)?;

        let product = load_product(&txn, product_id).await?;
        let batches = load_live_batches(&txn, product_id).await?;

        let plan = allocate(&batches, from, quantity);
        if !plan.fully_allocated() {
            return Err(self.shortfall_error(&product, from, quantity, &plan));
        }

        let to = from.opposite();
        let movement_type = match from {
            StockLocation::Godown => MovementType::GodownToStore,
            StockLocation::Store => MovementType::StoreToGodown,
        };

        let by_id: HashMap<Uuid, batch::Model> =
            batches.into_iter().map(|b| (b.id, b)).collect();
        let mut movements = Vec::with_capacity(plan.allocations.len());

        for alloc in &plan.allocations {
            let b = by_id.get(&alloc.batch_id).ok_or_else(|| {
                ServiceError::InternalError("allocation referenced an unloaded batch".into())
            })?;
            let (new_godown, new_store) = match from {
                StockLocation::Godown => {
                    (b.godown_qty - alloc.quantity, b.store_qty + alloc.quantity)
                }
                StockLocation::Store => {
                    (b.godown_qty + alloc.quantity, b.store_qty - alloc.quantity)
                }
            };
            let updated = apply_batch_quantities(
                &txn,
                b.clone(),
                new_godown,
                new_store,
                self.near_expiry_horizon_days,
            )
            .await?;

            movements.push(
                append_movement(
                    &txn,
                    MovementDraft {
                        product_id,
                        batch_id: Some(updated.id),
                        movement_type,
                        from_location: Some(from),
                        to_location: Some(to),
                        quantity: alloc.quantity,
                        unit_price: None,
                        godown_before: b.godown_qty,
                        store_before: b.store_qty,
                        godown_after: updated.godown_qty,
                        store_after: updated.store_qty,
                        reason: reason.clone(),
                        reference: None,
                        performed_by: actor_id,
                    },
                )
                .await?,
            );
        }

        recompute_product_stock(&txn, product_id).await?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(
            product_id = %product_id,
            quantity,
            from = from.as_str(),
            batches = movements.len(),
            "Transferred stock between locations"
        );
        self.event_sender
            .send_logged(Event::StockTransferred {
                product_id,
                quantity,
                from_location: from.as_str().to_string(),
                to_location: to.as_str().to_string(),
                batches_touched: movements.len(),
            })
            .await;

        Ok(movements)
    }

    async fn sell_once(
        &self,
        product_id: Uuid,
        quantity: i32,
        actor_id: Uuid,
        order_ref: Option<String>,
    ) -> Result<SaleOutcome, ServiceError> {
        require_positive(quantity)?;

        let db = &*self.db_pool;
        let txn = db.begin().await.map_err(ServiceError::db_error)?;

        let product = load_product(&txn, product_id).await?;
        let batches = load_live_batches(&txn, product_id).await?;

        let plan = allocate(&batches, StockLocation::Store, quantity);
        if !plan.fully_allocated() {
            return Err(self.shortfall_error(&product, StockLocation::Store, quantity, &plan));
        }

        let now = Utc::now();
        let promotions = active_promotions(&txn, product_id, now).await?;

        let by_id: HashMap<Uuid, batch::Model> =
            batches.into_iter().map(|b| (b.id, b)).collect();
        let mut movements = Vec::with_capacity(plan.allocations.len());
        let mut unit_prices_used = Vec::with_capacity(plan.allocations.len());

        for alloc in &plan.allocations {
            let b = by_id.get(&alloc.batch_id).ok_or_else(|| {
                ServiceError::InternalError("allocation referenced an unloaded batch".into())
            })?;

            let unit_price = promo_price_for_batch(&promotions, b.id)
                .or_else(|| (b.selling_price > Decimal::ZERO).then_some(b.selling_price))
                .unwrap_or(product.base_price);

            let updated = apply_batch_quantities(
                &txn,
                b.clone(),
                b.godown_qty,
                b.store_qty - alloc.quantity,
                self.near_expiry_horizon_days,
            )
            .await?;

            movements.push(
                append_movement(
                    &txn,
                    MovementDraft {
                        product_id,
                        batch_id: Some(updated.id),
                        movement_type: MovementType::StoreOut,
                        from_location: Some(StockLocation::Store),
                        to_location: None,
                        quantity: alloc.quantity,
                        unit_price: Some(unit_price),
                        godown_before: b.godown_qty,
                        store_before: b.store_qty,
                        godown_after: updated.godown_qty,
                        store_after: updated.store_qty,
                        reason: None,
                        reference: order_ref.clone(),
                        performed_by: actor_id,
                    },
                )
                .await?,
            );
            unit_prices_used.push((updated.id, unit_price));
        }

        let product_after = recompute_product_stock(&txn, product_id).await?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(
            product_id = %product_id,
            quantity,
            batches = movements.len(),
            "Sold stock from store"
        );
        self.event_sender
            .send_logged(Event::StockSold {
                product_id,
                quantity,
                batches_touched: movements.len(),
                reference: order_ref,
            })
            .await;
        if product_after.is_low_stock() {
            self.event_sender
                .send_logged(Event::LowStock {
                    product_id,
                    stock_total: product_after.stock_total,
                    threshold: product_after.low_stock_threshold,
                    at: Utc::now(),
                })
                .await;
        }

        Ok(SaleOutcome {
            movements,
            unit_prices_used,
        })
    }

    async fn adjust_once(
        &self,
        batch_id: Uuid,
        adjustment: StockAdjustment,
        actor_id: Uuid,
        reason: String,
    ) -> Result<batch::Model, ServiceError> {
        let db = &*self.db_pool;
        let txn = db.begin().await.map_err(ServiceError::db_error)?;

        let b = Batch::find_by_id(batch_id)
            .one(&txn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("Batch {} not found", batch_id)))?;

        if b.status_enum() == BatchStatus::Reversed {
            return Err(ServiceError::InvalidArgument(format!(
                "Batch {} is reversed and cannot be adjusted",
                batch_id
            )));
        }

        let (new_godown, new_store) = match adjustment {
            StockAdjustment::Absolute {
                godown_qty,
                store_qty,
            } => {
                if godown_qty.is_none() && store_qty.is_none() {
                    return Err(ServiceError::InvalidArgument(
                        "Adjustment specifies no target quantity".into(),
                    ));
                }
                (
                    godown_qty.unwrap_or(b.godown_qty),
                    store_qty.unwrap_or(b.store_qty),
                )
            }
            StockAdjustment::Delta { godown, store } => {
                (b.godown_qty + godown, b.store_qty + store)
            }
        };

        let change = (new_godown - b.godown_qty).abs() + (new_store - b.store_qty).abs();
        if change == 0 {
            return Err(ServiceError::InvalidArgument(
                "Adjustment does not change any quantity".into(),
            ));
        }

        let updated = apply_batch_quantities(
            &txn,
            b.clone(),
            new_godown,
            new_store,
            self.near_expiry_horizon_days,
        )
        .await?;

        append_movement(
            &txn,
            MovementDraft {
                product_id: b.product_id,
                batch_id: Some(b.id),
                movement_type: MovementType::Adjustment,
                from_location: None,
                to_location: None,
                quantity: change,
                unit_price: None,
                godown_before: b.godown_qty,
                store_before: b.store_qty,
                godown_after: updated.godown_qty,
                store_after: updated.store_qty,
                reason: Some(reason.clone()),
                reference: None,
                performed_by: actor_id,
            },
        )
        .await?;

        recompute_product_stock(&txn, b.product_id).await?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(
            batch_id = %batch_id,
            godown = updated.godown_qty,
            store = updated.store_qty,
            "Adjusted batch quantities"
        );
        self.event_sender
            .send_logged(Event::StockAdjusted {
                product_id: b.product_id,
                batch_id,
                reason,
            })
            .await;

        Ok(updated)
    }

    async fn reverse_once(
        &self,
        batch_id: Uuid,
        actor_id: Uuid,
        reason: String,
    ) -> Result<batch::Model, ServiceError> {
        let db = &*self.db_pool;
        let txn = db.begin().await.map_err(ServiceError::db_error)?;

        let b = Batch::find_by_id(batch_id)
            .one(&txn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("Batch {} not found", batch_id)))?;

        if b.status_enum() == BatchStatus::Reversed {
            return Err(ServiceError::InvalidArgument(format!(
                "Batch {} is already reversed",
                batch_id
            )));
        }

        let zeroed = b.total_qty;
        let mut active: batch::ActiveModel = b.clone().into();
        active.godown_qty = Set(0);
        active.store_qty = Set(0);
        active.total_qty = Set(0);
        active.status = Set(BatchStatus::Reversed.as_str().to_string());
        active.updated_at = Set(Utc::now());
        let updated = active.update(&txn).await.map_err(ServiceError::db_error)?;

        // A batch that already held nothing gets no movement: there is no
        // quantity change to audit, only the status flip.
        if zeroed > 0 {
            append_movement(
                &txn,
                MovementDraft {
                    product_id: b.product_id,
                    batch_id: Some(b.id),
                    movement_type: MovementType::Adjustment,
                    from_location: None,
                    to_location: None,
                    quantity: zeroed,
                    unit_price: None,
                    godown_before: b.godown_qty,
                    store_before: b.store_qty,
                    godown_after: 0,
                    store_after: 0,
                    reason: Some(reason.clone()),
                    reference: None,
                    performed_by: actor_id,
                },
            )
            .await?;
        }

        recompute_product_stock(&txn, b.product_id).await?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(
            batch_id = %batch_id,
            quantity_zeroed = zeroed,
            "Reversed batch"
        );
        self.event_sender
            .send_logged(Event::BatchReversed {
                product_id: b.product_id,
                batch_id,
                quantity_zeroed: zeroed,
            })
            .await;

        Ok(updated)
    }

    // ---- shared plumbing ----

    /// Batch-level availability is the verdict: whenever the allocation walk
    /// leaves a remainder the operation fails with `InsufficientBatchStock`,
    /// even when the product aggregate agrees there is too little. An
    /// aggregate that claimed the request was coverable has drifted from
    /// batch reality, which is worth a warning on top.
    fn shortfall_error(
        &self,
        product: &product::Model,
        location: StockLocation,
        requested: i32,
        plan: &AllocationPlan,
    ) -> ServiceError {
        let available = plan.total_allocated();
        let aggregate = match location {
            StockLocation::Godown => product.stock_godown,
            StockLocation::Store => product.stock_store,
        };

        if aggregate >= requested {
            warn!(
                product_id = %product.id,
                location = location.as_str(),
                aggregate,
                batch_available = available,
                requested,
                "Aggregate stock disagrees with batch-level availability"
            );
        }
        ServiceError::InsufficientBatchStock(format!(
            "Batches of product {} cover only {} of {} units at {}",
            product.id,
            available,
            requested,
            location.as_str()
        ))
    }

    async fn with_retry<'a, T, F>(&self, op: &'static str, mut attempt_fn: F) -> Result<T, ServiceError>
    where
        F: FnMut() -> BoxFuture<'a, Result<T, ServiceError>>,
    {
        let mut attempt = 1;
        loop {
            match attempt_fn().await {
                Err(e) if e.is_retryable() && attempt < MAX_ATTEMPTS => {
                    warn!(
                        operation = op,
                        attempt,
                        error = %e,
                        "Retrying ledger operation after conflict"
                    );
                    sleep(Duration::from_millis(RETRY_BACKOFF_MS * attempt as u64)).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

fn require_positive(quantity: i32) -> Result<(), ServiceError> {
    if quantity <= 0 {
        return Err(ServiceError::InvalidArgument(format!(
            "Quantity must be positive, got {}",
            quantity
        )));
    }
    Ok(())
}

pub(crate) async fn load_product(
    txn: &DatabaseTransaction,
    product_id: Uuid,
) -> Result<product::Model, ServiceError> {
    Product::find_by_id(product_id)
        .one(txn)
        .await
        .map_err(ServiceError::db_error)?
        .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", product_id)))
}

/// Loads every non-reversed batch of a product inside the open transaction,
/// so the allocation decision never trusts a pre-transaction snapshot.
pub(crate) async fn load_live_batches(
    txn: &DatabaseTransaction,
    product_id: Uuid,
) -> Result<Vec<batch::Model>, ServiceError> {
    Batch::find()
        .filter(batch::Column::ProductId.eq(product_id))
        .filter(batch::Column::Status.ne(BatchStatus::Reversed.as_str()))
        .all(txn)
        .await
        .map_err(ServiceError::db_error)
}

/// Writes new per-location quantities to a batch, re-deriving `total_qty`
/// and `status` in the same update. Rejects negative results.
pub(crate) async fn apply_batch_quantities(
    txn: &DatabaseTransaction,
    b: batch::Model,
    new_godown: i32,
    new_store: i32,
    near_expiry_horizon_days: i64,
) -> Result<batch::Model, ServiceError> {
    if new_godown < 0 || new_store < 0 {
        return Err(ServiceError::InvalidArgument(format!(
            "Batch {} quantities cannot go negative (godown {}, store {})",
            b.id, new_godown, new_store
        )));
    }

    let new_total = new_godown + new_store;
    let status = BatchStatus::derive(
        new_total,
        b.expiry_date,
        Utc::now().date_naive(),
        near_expiry_horizon_days,
    );

    let mut active: batch::ActiveModel = b.into();
    active.godown_qty = Set(new_godown);
    active.store_qty = Set(new_store);
    active.total_qty = Set(new_total);
    active.status = Set(status.as_str().to_string());
    active.updated_at = Set(Utc::now());
    active.update(txn).await.map_err(ServiceError::db_error)
}

pub(crate) struct MovementDraft {
    pub product_id: Uuid,
    pub batch_id: Option<Uuid>,
    pub movement_type: MovementType,
    pub from_location: Option<StockLocation>,
    pub to_location: Option<StockLocation>,
    pub quantity: i32,
    pub unit_price: Option<Decimal>,
    pub godown_before: i32,
    pub store_before: i32,
    pub godown_after: i32,
    pub store_after: i32,
    pub reason: Option<String>,
    pub reference: Option<String>,
    pub performed_by: Uuid,
}

/// Appends one immutable movement to the log after validating it. The log
/// has no update or delete path anywhere in the crate.
pub(crate) async fn append_movement(
    txn: &DatabaseTransaction,
    draft: MovementDraft,
) -> Result<stock_movement::Model, ServiceError> {
    validate_movement(
        draft.movement_type,
        draft.quantity,
        draft.from_location,
        draft.to_location,
    )?;

    stock_movement::ActiveModel {
        id: Set(Uuid::new_v4()),
        product_id: Set(draft.product_id),
        batch_id: Set(draft.batch_id),
        movement_type: Set(draft.movement_type.as_str().to_string()),
        from_location: Set(draft.from_location.map(|l| l.as_str().to_string())),
        to_location: Set(draft.to_location.map(|l| l.as_str().to_string())),
        quantity: Set(draft.quantity),
        unit_price: Set(draft.unit_price),
        godown_before: Set(draft.godown_before),
        store_before: Set(draft.store_before),
        godown_after: Set(draft.godown_after),
        store_after: Set(draft.store_after),
        reason: Set(draft.reason),
        reference: Set(draft.reference),
        performed_by: Set(draft.performed_by),
        created_at: Set(Utc::now()),
    }
    .insert(txn)
    .await
    .map_err(ServiceError::db_error)
}

/// Restores the product-aggregate invariant: `stock_*` columns equal the sum
/// over the product's non-reversed batches. Called inside every mutating
/// transaction rather than maintained by delta, so a partial-failure bug in
/// one operation cannot leave drift behind.
pub(crate) async fn recompute_product_stock(
    txn: &DatabaseTransaction,
    product_id: Uuid,
) -> Result<product::Model, ServiceError> {
    let batches = load_live_batches(txn, product_id).await?;
    let godown: i32 = batches.iter().map(|b| b.godown_qty).sum();
    let store: i32 = batches.iter().map(|b| b.store_qty).sum();

    let product = load_product(txn, product_id).await?;
    let mut active: product::ActiveModel = product.into();
    active.stock_godown = Set(godown);
    active.stock_store = Set(store);
    active.stock_total = Set(godown + store);
    active.updated_at = Set(Utc::now());
    active.update(txn).await.map_err(ServiceError::db_error)
}
