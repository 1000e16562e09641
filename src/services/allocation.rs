//! FEFO (First-Expiring-First-Out) batch allocation.
//!
//! `allocate` is a pure function over already-loaded batch rows: no I/O, no
//! mutation. The ledger service loads candidate batches inside its open
//! transaction, asks this module which batches to consume, applies the
//! returned plan, and aborts the transaction when the plan leaves a
//! remainder.

use uuid::Uuid;

use crate::entities::batch::{self, BatchStatus};
use crate::entities::stock_movement::StockLocation;

/// One (batch, quantity-to-take) pair in an allocation plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchAllocation {
    pub batch_id: Uuid,
    pub quantity: i32,
}

/// Result of a FEFO walk: the selected per-batch quantities, and whatever
/// portion of the request could not be covered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationPlan {
    pub allocations: Vec<BatchAllocation>,
    pub remainder: i32,
}

impl AllocationPlan {
    pub fn fully_allocated(&self) -> bool {
        self.remainder == 0
    }

    pub fn total_allocated(&self) -> i32 {
        self.allocations.iter().map(|a| a.quantity).sum()
    }
}

/// Selects batches to cover `requested` units at `location`, earliest expiry
/// first. Never-expiring batches sort last; ties break on creation order and
/// then id, so the walk is deterministic.
///
/// Reversed batches and batches with nothing at `location` are skipped. The
/// caller decides what a non-zero remainder means; partial plans are never an
/// error at this level.
pub fn allocate(
    batches: &[batch::Model],
    location: StockLocation,
    requested: i32,
) -> AllocationPlan {
    debug_assert!(requested > 0);

    let mut candidates: Vec<&batch::Model> = batches
        .iter()
        .filter(|b| b.status_enum() != BatchStatus::Reversed && b.quantity_at(location) > 0)
        .collect();

    // None (never expires) must sort after every concrete date
    candidates.sort_by(|a, b| {
        match (a.expiry_date, b.expiry_date) {
            (Some(ea), Some(eb)) => ea.cmp(&eb),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        }
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
    });

    let mut allocations = Vec::new();
    let mut remaining = requested;

    for candidate in candidates {
        if remaining == 0 {
            break;
        }
        let take = remaining.min(candidate.quantity_at(location));
        allocations.push(BatchAllocation {
            batch_id: candidate.id,
            quantity: take,
        });
        remaining -= take;
    }

    AllocationPlan {
        allocations,
        remainder: remaining,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate, Utc};
    use rust_decimal::Decimal;

    fn test_batch(
        expiry: Option<NaiveDate>,
        godown_qty: i32,
        store_qty: i32,
        created_offset_secs: i64,
    ) -> batch::Model {
        batch::Model {
            id: Uuid::new_v4(),
            product_id: Uuid::new_v4(),
            batch_number: None,
            invoice_ref: None,
            godown_qty,
            store_qty,
            total_qty: godown_qty + store_qty,
            original_qty: godown_qty + store_qty,
            purchase_price: Decimal::ZERO,
            selling_price: Decimal::ZERO,
            manufacturing_date: None,
            expiry_date: expiry,
            status: BatchStatus::Active.as_str().to_string(),
            created_at: Utc::now() + Duration::seconds(created_offset_secs),
            updated_at: Utc::now(),
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn earliest_expiry_is_consumed_first() {
        let later = test_batch(Some(date(2025, 3, 1)), 0, 10, 0);
        let sooner = test_batch(Some(date(2025, 2, 1)), 0, 10, 1);
        let never = test_batch(None, 0, 10, 2);
        let batches = vec![later.clone(), never.clone(), sooner.clone()];

        let plan = allocate(&batches, StockLocation::Store, 25);
        assert!(plan.fully_allocated());
        assert_eq!(
            plan.allocations,
            vec![
                BatchAllocation { batch_id: sooner.id, quantity: 10 },
                BatchAllocation { batch_id: later.id, quantity: 10 },
                BatchAllocation { batch_id: never.id, quantity: 5 },
            ]
        );
    }

    #[test]
    fn never_expiring_batches_sort_last() {
        let never = test_batch(None, 5, 0, 0);
        let dated = test_batch(Some(date(2030, 1, 1)), 5, 0, 1);
        let plan = allocate(&[never.clone(), dated.clone()], StockLocation::Godown, 3);

        assert_eq!(plan.allocations.len(), 1);
        assert_eq!(plan.allocations[0].batch_id, dated.id);
    }

    #[test]
    fn creation_order_breaks_expiry_ties() {
        let second = test_batch(Some(date(2025, 6, 1)), 4, 0, 10);
        let first = test_batch(Some(date(2025, 6, 1)), 4, 0, 0);
        let plan = allocate(&[second.clone(), first.clone()], StockLocation::Godown, 6);

        assert_eq!(
            plan.allocations,
            vec![
                BatchAllocation { batch_id: first.id, quantity: 4 },
                BatchAllocation { batch_id: second.id, quantity: 2 },
            ]
        );
    }

    #[test]
    fn exact_fit_consumes_one_batch() {
        let b = test_batch(Some(date(2025, 6, 1)), 0, 7, 0);
        let plan = allocate(&[b.clone()], StockLocation::Store, 7);
        assert!(plan.fully_allocated());
        assert_eq!(plan.total_allocated(), 7);
    }

    #[test]
    fn shortage_surfaces_as_remainder_not_error() {
        let b1 = test_batch(Some(date(2025, 1, 1)), 0, 5, 0);
        let b2 = test_batch(Some(date(2025, 2, 1)), 0, 5, 1);
        let plan = allocate(&[b1, b2], StockLocation::Store, 12);

        assert_eq!(plan.remainder, 2);
        assert_eq!(plan.total_allocated(), 10);
    }

    #[test]
    fn wrong_location_quantities_are_ignored() {
        // plenty in the godown, nothing in the store
        let b = test_batch(Some(date(2025, 6, 1)), 100, 0, 0);
        let plan = allocate(&[b], StockLocation::Store, 1);
        assert_eq!(plan.remainder, 1);
        assert!(plan.allocations.is_empty());
    }

    #[test]
    fn reversed_batches_are_never_allocated() {
        let mut reversed = test_batch(Some(date(2025, 1, 1)), 0, 10, 0);
        reversed.status = BatchStatus::Reversed.as_str().to_string();
        let live = test_batch(Some(date(2025, 2, 1)), 0, 10, 1);

        let plan = allocate(&[reversed, live.clone()], StockLocation::Store, 5);
        assert_eq!(plan.allocations.len(), 1);
        assert_eq!(plan.allocations[0].batch_id, live.id);
    }
}
