use chrono::{Duration, NaiveDate, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use super::stock_movement::StockLocation;

/// One purchase lot of one product, with its quantity split across the
/// godown (warehouse) and the store (shop floor).
///
/// `total_qty` is always `godown_qty + store_qty` and is re-derived on every
/// mutation; `original_qty` is the immutable quantity at creation, kept for
/// yield/loss reporting.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "stock_batches")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub product_id: Uuid,
    pub batch_number: Option<String>,
    pub invoice_ref: Option<String>,
    pub godown_qty: i32,
    pub store_qty: i32,
    pub total_qty: i32,
    pub original_qty: i32,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub purchase_price: rust_decimal::Decimal,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub selling_price: rust_decimal::Decimal,
    pub manufacturing_date: Option<NaiveDate>,
    pub expiry_date: Option<NaiveDate>,
    pub status: String,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::product::Entity",
        from = "Column::ProductId",
        to = "super::product::Column::Id"
    )]
    Product,
}

impl Related<super::product::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Product.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn quantity_at(&self, location: StockLocation) -> i32 {
        match location {
            StockLocation::Godown => self.godown_qty,
            StockLocation::Store => self.store_qty,
        }
    }

    pub fn status_enum(&self) -> BatchStatus {
        BatchStatus::from_str(&self.status).unwrap_or(BatchStatus::Active)
    }
}

/// Batch lifecycle status.
///
/// All values except `Reversed` are a pure function of (quantities,
/// expiry date, now); `Reversed` is terminal and only ever set explicitly by
/// the reversal operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchStatus {
    Active,
    NearExpiry,
    Expired,
    SoldOut,
    Reversed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Active => "active",
            BatchStatus::NearExpiry => "near_expiry",
            BatchStatus::Expired => "expired",
            BatchStatus::SoldOut => "sold_out",
            BatchStatus::Reversed => "reversed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "active" => Some(BatchStatus::Active),
            "near_expiry" => Some(BatchStatus::NearExpiry),
            "expired" => Some(BatchStatus::Expired),
            "sold_out" => Some(BatchStatus::SoldOut),
            "reversed" => Some(BatchStatus::Reversed),
            _ => None,
        }
    }

    /// Re-derives the status after a mutation: sold out beats expired beats
    /// near-expiry. A `Reversed` batch never leaves that state, so callers
    /// must check for it before calling this.
    pub fn derive(
        total_qty: i32,
        expiry_date: Option<NaiveDate>,
        today: NaiveDate,
        near_expiry_horizon_days: i64,
    ) -> Self {
        if total_qty == 0 {
            return BatchStatus::SoldOut;
        }
        match expiry_date {
            Some(expiry) if expiry <= today => BatchStatus::Expired,
            Some(expiry) if expiry <= today + Duration::days(near_expiry_horizon_days) => {
                BatchStatus::NearExpiry
            }
            _ => BatchStatus::Active,
        }
    }
}

/// Applies the derivation rule to a loaded batch, honoring the `Reversed`
/// override.
pub fn derived_status(batch: &Model, near_expiry_horizon_days: i64) -> BatchStatus {
    if batch.status_enum() == BatchStatus::Reversed {
        return BatchStatus::Reversed;
    }
    BatchStatus::derive(
        batch.total_qty,
        batch.expiry_date,
        Utc::now().date_naive(),
        near_expiry_horizon_days,
    )
}
