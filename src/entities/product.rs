use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Product with its denormalized stock aggregate.
///
/// The `stock_*` columns cache the sum over the product's non-reversed
/// batches and are recomputed synchronously inside every mutating ledger
/// transaction, never maintained by delta. `stock_reserved` tracks
/// quantity held against unfulfilled orders and moves independently of
/// batches.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "products")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub name: String,
    #[sea_orm(unique)]
    pub sku: String,
    /// Base sale price, used when a batch carries no positive selling price
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub base_price: rust_decimal::Decimal,
    pub stock_godown: i32,
    pub stock_store: i32,
    pub stock_total: i32,
    pub stock_reserved: i32,
    pub low_stock_threshold: i32,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::batch::Entity")]
    Batches,
    #[sea_orm(has_many = "super::stock_movement::Entity")]
    Movements,
}

impl Related<super::batch::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Batches.def()
    }
}

impl Related<super::stock_movement::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Movements.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn is_low_stock(&self) -> bool {
        self.stock_total > 0 && self.stock_total <= self.low_stock_threshold
    }

    pub fn is_out_of_stock(&self) -> bool {
        self.stock_total == 0
    }
}
