use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Time-bounded sale-price override for a product or one specific batch.
///
/// Read-only input to the ledger: the sell path consults promotions to pick
/// the unit price recorded on a `store_out` movement and never writes here.
/// A batch-level promotion (non-null `batch_id`) wins over a product-level
/// one.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "promotions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub product_id: Uuid,
    pub batch_id: Option<Uuid>,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub promo_price: rust_decimal::Decimal,
    pub starts_at: DateTimeUtc,
    pub ends_at: DateTimeUtc,
    pub active: bool,
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
