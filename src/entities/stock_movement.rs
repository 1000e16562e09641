use async_trait::async_trait;
use chrono::Utc;
use sea_orm::entity::prelude::*;
use sea_orm::{ActiveValue, Set};
use serde::{Deserialize, Serialize};

use crate::errors::ServiceError;

/// The two physical locations stock can reside in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StockLocation {
    Godown,
    Store,
}

impl StockLocation {
    pub fn as_str(&self) -> &'static str {
        match self {
            StockLocation::Godown => "godown",
            StockLocation::Store => "store",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "godown" => Some(StockLocation::Godown),
            "store" => Some(StockLocation::Store),
            _ => None,
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            StockLocation::Godown => StockLocation::Store,
            StockLocation::Store => StockLocation::Godown,
        }
    }
}

/// Kinds of quantity change recorded in the movement log. Direction is
/// encoded by the type and locations, never by the sign of the quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MovementType {
    GodownIn,
    GodownOut,
    StoreIn,
    StoreOut,
    GodownToStore,
    StoreToGodown,
    Expired,
    Damaged,
    Returned,
    Adjustment,
}

impl MovementType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MovementType::GodownIn => "godown_in",
            MovementType::GodownOut => "godown_out",
            MovementType::StoreIn => "store_in",
            MovementType::StoreOut => "store_out",
            MovementType::GodownToStore => "godown_to_store",
            MovementType::StoreToGodown => "store_to_godown",
            MovementType::Expired => "expired",
            MovementType::Damaged => "damaged",
            MovementType::Returned => "returned",
            MovementType::Adjustment => "adjustment",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "godown_in" => Some(MovementType::GodownIn),
            "godown_out" => Some(MovementType::GodownOut),
            "store_in" => Some(MovementType::StoreIn),
            "store_out" => Some(MovementType::StoreOut),
            "godown_to_store" => Some(MovementType::GodownToStore),
            "store_to_godown" => Some(MovementType::StoreToGodown),
            "expired" => Some(MovementType::Expired),
            "damaged" => Some(MovementType::Damaged),
            "returned" => Some(MovementType::Returned),
            "adjustment" => Some(MovementType::Adjustment),
            _ => None,
        }
    }
}

/// One immutable audit entry describing a single quantity change.
///
/// Movements are only ever inserted; corrections are new movements. The
/// before/after snapshots capture the touched batch's per-location quantities
/// (totals are derived as godown + store).
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "stock_movements")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub product_id: Uuid,
    /// Absent only for movements not attributable to one batch
    pub batch_id: Option<Uuid>,
    pub movement_type: String,
    pub from_location: Option<String>,
    pub to_location: Option<String>,
    /// Always > 0; enforced by [`validate_movement`]
    pub quantity: i32,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))", nullable)]
    pub unit_price: Option<rust_decimal::Decimal>,
    pub godown_before: i32,
    pub store_before: i32,
    pub godown_after: i32,
    pub store_after: i32,
    pub reason: Option<String>,
    /// Order/invoice reference supplied by the caller
    pub reference: Option<String>,
    pub performed_by: Uuid,
    pub created_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::product::Entity",
        from = "Column::ProductId",
        to = "super::product::Column::Id"
    )]
    Product,
    #[sea_orm(
        belongs_to = "super::batch::Entity",
        from = "Column::BatchId",
        to = "super::batch::Column::Id"
    )]
    Batch,
}

impl Related<super::product::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Product.def()
    }
}

impl Related<super::batch::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Batch.def()
    }
}

#[async_trait]
impl ActiveModelBehavior for ActiveModel {
    async fn before_save<C: ConnectionTrait>(self, _db: &C, _insert: bool) -> Result<Self, DbErr>
    where
        C: ConnectionTrait,
    {
        let mut active_model = self;
        if let ActiveValue::NotSet = active_model.created_at {
            active_model.created_at = Set(Utc::now());
        }
        Ok(active_model)
    }
}

impl Model {
    pub fn movement_type_enum(&self) -> Option<MovementType> {
        MovementType::from_str(&self.movement_type)
    }

    pub fn total_before(&self) -> i32 {
        self.godown_before + self.store_before
    }

    pub fn total_after(&self) -> i32 {
        self.godown_after + self.store_after
    }
}

/// Validates a movement before it is appended to the log: quantity must be
/// positive, and from/to must differ unless the type is `adjustment`.
pub fn validate_movement(
    movement_type: MovementType,
    quantity: i32,
    from_location: Option<StockLocation>,
    to_location: Option<StockLocation>,
) -> Result<(), ServiceError> {
    if quantity <= 0 {
        return Err(ServiceError::InvalidArgument(format!(
            "movement quantity must be positive, got {}",
            quantity
        )));
    }
    if movement_type != MovementType::Adjustment {
        if let (Some(from), Some(to)) = (from_location, to_location) {
            if from == to {
                return Err(ServiceError::InvalidArgument(format!(
                    "movement from and to locations must differ for type {}",
                    movement_type.as_str()
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_positive_quantities() {
        assert!(validate_movement(MovementType::GodownIn, 0, None, None).is_err());
        assert!(validate_movement(MovementType::StoreOut, -3, Some(StockLocation::Store), None).is_err());
    }

    #[test]
    fn rejects_same_location_transfer() {
        let err = validate_movement(
            MovementType::GodownToStore,
            5,
            Some(StockLocation::Godown),
            Some(StockLocation::Godown),
        );
        assert!(err.is_err());
    }

    #[test]
    fn adjustment_may_keep_location() {
        assert!(validate_movement(
            MovementType::Adjustment,
            5,
            Some(StockLocation::Godown),
            Some(StockLocation::Godown),
        )
        .is_ok());
    }

    #[test]
    fn movement_types_round_trip() {
        for ty in [
            MovementType::GodownIn,
            MovementType::GodownOut,
            MovementType::StoreIn,
            MovementType::StoreOut,
            MovementType::GodownToStore,
            MovementType::StoreToGodown,
            MovementType::Expired,
            MovementType::Damaged,
            MovementType::Returned,
            MovementType::Adjustment,
        ] {
            assert_eq!(MovementType::from_str(ty.as_str()), Some(ty));
        }
    }
}
