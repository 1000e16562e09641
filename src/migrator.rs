use sea_orm_migration::prelude::*;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20250101_000001_create_products_table::Migration),
            Box::new(m20250101_000002_create_stock_batches_table::Migration),
            Box::new(m20250101_000003_create_stock_movements_table::Migration),
            Box::new(m20250101_000004_create_promotions_table::Migration),
        ]
    }
}

// Migration implementations

mod m20250101_000001_create_products_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20250101_000001_create_products_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            // Aligned with entities::product Model. Decimal precision stays
            // at 16: sea-query's SQLite backend rejects anything larger.
            manager
                .create_table(
                    Table::create()
                        .table(Products::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Products::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(Products::Name).string().not_null())
                        .col(ColumnDef::new(Products::Sku).string().not_null().unique_key())
                        .col(
                            ColumnDef::new(Products::BasePrice)
                                .decimal_len(16, 4)
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Products::StockGodown)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Products::StockStore)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Products::StockTotal)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Products::StockReserved)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Products::LowStockThreshold)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Products::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Products::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Products::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub(super) enum Products {
        Table,
        Id,
        Name,
        Sku,
        BasePrice,
        StockGodown,
        StockStore,
        StockTotal,
        StockReserved,
        LowStockThreshold,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20250101_000002_create_stock_batches_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20250101_000002_create_stock_batches_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            // Aligned with entities::batch Model
            manager
                .create_table(
                    Table::create()
                        .table(StockBatches::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(StockBatches::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(StockBatches::ProductId).uuid().not_null())
                        .col(ColumnDef::new(StockBatches::BatchNumber).string().null())
                        .col(ColumnDef::new(StockBatches::InvoiceRef).string().null())
                        .col(
                            ColumnDef::new(StockBatches::GodownQty)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(StockBatches::StoreQty)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(StockBatches::TotalQty)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(StockBatches::OriginalQty)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(StockBatches::PurchasePrice)
                                .decimal_len(16, 4)
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(StockBatches::SellingPrice)
                                .decimal_len(16, 4)
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(StockBatches::ManufacturingDate)
                                .date()
                                .null(),
                        )
                        .col(ColumnDef::new(StockBatches::ExpiryDate).date().null())
                        .col(ColumnDef::new(StockBatches::Status).string().not_null())
                        .col(
                            ColumnDef::new(StockBatches::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(StockBatches::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_stock_batches_product")
                                .from(StockBatches::Table, StockBatches::ProductId)
                                .to(Products::Table, Products::Id),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_stock_batches_product_id")
                        .table(StockBatches::Table)
                        .col(StockBatches::ProductId)
                        .to_owned(),
                )
                .await?;

            // FEFO scans filter by product and order by expiry
            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_stock_batches_product_expiry")
                        .table(StockBatches::Table)
                        .col(StockBatches::ProductId)
                        .col(StockBatches::ExpiryDate)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_stock_batches_expiry_date")
                        .table(StockBatches::Table)
                        .col(StockBatches::ExpiryDate)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(StockBatches::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub(super) enum StockBatches {
        Table,
        Id,
        ProductId,
        BatchNumber,
        InvoiceRef,
        GodownQty,
        StoreQty,
        TotalQty,
        OriginalQty,
        PurchasePrice,
        SellingPrice,
        ManufacturingDate,
        ExpiryDate,
        Status,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum Products {
        Table,
        Id,
    }
}

mod m20250101_000003_create_stock_movements_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20250101_000003_create_stock_movements_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            // Append-only audit log; no updates or deletes are ever issued
            manager
                .create_table(
                    Table::create()
                        .table(StockMovements::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(StockMovements::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(StockMovements::ProductId).uuid().not_null())
                        .col(ColumnDef::new(StockMovements::BatchId).uuid().null())
                        .col(
                            ColumnDef::new(StockMovements::MovementType)
                                .string()
                                .not_null(),
                        )
                        .col(ColumnDef::new(StockMovements::FromLocation).string().null())
                        .col(ColumnDef::new(StockMovements::ToLocation).string().null())
                        .col(ColumnDef::new(StockMovements::Quantity).integer().not_null())
                        .col(
                            ColumnDef::new(StockMovements::UnitPrice)
                                .decimal_len(16, 4)
                                .null(),
                        )
                        .col(
                            ColumnDef::new(StockMovements::GodownBefore)
                                .integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(StockMovements::StoreBefore)
                                .integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(StockMovements::GodownAfter)
                                .integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(StockMovements::StoreAfter)
                                .integer()
                                .not_null(),
                        )
                        .col(ColumnDef::new(StockMovements::Reason).string().null())
                        .col(ColumnDef::new(StockMovements::Reference).string().null())
                        .col(ColumnDef::new(StockMovements::PerformedBy).uuid().not_null())
                        .col(
                            ColumnDef::new(StockMovements::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            // History reads are by product, newest first
            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_stock_movements_product_created")
                        .table(StockMovements::Table)
                        .col(StockMovements::ProductId)
                        .col(StockMovements::CreatedAt)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_stock_movements_batch_id")
                        .table(StockMovements::Table)
                        .col(StockMovements::BatchId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(StockMovements::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub(super) enum StockMovements {
        Table,
        Id,
        ProductId,
        BatchId,
        MovementType,
        FromLocation,
        ToLocation,
        Quantity,
        UnitPrice,
        GodownBefore,
        StoreBefore,
        GodownAfter,
        StoreAfter,
        Reason,
        Reference,
        PerformedBy,
        CreatedAt,
    }
}

mod m20250101_000004_create_promotions_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20250101_000004_create_promotions_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Promotions::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(Promotions::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(Promotions::ProductId).uuid().not_null())
                        .col(ColumnDef::new(Promotions::BatchId).uuid().null())
                        .col(
                            ColumnDef::new(Promotions::PromoPrice)
                                .decimal_len(16, 4)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Promotions::StartsAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Promotions::EndsAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Promotions::Active)
                                .boolean()
                                .not_null()
                                .default(true),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_promotions_product_id")
                        .table(Promotions::Table)
                        .col(Promotions::ProductId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Promotions::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub(super) enum Promotions {
        Table,
        Id,
        ProductId,
        BatchId,
        PromoPrice,
        StartsAt,
        EndsAt,
        Active,
    }
}
