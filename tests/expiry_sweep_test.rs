mod common;

use chrono::Utc;
use rust_decimal_macros::dec;
use sea_orm::{ActiveModelTrait, EntityTrait, Set};
use uuid::Uuid;

use stockledger_api::entities::batch::{self, BatchStatus, Entity as Batch};
use stockledger_api::entities::product::Entity as Product;
use stockledger_api::entities::stock_movement::{MovementType, StockLocation};
use stockledger_api::services::stock_ledger::ReceiveStock;

use common::{actor, days_from_now, seed_product, setup};

fn expired_receive(product_id: Uuid, quantity: i32) -> ReceiveStock {
    ReceiveStock {
        product_id,
        quantity,
        batch_number: None,
        invoice_ref: None,
        purchase_price: Some(dec!(8.00)),
        selling_price: Some(dec!(12.00)),
        manufacturing_date: None,
        expiry_date: Some(days_from_now(-1)),
    }
}

#[tokio::test]
async fn sweep_writes_off_expired_batch_across_both_locations() {
    let app = setup().await;
    let p = seed_product(&app.db, "Yogurt", dec!(15.00), 0).await;
    let who = actor();

    let b = app
        .ledger
        .receive(expired_receive(p.id, 5), who)
        .await
        .unwrap();
    app.ledger
        .transfer_to_store(p.id, 2, who, None)
        .await
        .unwrap();

    let outcome = app.sweeper.sweep_expired().await.unwrap();
    assert_eq!(outcome.batches_expired, 1);
    assert_eq!(outcome.quantity_written_off, 5);

    let after = Batch::find_by_id(b.id).one(&*app.db).await.unwrap().unwrap();
    assert_eq!(after.godown_qty, 0);
    assert_eq!(after.store_qty, 0);
    assert_eq!(after.total_qty, 0);
    assert_eq!(after.status_enum(), BatchStatus::Expired);

    let movements = app.ledger.get_batch_movements(b.id).await.unwrap();
    let write_off = movements
        .iter()
        .find(|m| m.movement_type == MovementType::Expired.as_str())
        .expect("expired movement missing");
    assert_eq!(write_off.quantity, 5);
    assert_eq!(
        write_off.from_location.as_deref(),
        Some(StockLocation::Store.as_str())
    );
    assert_eq!((write_off.godown_before, write_off.store_before), (3, 2));
    assert_eq!((write_off.godown_after, write_off.store_after), (0, 0));

    let product = Product::find_by_id(p.id)
        .one(&*app.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(product.stock_total, 0);
}

#[tokio::test]
async fn sweep_is_idempotent_and_skips_live_batches() {
    let app = setup().await;
    let p = seed_product(&app.db, "Bread", dec!(40.00), 0).await;
    let who = actor();

    app.ledger
        .receive(expired_receive(p.id, 10), who)
        .await
        .unwrap();
    let live = app
        .ledger
        .receive(
            ReceiveStock {
                expiry_date: Some(days_from_now(200)),
                ..expired_receive(p.id, 20)
            },
            who,
        )
        .await
        .unwrap();

    let first = app.sweeper.sweep_expired().await.unwrap();
    assert_eq!(first.batches_expired, 1);
    assert_eq!(first.quantity_written_off, 10);

    let second = app.sweeper.sweep_expired().await.unwrap();
    assert_eq!(second.batches_expired, 0);
    assert_eq!(second.quantity_written_off, 0);

    let live_after = Batch::find_by_id(live.id)
        .one(&*app.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(live_after.total_qty, 20);

    let product = Product::find_by_id(p.id)
        .one(&*app.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(product.stock_total, 20);
}

#[tokio::test]
async fn sweep_ignores_reversed_batches() {
    let app = setup().await;
    let p = seed_product(&app.db, "Paneer", dec!(90.00), 0).await;
    let who = actor();

    let b = app
        .ledger
        .receive(expired_receive(p.id, 6), who)
        .await
        .unwrap();
    app.ledger
        .reverse(b.id, who, "supplier recall".into())
        .await
        .unwrap();

    let outcome = app.sweeper.sweep_expired().await.unwrap();
    assert_eq!(outcome.batches_expired, 0);

    let after = Batch::find_by_id(b.id).one(&*app.db).await.unwrap().unwrap();
    assert_eq!(after.status_enum(), BatchStatus::Reversed);
}

#[tokio::test]
async fn sweep_refreshes_stale_active_statuses_inside_horizon() {
    let app = setup().await;
    let p = seed_product(&app.db, "Juice", dec!(35.00), 0).await;
    let who = actor();

    let b = app
        .ledger
        .receive(
            ReceiveStock {
                expiry_date: Some(days_from_now(10)),
                ..expired_receive(p.id, 12)
            },
            who,
        )
        .await
        .unwrap();

    // Simulate a status written before the batch crossed the horizon.
    let model = Batch::find_by_id(b.id).one(&*app.db).await.unwrap().unwrap();
    let mut stale: batch::ActiveModel = model.into();
    stale.status = Set(BatchStatus::Active.as_str().to_string());
    stale.updated_at = Set(Utc::now());
    stale.update(&*app.db).await.unwrap();

    let outcome = app.sweeper.sweep_expired().await.unwrap();
    assert_eq!(outcome.batches_expired, 0);
    assert_eq!(outcome.statuses_refreshed, 1);

    let after = Batch::find_by_id(b.id).one(&*app.db).await.unwrap().unwrap();
    assert_eq!(after.status_enum(), BatchStatus::NearExpiry);
    assert_eq!(after.total_qty, 12);
}
