use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, Set};
use tokio::sync::mpsc;
use uuid::Uuid;

use stockledger_api::config::AppConfig;
use stockledger_api::db::{establish_connection_with_config, run_migrations, DbConfig, DbPool};
use stockledger_api::entities::product;
use stockledger_api::events::{process_events, EventSender};
use stockledger_api::handlers::AppState;
use stockledger_api::services::{ExpirySweeper, StockLedgerService};

pub const HORIZON_DAYS: i64 = 30;

pub struct TestApp {
    pub db: Arc<DbPool>,
    pub ledger: StockLedgerService,
    pub sweeper: ExpirySweeper,
}

impl TestApp {
    /// Handler-level state over the same pool and services.
    pub fn state(&self) -> AppState {
        AppState {
            db: Arc::clone(&self.db),
            stock_ledger: self.ledger.clone(),
            sweeper: self.sweeper.clone(),
            config: Arc::new(test_config()),
        }
    }
}

pub fn test_config() -> AppConfig {
    AppConfig {
        database_url: "sqlite::memory:".to_string(),
        host: "127.0.0.1".to_string(),
        port: 8080,
        environment: "test".to_string(),
        log_level: "debug".to_string(),
        log_json: false,
        auto_migrate: true,
        near_expiry_horizon_days: HORIZON_DAYS,
        sweep_interval_secs: 0,
        sweep_on_start: false,
        db_max_connections: 1,
        db_min_connections: 1,
        db_connect_timeout_secs: 5,
        db_idle_timeout_secs: 60,
        db_acquire_timeout_secs: 5,
        db_statement_timeout_secs: Some(5),
    }
}

/// Fresh in-memory database with migrations applied and an event drain
/// running. The pool is pinned to one connection: with `sqlite::memory:`
/// every pooled connection would otherwise open its own empty database.
pub async fn setup() -> TestApp {
    let cfg = DbConfig {
        url: "sqlite::memory:".to_string(),
        max_connections: 1,
        min_connections: 1,
        ..Default::default()
    };
    let db = Arc::new(
        establish_connection_with_config(&cfg)
            .await
            .expect("failed to open in-memory database"),
    );
    run_migrations(&db).await.expect("migrations failed");

    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(process_events(rx));
    let sender = EventSender::new(tx);

    TestApp {
        ledger: StockLedgerService::new(Arc::clone(&db), sender.clone(), HORIZON_DAYS),
        sweeper: ExpirySweeper::new(Arc::clone(&db), sender, HORIZON_DAYS),
        db,
    }
}

pub async fn seed_product(
    db: &DbPool,
    name: &str,
    base_price: Decimal,
    low_stock_threshold: i32,
) -> product::Model {
    product::ActiveModel {
        id: Set(Uuid::new_v4()),
        name: Set(name.to_string()),
        sku: Set(format!("SKU-{}", Uuid::new_v4().simple())),
        base_price: Set(base_price),
        stock_godown: Set(0),
        stock_store: Set(0),
        stock_total: Set(0),
        stock_reserved: Set(0),
        low_stock_threshold: Set(low_stock_threshold),
        created_at: Set(Utc::now()),
        updated_at: Set(Utc::now()),
    }
    .insert(db)
    .await
    .expect("failed to seed product")
}

pub fn days_from_now(days: i64) -> NaiveDate {
    Utc::now().date_naive() + chrono::Duration::days(days)
}

pub fn actor() -> Uuid {
    Uuid::new_v4()
}
