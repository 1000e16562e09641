pub mod health;
pub mod products;
pub mod stock;

use std::sync::Arc;

use axum::Router;

use crate::config::AppConfig;
use crate::db::DbPool;
use crate::services::{ExpirySweeper, StockLedgerService};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DbPool>,
    pub stock_ledger: StockLedgerService,
    pub sweeper: ExpirySweeper,
    pub config: Arc<AppConfig>,
}

/// All routes under `/api/v1`.
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .nest("/products", products::router())
        .nest("/stock", stock::router())
}
