//! Batch-level stock ledger for a two-location retail operation.
//!
//! Stock lives in purchase batches split between a godown (back warehouse)
//! and a store front. Every change to stock goes through the
//! [`services::StockLedgerService`], which consumes batches in
//! first-expiring-first-out order, appends to an immutable movement log, and
//! keeps the per-product aggregate derived from batch reality.

pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod migrator;
pub mod services;

use std::time::Duration;

use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

pub use config::AppConfig;
pub use errors::ServiceError;
use handlers::AppState;

/// Builds the full application router: health at the root, everything else
/// under `/api/v1`.
pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(handlers::health::router())
        .nest("/api/v1", handlers::api_routes())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
        .with_state(state)
}
