use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;

use crate::errors::ServiceError;
use crate::handlers::AppState;
use crate::services::stock_ledger::{ReceiveStock, StockAdjustment};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/receive", post(receive_stock))
        .route("/transfer-to-store", post(transfer_to_store))
        .route("/transfer-to-godown", post(transfer_to_godown))
        .route("/sell", post(sell_stock))
        .route("/batches/:id/adjust", post(adjust_batch))
        .route("/batches/:id/reverse", post(reverse_batch))
        .route("/batches/:id", delete(delete_batch))
        .route("/batches/:id/movements", get(batch_movements))
        .route("/products/:id/batches", get(product_batches))
        .route("/products/:id/history", get(product_history))
        .route("/summary", get(stock_summary))
        .route("/sweep", post(run_sweep))
}

#[derive(Debug, Deserialize, Validate)]
pub struct ReceiveStockRequest {
    pub product_id: Uuid,
    #[validate(range(min = 1))]
    pub quantity: i32,
    pub batch_number: Option<String>,
    pub invoice_ref: Option<String>,
    pub purchase_price: Option<Decimal>,
    pub selling_price: Option<Decimal>,
    pub manufacturing_date: Option<NaiveDate>,
    pub expiry_date: Option<NaiveDate>,
    pub performed_by: Uuid,
}

#[derive(Debug, Deserialize, Validate)]
pub struct TransferRequest {
    pub product_id: Uuid,
    #[validate(range(min = 1))]
    pub quantity: i32,
    pub reason: Option<String>,
    pub performed_by: Uuid,
}

#[derive(Debug, Deserialize, Validate)]
pub struct SellRequest {
    pub product_id: Uuid,
    #[validate(range(min = 1))]
    pub quantity: i32,
    pub order_ref: Option<String>,
    pub performed_by: Uuid,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AdjustmentBody {
    Absolute {
        godown_qty: Option<i32>,
        store_qty: Option<i32>,
    },
    Delta {
        godown: i32,
        store: i32,
    },
}

#[derive(Debug, Deserialize, Validate)]
pub struct AdjustBatchRequest {
    #[serde(flatten)]
    pub adjustment: AdjustmentBody,
    #[validate(length(min = 1, max = 512))]
    pub reason: String,
    pub performed_by: Uuid,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ReverseBatchRequest {
    #[validate(length(min = 1, max = 512))]
    pub reason: String,
    pub performed_by: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    pub limit: Option<u64>,
}

async fn receive_stock(
    State(state): State<AppState>,
    Json(req): Json<ReceiveStockRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    req.validate()
        .map_err(|e| ServiceError::InvalidArgument(e.to_string()))?;
    let batch = state
        .stock_ledger
        .receive(
            ReceiveStock {
                product_id: req.product_id,
                quantity: req.quantity,
                batch_number: req.batch_number,
                invoice_ref: req.invoice_ref,
                purchase_price: req.purchase_price,
                selling_price: req.selling_price,
                manufacturing_date: req.manufacturing_date,
                expiry_date: req.expiry_date,
            },
            req.performed_by,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(batch)))
}

async fn transfer_to_store(
    State(state): State<AppState>,
    Json(req): Json<TransferRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    req.validate()
        .map_err(|e| ServiceError::InvalidArgument(e.to_string()))?;
    let movements = state
        .stock_ledger
        .transfer_to_store(req.product_id, req.quantity, req.performed_by, req.reason)
        .await?;
    Ok(Json(movements))
}

async fn transfer_to_godown(
    State(state): State<AppState>,
    Json(req): Json<TransferRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    req.validate()
        .map_err(|e| ServiceError::InvalidArgument(e.to_string()))?;
    let movements = state
        .stock_ledger
        .transfer_to_godown(req.product_id, req.quantity, req.performed_by, req.reason)
        .await?;
    Ok(Json(movements))
}

async fn sell_stock(
    State(state): State<AppState>,
    Json(req): Json<SellRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    req.validate()
        .map_err(|e| ServiceError::InvalidArgument(e.to_string()))?;
    let outcome = state
        .stock_ledger
        .sell(req.product_id, req.quantity, req.performed_by, req.order_ref)
        .await?;
    Ok(Json(serde_json::json!({
        "movements": outcome.movements,
        "unit_prices_used": outcome.unit_prices_used,
    })))
}

async fn adjust_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<Uuid>,
    Json(req): Json<AdjustBatchRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    req.validate()
        .map_err(|e| ServiceError::InvalidArgument(e.to_string()))?;
    let adjustment = match req.adjustment {
        AdjustmentBody::Absolute {
            godown_qty,
            store_qty,
        } => StockAdjustment::Absolute {
            godown_qty,
            store_qty,
        },
        AdjustmentBody::Delta { godown, store } => StockAdjustment::Delta { godown, store },
    };
    let batch = state
        .stock_ledger
        .adjust(batch_id, adjustment, req.performed_by, req.reason)
        .await?;
    Ok(Json(batch))
}

async fn reverse_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<Uuid>,
    Json(req): Json<ReverseBatchRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    req.validate()
        .map_err(|e| ServiceError::InvalidArgument(e.to_string()))?;
    let batch = state
        .stock_ledger
        .reverse(batch_id, req.performed_by, req.reason)
        .await?;
    Ok(Json(batch))
}

async fn delete_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    state.stock_ledger.delete_batch(batch_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn batch_movements(
    State(state): State<AppState>,
    Path(batch_id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let movements = state.stock_ledger.get_batch_movements(batch_id).await?;
    Ok(Json(movements))
}

async fn product_batches(
    State(state): State<AppState>,
    Path(product_id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let batches = state.stock_ledger.get_batches(product_id).await?;
    Ok(Json(batches))
}

async fn product_history(
    State(state): State<AppState>,
    Path(product_id): Path<Uuid>,
    Query(params): Query<HistoryParams>,
) -> Result<impl IntoResponse, ServiceError> {
    let movements = state
        .stock_ledger
        .get_history(product_id, params.limit.unwrap_or(100).min(1000))
        .await?;
    Ok(Json(movements))
}

async fn stock_summary(State(state): State<AppState>) -> Result<impl IntoResponse, ServiceError> {
    let summary = state.stock_ledger.get_stock_summary().await?;
    Ok(Json(summary))
}

async fn run_sweep(State(state): State<AppState>) -> Result<impl IntoResponse, ServiceError> {
    let outcome = state.sweeper.sweep_expired().await?;
    Ok(Json(outcome))
}
