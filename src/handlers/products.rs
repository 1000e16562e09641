use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, QuerySelect, Set};
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;

use crate::entities::product::{self, Entity as Product};
use crate::errors::ServiceError;
use crate::handlers::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_products).post(create_product))
        .route("/:id", get(get_product))
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateProductRequest {
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    #[validate(length(min = 1, max = 64))]
    pub sku: String,
    pub base_price: Decimal,
    pub low_stock_threshold: Option<i32>,
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub limit: Option<u64>,
}

async fn create_product(
    State(state): State<AppState>,
    Json(req): Json<CreateProductRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    req.validate()
        .map_err(|e| ServiceError::InvalidArgument(e.to_string()))?;
    if req.base_price < Decimal::ZERO {
        return Err(ServiceError::InvalidArgument(
            "base_price cannot be negative".into(),
        ));
    }

    let existing = Product::find()
        .filter(product::Column::Sku.eq(req.sku.clone()))
        .one(&*state.db)
        .await
        .map_err(ServiceError::db_error)?;
    if existing.is_some() {
        return Err(ServiceError::InvalidArgument(format!(
            "SKU {} already exists",
            req.sku
        )));
    }

    let created = product::ActiveModel {
        id: Set(Uuid::new_v4()),
        name: Set(req.name),
        sku: Set(req.sku),
        base_price: Set(req.base_price),
        stock_godown: Set(0),
        stock_store: Set(0),
        stock_total: Set(0),
        stock_reserved: Set(0),
        low_stock_threshold: Set(req.low_stock_threshold.unwrap_or(0)),
        created_at: Set(Utc::now()),
        updated_at: Set(Utc::now()),
    }
    .insert(&*state.db)
    .await
    .map_err(ServiceError::db_error)?;

    Ok((StatusCode::CREATED, Json(created)))
}

async fn list_products(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<impl IntoResponse, ServiceError> {
    let products = Product::find()
        .limit(params.limit.unwrap_or(100).min(500))
        .all(&*state.db)
        .await
        .map_err(ServiceError::db_error)?;
    Ok(Json(products))
}

async fn get_product(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let found = Product::find_by_id(id)
        .one(&*state.db)
        .await
        .map_err(ServiceError::db_error)?
        .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", id)))?;
    Ok(Json(found))
}
