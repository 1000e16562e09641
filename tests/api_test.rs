mod common;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::response::Response;
use axum::Router;
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

use stockledger_api::app;

use common::{actor, days_from_now, seed_product, setup};

async fn send_json(router: &Router, method: &str, uri: &str, body: Value) -> Response {
    router
        .clone()
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(serde_json::to_vec(&body).unwrap()))
                .unwrap(),
        )
        .await
        .unwrap()
}

async fn get(router: &Router, uri: &str) -> Response {
    router
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

async fn body_json(resp: Response) -> Value {
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_endpoint_reports_database_up() {
    let app_ctx = setup().await;
    let router = app(app_ctx.state());

    let resp = get(&router, "/health").await;
    assert_eq!(resp.status(), StatusCode::OK);

    let body = body_json(resp).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["database"], "up");
}

#[tokio::test]
async fn product_can_be_created_and_fetched_over_http() {
    let app_ctx = setup().await;
    let router = app(app_ctx.state());

    let resp = send_json(
        &router,
        "POST",
        "/api/v1/products",
        json!({
            "name": "Basmati Rice 5kg",
            "sku": "RICE-5KG",
            "base_price": "450.00",
            "low_stock_threshold": 10
        }),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let created = body_json(resp).await;
    let id = created["id"].as_str().unwrap().to_string();

    let resp = get(&router, &format!("/api/v1/products/{}", id)).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let fetched = body_json(resp).await;
    assert_eq!(fetched["name"], "Basmati Rice 5kg");
    assert_eq!(fetched["stock_total"], 0);

    // Duplicate SKU is rejected.
    let resp = send_json(
        &router,
        "POST",
        "/api/v1/products",
        json!({
            "name": "Other",
            "sku": "RICE-5KG",
            "base_price": "1.00"
        }),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn receive_then_summary_round_trips_over_http() {
    let app_ctx = setup().await;
    let p = seed_product(&app_ctx.db, "Dal 1kg", dec!(90.00), 0).await;
    let router = app(app_ctx.state());

    let resp = send_json(
        &router,
        "POST",
        "/api/v1/stock/receive",
        json!({
            "product_id": p.id,
            "quantity": 10,
            "expiry_date": days_from_now(120).to_string(),
            "performed_by": actor()
        }),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let batch = body_json(resp).await;
    assert_eq!(batch["godown_qty"], 10);

    let resp = get(&router, "/api/v1/stock/summary").await;
    assert_eq!(resp.status(), StatusCode::OK);
    let summary = body_json(resp).await;
    assert_eq!(summary["total_stock"], 10);
    assert_eq!(summary["godown_stock"], 10);
}

#[tokio::test]
async fn missing_product_yields_not_found_error_body() {
    let app_ctx = setup().await;
    let router = app(app_ctx.state());

    let resp = get(&router, &format!("/api/v1/products/{}", Uuid::new_v4())).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let body = body_json(resp).await;
    assert_eq!(body["error"], "Not Found");
    assert!(body["message"].as_str().unwrap().contains("not found"));
    assert!(body["timestamp"].is_string());
}

#[tokio::test]
async fn non_positive_receive_quantity_is_rejected_at_the_boundary() {
    let app_ctx = setup().await;
    let p = seed_product(&app_ctx.db, "Honey 500g", dec!(210.00), 0).await;
    let router = app(app_ctx.state());

    let resp = send_json(
        &router,
        "POST",
        "/api/v1/stock/receive",
        json!({
            "product_id": p.id,
            "quantity": 0,
            "performed_by": actor()
        }),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}
