//! API routes

pub mod admin;
pub mod catalog;
pub mod cron;
#[cfg(test)]
mod edge_case_tests;
pub mod payments;
pub mod pos;

use axum::{
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

use crate::{
    auth::{require_admin, require_cron_secret},
    security::security_headers_middleware,
    state::AppState,
};

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Create the main router
pub fn create_router(state: AppState) -> Router {
    let public = Router::new()
        .route("/health", get(health))
        .route(
            "/api/payments/webhook",
            get(payments::webhook_probe).post(payments::payment_webhook),
        )
        .route("/api/payments/checkout", post(payments::checkout))
        .route("/api/payments/{id}/status", get(payments::payment_status))
        .route("/api/coupons/validate", post(catalog::validate_coupon))
        .route("/api/events/{id}/capacity", get(catalog::event_capacity));

    let staff = Router::new()
        .route("/api/pos/sales", post(pos::record_sale))
        .route("/api/passes/{id}/redeem", post(pos::redeem_pass))
        .route(
            "/api/admin/payments/{id}/verify",
            post(admin::verify_payment),
        )
        .route(
            "/api/admin/payments/{id}/refunds",
            get(admin::list_refunds),
        )
        .route(
            "/api/admin/payments/{id}/refund",
            post(admin::refund_payment),
        )
        .route("/api/admin/webhooks", get(admin::list_webhooks))
        .route(
            "/api/admin/webhooks/{id}/replay",
            post(admin::replay_webhook),
        )
        .route("/api/admin/alerts", get(admin::list_alerts))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_admin));

    let cron = Router::new()
        .route("/api/cron/sync-pending", post(cron::sync_pending))
        .route("/api/cron/detect-stuck", post(cron::detect_stuck))
        .route("/api/cron/expire-abandoned", post(cron::expire_abandoned))
        .route("/api/cron/retry-webhooks", post(cron::retry_webhooks))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_cron_secret,
        ));

    public
        .merge(staff)
        .merge(cron)
        .layer(middleware::from_fn(security_headers_middleware))
        .with_state(state)
}
