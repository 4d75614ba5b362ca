//! Staff routes: verification, refunds, webhook logs and alerts
//!
//! All routes here sit behind the admin bearer token.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use playhouse_billing::{
    OperatorAlert, Refund, RefundResult, VerifyOutcome, WebhookAck, WebhookLog, WebhookStatus,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct RefundRequest {
    /// Partial amount in agorot; the full amount when absent
    pub amount: Option<i64>,
    pub reason: String,
    pub requested_by: String,
}

#[derive(Debug, Deserialize)]
pub struct ListWebhooksQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct WebhookListResponse {
    pub webhooks: Vec<WebhookLog>,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Deserialize)]
pub struct ListAlertsQuery {
    pub limit: Option<i64>,
}

// =============================================================================
// Handlers
// =============================================================================

pub async fn verify_payment(
    State(state): State<AppState>,
    Path(payment_id): Path<Uuid>,
) -> ApiResult<Json<VerifyOutcome>> {
    let outcome = state.billing.reconciler.verify_payment(payment_id).await?;
    tracing::info!(
        payment_id = %payment_id,
        status = %outcome.payment.status,
        changed = outcome.changed,
        "Manual payment verification"
    );
    Ok(Json(outcome))
}

pub async fn refund_payment(
    State(state): State<AppState>,
    Path(payment_id): Path<Uuid>,
    Json(req): Json<RefundRequest>,
) -> ApiResult<Json<RefundResult>> {
    if req.reason.trim().is_empty() {
        return Err(ApiError::Validation("refund reason is required".into()));
    }
    if req.requested_by.trim().is_empty() {
        return Err(ApiError::Validation("requested_by is required".into()));
    }
    let result = state
        .billing
        .refunds
        .issue_refund(payment_id, req.amount, &req.reason, &req.requested_by)
        .await?;
    Ok(Json(result))
}

pub async fn list_refunds(
    State(state): State<AppState>,
    Path(payment_id): Path<Uuid>,
) -> ApiResult<Json<Vec<Refund>>> {
    Ok(Json(state.billing.refunds.list_refunds(payment_id).await?))
}

pub async fn list_webhooks(
    State(state): State<AppState>,
    Query(query): Query<ListWebhooksQuery>,
) -> ApiResult<Json<WebhookListResponse>> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<WebhookStatus>)
        .transpose()?;
    let limit = query.limit.unwrap_or(50).clamp(1, 200);
    let offset = query.offset.unwrap_or(0).max(0);

    let webhooks = state.billing.webhooks.list(status, limit, offset).await?;
    Ok(Json(WebhookListResponse {
        webhooks,
        limit,
        offset,
    }))
}

/// Reprocess a stored delivery immediately, ignoring the backoff
pub async fn replay_webhook(
    State(state): State<AppState>,
    Path(webhook_id): Path<Uuid>,
) -> ApiResult<Json<WebhookAck>> {
    let ack = state.billing.webhooks.replay(webhook_id).await?;
    tracing::info!(webhook_id = %webhook_id, ack = ?ack, "Webhook replayed by admin");
    Ok(Json(ack))
}

pub async fn list_alerts(
    State(state): State<AppState>,
    Query(query): Query<ListAlertsQuery>,
) -> Json<Vec<OperatorAlert>> {
    let limit = query.limit.unwrap_or(50).clamp(1, 200);
    Json(state.billing.alerts.recent(limit).await)
}
