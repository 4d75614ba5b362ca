//! Scheduler-triggered reconciliation jobs
//!
//! Authenticated by the cron bearer secret before any handler runs. Each
//! call runs one pass of the job and returns its run summary.

use axum::{extract::State, Json};
use playhouse_billing::ReconciliationRun;

use crate::{error::ApiResult, state::AppState};

pub async fn sync_pending(State(state): State<AppState>) -> ApiResult<Json<ReconciliationRun>> {
    Ok(Json(state.billing.reconciler.sync_pending().await?))
}

pub async fn detect_stuck(State(state): State<AppState>) -> ApiResult<Json<ReconciliationRun>> {
    Ok(Json(state.billing.reconciler.detect_stuck().await?))
}

pub async fn expire_abandoned(
    State(state): State<AppState>,
) -> ApiResult<Json<ReconciliationRun>> {
    Ok(Json(state.billing.reconciler.expire_abandoned().await?))
}

pub async fn retry_webhooks(State(state): State<AppState>) -> ApiResult<Json<ReconciliationRun>> {
    Ok(Json(state.billing.reconciler.retry_failed_webhooks().await?))
}
