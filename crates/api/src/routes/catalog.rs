//! Coupon preview and event capacity

use axum::{
    extract::{Path, State},
    Json,
};
use playhouse_billing::{CapacityCheck, CouponQuote, ItemType};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct ValidateCouponRequest {
    pub code: String,
    pub item_type: ItemType,
    /// Order total in agorot before the discount
    pub amount: i64,
}

/// Preview a coupon; usage is only counted when a payment completes
pub async fn validate_coupon(
    State(state): State<AppState>,
    Json(req): Json<ValidateCouponRequest>,
) -> ApiResult<Json<CouponQuote>> {
    if req.code.trim().is_empty() {
        return Err(ApiError::Validation("coupon code is required".into()));
    }
    if req.amount < 0 {
        return Err(ApiError::Validation("amount must be non-negative".into()));
    }
    let quote = state
        .billing
        .coupons
        .validate_coupon(&req.code, req.item_type, req.amount)
        .await?;
    Ok(Json(quote))
}

pub async fn event_capacity(
    State(state): State<AppState>,
    Path(event_id): Path<Uuid>,
) -> ApiResult<Json<CapacityCheck>> {
    let check = state.billing.capacity.check_capacity(event_id, None).await?;
    Ok(Json(check))
}
