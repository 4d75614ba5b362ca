//! Front-desk routes: POS sales and pass entry

use axum::{
    extract::{Path, State},
    Json,
};
use playhouse_billing::{Pass, PosReceipt, PosSale};
use uuid::Uuid;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

pub async fn record_sale(
    State(state): State<AppState>,
    Json(sale): Json<PosSale>,
) -> ApiResult<Json<PosReceipt>> {
    if sale.recorded_by.trim().is_empty() {
        return Err(ApiError::Validation("recorded_by is required".into()));
    }
    let receipt = state.billing.pos.record_sale(sale).await?;
    Ok(Json(receipt))
}

pub async fn redeem_pass(
    State(state): State<AppState>,
    Path(pass_id): Path<Uuid>,
) -> ApiResult<Json<Pass>> {
    let pass = state.billing.passes.redeem_entry(pass_id).await?;
    Ok(Json(pass))
}
