//! Purchaser-facing payment routes and the gateway callback

use std::collections::BTreeMap;

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use playhouse_billing::store::PaymentStore;
use playhouse_billing::{BillingError, CheckoutOutcome, CheckoutRequest, PaymentStatus, WebhookAck};
use serde::Serialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

/// Provider reachability probe
pub async fn webhook_probe() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Gateway callback
///
/// The raw body is kept verbatim so the stored copy verifies against the
/// signature. Every outcome is acknowledged with 200 except a bad signature.
pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<WebhookAck>> {
    let headers: BTreeMap<String, String> = headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect();

    match state.billing.webhooks.handle(&body, headers).await {
        Ok(ack) => Ok(Json(ack)),
        Err(BillingError::WebhookSignatureInvalid) => {
            Err(BillingError::WebhookSignatureInvalid.into())
        }
        Err(e) => {
            // Recorded for the retry job; the provider does not need to resend
            tracing::error!(error = %e, "Webhook handling failed");
            Ok(Json(WebhookAck::Deferred))
        }
    }
}

pub async fn checkout(
    State(state): State<AppState>,
    Json(req): Json<CheckoutRequest>,
) -> ApiResult<Json<CheckoutOutcome>> {
    if req.customer.name.trim().is_empty() {
        return Err(ApiError::Validation("customer name is required".into()));
    }
    let outcome = state.billing.checkout.start_checkout(req).await?;
    Ok(Json(outcome))
}

#[derive(Debug, Serialize)]
pub struct PaymentStatusResponse {
    pub payment_id: Uuid,
    pub status: PaymentStatus,
    pub amount: i64,
    pub item_id: Option<Uuid>,
    /// Completed but the entitlement could not be granted; staff will refund
    pub manual_refund_required: bool,
}

/// Status check used by the return page
///
/// A pending payment is verified with the gateway on the way; a gateway
/// outage only means the stored status is returned.
pub async fn payment_status(
    State(state): State<AppState>,
    Path(payment_id): Path<Uuid>,
) -> ApiResult<Json<PaymentStatusResponse>> {
    let payment = match state.billing.reconciler.verify_payment(payment_id).await {
        Ok(outcome) => outcome.payment,
        Err(BillingError::NotFound(_)) => return Err(ApiError::NotFound),
        Err(e) => {
            tracing::warn!(payment_id = %payment_id, error = %e, "Status verification failed");
            state
                .billing
                .store
                .get_payment(payment_id)
                .await?
                .ok_or(ApiError::NotFound)?
        }
    };

    Ok(Json(PaymentStatusResponse {
        payment_id: payment.id,
        status: payment.status,
        amount: payment.amount,
        item_id: payment.item_id,
        manual_refund_required: payment.metadata.manual_refund_required(),
    }))
}
