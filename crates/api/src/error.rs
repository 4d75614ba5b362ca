//! API error type and its HTTP mapping

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use playhouse_billing::BillingError;
use serde_json::json;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Not found")]
    NotFound,

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Billing(#[from] BillingError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            ApiError::NotFound => (StatusCode::NOT_FOUND, "not_found", "Not found".into()),
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "Authentication required".into(),
            ),
            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, "validation", msg.clone()),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg.clone()),
            ApiError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal",
                "Internal server error".into(),
            ),
            ApiError::Billing(e) => billing_parts(e),
        }
    }
}

fn billing_parts(e: &BillingError) -> (StatusCode, &'static str, String) {
    match e {
        BillingError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found", e.to_string()),
        BillingError::InvalidInput(_) | BillingError::ItemUnavailable(_) => {
            (StatusCode::BAD_REQUEST, "invalid_input", e.to_string())
        }
        BillingError::WebhookSignatureInvalid => (
            StatusCode::UNAUTHORIZED,
            "invalid_signature",
            "Invalid signature".into(),
        ),
        BillingError::SoldOut { .. } => (StatusCode::CONFLICT, "sold_out", e.to_string()),
        BillingError::Coupon(c) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            "coupon_rejected",
            c.to_string(),
        ),
        BillingError::AlreadyTerminal(_)
        | BillingError::InvalidTransition { .. }
        | BillingError::RefundNotAllowed(_)
        | BillingError::MaterializationConflict { .. } => {
            (StatusCode::CONFLICT, "conflict", e.to_string())
        }
        BillingError::PassDepleted | BillingError::PassExpired | BillingError::PassInactive => {
            (StatusCode::CONFLICT, "pass_unusable", e.to_string())
        }
        BillingError::GatewayRejected(_) | BillingError::RefundFailed(_) => {
            (StatusCode::BAD_GATEWAY, "gateway_error", e.to_string())
        }
        BillingError::GatewayUnreachable(_)
        | BillingError::GatewayTimeout
        | BillingError::GatewayNotConfigured(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            "gateway_unavailable",
            "Payment gateway is unavailable, try again shortly".into(),
        ),
        BillingError::Database(_)
        | BillingError::Metadata(_)
        | BillingError::AlertDelivery(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal",
            "Internal server error".into(),
        ),
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = self.parts();
        if status.is_server_error() {
            tracing::error!(error = %self, status = status.as_u16(), "Request failed");
        }
        let body = Json(json!({
            "error": code,
            "message": message,
        }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn billing_errors_map_to_statuses() {
        let status = |e: BillingError| ApiError::from(e).parts().0;
        assert_eq!(
            status(BillingError::SoldOut {
                event_id: Uuid::new_v4(),
                available: 0
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(status(BillingError::WebhookSignatureInvalid), StatusCode::UNAUTHORIZED);
        assert_eq!(status(BillingError::GatewayTimeout), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            status(BillingError::GatewayRejected("bad amount".into())),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status(BillingError::Coupon(playhouse_billing::CouponError::Expired)),
            StatusCode::UNPROCESSABLE_ENTITY
        );
    }

    #[test]
    fn internal_details_are_not_leaked() {
        let (_, _, message) =
            ApiError::from(BillingError::Database("password=hunter2".into())).parts();
        assert!(!message.contains("hunter2"));
    }
}
