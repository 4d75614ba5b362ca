//! Billing error taxonomy

use uuid::Uuid;

use crate::guard::CouponError;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A metadata field a read site depends on is missing or malformed
    #[error("Payment metadata invalid: {0}")]
    Metadata(String),

    /// Gateway credentials are absent; distinct from a failing gateway
    #[error("Payment gateway is not configured: {0}")]
    GatewayNotConfigured(String),

    #[error("Payment gateway unreachable: {0}")]
    GatewayUnreachable(String),

    #[error("Payment gateway timed out")]
    GatewayTimeout,

    /// The gateway refused the request itself (bad amount, bad credentials)
    #[error("Payment gateway rejected the request: {0}")]
    GatewayRejected(String),

    #[error("Webhook signature invalid")]
    WebhookSignatureInvalid,

    #[error("Payment {0} is already in a terminal state")]
    AlreadyTerminal(Uuid),

    #[error("Invalid payment transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Event {event_id} is sold out ({available} seats available)")]
    SoldOut { event_id: Uuid, available: i64 },

    #[error("Coupon rejected: {0}")]
    Coupon(#[from] CouponError),

    /// Money has moved but the entitlement cannot be granted
    #[error("Entitlement for payment {payment_id} cannot be granted: {reason}")]
    MaterializationConflict { payment_id: Uuid, reason: String },

    #[error("Item not available for purchase: {0}")]
    ItemUnavailable(String),

    #[error("Refund not allowed: {0}")]
    RefundNotAllowed(String),

    #[error("Refund failed: {0}")]
    RefundFailed(String),

    #[error("Pass has no remaining entries")]
    PassDepleted,

    #[error("Pass expired")]
    PassExpired,

    #[error("Pass is not active")]
    PassInactive,

    #[error("Alert delivery failed: {0}")]
    AlertDelivery(String),
}

impl BillingError {
    /// Errors the scheduler should retry on a later run
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BillingError::GatewayUnreachable(_)
                | BillingError::GatewayTimeout
                | BillingError::Database(_)
        )
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => BillingError::NotFound("row not found".to_string()),
            other => BillingError::Database(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for BillingError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            BillingError::GatewayTimeout
        } else {
            BillingError::GatewayUnreachable(e.to_string())
        }
    }
}

impl From<serde_json::Error> for BillingError {
    fn from(e: serde_json::Error) -> Self {
        BillingError::Metadata(e.to_string())
    }
}
