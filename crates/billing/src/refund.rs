//! Admin-initiated refunds
//!
//! A refund row is inserted before any money moves; the partial unique index
//! on `refunds(payment_id) WHERE status <> 'failed'` guarantees a payment has
//! at most one refund in flight or done. Card payments are refunded through
//! the gateway; POS payments are bookkeeping only.
//!
//! Once the gateway has returned the money the refund row is closed as
//! `completed` even if the local updates fail. The error is kept on the row
//! and a second `issue_refund` call finishes the local steps without paying
//! out again.

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::alerts::{AlertKind, AlertService, AlertSeverity};
use crate::client::PaymentGateway;
use crate::error::{BillingError, BillingResult};
use crate::payment::{meta_keys, PaymentMetadata, PaymentRecord, PaymentStatus, TransitionUpdate};
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundStatus {
    Pending,
    Completed,
    Failed,
}

impl RefundStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefundStatus::Pending => "pending",
            RefundStatus::Completed => "completed",
            RefundStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for RefundStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RefundStatus::Pending),
            "completed" => Ok(RefundStatus::Completed),
            "failed" => Ok(RefundStatus::Failed),
            other => Err(BillingError::InvalidInput(format!(
                "unknown refund status '{}'",
                other
            ))),
        }
    }
}

/// Refund record for the audit trail
#[derive(Debug, Clone, Serialize)]
pub struct Refund {
    pub id: Uuid,
    pub payment_id: Uuid,
    /// Amount in agorot
    pub amount: i64,
    pub status: RefundStatus,
    pub reason: String,
    pub requested_by: String,
    pub gateway_response: Option<serde_json::Value>,
    pub error_message: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone)]
pub struct NewRefund {
    pub id: Uuid,
    pub payment_id: Uuid,
    pub amount: i64,
    pub reason: String,
    pub requested_by: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefundResult {
    pub refund: Refund,
    pub payment: PaymentRecord,
}

#[derive(Clone)]
pub struct RefundService {
    store: Arc<dyn Store>,
    gateway: Arc<dyn PaymentGateway>,
    alerts: AlertService,
}

impl RefundService {
    pub fn new(
        store: Arc<dyn Store>,
        gateway: Arc<dyn PaymentGateway>,
        alerts: AlertService,
    ) -> Self {
        Self {
            store,
            gateway,
            alerts,
        }
    }

    /// Refund a completed payment, fully when `amount` is `None`
    pub async fn issue_refund(
        &self,
        payment_id: Uuid,
        amount: Option<i64>,
        reason: &str,
        requested_by: &str,
    ) -> BillingResult<RefundResult> {
        let payment = self
            .store
            .get_payment(payment_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("payment {}", payment_id)))?;

        match payment.status {
            PaymentStatus::Completed => {
                let paid_out = self
                    .store
                    .list_refunds(payment_id)
                    .await?
                    .into_iter()
                    .find(|r| r.status == RefundStatus::Completed);
                if let Some(refund) = paid_out {
                    return self.resume(refund).await;
                }
            }
            PaymentStatus::Refunded => {
                let unfinished = self
                    .store
                    .list_refunds(payment_id)
                    .await?
                    .into_iter()
                    .find(|r| r.status == RefundStatus::Completed && r.error_message.is_some());
                if let Some(refund) = unfinished {
                    return self.resume(refund).await;
                }
                return Err(BillingError::RefundNotAllowed(
                    "payment is already refunded".to_string(),
                ));
            }
            other => {
                return Err(BillingError::RefundNotAllowed(format!(
                    "payment is {}, only completed payments can be refunded",
                    other
                )))
            }
        }

        let amount = amount.unwrap_or(payment.amount);
        if amount <= 0 || amount > payment.amount {
            return Err(BillingError::RefundNotAllowed(format!(
                "refund amount {} must be between 1 and {}",
                amount, payment.amount
            )));
        }

        let transaction_uid = if payment.payment_type.uses_gateway() {
            Some(payment.transaction_uid.clone().ok_or_else(|| {
                BillingError::RefundNotAllowed(
                    "card payment has no gateway transaction id".to_string(),
                )
            })?)
        } else {
            None
        };

        let refund = self
            .store
            .insert_refund(NewRefund {
                id: Uuid::new_v4(),
                payment_id,
                amount,
                reason: reason.to_string(),
                requested_by: requested_by.to_string(),
            })
            .await?
            .ok_or_else(|| {
                BillingError::RefundNotAllowed(
                    "a refund for this payment is already pending or completed".to_string(),
                )
            })?;

        let gateway_response = match &transaction_uid {
            Some(uid) => Some(self.refund_at_gateway(&refund, uid).await?),
            None => None,
        };

        // From here on the money is returned; local failures must not lose that
        match self.apply_locally(&refund, gateway_response.clone()).await {
            Ok(result) => {
                tracing::info!(
                    payment_id = %payment_id,
                    refund_id = %result.refund.id,
                    amount = amount,
                    requested_by = %requested_by,
                    "Refund completed"
                );
                Ok(result)
            }
            Err(e) => Err(self.local_failure(&refund, gateway_response, e).await),
        }
    }

    /// Finish the local steps of a refund whose money was already returned
    async fn resume(&self, refund: Refund) -> BillingResult<RefundResult> {
        tracing::warn!(
            payment_id = %refund.payment_id,
            refund_id = %refund.id,
            "Resuming refund whose local bookkeeping did not finish"
        );
        let gateway_response = refund.gateway_response.clone();
        match self.apply_locally(&refund, gateway_response.clone()).await {
            Ok(result) => {
                tracing::info!(
                    payment_id = %refund.payment_id,
                    refund_id = %refund.id,
                    "Refund bookkeeping completed on retry"
                );
                Ok(result)
            }
            Err(e) => Err(self.local_failure(&refund, gateway_response, e).await),
        }
    }

    /// `completed -> refunded`, revoke the entitlement, close the refund row
    async fn apply_locally(
        &self,
        refund: &Refund,
        gateway_response: Option<serde_json::Value>,
    ) -> BillingResult<RefundResult> {
        let update = TransitionUpdate::with_metadata(
            PaymentMetadata::new()
                .with(meta_keys::REFUNDED_AT, OffsetDateTime::now_utc().unix_timestamp())
                .with("refund_id", refund.id.to_string())
                .with("refund_reason", refund.reason.as_str()),
        );
        let outcome = self
            .store
            .transition(refund.payment_id, PaymentStatus::Refunded, update)
            .await?;
        if !outcome.is_applied() && outcome.record().status != PaymentStatus::Refunded {
            tracing::warn!(
                payment_id = %refund.payment_id,
                status = %outcome.record().status,
                "Payment left completed state while refund was in flight"
            );
        }

        self.store.revoke_entitlement(refund.payment_id).await?;

        let refund = self
            .store
            .finish_refund(refund.id, RefundStatus::Completed, gateway_response, None)
            .await?;

        Ok(RefundResult {
            refund,
            payment: outcome.into_record(),
        })
    }

    /// Record that the money moved but local state did not follow
    ///
    /// The row is closed as `completed` so the single-refund index keeps a
    /// second payout out; `issue_refund` on the same payment resumes it.
    async fn local_failure(
        &self,
        refund: &Refund,
        gateway_response: Option<serde_json::Value>,
        error: BillingError,
    ) -> BillingError {
        let message = format!("refund returned but local update failed: {}", error);
        tracing::error!(
            payment_id = %refund.payment_id,
            refund_id = %refund.id,
            error = %error,
            "Refund bookkeeping failed after money was returned"
        );

        if let Err(e) = self
            .store
            .finish_refund(
                refund.id,
                RefundStatus::Completed,
                gateway_response,
                Some(&message),
            )
            .await
        {
            tracing::error!(
                refund_id = %refund.id,
                error = %e,
                "Failed to record refund outcome; row left pending"
            );
        }

        self.alerts
            .raise(
                AlertKind::RefundFailed,
                AlertSeverity::Critical,
                format!(
                    "Refund for payment {} was paid out but not recorded: {}",
                    refund.payment_id, error
                ),
                Some(refund.payment_id),
                serde_json::json!({
                    "refund_id": refund.id,
                    "amount": refund.amount,
                    "stage": "local_bookkeeping",
                }),
            )
            .await;

        BillingError::RefundFailed(message)
    }

    async fn refund_at_gateway(
        &self,
        refund: &Refund,
        transaction_uid: &str,
    ) -> BillingResult<serde_json::Value> {
        let error = match self
            .gateway
            .issue_refund(transaction_uid, refund.amount, &refund.reason)
            .await
        {
            Ok(report) if report.succeeded => return Ok(report.raw),
            Ok(report) => {
                self.store
                    .finish_refund(
                        refund.id,
                        RefundStatus::Failed,
                        Some(report.raw),
                        Some("gateway declined the refund"),
                    )
                    .await?;
                "gateway declined the refund".to_string()
            }
            Err(e) => {
                self.store
                    .finish_refund(refund.id, RefundStatus::Failed, None, Some(&e.to_string()))
                    .await?;
                e.to_string()
            }
        };

        tracing::error!(
            payment_id = %refund.payment_id,
            refund_id = %refund.id,
            error = %error,
            "Gateway refund failed"
        );
        self.alerts
            .raise(
                AlertKind::RefundFailed,
                AlertSeverity::High,
                format!("Refund for payment {} failed: {}", refund.payment_id, error),
                Some(refund.payment_id),
                serde_json::json!({ "refund_id": refund.id, "amount": refund.amount }),
            )
            .await;

        Err(BillingError::RefundFailed(error))
    }

    pub async fn list_refunds(&self, payment_id: Uuid) -> BillingResult<Vec<Refund>> {
        self.store.list_refunds(payment_id).await
    }
}
