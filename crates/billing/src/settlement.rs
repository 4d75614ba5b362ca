//! Applying a gateway verdict to a payment
//!
//! The webhook handler, the pending-payment sync job, manual verification, POS
//! sales and the free-coupon path all settle payments through
//! [`Settlement::settle`]. Whoever wins the conditional transition
//! materializes; everyone else observes the settled state and, for completed
//! payments, makes sure the entitlement exists. Both paths therefore reach the
//! same end state regardless of arrival order.

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;

use crate::alerts::{AlertKind, AlertService, AlertSeverity};
use crate::entitlement::{Entitlement, EntitlementMaterializer};
use crate::error::{BillingError, BillingResult};
use crate::payment::{
    meta_keys, PaymentMetadata, PaymentRecord, PaymentStatus, TransitionOutcome, TransitionUpdate,
};
use crate::store::Store;

/// What the gateway (or the till) says happened to the money
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayVerdict {
    Succeeded {
        transaction_uid: Option<String>,
        status_code: Option<String>,
    },
    Declined {
        status_code: Option<String>,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SettledBy {
    Webhook,
    Sync,
    ManualVerify,
    Pos,
    FreeCoupon,
    Expiry,
    Checkout,
}

impl SettledBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettledBy::Webhook => "webhook",
            SettledBy::Sync => "sync",
            SettledBy::ManualVerify => "manual_verify",
            SettledBy::Pos => "pos",
            SettledBy::FreeCoupon => "free_coupon",
            SettledBy::Expiry => "expiry",
            SettledBy::Checkout => "checkout",
        }
    }
}

#[derive(Debug, Clone)]
pub enum SettlementResult {
    /// This caller completed the payment and created the entitlement
    Completed {
        payment: PaymentRecord,
        entitlement: Entitlement,
    },
    /// Another writer completed it first; the entitlement is ensured
    AlreadyCompleted {
        payment: PaymentRecord,
        entitlement: Entitlement,
    },
    Failed {
        payment: PaymentRecord,
    },
    /// Settled earlier in a way this verdict must not overwrite
    AlreadySettled {
        payment: PaymentRecord,
    },
    /// Success reported for a payment already failed (e.g. expired)
    LateSuccess {
        payment: PaymentRecord,
    },
    /// Completed, but the entitlement was refused and a refund is owed
    ManualRefund {
        payment: PaymentRecord,
        reason: String,
    },
}

impl SettlementResult {
    pub fn payment(&self) -> &PaymentRecord {
        match self {
            SettlementResult::Completed { payment, .. }
            | SettlementResult::AlreadyCompleted { payment, .. }
            | SettlementResult::Failed { payment }
            | SettlementResult::AlreadySettled { payment }
            | SettlementResult::LateSuccess { payment }
            | SettlementResult::ManualRefund { payment, .. } => payment,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SettlementResult::Completed { .. } => "completed",
            SettlementResult::AlreadyCompleted { .. } => "already_completed",
            SettlementResult::Failed { .. } => "failed",
            SettlementResult::AlreadySettled { .. } => "already_settled",
            SettlementResult::LateSuccess { .. } => "late_success",
            SettlementResult::ManualRefund { .. } => "manual_refund",
        }
    }

    /// True when this call changed the payment's status
    pub fn changed_state(&self) -> bool {
        matches!(
            self,
            SettlementResult::Completed { .. } | SettlementResult::Failed { .. }
        )
    }
}

#[derive(Clone)]
pub struct Settlement {
    store: Arc<dyn Store>,
    materializer: EntitlementMaterializer,
    alerts: AlertService,
}

impl Settlement {
    pub fn new(
        store: Arc<dyn Store>,
        materializer: EntitlementMaterializer,
        alerts: AlertService,
    ) -> Self {
        Self {
            store,
            materializer,
            alerts,
        }
    }

    pub fn materializer(&self) -> &EntitlementMaterializer {
        &self.materializer
    }

    pub async fn settle(
        &self,
        payment: &PaymentRecord,
        verdict: GatewayVerdict,
        by: SettledBy,
    ) -> BillingResult<SettlementResult> {
        match verdict {
            GatewayVerdict::Succeeded {
                transaction_uid,
                status_code,
            } => self.complete(payment, transaction_uid, status_code, by).await,
            GatewayVerdict::Declined {
                status_code,
                reason,
            } => self.fail(payment, status_code, &reason, by).await,
        }
    }

    async fn complete(
        &self,
        payment: &PaymentRecord,
        transaction_uid: Option<String>,
        status_code: Option<String>,
        by: SettledBy,
    ) -> BillingResult<SettlementResult> {
        let mut metadata = PaymentMetadata::new().with(meta_keys::SETTLED_BY, by.as_str());
        if let Some(code) = &status_code {
            metadata.insert(meta_keys::STATUS_CODE, code.as_str());
        }
        let update = TransitionUpdate::with_metadata(metadata).transaction_uid(transaction_uid);

        match self
            .store
            .transition(payment.id, PaymentStatus::Completed, update)
            .await?
        {
            TransitionOutcome::Applied(completed) => {
                tracing::info!(
                    payment_id = %completed.id,
                    settled_by = by.as_str(),
                    amount = completed.amount,
                    "Payment completed"
                );
                self.ensure_entitlement(completed, true).await
            }
            TransitionOutcome::AlreadyTerminal(current) => match current.status {
                PaymentStatus::Completed => self.ensure_entitlement(current, false).await,
                PaymentStatus::Failed => self.late_success(current, by).await,
                _ => Ok(SettlementResult::AlreadySettled { payment: current }),
            },
            TransitionOutcome::InvalidTransition(current) => {
                Ok(SettlementResult::AlreadySettled { payment: current })
            }
        }
    }

    async fn ensure_entitlement(
        &self,
        payment: PaymentRecord,
        won_transition: bool,
    ) -> BillingResult<SettlementResult> {
        match self.materializer.materialize(&payment).await {
            Ok(entitlement) => {
                // Re-read so callers see the back-linked item_id
                let payment = self
                    .store
                    .get_payment(payment.id)
                    .await?
                    .unwrap_or(payment);
                if won_transition {
                    Ok(SettlementResult::Completed {
                        payment,
                        entitlement,
                    })
                } else {
                    Ok(SettlementResult::AlreadyCompleted {
                        payment,
                        entitlement,
                    })
                }
            }
            Err(BillingError::MaterializationConflict { reason, .. }) => {
                Ok(SettlementResult::ManualRefund { payment, reason })
            }
            Err(e) => Err(e),
        }
    }

    async fn late_success(
        &self,
        payment: PaymentRecord,
        by: SettledBy,
    ) -> BillingResult<SettlementResult> {
        if payment.metadata.manual_refund_required() {
            return Ok(SettlementResult::LateSuccess { payment });
        }

        let reason = "gateway reported success after the payment was marked failed";
        let flag = PaymentMetadata::new()
            .with(meta_keys::MANUAL_REFUND_REQUIRED, true)
            .with(meta_keys::MANUAL_REFUND_REASON, reason);
        self.store.annotate_payment(payment.id, flag).await?;

        tracing::error!(
            payment_id = %payment.id,
            settled_by = by.as_str(),
            "Late settlement for failed payment - flagged for manual refund"
        );

        self.alerts
            .raise(
                AlertKind::LateSettlement,
                AlertSeverity::Critical,
                format!("Payment {} succeeded at the gateway after being failed", payment.id),
                Some(payment.id),
                serde_json::json!({
                    "amount": payment.amount,
                    "reported_by": by.as_str(),
                }),
            )
            .await;

        Ok(SettlementResult::LateSuccess { payment })
    }

    async fn fail(
        &self,
        payment: &PaymentRecord,
        status_code: Option<String>,
        reason: &str,
        by: SettledBy,
    ) -> BillingResult<SettlementResult> {
        let mut metadata = PaymentMetadata::new()
            .with(meta_keys::SETTLED_BY, by.as_str())
            .with(meta_keys::FAILURE_REASON, reason)
            .with(
                "failed_at",
                OffsetDateTime::now_utc().unix_timestamp(),
            );
        if let Some(code) = &status_code {
            metadata.insert(meta_keys::STATUS_CODE, code.as_str());
        }

        match self
            .store
            .transition(
                payment.id,
                PaymentStatus::Failed,
                TransitionUpdate::with_metadata(metadata),
            )
            .await?
        {
            TransitionOutcome::Applied(failed) => {
                tracing::info!(
                    payment_id = %failed.id,
                    settled_by = by.as_str(),
                    reason = %reason,
                    "Payment failed"
                );
                Ok(SettlementResult::Failed { payment: failed })
            }
            TransitionOutcome::AlreadyTerminal(current)
            | TransitionOutcome::InvalidTransition(current) => {
                tracing::info!(
                    payment_id = %current.id,
                    status = %current.status,
                    "Decline ignored - payment already settled"
                );
                Ok(SettlementResult::AlreadySettled { payment: current })
            }
        }
    }
}
