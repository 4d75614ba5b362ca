//! Storage seams for the billing core
//!
//! Each service receives an explicitly constructed `Arc<dyn Store>`; there is
//! no ambient client. [`postgres::PgStore`] is the production implementation
//! and [`memory::MemoryStore`] backs tests and local runs.
//!
//! Every mutation that participates in a race is a single atomic operation
//! here: status transitions are conditional on the current status, entitlement
//! creation is conditional on the payment being unlinked, webhook claims are
//! conditional on the existing log state. Callers never hold locks across
//! gateway calls.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::alerts::OperatorAlert;
use crate::catalog::{CardType, Coupon, EventInfo};
use crate::entitlement::{
    Entitlement, LinkOutcome, NewPass, NewRegistration, Pass, RedeemOutcome,
};
use crate::error::BillingResult;
use crate::guard::CouponRedemption;
use crate::payment::{
    ItemType, NewPayment, PaymentMetadata, PaymentRecord, PaymentStatus, TransitionOutcome,
    TransitionUpdate,
};
use crate::reconciliation::ReconciliationRun;
use crate::refund::{NewRefund, Refund, RefundStatus};
use crate::webhooks::{NewWebhookLog, WebhookClaim, WebhookLog, WebhookStatus};

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[async_trait]
pub trait PaymentStore: Send + Sync {
    async fn create_pending(&self, new: NewPayment) -> BillingResult<PaymentRecord>;

    async fn get_payment(&self, id: Uuid) -> BillingResult<Option<PaymentRecord>>;

    async fn find_by_gateway_correlation(
        &self,
        gateway_correlation_id: &str,
    ) -> BillingResult<Option<PaymentRecord>>;

    /// Attach the gateway's page id to a still-pending payment
    async fn set_gateway_correlation(
        &self,
        id: Uuid,
        gateway_correlation_id: &str,
    ) -> BillingResult<()>;

    /// Conditional status update; fails only with `NotFound`
    async fn transition(
        &self,
        id: Uuid,
        to: PaymentStatus,
        update: TransitionUpdate,
    ) -> BillingResult<TransitionOutcome>;

    /// Merge bookkeeping keys into metadata without touching status
    async fn annotate_payment(&self, id: Uuid, metadata: PaymentMetadata) -> BillingResult<()>;

    /// Pending payments created inside `(created_after, created_before)`, oldest first
    async fn list_pending(
        &self,
        created_before: OffsetDateTime,
        created_after: Option<OffsetDateTime>,
        limit: i64,
    ) -> BillingResult<Vec<PaymentRecord>>;

    /// Completed payments with no linked entitlement and no manual-refund flag
    async fn list_unmaterialized(
        &self,
        completed_before: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<PaymentRecord>>;
}

#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn get_card_type(&self, id: Uuid) -> BillingResult<Option<CardType>>;

    async fn get_event(&self, id: Uuid) -> BillingResult<Option<EventInfo>>;

    async fn count_confirmed_registrations(&self, event_id: Uuid) -> BillingResult<i64>;

    /// Pending payments for the event created after `held_since`
    async fn count_pending_holds(
        &self,
        event_id: Uuid,
        held_since: OffsetDateTime,
        excluding: Option<Uuid>,
    ) -> BillingResult<i64>;

    async fn get_coupon_by_code(&self, code: &str) -> BillingResult<Option<Coupon>>;

    /// Pending payments carrying the coupon created after `held_since`
    async fn count_coupon_holds(&self, code: &str, held_since: OffsetDateTime)
        -> BillingResult<i64>;
}

#[async_trait]
pub trait EntitlementStore: Send + Sync {
    /// Insert the pass and set the payment's `item_id` in one step
    async fn insert_pass_linked(&self, payment_id: Uuid, pass: NewPass)
        -> BillingResult<LinkOutcome>;

    /// Re-check capacity, insert the registration and link it, atomically
    async fn insert_registration_within_capacity(
        &self,
        payment_id: Uuid,
        registration: NewRegistration,
        held_since: OffsetDateTime,
    ) -> BillingResult<LinkOutcome>;

    async fn get_entitlement(
        &self,
        item_type: ItemType,
        item_id: Uuid,
    ) -> BillingResult<Option<Entitlement>>;

    async fn get_pass(&self, id: Uuid) -> BillingResult<Option<Pass>>;

    async fn redeem_pass_entry(&self, pass_id: Uuid, now: OffsetDateTime)
        -> BillingResult<RedeemOutcome>;

    /// Mark the payment's entitlement refunded (pass) or cancelled (registration)
    async fn revoke_entitlement(&self, payment_id: Uuid) -> BillingResult<()>;

    /// Count the payment against the coupon, only while `used_count < max_uses`
    async fn redeem_coupon(&self, coupon_id: Uuid, payment_id: Uuid)
        -> BillingResult<CouponRedemption>;

    /// Give back the use counted for a payment whose entitlement was refused
    async fn release_coupon_redemption(&self, payment_id: Uuid) -> BillingResult<bool>;
}

#[async_trait]
pub trait WebhookLogStore: Send + Sync {
    async fn claim_webhook(
        &self,
        log: NewWebhookLog,
        stale_before: OffsetDateTime,
    ) -> BillingResult<WebhookClaim>;

    async fn complete_webhook(&self, id: Uuid, payment_id: Option<Uuid>) -> BillingResult<()>;

    async fn fail_webhook(
        &self,
        id: Uuid,
        payment_id: Option<Uuid>,
        error: &str,
        retryable: bool,
    ) -> BillingResult<()>;

    /// Final state; redeliveries are answered with `AlreadyRejected`
    async fn reject_webhook(&self, id: Uuid, payment_id: Uuid, reason: &str) -> BillingResult<()>;

    async fn get_webhook(&self, id: Uuid) -> BillingResult<Option<WebhookLog>>;

    async fn list_webhooks(
        &self,
        status: Option<WebhookStatus>,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<WebhookLog>>;

    /// Retryable failed logs plus `processing` logs claimed before `stale_before`
    async fn list_retry_candidates(
        &self,
        stale_before: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<WebhookLog>>;

    /// Move a candidate back to `processing` with `retry_count + 1`
    async fn reclaim_for_retry(
        &self,
        id: Uuid,
        stale_before: OffsetDateTime,
    ) -> BillingResult<Option<WebhookLog>>;

    async fn mark_webhook_exhausted(&self, id: Uuid) -> BillingResult<()>;
}

#[async_trait]
pub trait RefundStore: Send + Sync {
    /// `None` when a non-failed refund already exists for the payment
    async fn insert_refund(&self, refund: NewRefund) -> BillingResult<Option<Refund>>;

    async fn finish_refund(
        &self,
        id: Uuid,
        status: RefundStatus,
        gateway_response: Option<serde_json::Value>,
        error_message: Option<&str>,
    ) -> BillingResult<Refund>;

    async fn list_refunds(&self, payment_id: Uuid) -> BillingResult<Vec<Refund>>;
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn record_run(&self, run: &ReconciliationRun) -> BillingResult<()>;

    async fn insert_alert(&self, alert: &OperatorAlert) -> BillingResult<()>;

    async fn list_alerts(&self, limit: i64) -> BillingResult<Vec<OperatorAlert>>;
}

/// Everything the billing services need from persistence
pub trait Store:
    PaymentStore + CatalogStore + EntitlementStore + WebhookLogStore + RefundStore + AuditStore
{
}

impl<T> Store for T where
    T: PaymentStore + CatalogStore + EntitlementStore + WebhookLogStore + RefundStore + AuditStore
{
}
