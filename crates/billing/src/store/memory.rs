//! In-memory store for tests and local runs
//!
//! All state sits behind one `tokio::sync::Mutex`, so every trait method is
//! atomic with respect to the others, mirroring the single-statement and
//! single-transaction guarantees of [`super::PgStore`].

use std::collections::HashMap;

use async_trait::async_trait;
use time::{Duration, OffsetDateTime};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{AuditStore, CatalogStore, EntitlementStore, PaymentStore, RefundStore, WebhookLogStore};
use crate::alerts::OperatorAlert;
use crate::catalog::{CardType, Coupon, EventInfo, EventStatus};
use crate::entitlement::{
    Entitlement, EventRegistration, LinkOutcome, NewPass, NewRegistration, Pass, PassStatus,
    RedeemOutcome, RegistrationStatus,
};
use crate::error::{BillingError, BillingResult};
use crate::guard::CouponRedemption;
use crate::payment::{
    ItemType, NewPayment, PaymentMetadata, PaymentRecord, PaymentStatus, TransitionOutcome,
    TransitionUpdate,
};
use crate::reconciliation::ReconciliationRun;
use crate::refund::{NewRefund, Refund, RefundStatus};
use crate::webhooks::{NewWebhookLog, WebhookClaim, WebhookLog, WebhookStatus};

#[derive(Default)]
struct State {
    payments: HashMap<Uuid, PaymentRecord>,
    card_types: HashMap<Uuid, CardType>,
    events: HashMap<Uuid, EventInfo>,
    coupons: HashMap<Uuid, Coupon>,
    passes: HashMap<Uuid, Pass>,
    registrations: HashMap<Uuid, EventRegistration>,
    /// payment id -> coupon id
    coupon_redemptions: HashMap<Uuid, Uuid>,
    webhooks: HashMap<Uuid, WebhookLog>,
    webhook_keys: HashMap<String, Uuid>,
    refunds: Vec<Refund>,
    runs: Vec<ReconciliationRun>,
    alerts: Vec<OperatorAlert>,
    fail_revocations: bool,
}

impl State {
    fn payment(&self, id: Uuid) -> BillingResult<&PaymentRecord> {
        self.payments
            .get(&id)
            .ok_or_else(|| BillingError::NotFound(format!("payment {}", id)))
    }

    fn payment_mut(&mut self, id: Uuid) -> BillingResult<&mut PaymentRecord> {
        self.payments
            .get_mut(&id)
            .ok_or_else(|| BillingError::NotFound(format!("payment {}", id)))
    }

    fn webhook_mut(&mut self, id: Uuid) -> BillingResult<&mut WebhookLog> {
        self.webhooks
            .get_mut(&id)
            .ok_or_else(|| BillingError::NotFound(format!("webhook log {}", id)))
    }

    fn entitlement_for_payment(&self, payment_id: Uuid) -> Option<Entitlement> {
        if let Some(pass) = self.passes.values().find(|p| p.payment_id == payment_id) {
            return Some(Entitlement::Pass(pass.clone()));
        }
        self.registrations
            .values()
            .find(|r| r.payment_id == payment_id)
            .map(|r| Entitlement::EventRegistration(r.clone()))
    }

    fn confirmed_registrations(&self, event_id: Uuid) -> i64 {
        self.registrations
            .values()
            .filter(|r| r.event_id == event_id && r.status.holds_seat())
            .count() as i64
    }

    fn pending_holds(&self, event_id: Uuid, held_since: OffsetDateTime, excluding: Option<Uuid>) -> i64 {
        self.payments
            .values()
            .filter(|p| {
                p.status == PaymentStatus::Pending
                    && p.created_at >= held_since
                    && Some(p.id) != excluding
                    && p.metadata
                        .purchase()
                        .ok()
                        .and_then(|purchase| purchase.event_id())
                        == Some(event_id)
            })
            .count() as i64
    }

    fn link(&mut self, payment_id: Uuid, item_type: ItemType, item_id: Uuid) -> BillingResult<()> {
        let payment = self.payment_mut(payment_id)?;
        payment.item_type = Some(item_type);
        payment.item_id = Some(item_id);
        Ok(())
    }

    fn already_linked(&self, payment_id: Uuid) -> BillingResult<Option<LinkOutcome>> {
        let payment = self.payment(payment_id)?;
        if payment.item_id.is_none() && self.entitlement_for_payment(payment_id).is_none() {
            return Ok(None);
        }
        let entitlement = self.entitlement_for_payment(payment_id).ok_or_else(|| {
            BillingError::NotFound(format!("entitlement linked from payment {}", payment_id))
        })?;
        Ok(Some(LinkOutcome::AlreadyLinked(entitlement)))
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_card_type(&self, card_type: CardType) {
        self.state
            .lock()
            .await
            .card_types
            .insert(card_type.id, card_type);
    }

    pub async fn insert_event(&self, event: EventInfo) {
        self.state.lock().await.events.insert(event.id, event);
    }

    pub async fn set_event_status(&self, event_id: Uuid, status: EventStatus) {
        if let Some(event) = self.state.lock().await.events.get_mut(&event_id) {
            event.status = status;
        }
    }

    pub async fn insert_coupon(&self, coupon: Coupon) {
        self.state.lock().await.coupons.insert(coupon.id, coupon);
    }

    pub async fn coupon(&self, code: &str) -> Option<Coupon> {
        self.state
            .lock()
            .await
            .coupons
            .values()
            .find(|c| c.code.eq_ignore_ascii_case(code))
            .cloned()
    }

    /// Seed a registration that did not come through a payment here
    pub async fn insert_registration(&self, registration: EventRegistration) {
        self.state
            .lock()
            .await
            .registrations
            .insert(registration.id, registration);
    }

    pub async fn passes(&self) -> Vec<Pass> {
        self.state.lock().await.passes.values().cloned().collect()
    }

    pub async fn registrations_for_event(&self, event_id: Uuid) -> Vec<EventRegistration> {
        self.state
            .lock()
            .await
            .registrations
            .values()
            .filter(|r| r.event_id == event_id)
            .cloned()
            .collect()
    }

    pub async fn webhook_logs(&self) -> Vec<WebhookLog> {
        self.state.lock().await.webhooks.values().cloned().collect()
    }

    pub async fn runs(&self) -> Vec<ReconciliationRun> {
        self.state.lock().await.runs.clone()
    }

    /// Make `revoke_entitlement` fail until switched off again
    pub async fn fail_revocations(&self, fail: bool) {
        self.state.lock().await.fail_revocations = fail;
    }

    /// Shift a payment's timestamps into the past
    pub async fn backdate_payment(&self, id: Uuid, by: Duration) {
        if let Some(p) = self.state.lock().await.payments.get_mut(&id) {
            p.created_at -= by;
            p.completed_at = p.completed_at.map(|at| at - by);
        }
    }

    /// Shift a webhook log's attempt timestamps into the past
    pub async fn backdate_webhook(&self, id: Uuid, by: Duration) {
        if let Some(log) = self.state.lock().await.webhooks.get_mut(&id) {
            log.processing_started_at -= by;
            log.last_attempt_at -= by;
        }
    }
}

#[async_trait]
impl PaymentStore for MemoryStore {
    async fn create_pending(&self, new: NewPayment) -> BillingResult<PaymentRecord> {
        let record = PaymentRecord {
            id: Uuid::new_v4(),
            user_id: new.user_id,
            amount: new.amount,
            currency: new.currency,
            payment_type: new.payment_type,
            status: PaymentStatus::Pending,
            item_type: None,
            item_id: None,
            metadata: new.metadata,
            transaction_uid: None,
            gateway_correlation_id: None,
            created_at: OffsetDateTime::now_utc(),
            completed_at: None,
        };
        self.state
            .lock()
            .await
            .payments
            .insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_payment(&self, id: Uuid) -> BillingResult<Option<PaymentRecord>> {
        Ok(self.state.lock().await.payments.get(&id).cloned())
    }

    async fn find_by_gateway_correlation(
        &self,
        gateway_correlation_id: &str,
    ) -> BillingResult<Option<PaymentRecord>> {
        Ok(self
            .state
            .lock()
            .await
            .payments
            .values()
            .find(|p| p.gateway_correlation_id.as_deref() == Some(gateway_correlation_id))
            .cloned())
    }

    async fn set_gateway_correlation(
        &self,
        id: Uuid,
        gateway_correlation_id: &str,
    ) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        let payment = state.payment_mut(id)?;
        if payment.status == PaymentStatus::Pending {
            payment.gateway_correlation_id = Some(gateway_correlation_id.to_string());
        }
        Ok(())
    }

    async fn transition(
        &self,
        id: Uuid,
        to: PaymentStatus,
        update: TransitionUpdate,
    ) -> BillingResult<TransitionOutcome> {
        let mut state = self.state.lock().await;
        let payment = state.payment_mut(id)?;

        if !payment.status.can_transition_to(to) {
            return Ok(TransitionOutcome::rejected(payment.clone()));
        }

        payment.status = to;
        payment.metadata.merge(&update.metadata);
        if let Some(uid) = update.transaction_uid {
            payment.transaction_uid = Some(uid);
        }
        if matches!(to, PaymentStatus::Completed | PaymentStatus::Failed) {
            payment.completed_at = Some(OffsetDateTime::now_utc());
        }
        Ok(TransitionOutcome::Applied(payment.clone()))
    }

    async fn annotate_payment(&self, id: Uuid, metadata: PaymentMetadata) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        state.payment_mut(id)?.metadata.merge(&metadata);
        Ok(())
    }

    async fn list_pending(
        &self,
        created_before: OffsetDateTime,
        created_after: Option<OffsetDateTime>,
        limit: i64,
    ) -> BillingResult<Vec<PaymentRecord>> {
        let state = self.state.lock().await;
        let mut pending: Vec<PaymentRecord> = state
            .payments
            .values()
            .filter(|p| {
                p.status == PaymentStatus::Pending
                    && p.created_at < created_before
                    && created_after.map_or(true, |after| p.created_at > after)
            })
            .cloned()
            .collect();
        pending.sort_by_key(|p| p.created_at);
        pending.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(pending)
    }

    async fn list_unmaterialized(
        &self,
        completed_before: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<PaymentRecord>> {
        let state = self.state.lock().await;
        let mut orphans: Vec<PaymentRecord> = state
            .payments
            .values()
            .filter(|p| {
                p.status == PaymentStatus::Completed
                    && p.item_id.is_none()
                    && !p.metadata.manual_refund_required()
                    && p.completed_at.unwrap_or(p.created_at) < completed_before
            })
            .cloned()
            .collect();
        orphans.sort_by_key(|p| p.created_at);
        orphans.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(orphans)
    }
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn get_card_type(&self, id: Uuid) -> BillingResult<Option<CardType>> {
        Ok(self.state.lock().await.card_types.get(&id).cloned())
    }

    async fn get_event(&self, id: Uuid) -> BillingResult<Option<EventInfo>> {
        Ok(self.state.lock().await.events.get(&id).cloned())
    }

    async fn count_confirmed_registrations(&self, event_id: Uuid) -> BillingResult<i64> {
        Ok(self.state.lock().await.confirmed_registrations(event_id))
    }

    async fn count_pending_holds(
        &self,
        event_id: Uuid,
        held_since: OffsetDateTime,
        excluding: Option<Uuid>,
    ) -> BillingResult<i64> {
        Ok(self
            .state
            .lock()
            .await
            .pending_holds(event_id, held_since, excluding))
    }

    async fn get_coupon_by_code(&self, code: &str) -> BillingResult<Option<Coupon>> {
        Ok(self.coupon(code).await)
    }

    async fn count_coupon_holds(&self, code: &str, held_since: OffsetDateTime) -> BillingResult<i64> {
        let state = self.state.lock().await;
        Ok(state
            .payments
            .values()
            .filter(|p| {
                p.status == PaymentStatus::Pending
                    && p.created_at >= held_since
                    && p.metadata
                        .coupon_code()
                        .ok()
                        .flatten()
                        .is_some_and(|c| c.eq_ignore_ascii_case(code))
            })
            .count() as i64)
    }
}

#[async_trait]
impl EntitlementStore for MemoryStore {
    async fn insert_pass_linked(
        &self,
        payment_id: Uuid,
        pass: NewPass,
    ) -> BillingResult<LinkOutcome> {
        let mut state = self.state.lock().await;
        if let Some(linked) = state.already_linked(payment_id)? {
            return Ok(linked);
        }

        let pass = Pass {
            id: pass.id,
            user_id: pass.user_id,
            card_type_id: pass.card_type_id,
            total_entries: pass.total_entries,
            remaining_entries: pass.total_entries,
            expiry_date: pass.expiry_date,
            status: PassStatus::Active,
            payment_id,
            created_at: OffsetDateTime::now_utc(),
        };
        state.passes.insert(pass.id, pass.clone());
        state.link(payment_id, ItemType::Pass, pass.id)?;
        Ok(LinkOutcome::Created(Entitlement::Pass(pass)))
    }

    async fn insert_registration_within_capacity(
        &self,
        payment_id: Uuid,
        registration: NewRegistration,
        held_since: OffsetDateTime,
    ) -> BillingResult<LinkOutcome> {
        let mut state = self.state.lock().await;
        if let Some(linked) = state.already_linked(payment_id)? {
            return Ok(linked);
        }

        let Some(event) = state.events.get(&registration.event_id).cloned() else {
            return Ok(LinkOutcome::Refused {
                reason: format!("event {} no longer exists", registration.event_id),
            });
        };
        if event.status == EventStatus::Cancelled {
            return Ok(LinkOutcome::Refused {
                reason: format!("event '{}' was cancelled", event.title),
            });
        }

        let confirmed = state.confirmed_registrations(event.id);
        let held = state.pending_holds(event.id, held_since, Some(payment_id));
        if confirmed + held + 1 > i64::from(event.capacity) {
            return Ok(LinkOutcome::Refused {
                reason: format!(
                    "event '{}' is full ({} confirmed, {} held, capacity {})",
                    event.title, confirmed, held, event.capacity
                ),
            });
        }

        let registration = EventRegistration {
            id: registration.id,
            event_id: registration.event_id,
            user_id: registration.user_id,
            status: RegistrationStatus::Confirmed,
            ticket_type: registration.ticket_type,
            payment_id,
            created_at: OffsetDateTime::now_utc(),
        };
        state
            .registrations
            .insert(registration.id, registration.clone());
        state.link(payment_id, ItemType::EventRegistration, registration.id)?;
        Ok(LinkOutcome::Created(Entitlement::EventRegistration(
            registration,
        )))
    }

    async fn get_entitlement(
        &self,
        item_type: ItemType,
        item_id: Uuid,
    ) -> BillingResult<Option<Entitlement>> {
        let state = self.state.lock().await;
        Ok(match item_type {
            ItemType::Pass => state.passes.get(&item_id).cloned().map(Entitlement::Pass),
            ItemType::EventRegistration => state
                .registrations
                .get(&item_id)
                .cloned()
                .map(Entitlement::EventRegistration),
        })
    }

    async fn get_pass(&self, id: Uuid) -> BillingResult<Option<Pass>> {
        Ok(self.state.lock().await.passes.get(&id).cloned())
    }

    async fn redeem_pass_entry(
        &self,
        pass_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<RedeemOutcome> {
        let mut state = self.state.lock().await;
        let Some(pass) = state.passes.get_mut(&pass_id) else {
            return Ok(RedeemOutcome::NotFound);
        };
        match pass.status {
            PassStatus::Refunded => return Ok(RedeemOutcome::Inactive),
            PassStatus::Depleted => return Ok(RedeemOutcome::Depleted),
            PassStatus::Active => {}
        }
        if pass.remaining_entries <= 0 {
            return Ok(RedeemOutcome::Depleted);
        }
        if pass.expiry_date < now {
            return Ok(RedeemOutcome::Expired);
        }

        pass.remaining_entries -= 1;
        if pass.remaining_entries == 0 {
            pass.status = PassStatus::Depleted;
        }
        Ok(RedeemOutcome::Redeemed(pass.clone()))
    }

    async fn revoke_entitlement(&self, payment_id: Uuid) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        if state.fail_revocations {
            return Err(BillingError::Database("entitlement update rejected".to_string()));
        }
        for pass in state.passes.values_mut().filter(|p| p.payment_id == payment_id) {
            pass.status = PassStatus::Refunded;
        }
        for reg in state
            .registrations
            .values_mut()
            .filter(|r| r.payment_id == payment_id)
        {
            reg.status = RegistrationStatus::Cancelled;
        }
        Ok(())
    }

    async fn redeem_coupon(
        &self,
        coupon_id: Uuid,
        payment_id: Uuid,
    ) -> BillingResult<CouponRedemption> {
        let mut state = self.state.lock().await;
        if state.coupon_redemptions.contains_key(&payment_id) {
            return Ok(CouponRedemption::AlreadyRecorded);
        }
        let coupon = state
            .coupons
            .get_mut(&coupon_id)
            .ok_or_else(|| BillingError::NotFound(format!("coupon {}", coupon_id)))?;
        if coupon.max_uses.is_some_and(|max| coupon.used_count >= max) {
            return Ok(CouponRedemption::Exhausted);
        }
        coupon.used_count += 1;
        state.coupon_redemptions.insert(payment_id, coupon_id);
        Ok(CouponRedemption::Recorded)
    }

    async fn release_coupon_redemption(&self, payment_id: Uuid) -> BillingResult<bool> {
        let mut state = self.state.lock().await;
        let Some(coupon_id) = state.coupon_redemptions.remove(&payment_id) else {
            return Ok(false);
        };
        if let Some(coupon) = state.coupons.get_mut(&coupon_id) {
            coupon.used_count = (coupon.used_count - 1).max(0);
        }
        Ok(true)
    }
}

#[async_trait]
impl WebhookLogStore for MemoryStore {
    async fn claim_webhook(
        &self,
        log: NewWebhookLog,
        stale_before: OffsetDateTime,
    ) -> BillingResult<WebhookClaim> {
        let mut state = self.state.lock().await;
        let now = OffsetDateTime::now_utc();

        if let Some(existing_id) = state.webhook_keys.get(&log.idempotency_key).copied() {
            let existing = state.webhook_mut(existing_id)?;
            let reclaimable = match existing.status {
                WebhookStatus::Completed => return Ok(WebhookClaim::AlreadyCompleted(existing.clone())),
                WebhookStatus::Rejected => return Ok(WebhookClaim::AlreadyRejected(existing.clone())),
                WebhookStatus::Failed => true,
                WebhookStatus::Processing => existing.processing_started_at < stale_before,
            };
            if !reclaimable {
                return Ok(WebhookClaim::InProgress(existing.clone()));
            }
            existing.status = WebhookStatus::Processing;
            existing.retry_count += 1;
            existing.payload = log.payload;
            existing.headers = log.headers;
            existing.processing_started_at = now;
            existing.last_attempt_at = now;
            return Ok(WebhookClaim::Reclaimed(existing.clone()));
        }

        let row = WebhookLog {
            id: log.id,
            webhook_type: log.webhook_type,
            idempotency_key: log.idempotency_key.clone(),
            payload: log.payload,
            headers: log.headers,
            status: WebhookStatus::Processing,
            retry_count: 0,
            retryable: true,
            error_message: None,
            payment_id: None,
            processing_started_at: now,
            last_attempt_at: now,
            completed_at: None,
            created_at: now,
        };
        state.webhook_keys.insert(log.idempotency_key, row.id);
        state.webhooks.insert(row.id, row.clone());
        Ok(WebhookClaim::Claimed(row))
    }

    async fn complete_webhook(&self, id: Uuid, payment_id: Option<Uuid>) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        let log = state.webhook_mut(id)?;
        log.status = WebhookStatus::Completed;
        log.completed_at = Some(OffsetDateTime::now_utc());
        log.error_message = None;
        if payment_id.is_some() {
            log.payment_id = payment_id;
        }
        Ok(())
    }

    async fn fail_webhook(
        &self,
        id: Uuid,
        payment_id: Option<Uuid>,
        error: &str,
        retryable: bool,
    ) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        let log = state.webhook_mut(id)?;
        log.status = WebhookStatus::Failed;
        log.error_message = Some(error.to_string());
        log.retryable = retryable;
        log.last_attempt_at = OffsetDateTime::now_utc();
        if payment_id.is_some() {
            log.payment_id = payment_id;
        }
        Ok(())
    }

    async fn reject_webhook(&self, id: Uuid, payment_id: Uuid, reason: &str) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        let log = state.webhook_mut(id)?;
        let now = OffsetDateTime::now_utc();
        log.status = WebhookStatus::Rejected;
        log.retryable = false;
        log.error_message = Some(reason.to_string());
        log.payment_id = Some(payment_id);
        log.last_attempt_at = now;
        log.completed_at = Some(now);
        Ok(())
    }

    async fn get_webhook(&self, id: Uuid) -> BillingResult<Option<WebhookLog>> {
        Ok(self.state.lock().await.webhooks.get(&id).cloned())
    }

    async fn list_webhooks(
        &self,
        status: Option<WebhookStatus>,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<WebhookLog>> {
        let state = self.state.lock().await;
        let mut logs: Vec<WebhookLog> = state
            .webhooks
            .values()
            .filter(|l| status.map_or(true, |s| l.status == s))
            .cloned()
            .collect();
        logs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(logs
            .into_iter()
            .skip(usize::try_from(offset).unwrap_or(0))
            .take(usize::try_from(limit).unwrap_or(0))
            .collect())
    }

    async fn list_retry_candidates(
        &self,
        stale_before: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<WebhookLog>> {
        let state = self.state.lock().await;
        let mut logs: Vec<WebhookLog> = state
            .webhooks
            .values()
            .filter(|l| match l.status {
                WebhookStatus::Failed => l.retryable,
                WebhookStatus::Processing => l.processing_started_at < stale_before,
                WebhookStatus::Completed | WebhookStatus::Rejected => false,
            })
            .cloned()
            .collect();
        logs.sort_by_key(|l| l.last_attempt_at);
        logs.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(logs)
    }

    async fn reclaim_for_retry(
        &self,
        id: Uuid,
        stale_before: OffsetDateTime,
    ) -> BillingResult<Option<WebhookLog>> {
        let mut state = self.state.lock().await;
        let log = state.webhook_mut(id)?;
        let reclaimable = match log.status {
            WebhookStatus::Failed => true,
            WebhookStatus::Processing => log.processing_started_at < stale_before,
            WebhookStatus::Completed | WebhookStatus::Rejected => false,
        };
        if !reclaimable {
            return Ok(None);
        }
        let now = OffsetDateTime::now_utc();
        log.status = WebhookStatus::Processing;
        log.retry_count += 1;
        log.processing_started_at = now;
        log.last_attempt_at = now;
        Ok(Some(log.clone()))
    }

    async fn mark_webhook_exhausted(&self, id: Uuid) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        let log = state.webhook_mut(id)?;
        log.status = WebhookStatus::Failed;
        log.retryable = false;
        let previous = log.error_message.take().unwrap_or_default();
        log.error_message = Some(format!("retries exhausted; last error: {}", previous));
        Ok(())
    }
}

#[async_trait]
impl RefundStore for MemoryStore {
    async fn insert_refund(&self, refund: NewRefund) -> BillingResult<Option<Refund>> {
        let mut state = self.state.lock().await;
        if state
            .refunds
            .iter()
            .any(|r| r.payment_id == refund.payment_id && r.status != RefundStatus::Failed)
        {
            return Ok(None);
        }
        let row = Refund {
            id: refund.id,
            payment_id: refund.payment_id,
            amount: refund.amount,
            status: RefundStatus::Pending,
            reason: refund.reason,
            requested_by: refund.requested_by,
            gateway_response: None,
            error_message: None,
            created_at: OffsetDateTime::now_utc(),
            completed_at: None,
        };
        state.refunds.push(row.clone());
        Ok(Some(row))
    }

    async fn finish_refund(
        &self,
        id: Uuid,
        status: RefundStatus,
        gateway_response: Option<serde_json::Value>,
        error_message: Option<&str>,
    ) -> BillingResult<Refund> {
        let mut state = self.state.lock().await;
        let refund = state
            .refunds
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| BillingError::NotFound(format!("refund {}", id)))?;
        refund.status = status;
        refund.gateway_response = gateway_response;
        refund.error_message = error_message.map(str::to_string);
        if status == RefundStatus::Completed {
            refund.completed_at = Some(OffsetDateTime::now_utc());
        }
        Ok(refund.clone())
    }

    async fn list_refunds(&self, payment_id: Uuid) -> BillingResult<Vec<Refund>> {
        Ok(self
            .state
            .lock()
            .await
            .refunds
            .iter()
            .filter(|r| r.payment_id == payment_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl AuditStore for MemoryStore {
    async fn record_run(&self, run: &ReconciliationRun) -> BillingResult<()> {
        self.state.lock().await.runs.push(run.clone());
        Ok(())
    }

    async fn insert_alert(&self, alert: &OperatorAlert) -> BillingResult<()> {
        self.state.lock().await.alerts.push(alert.clone());
        Ok(())
    }

    async fn list_alerts(&self, limit: i64) -> BillingResult<Vec<OperatorAlert>> {
        let state = self.state.lock().await;
        Ok(state
            .alerts
            .iter()
            .rev()
            .take(usize::try_from(limit).unwrap_or(0))
            .cloned()
            .collect())
    }
}
