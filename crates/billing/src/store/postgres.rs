//! Postgres-backed store
//!
//! Races are settled by the database: conditional `UPDATE ... WHERE status =`
//! for transitions, `INSERT ... ON CONFLICT` for webhook claims and coupon
//! redemptions, and `SELECT ... FOR UPDATE` on the payment and event rows
//! while an entitlement is inserted.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgConnection, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{AuditStore, CatalogStore, EntitlementStore, PaymentStore, RefundStore, WebhookLogStore};
use crate::alerts::OperatorAlert;
use crate::catalog::{CardType, Coupon, EventInfo, EventStatus};
use crate::entitlement::{
    Entitlement, EventRegistration, LinkOutcome, NewPass, NewRegistration, Pass, PassStatus,
    RedeemOutcome,
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

const PAYMENT_COLUMNS: &str = "id, user_id, amount_agorot, currency, payment_type, status, \
     item_type, item_id, metadata, transaction_uid, gateway_correlation_id, created_at, completed_at";

const PASS_COLUMNS: &str = "id, user_id, card_type_id, total_entries, remaining_entries, \
     expiry_date, status, payment_id, created_at";

const REGISTRATION_COLUMNS: &str = "id, event_id, user_id, status, ticket_type, payment_id, created_at";

const WEBHOOK_COLUMNS: &str = "id, webhook_type, idempotency_key, payload, headers, status, \
     retry_count, retryable, error_message, payment_id, processing_started_at, last_attempt_at, \
     completed_at, created_at";

const REFUND_COLUMNS: &str = "id, payment_id, refund_amount_agorot, status, reason, requested_by, \
     gateway_response, error_message, created_at, completed_at";

#[derive(sqlx::FromRow)]
struct PaymentRow {
    id: Uuid,
    user_id: Option<Uuid>,
    amount_agorot: i64,
    currency: String,
    payment_type: String,
    status: String,
    item_type: Option<String>,
    item_id: Option<Uuid>,
    metadata: Value,
    transaction_uid: Option<String>,
    gateway_correlation_id: Option<String>,
    created_at: OffsetDateTime,
    completed_at: Option<OffsetDateTime>,
}

impl TryFrom<PaymentRow> for PaymentRecord {
    type Error = BillingError;

    fn try_from(row: PaymentRow) -> Result<Self, Self::Error> {
        Ok(PaymentRecord {
            id: row.id,
            user_id: row.user_id,
            amount: row.amount_agorot,
            currency: row.currency,
            payment_type: row.payment_type.parse()?,
            status: row.status.parse()?,
            item_type: row.item_type.as_deref().map(str::parse).transpose()?,
            item_id: row.item_id,
            metadata: PaymentMetadata::from_value(row.metadata)?,
            transaction_uid: row.transaction_uid,
            gateway_correlation_id: row.gateway_correlation_id,
            created_at: row.created_at,
            completed_at: row.completed_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct CardTypeRow {
    id: Uuid,
    name: String,
    entries: i32,
    price_agorot: i64,
    validity_months: Option<i32>,
    is_active: bool,
}

impl From<CardTypeRow> for CardType {
    fn from(row: CardTypeRow) -> Self {
        CardType {
            id: row.id,
            name: row.name,
            entries: row.entries,
            price: row.price_agorot,
            validity_months: row.validity_months,
            is_active: row.is_active,
        }
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    id: Uuid,
    title: String,
    capacity: i32,
    price_agorot: i64,
    start_at: OffsetDateTime,
    status: String,
}

impl TryFrom<EventRow> for EventInfo {
    type Error = BillingError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        Ok(EventInfo {
            id: row.id,
            title: row.title,
            capacity: row.capacity,
            price: row.price_agorot,
            start_at: row.start_at,
            status: row.status.parse()?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct CouponRow {
    id: Uuid,
    code: String,
    discount_type: String,
    discount_value: i64,
    applies_to: Vec<String>,
    min_amount_agorot: Option<i64>,
    max_uses: Option<i32>,
    used_count: i32,
    valid_from: Option<OffsetDateTime>,
    valid_until: Option<OffsetDateTime>,
    is_active: bool,
}

impl TryFrom<CouponRow> for Coupon {
    type Error = BillingError;

    fn try_from(row: CouponRow) -> Result<Self, Self::Error> {
        Ok(Coupon {
            id: row.id,
            code: row.code,
            discount_type: row.discount_type.parse()?,
            discount_value: row.discount_value,
            applies_to: row
                .applies_to
                .iter()
                .map(|s| s.parse())
                .collect::<BillingResult<Vec<ItemType>>>()?,
            min_amount: row.min_amount_agorot,
            max_uses: row.max_uses,
            used_count: row.used_count,
            valid_from: row.valid_from,
            valid_until: row.valid_until,
            is_active: row.is_active,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PassRow {
    id: Uuid,
    user_id: Option<Uuid>,
    card_type_id: Uuid,
    total_entries: i32,
    remaining_entries: i32,
    expiry_date: OffsetDateTime,
    status: String,
    payment_id: Uuid,
    created_at: OffsetDateTime,
}

impl TryFrom<PassRow> for Pass {
    type Error = BillingError;

    fn try_from(row: PassRow) -> Result<Self, Self::Error> {
        Ok(Pass {
            id: row.id,
            user_id: row.user_id,
            card_type_id: row.card_type_id,
            total_entries: row.total_entries,
            remaining_entries: row.remaining_entries,
            expiry_date: row.expiry_date,
            status: row.status.parse()?,
            payment_id: row.payment_id,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct RegistrationRow {
    id: Uuid,
    event_id: Uuid,
    user_id: Option<Uuid>,
    status: String,
    ticket_type: String,
    payment_id: Uuid,
    created_at: OffsetDateTime,
}

impl TryFrom<RegistrationRow> for EventRegistration {
    type Error = BillingError;

    fn try_from(row: RegistrationRow) -> Result<Self, Self::Error> {
        Ok(EventRegistration {
            id: row.id,
            event_id: row.event_id,
            user_id: row.user_id,
            status: row.status.parse()?,
            ticket_type: row.ticket_type,
            payment_id: row.payment_id,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct WebhookRow {
    id: Uuid,
    webhook_type: String,
    idempotency_key: String,
    payload: String,
    headers: Value,
    status: String,
    retry_count: i32,
    retryable: bool,
    error_message: Option<String>,
    payment_id: Option<Uuid>,
    processing_started_at: OffsetDateTime,
    last_attempt_at: OffsetDateTime,
    completed_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
}

impl TryFrom<WebhookRow> for WebhookLog {
    type Error = BillingError;

    fn try_from(row: WebhookRow) -> Result<Self, Self::Error> {
        let headers: BTreeMap<String, String> = serde_json::from_value(row.headers)?;
        Ok(WebhookLog {
            id: row.id,
            webhook_type: row.webhook_type,
            idempotency_key: row.idempotency_key,
            payload: row.payload,
            headers,
            status: row.status.parse()?,
            retry_count: row.retry_count,
            retryable: row.retryable,
            error_message: row.error_message,
            payment_id: row.payment_id,
            processing_started_at: row.processing_started_at,
            last_attempt_at: row.last_attempt_at,
            completed_at: row.completed_at,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ClaimRow {
    #[sqlx(flatten)]
    log: WebhookRow,
    inserted: bool,
}

#[derive(sqlx::FromRow)]
struct RefundRow {
    id: Uuid,
    payment_id: Uuid,
    refund_amount_agorot: i64,
    status: String,
    reason: String,
    requested_by: String,
    gateway_response: Option<Value>,
    error_message: Option<String>,
    created_at: OffsetDateTime,
    completed_at: Option<OffsetDateTime>,
}

impl TryFrom<RefundRow> for Refund {
    type Error = BillingError;

    fn try_from(row: RefundRow) -> Result<Self, Self::Error> {
        Ok(Refund {
            id: row.id,
            payment_id: row.payment_id,
            amount: row.refund_amount_agorot,
            status: row.status.parse()?,
            reason: row.reason,
            requested_by: row.requested_by,
            gateway_response: row.gateway_response,
            error_message: row.error_message,
            created_at: row.created_at,
            completed_at: row.completed_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct AlertRow {
    id: Uuid,
    kind: String,
    severity: String,
    message: String,
    context: Value,
    payment_id: Option<Uuid>,
    created_at: OffsetDateTime,
}

impl TryFrom<AlertRow> for OperatorAlert {
    type Error = BillingError;

    fn try_from(row: AlertRow) -> Result<Self, Self::Error> {
        Ok(OperatorAlert {
            id: row.id,
            kind: row.kind.parse()?,
            severity: row.severity.parse()?,
            message: row.message,
            context: row.context,
            payment_id: row.payment_id,
            created_at: row.created_at,
        })
    }
}

fn convert_all<R, T>(rows: Vec<R>) -> BillingResult<Vec<T>>
where
    T: TryFrom<R, Error = BillingError>,
{
    rows.into_iter().map(T::try_from).collect()
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch_payment(&self, id: Uuid) -> BillingResult<Option<PaymentRecord>> {
        let sql = format!("SELECT {} FROM payments WHERE id = $1", PAYMENT_COLUMNS);
        let row: Option<PaymentRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(PaymentRecord::try_from).transpose()
    }
}

/// Entitlement already linked from a payment, read on the caller's connection
async fn linked_entitlement(
    conn: &mut PgConnection,
    payment_id: Uuid,
) -> BillingResult<Option<Entitlement>> {
    let sql = format!("SELECT {} FROM passes WHERE payment_id = $1", PASS_COLUMNS);
    let pass: Option<PassRow> = sqlx::query_as(&sql)
        .bind(payment_id)
        .fetch_optional(&mut *conn)
        .await?;
    if let Some(row) = pass {
        return Ok(Some(Entitlement::Pass(row.try_into()?)));
    }

    let sql = format!(
        "SELECT {} FROM event_registrations WHERE payment_id = $1",
        REGISTRATION_COLUMNS
    );
    let registration: Option<RegistrationRow> = sqlx::query_as(&sql)
        .bind(payment_id)
        .fetch_optional(&mut *conn)
        .await?;
    registration
        .map(|row| row.try_into().map(Entitlement::EventRegistration))
        .transpose()
}

/// Lock the payment row; `Some` when it is already linked
async fn lock_payment_for_link(
    conn: &mut PgConnection,
    payment_id: Uuid,
) -> BillingResult<Option<LinkOutcome>> {
    let locked: Option<(Option<Uuid>,)> =
        sqlx::query_as("SELECT item_id FROM payments WHERE id = $1 FOR UPDATE")
            .bind(payment_id)
            .fetch_optional(&mut *conn)
            .await?;
    let Some((item_id,)) = locked else {
        return Err(BillingError::NotFound(format!("payment {}", payment_id)));
    };

    match linked_entitlement(conn, payment_id).await? {
        Some(entitlement) => Ok(Some(LinkOutcome::AlreadyLinked(entitlement))),
        None if item_id.is_some() => Err(BillingError::NotFound(format!(
            "entitlement linked from payment {}",
            payment_id
        ))),
        None => Ok(None),
    }
}

async fn link_payment(
    conn: &mut PgConnection,
    payment_id: Uuid,
    item_type: ItemType,
    item_id: Uuid,
) -> BillingResult<()> {
    sqlx::query("UPDATE payments SET item_type = $2, item_id = $3 WHERE id = $1 AND item_id IS NULL")
        .bind(payment_id)
        .bind(item_type.as_str())
        .bind(item_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

#[async_trait]
impl PaymentStore for PgStore {
    async fn create_pending(&self, new: NewPayment) -> BillingResult<PaymentRecord> {
        let sql = format!(
            r#"
            INSERT INTO payments (id, user_id, amount_agorot, currency, payment_type, status, metadata)
            VALUES ($1, $2, $3, $4, $5, 'pending', $6)
            RETURNING {}
            "#,
            PAYMENT_COLUMNS
        );
        let row: PaymentRow = sqlx::query_as(&sql)
            .bind(Uuid::new_v4())
            .bind(new.user_id)
            .bind(new.amount)
            .bind(&new.currency)
            .bind(new.payment_type.as_str())
            .bind(new.metadata.as_value())
            .fetch_one(&self.pool)
            .await?;
        row.try_into()
    }

    async fn get_payment(&self, id: Uuid) -> BillingResult<Option<PaymentRecord>> {
        self.fetch_payment(id).await
    }

    async fn find_by_gateway_correlation(
        &self,
        gateway_correlation_id: &str,
    ) -> BillingResult<Option<PaymentRecord>> {
        let sql = format!(
            "SELECT {} FROM payments WHERE gateway_correlation_id = $1",
            PAYMENT_COLUMNS
        );
        let row: Option<PaymentRow> = sqlx::query_as(&sql)
            .bind(gateway_correlation_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(PaymentRecord::try_from).transpose()
    }

    async fn set_gateway_correlation(
        &self,
        id: Uuid,
        gateway_correlation_id: &str,
    ) -> BillingResult<()> {
        sqlx::query(
            "UPDATE payments SET gateway_correlation_id = $2 WHERE id = $1 AND status = 'pending'",
        )
        .bind(id)
        .bind(gateway_correlation_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn transition(
        &self,
        id: Uuid,
        to: PaymentStatus,
        update: TransitionUpdate,
    ) -> BillingResult<TransitionOutcome> {
        if let Some(from) = to.predecessor() {
            let sql = format!(
                r#"
                UPDATE payments
                SET status = $2,
                    metadata = metadata || $3,
                    transaction_uid = COALESCE($4, transaction_uid),
                    completed_at = CASE
                        WHEN $2 IN ('completed', 'failed') THEN NOW()
                        ELSE completed_at
                    END
                WHERE id = $1 AND status = $5
                RETURNING {}
                "#,
                PAYMENT_COLUMNS
            );
            let applied: Option<PaymentRow> = sqlx::query_as(&sql)
                .bind(id)
                .bind(to.as_str())
                .bind(update.metadata.as_value())
                .bind(update.transaction_uid.as_deref())
                .bind(from.as_str())
                .fetch_optional(&self.pool)
                .await?;
            if let Some(row) = applied {
                return Ok(TransitionOutcome::Applied(row.try_into()?));
            }
        }

        let current = self
            .fetch_payment(id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("payment {}", id)))?;
        Ok(TransitionOutcome::rejected(current))
    }

    async fn annotate_payment(&self, id: Uuid, metadata: PaymentMetadata) -> BillingResult<()> {
        let result = sqlx::query("UPDATE payments SET metadata = metadata || $2 WHERE id = $1")
            .bind(id)
            .bind(metadata.as_value())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(BillingError::NotFound(format!("payment {}", id)));
        }
        Ok(())
    }

    async fn list_pending(
        &self,
        created_before: OffsetDateTime,
        created_after: Option<OffsetDateTime>,
        limit: i64,
    ) -> BillingResult<Vec<PaymentRecord>> {
        let sql = format!(
            r#"
            SELECT {} FROM payments
            WHERE status = 'pending'
              AND created_at < $1
              AND ($2::timestamptz IS NULL OR created_at > $2)
            ORDER BY created_at
            LIMIT $3
            "#,
            PAYMENT_COLUMNS
        );
        let rows: Vec<PaymentRow> = sqlx::query_as(&sql)
            .bind(created_before)
            .bind(created_after)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        convert_all(rows)
    }

    async fn list_unmaterialized(
        &self,
        completed_before: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<PaymentRecord>> {
        let sql = format!(
            r#"
            SELECT {} FROM payments
            WHERE status = 'completed'
              AND item_id IS NULL
              AND COALESCE(metadata->>'manual_refund_required', 'false') <> 'true'
              AND COALESCE(completed_at, created_at) < $1
            ORDER BY created_at
            LIMIT $2
            "#,
            PAYMENT_COLUMNS
        );
        let rows: Vec<PaymentRow> = sqlx::query_as(&sql)
            .bind(completed_before)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        convert_all(rows)
    }
}

#[async_trait]
impl CatalogStore for PgStore {
    async fn get_card_type(&self, id: Uuid) -> BillingResult<Option<CardType>> {
        let row: Option<CardTypeRow> = sqlx::query_as(
            "SELECT id, name, entries, price_agorot, validity_months, is_active \
             FROM card_types WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(CardType::from))
    }

    async fn get_event(&self, id: Uuid) -> BillingResult<Option<EventInfo>> {
        let row: Option<EventRow> = sqlx::query_as(
            "SELECT id, title, capacity, price_agorot, start_at, status FROM events WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(EventInfo::try_from).transpose()
    }

    async fn count_confirmed_registrations(&self, event_id: Uuid) -> BillingResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM event_registrations \
             WHERE event_id = $1 AND status IN ('confirmed', 'attended')",
        )
        .bind(event_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn count_pending_holds(
        &self,
        event_id: Uuid,
        held_since: OffsetDateTime,
        excluding: Option<Uuid>,
    ) -> BillingResult<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM payments
            WHERE status = 'pending'
              AND metadata->'purchase'->>'event_id' = $1
              AND created_at >= $2
              AND ($3::uuid IS NULL OR id <> $3)
            "#,
        )
        .bind(event_id.to_string())
        .bind(held_since)
        .bind(excluding)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn get_coupon_by_code(&self, code: &str) -> BillingResult<Option<Coupon>> {
        let row: Option<CouponRow> = sqlx::query_as(
            r#"
            SELECT id, code, discount_type, discount_value, applies_to, min_amount_agorot,
                   max_uses, used_count, valid_from, valid_until, is_active
            FROM coupons
            WHERE LOWER(code) = LOWER($1)
            "#,
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Coupon::try_from).transpose()
    }

    async fn count_coupon_holds(&self, code: &str, held_since: OffsetDateTime) -> BillingResult<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM payments
            WHERE status = 'pending'
              AND LOWER(metadata->>'coupon_code') = LOWER($1)
              AND created_at >= $2
            "#,
        )
        .bind(code)
        .bind(held_since)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

#[async_trait]
impl EntitlementStore for PgStore {
    async fn insert_pass_linked(
        &self,
        payment_id: Uuid,
        pass: NewPass,
    ) -> BillingResult<LinkOutcome> {
        let mut tx = self.pool.begin().await?;
        if let Some(linked) = lock_payment_for_link(&mut tx, payment_id).await? {
            tx.rollback().await?;
            return Ok(linked);
        }

        let sql = format!(
            r#"
            INSERT INTO passes (id, user_id, card_type_id, total_entries, remaining_entries,
                                expiry_date, status, payment_id)
            VALUES ($1, $2, $3, $4, $4, $5, 'active', $6)
            RETURNING {}
            "#,
            PASS_COLUMNS
        );
        let row: PassRow = sqlx::query_as(&sql)
            .bind(pass.id)
            .bind(pass.user_id)
            .bind(pass.card_type_id)
            .bind(pass.total_entries)
            .bind(pass.expiry_date)
            .bind(payment_id)
            .fetch_one(&mut *tx)
            .await?;
        link_payment(&mut tx, payment_id, ItemType::Pass, row.id).await?;
        tx.commit().await?;

        Ok(LinkOutcome::Created(Entitlement::Pass(row.try_into()?)))
    }

    async fn insert_registration_within_capacity(
        &self,
        payment_id: Uuid,
        registration: NewRegistration,
        held_since: OffsetDateTime,
    ) -> BillingResult<LinkOutcome> {
        let mut tx = self.pool.begin().await?;
        if let Some(linked) = lock_payment_for_link(&mut tx, payment_id).await? {
            tx.rollback().await?;
            return Ok(linked);
        }

        // Serializes every seat decision for this event
        let event: Option<EventRow> = sqlx::query_as(
            "SELECT id, title, capacity, price_agorot, start_at, status \
             FROM events WHERE id = $1 FOR UPDATE",
        )
        .bind(registration.event_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(event) = event.map(EventInfo::try_from).transpose()? else {
            tx.rollback().await?;
            return Ok(LinkOutcome::Refused {
                reason: format!("event {} no longer exists", registration.event_id),
            });
        };
        if event.status == EventStatus::Cancelled {
            tx.rollback().await?;
            return Ok(LinkOutcome::Refused {
                reason: format!("event '{}' was cancelled", event.title),
            });
        }

        let (confirmed, held): (i64, i64) = sqlx::query_as(
            r#"
            SELECT
                (SELECT COUNT(*) FROM event_registrations
                 WHERE event_id = $1 AND status IN ('confirmed', 'attended')),
                (SELECT COUNT(*) FROM payments
                 WHERE status = 'pending'
                   AND metadata->'purchase'->>'event_id' = $2
                   AND created_at >= $3
                   AND id <> $4)
            "#,
        )
        .bind(event.id)
        .bind(event.id.to_string())
        .bind(held_since)
        .bind(payment_id)
        .fetch_one(&mut *tx)
        .await?;

        if confirmed + held + 1 > i64::from(event.capacity) {
            tx.rollback().await?;
            return Ok(LinkOutcome::Refused {
                reason: format!(
                    "event '{}' is full ({} confirmed, {} held, capacity {})",
                    event.title, confirmed, held, event.capacity
                ),
            });
        }

        let sql = format!(
            r#"
            INSERT INTO event_registrations (id, event_id, user_id, status, ticket_type, payment_id)
            VALUES ($1, $2, $3, 'confirmed', $4, $5)
            RETURNING {}
            "#,
            REGISTRATION_COLUMNS
        );
        let row: RegistrationRow = sqlx::query_as(&sql)
            .bind(registration.id)
            .bind(registration.event_id)
            .bind(registration.user_id)
            .bind(&registration.ticket_type)
            .bind(payment_id)
            .fetch_one(&mut *tx)
            .await?;
        link_payment(&mut tx, payment_id, ItemType::EventRegistration, row.id).await?;
        tx.commit().await?;

        Ok(LinkOutcome::Created(Entitlement::EventRegistration(
            row.try_into()?,
        )))
    }

    async fn get_entitlement(
        &self,
        item_type: ItemType,
        item_id: Uuid,
    ) -> BillingResult<Option<Entitlement>> {
        match item_type {
            ItemType::Pass => Ok(self.get_pass(item_id).await?.map(Entitlement::Pass)),
            ItemType::EventRegistration => {
                let sql = format!(
                    "SELECT {} FROM event_registrations WHERE id = $1",
                    REGISTRATION_COLUMNS
                );
                let row: Option<RegistrationRow> = sqlx::query_as(&sql)
                    .bind(item_id)
                    .fetch_optional(&self.pool)
                    .await?;
                row.map(|r| r.try_into().map(Entitlement::EventRegistration))
                    .transpose()
            }
        }
    }

    async fn get_pass(&self, id: Uuid) -> BillingResult<Option<Pass>> {
        let sql = format!("SELECT {} FROM passes WHERE id = $1", PASS_COLUMNS);
        let row: Option<PassRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Pass::try_from).transpose()
    }

    async fn redeem_pass_entry(
        &self,
        pass_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<RedeemOutcome> {
        let sql = format!(
            r#"
            UPDATE passes
            SET remaining_entries = remaining_entries - 1,
                status = CASE WHEN remaining_entries - 1 = 0 THEN 'depleted' ELSE status END
            WHERE id = $1
              AND status = 'active'
              AND remaining_entries > 0
              AND expiry_date >= $2
            RETURNING {}
            "#,
            PASS_COLUMNS
        );
        let redeemed: Option<PassRow> = sqlx::query_as(&sql)
            .bind(pass_id)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;
        if let Some(row) = redeemed {
            return Ok(RedeemOutcome::Redeemed(row.try_into()?));
        }

        // Nothing matched; report why
        let Some(pass) = self.get_pass(pass_id).await? else {
            return Ok(RedeemOutcome::NotFound);
        };
        Ok(match pass.status {
            PassStatus::Refunded => RedeemOutcome::Inactive,
            PassStatus::Depleted => RedeemOutcome::Depleted,
            PassStatus::Active if pass.remaining_entries <= 0 => RedeemOutcome::Depleted,
            PassStatus::Active => RedeemOutcome::Expired,
        })
    }

    async fn revoke_entitlement(&self, payment_id: Uuid) -> BillingResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE passes SET status = 'refunded' WHERE payment_id = $1")
            .bind(payment_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE event_registrations SET status = 'cancelled' WHERE payment_id = $1")
            .bind(payment_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn redeem_coupon(
        &self,
        coupon_id: Uuid,
        payment_id: Uuid,
    ) -> BillingResult<CouponRedemption> {
        let mut tx = self.pool.begin().await?;

        // Unique on payment_id: a concurrent call for the same payment blocks
        // here until the first commits, then sees the conflict
        let inserted: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO coupon_redemptions (coupon_id, payment_id)
            VALUES ($1, $2)
            ON CONFLICT (payment_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(coupon_id)
        .bind(payment_id)
        .fetch_optional(&mut *tx)
        .await?;
        if inserted.is_none() {
            tx.rollback().await?;
            return Ok(CouponRedemption::AlreadyRecorded);
        }

        // The row lock serializes redeemers of the coupon; each re-reads used_count
        let counted: Option<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE coupons
            SET used_count = used_count + 1
            WHERE id = $1
              AND (max_uses IS NULL OR used_count < max_uses)
            RETURNING id
            "#,
        )
        .bind(coupon_id)
        .fetch_optional(&mut *tx)
        .await?;
        if counted.is_none() {
            tx.rollback().await?;
            return Ok(CouponRedemption::Exhausted);
        }

        tx.commit().await?;
        Ok(CouponRedemption::Recorded)
    }

    async fn release_coupon_redemption(&self, payment_id: Uuid) -> BillingResult<bool> {
        let mut tx = self.pool.begin().await?;
        let released: Option<(Uuid,)> = sqlx::query_as(
            "DELETE FROM coupon_redemptions WHERE payment_id = $1 RETURNING coupon_id",
        )
        .bind(payment_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((coupon_id,)) = released else {
            tx.rollback().await?;
            return Ok(false);
        };
        sqlx::query(
            "UPDATE coupons SET used_count = used_count - 1 WHERE id = $1 AND used_count > 0",
        )
        .bind(coupon_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(true)
    }
}

#[async_trait]
impl WebhookLogStore for PgStore {
    async fn claim_webhook(
        &self,
        log: NewWebhookLog,
        stale_before: OffsetDateTime,
    ) -> BillingResult<WebhookClaim> {
        let headers = serde_json::to_value(&log.headers)?;
        // xmax = 0 only for freshly inserted tuples
        let sql = format!(
            r#"
            INSERT INTO webhook_logs
                (id, webhook_type, idempotency_key, payload, headers, status, retry_count,
                 processing_started_at, last_attempt_at)
            VALUES ($1, $2, $3, $4, $5, 'processing', 0, NOW(), NOW())
            ON CONFLICT (idempotency_key) DO UPDATE SET
                status = 'processing',
                retry_count = webhook_logs.retry_count + 1,
                payload = EXCLUDED.payload,
                headers = EXCLUDED.headers,
                processing_started_at = NOW(),
                last_attempt_at = NOW()
            WHERE webhook_logs.status = 'failed'
               OR (webhook_logs.status = 'processing'
                   AND webhook_logs.processing_started_at < $6)
            RETURNING {}, (xmax = 0) AS inserted
            "#,
            WEBHOOK_COLUMNS
        );
        let claimed: Option<ClaimRow> = sqlx::query_as(&sql)
            .bind(log.id)
            .bind(&log.webhook_type)
            .bind(&log.idempotency_key)
            .bind(&log.payload)
            .bind(headers)
            .bind(stale_before)
            .fetch_optional(&self.pool)
            .await?;

        if let Some(row) = claimed {
            let inserted = row.inserted;
            let log = WebhookLog::try_from(row.log)?;
            return Ok(if inserted {
                WebhookClaim::Claimed(log)
            } else {
                WebhookClaim::Reclaimed(log)
            });
        }

        let sql = format!(
            "SELECT {} FROM webhook_logs WHERE idempotency_key = $1",
            WEBHOOK_COLUMNS
        );
        let existing: WebhookRow = sqlx::query_as(&sql)
            .bind(&log.idempotency_key)
            .fetch_one(&self.pool)
            .await?;
        let existing = WebhookLog::try_from(existing)?;
        Ok(match existing.status {
            WebhookStatus::Completed => WebhookClaim::AlreadyCompleted(existing),
            WebhookStatus::Rejected => WebhookClaim::AlreadyRejected(existing),
            WebhookStatus::Processing | WebhookStatus::Failed => WebhookClaim::InProgress(existing),
        })
    }

    async fn complete_webhook(&self, id: Uuid, payment_id: Option<Uuid>) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE webhook_logs
            SET status = 'completed',
                completed_at = NOW(),
                error_message = NULL,
                payment_id = COALESCE($2, payment_id)
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(payment_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail_webhook(
        &self,
        id: Uuid,
        payment_id: Option<Uuid>,
        error: &str,
        retryable: bool,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE webhook_logs
            SET status = 'failed',
                error_message = $3,
                retryable = $4,
                last_attempt_at = NOW(),
                payment_id = COALESCE($2, payment_id)
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(payment_id)
        .bind(error)
        .bind(retryable)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reject_webhook(&self, id: Uuid, payment_id: Uuid, reason: &str) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE webhook_logs
            SET status = 'rejected',
                error_message = $3,
                retryable = FALSE,
                last_attempt_at = NOW(),
                completed_at = NOW(),
                payment_id = $2
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(payment_id)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_webhook(&self, id: Uuid) -> BillingResult<Option<WebhookLog>> {
        let sql = format!("SELECT {} FROM webhook_logs WHERE id = $1", WEBHOOK_COLUMNS);
        let row: Option<WebhookRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(WebhookLog::try_from).transpose()
    }

    async fn list_webhooks(
        &self,
        status: Option<WebhookStatus>,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<WebhookLog>> {
        let sql = format!(
            r#"
            SELECT {} FROM webhook_logs
            WHERE ($1::text IS NULL OR status = $1)
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            "#,
            WEBHOOK_COLUMNS
        );
        let rows: Vec<WebhookRow> = sqlx::query_as(&sql)
            .bind(status.map(|s| s.as_str()))
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;
        convert_all(rows)
    }

    async fn list_retry_candidates(
        &self,
        stale_before: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<WebhookLog>> {
        let sql = format!(
            r#"
            SELECT {} FROM webhook_logs
            WHERE (status = 'failed' AND retryable)
               OR (status = 'processing' AND processing_started_at < $1)
            ORDER BY last_attempt_at
            LIMIT $2
            "#,
            WEBHOOK_COLUMNS
        );
        let rows: Vec<WebhookRow> = sqlx::query_as(&sql)
            .bind(stale_before)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        convert_all(rows)
    }

    async fn reclaim_for_retry(
        &self,
        id: Uuid,
        stale_before: OffsetDateTime,
    ) -> BillingResult<Option<WebhookLog>> {
        let sql = format!(
            r#"
            UPDATE webhook_logs
            SET status = 'processing',
                retry_count = retry_count + 1,
                processing_started_at = NOW(),
                last_attempt_at = NOW()
            WHERE id = $1
              AND (status = 'failed'
                   OR (status = 'processing' AND processing_started_at < $2))
            RETURNING {}
            "#,
            WEBHOOK_COLUMNS
        );
        let row: Option<WebhookRow> = sqlx::query_as(&sql)
            .bind(id)
            .bind(stale_before)
            .fetch_optional(&self.pool)
            .await?;
        row.map(WebhookLog::try_from).transpose()
    }

    async fn mark_webhook_exhausted(&self, id: Uuid) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE webhook_logs
            SET status = 'failed',
                retryable = FALSE,
                error_message = 'retries exhausted; last error: ' || COALESCE(error_message, '')
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl RefundStore for PgStore {
    async fn insert_refund(&self, refund: NewRefund) -> BillingResult<Option<Refund>> {
        // The partial unique index allows one non-failed refund per payment
        let sql = format!(
            r#"
            INSERT INTO refunds (id, payment_id, refund_amount_agorot, status, reason, requested_by)
            VALUES ($1, $2, $3, 'pending', $4, $5)
            ON CONFLICT DO NOTHING
            RETURNING {}
            "#,
            REFUND_COLUMNS
        );
        let row: Option<RefundRow> = sqlx::query_as(&sql)
            .bind(refund.id)
            .bind(refund.payment_id)
            .bind(refund.amount)
            .bind(&refund.reason)
            .bind(&refund.requested_by)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Refund::try_from).transpose()
    }

    async fn finish_refund(
        &self,
        id: Uuid,
        status: RefundStatus,
        gateway_response: Option<Value>,
        error_message: Option<&str>,
    ) -> BillingResult<Refund> {
        let sql = format!(
            r#"
            UPDATE refunds
            SET status = $2,
                gateway_response = $3,
                error_message = $4,
                completed_at = CASE WHEN $2 = 'completed' THEN NOW() ELSE completed_at END
            WHERE id = $1
            RETURNING {}
            "#,
            REFUND_COLUMNS
        );
        let row: Option<RefundRow> = sqlx::query_as(&sql)
            .bind(id)
            .bind(status.as_str())
            .bind(gateway_response)
            .bind(error_message)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Refund::try_from)
            .transpose()?
            .ok_or_else(|| BillingError::NotFound(format!("refund {}", id)))
    }

    async fn list_refunds(&self, payment_id: Uuid) -> BillingResult<Vec<Refund>> {
        let sql = format!(
            "SELECT {} FROM refunds WHERE payment_id = $1 ORDER BY created_at",
            REFUND_COLUMNS
        );
        let rows: Vec<RefundRow> = sqlx::query_as(&sql)
            .bind(payment_id)
            .fetch_all(&self.pool)
            .await?;
        convert_all(rows)
    }
}

#[async_trait]
impl AuditStore for PgStore {
    async fn record_run(&self, run: &ReconciliationRun) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO reconciliation_runs
                (id, job, checked, updated, failed, skipped, details, started_at, finished_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(run.id)
        .bind(run.job.as_str())
        .bind(run.checked)
        .bind(run.updated)
        .bind(run.failed)
        .bind(run.skipped)
        .bind(&run.details)
        .bind(run.started_at)
        .bind(run.finished_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_alert(&self, alert: &OperatorAlert) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO operator_alerts (id, kind, severity, message, context, payment_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(alert.id)
        .bind(alert.kind.as_str())
        .bind(alert.severity.as_str())
        .bind(&alert.message)
        .bind(&alert.context)
        .bind(alert.payment_id)
        .bind(alert.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_alerts(&self, limit: i64) -> BillingResult<Vec<OperatorAlert>> {
        let rows: Vec<AlertRow> = sqlx::query_as(
            r#"
            SELECT id, kind, severity, message, context, payment_id, created_at
            FROM operator_alerts
            ORDER BY created_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }
}
