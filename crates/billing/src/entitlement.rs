//! Entitlement materialization
//!
//! Turns a completed payment into exactly one pass or event registration and
//! links it back to the payment. The store performs "insert entitlement + set
//! `item_id`" as one atomic step that is a no-op when the payment is already
//! linked, which is what makes webhook retries and scheduler repairs safe.

use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::{Date, Duration, Month, OffsetDateTime};
use uuid::Uuid;

use crate::alerts::{AlertKind, AlertService, AlertSeverity};
use crate::catalog::CardType;
use crate::error::{BillingError, BillingResult};
use crate::guard::CouponRedemption;
use crate::payment::{meta_keys, ItemType, PaymentMetadata, PaymentRecord, PaymentStatus, Purchase};
use crate::store::Store;

/// Default ticket type when the purchase does not name one
pub const DEFAULT_TICKET_TYPE: &str = "regular";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassStatus {
    Active,
    Depleted,
    Refunded,
}

impl PassStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PassStatus::Active => "active",
            PassStatus::Depleted => "depleted",
            PassStatus::Refunded => "refunded",
        }
    }
}

impl FromStr for PassStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(PassStatus::Active),
            "depleted" => Ok(PassStatus::Depleted),
            "refunded" => Ok(PassStatus::Refunded),
            other => Err(BillingError::InvalidInput(format!(
                "unknown pass status '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pass {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub card_type_id: Uuid,
    pub total_entries: i32,
    pub remaining_entries: i32,
    #[serde(with = "time::serde::rfc3339")]
    pub expiry_date: OffsetDateTime,
    pub status: PassStatus,
    pub payment_id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationStatus {
    Pending,
    Confirmed,
    Cancelled,
    Attended,
}

impl RegistrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistrationStatus::Pending => "pending",
            RegistrationStatus::Confirmed => "confirmed",
            RegistrationStatus::Cancelled => "cancelled",
            RegistrationStatus::Attended => "attended",
        }
    }

    /// Statuses that occupy a seat
    pub fn holds_seat(&self) -> bool {
        matches!(
            self,
            RegistrationStatus::Confirmed | RegistrationStatus::Attended
        )
    }
}

impl FromStr for RegistrationStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RegistrationStatus::Pending),
            "confirmed" => Ok(RegistrationStatus::Confirmed),
            "cancelled" => Ok(RegistrationStatus::Cancelled),
            "attended" => Ok(RegistrationStatus::Attended),
            other => Err(BillingError::InvalidInput(format!(
                "unknown registration status '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRegistration {
    pub id: Uuid,
    pub event_id: Uuid,
    pub user_id: Option<Uuid>,
    pub status: RegistrationStatus,
    pub ticket_type: String,
    pub payment_id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Entitlement {
    Pass(Pass),
    EventRegistration(EventRegistration),
}

impl Entitlement {
    pub fn id(&self) -> Uuid {
        match self {
            Entitlement::Pass(p) => p.id,
            Entitlement::EventRegistration(r) => r.id,
        }
    }

    pub fn item_type(&self) -> ItemType {
        match self {
            Entitlement::Pass(_) => ItemType::Pass,
            Entitlement::EventRegistration(_) => ItemType::EventRegistration,
        }
    }

    pub fn payment_id(&self) -> Uuid {
        match self {
            Entitlement::Pass(p) => p.payment_id,
            Entitlement::EventRegistration(r) => r.payment_id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewPass {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub card_type_id: Uuid,
    pub total_entries: i32,
    pub expiry_date: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct NewRegistration {
    pub id: Uuid,
    pub event_id: Uuid,
    pub user_id: Option<Uuid>,
    pub ticket_type: String,
}

/// Result of the store's atomic "insert and link" step
#[derive(Debug, Clone)]
pub enum LinkOutcome {
    Created(Entitlement),
    AlreadyLinked(Entitlement),
    /// The entitlement cannot be granted (capacity gone, event cancelled)
    Refused { reason: String },
}

/// Result of the store's atomic entry decrement
#[derive(Debug, Clone)]
pub enum RedeemOutcome {
    Redeemed(Pass),
    Depleted,
    Expired,
    Inactive,
    NotFound,
}

/// Single source of truth for how long a pass stays valid
#[derive(Debug, Clone, Copy)]
pub struct PassValidityPolicy {
    pub default_months: i32,
}

impl Default for PassValidityPolicy {
    fn default() -> Self {
        Self { default_months: 3 }
    }
}

impl PassValidityPolicy {
    pub fn expiry_for(
        &self,
        card_type: &CardType,
        from: OffsetDateTime,
    ) -> BillingResult<OffsetDateTime> {
        let months = card_type.validity_months.unwrap_or(self.default_months);
        add_months(from, months)
    }
}

/// Calendar month arithmetic, clamping to the last day of the target month
pub fn add_months(at: OffsetDateTime, months: i32) -> BillingResult<OffsetDateTime> {
    let date = at.date();
    let index = date.year() * 12 + (u8::from(date.month()) as i32 - 1) + months;
    let year = index.div_euclid(12);
    let month = Month::try_from((index.rem_euclid(12) + 1) as u8)
        .map_err(|e| BillingError::InvalidInput(format!("month out of range: {}", e)))?;
    let day = date.day().min(time::util::days_in_year_month(year, month));
    let target = Date::from_calendar_date(year, month, day)
        .map_err(|e| BillingError::InvalidInput(format!("date out of range: {}", e)))?;
    Ok(at.replace_date(target))
}

/// Creates entitlements for completed payments
#[derive(Clone)]
pub struct EntitlementMaterializer {
    store: Arc<dyn Store>,
    alerts: AlertService,
    validity: PassValidityPolicy,
    hold_window: Duration,
}

impl EntitlementMaterializer {
    pub fn new(
        store: Arc<dyn Store>,
        alerts: AlertService,
        validity: PassValidityPolicy,
        hold_window: Duration,
    ) -> Self {
        Self {
            store,
            alerts,
            validity,
            hold_window,
        }
    }

    /// Materialize the entitlement a completed payment grants
    ///
    /// Safe to call repeatedly: a payment that already carries an `item_id`
    /// returns the linked entitlement without creating anything.
    pub async fn materialize(&self, payment: &PaymentRecord) -> BillingResult<Entitlement> {
        if payment.status != PaymentStatus::Completed {
            return Err(BillingError::InvalidInput(format!(
                "payment {} is {}, only completed payments are materialized",
                payment.id, payment.status
            )));
        }

        if let Some(existing) = self.linked_entitlement(payment).await? {
            return Ok(existing);
        }

        // Already routed to a human; do not grant it behind their back
        if payment.metadata.manual_refund_required() {
            let reason = payment
                .metadata
                .str_field(meta_keys::MANUAL_REFUND_REASON)?
                .unwrap_or("flagged for manual refund")
                .to_string();
            return Err(BillingError::MaterializationConflict {
                payment_id: payment.id,
                reason,
            });
        }

        let purchase = payment.metadata.purchase()?;
        let now = OffsetDateTime::now_utc();

        if let Some(reason) = self.redeem_coupon(payment).await? {
            self.route_to_manual_refund(payment, AlertKind::CouponExhausted, &reason)
                .await?;
            return Err(BillingError::MaterializationConflict {
                payment_id: payment.id,
                reason,
            });
        }

        let outcome = match &purchase {
            Purchase::Pass { card_type_id } => {
                match self.store.get_card_type(*card_type_id).await? {
                    Some(card_type) => {
                        let pass = NewPass {
                            id: Uuid::new_v4(),
                            user_id: payment.user_id,
                            card_type_id: card_type.id,
                            total_entries: card_type.entries,
                            expiry_date: self.validity.expiry_for(&card_type, now)?,
                        };
                        self.store.insert_pass_linked(payment.id, pass).await?
                    }
                    None => LinkOutcome::Refused {
                        reason: format!("card type {} no longer exists", card_type_id),
                    },
                }
            }
            Purchase::EventTicket {
                event_id,
                ticket_type,
            } => {
                let registration = NewRegistration {
                    id: Uuid::new_v4(),
                    event_id: *event_id,
                    user_id: payment.user_id,
                    ticket_type: ticket_type.clone(),
                };
                self.store
                    .insert_registration_within_capacity(
                        payment.id,
                        registration,
                        now - self.hold_window,
                    )
                    .await?
            }
        };

        match outcome {
            LinkOutcome::Created(entitlement) => {
                tracing::info!(
                    payment_id = %payment.id,
                    item_type = entitlement.item_type().as_str(),
                    item_id = %entitlement.id(),
                    "Entitlement materialized"
                );
                Ok(entitlement)
            }
            LinkOutcome::AlreadyLinked(entitlement) => {
                tracing::info!(
                    payment_id = %payment.id,
                    item_id = %entitlement.id(),
                    "Entitlement already linked by a concurrent writer"
                );
                Ok(entitlement)
            }
            LinkOutcome::Refused { reason } => {
                self.release_coupon(payment).await;
                self.route_to_manual_refund(payment, AlertKind::MaterializationConflict, &reason)
                    .await?;
                Err(BillingError::MaterializationConflict {
                    payment_id: payment.id,
                    reason,
                })
            }
        }
    }

    async fn linked_entitlement(&self, payment: &PaymentRecord) -> BillingResult<Option<Entitlement>> {
        match (payment.item_type, payment.item_id) {
            (Some(item_type), Some(item_id)) => {
                let entitlement = self
                    .store
                    .get_entitlement(item_type, item_id)
                    .await?
                    .ok_or_else(|| {
                        BillingError::NotFound(format!(
                            "{} {} linked from payment {}",
                            item_type.as_str(),
                            item_id,
                            payment.id
                        ))
                    })?;
                Ok(Some(entitlement))
            }
            _ => Ok(None),
        }
    }

    /// Count the payment against its coupon before anything is granted
    ///
    /// Keyed by payment, so replays never double count. Returns the refusal
    /// reason when the coupon has no uses left.
    async fn redeem_coupon(&self, payment: &PaymentRecord) -> BillingResult<Option<String>> {
        let Some(code) = payment.metadata.coupon_code()? else {
            return Ok(None);
        };
        let coupon = self
            .store
            .get_coupon_by_code(code)
            .await?
            .ok_or_else(|| BillingError::Metadata(format!("coupon '{}' not found", code)))?;

        match self.store.redeem_coupon(coupon.id, payment.id).await? {
            CouponRedemption::Recorded => {
                tracing::info!(payment_id = %payment.id, coupon = %code, "Coupon redemption recorded");
                Ok(None)
            }
            CouponRedemption::AlreadyRecorded => Ok(None),
            CouponRedemption::Exhausted => {
                tracing::warn!(
                    payment_id = %payment.id,
                    coupon = %code,
                    max_uses = ?coupon.max_uses,
                    "Coupon usage limit reached before settlement"
                );
                Ok(Some(format!("coupon '{}' reached its usage limit", code)))
            }
        }
    }

    async fn release_coupon(&self, payment: &PaymentRecord) {
        match self.store.release_coupon_redemption(payment.id).await {
            Ok(true) => tracing::info!(payment_id = %payment.id, "Coupon use released"),
            Ok(false) => {}
            Err(e) => tracing::error!(
                payment_id = %payment.id,
                error = %e,
                "Failed to release coupon use for a refused entitlement"
            ),
        }
    }

    async fn route_to_manual_refund(
        &self,
        payment: &PaymentRecord,
        kind: AlertKind,
        reason: &str,
    ) -> BillingResult<()> {
        if payment.metadata.manual_refund_required() {
            return Ok(());
        }

        let flag = PaymentMetadata::new()
            .with(meta_keys::MANUAL_REFUND_REQUIRED, true)
            .with(meta_keys::MANUAL_REFUND_REASON, reason);
        self.store.annotate_payment(payment.id, flag).await?;

        tracing::error!(
            payment_id = %payment.id,
            amount = payment.amount,
            reason = %reason,
            "Entitlement refused after settlement - payment flagged for manual refund"
        );

        self.alerts
            .raise(
                kind,
                AlertSeverity::Critical,
                format!(
                    "Payment {} settled but its entitlement was refused: {}",
                    payment.id, reason
                ),
                Some(payment.id),
                serde_json::json!({
                    "amount": payment.amount,
                    "currency": payment.currency,
                    "user_id": payment.user_id,
                }),
            )
            .await;
        Ok(())
    }
}

/// Entry redemption at the front desk
#[derive(Clone)]
pub struct PassService {
    store: Arc<dyn Store>,
}

impl PassService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Use one entry; never drives `remaining_entries` below zero
    pub async fn redeem_entry(&self, pass_id: Uuid) -> BillingResult<Pass> {
        match self
            .store
            .redeem_pass_entry(pass_id, OffsetDateTime::now_utc())
            .await?
        {
            RedeemOutcome::Redeemed(pass) => {
                tracing::info!(
                    pass_id = %pass.id,
                    remaining = pass.remaining_entries,
                    "Pass entry redeemed"
                );
                Ok(pass)
            }
            RedeemOutcome::Depleted => Err(BillingError::PassDepleted),
            RedeemOutcome::Expired => Err(BillingError::PassExpired),
            RedeemOutcome::Inactive => Err(BillingError::PassInactive),
            RedeemOutcome::NotFound => Err(BillingError::NotFound(format!("pass {}", pass_id))),
        }
    }

    pub async fn get_pass(&self, pass_id: Uuid) -> BillingResult<Pass> {
        self.store
            .get_pass(pass_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("pass {}", pass_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn card(validity_months: Option<i32>) -> CardType {
        CardType {
            id: Uuid::new_v4(),
            name: "10 entries".to_string(),
            entries: 10,
            price: 32_000,
            validity_months,
            is_active: true,
        }
    }

    #[test]
    fn default_validity_is_three_months() {
        let from = datetime!(2026-01-15 10:00 UTC);
        let expiry = PassValidityPolicy::default().expiry_for(&card(None), from).unwrap();
        assert_eq!(expiry, datetime!(2026-04-15 10:00 UTC));
    }

    #[test]
    fn card_type_override_wins() {
        let from = datetime!(2026-01-15 10:00 UTC);
        let expiry = PassValidityPolicy::default()
            .expiry_for(&card(Some(6)), from)
            .unwrap();
        assert_eq!(expiry, datetime!(2026-07-15 10:00 UTC));
    }

    #[test]
    fn month_end_is_clamped() {
        let expiry = add_months(datetime!(2025-11-30 09:00 UTC), 3).unwrap();
        assert_eq!(expiry, datetime!(2026-02-28 09:00 UTC));
    }

    #[test]
    fn year_rollover() {
        let expiry = add_months(datetime!(2026-11-01 00:00 UTC), 3).unwrap();
        assert_eq!(expiry, datetime!(2027-02-01 00:00 UTC));
    }

    #[test]
    fn only_confirmed_and_attended_hold_seats() {
        assert!(RegistrationStatus::Confirmed.holds_seat());
        assert!(RegistrationStatus::Attended.holds_seat());
        assert!(!RegistrationStatus::Cancelled.holds_seat());
        assert!(!RegistrationStatus::Pending.holds_seat());
    }
}
