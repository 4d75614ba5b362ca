//! Pre-payment checks: seat capacity and coupon validity
//!
//! Both are recomputed from source rows on every call. Unexpired pending
//! payments count against seats and coupon uses alike. Both limits are
//! enforced again when the entitlement is materialized: capacity inside the
//! registration insert, coupon uses by the conditional `used_count` increment.
//! That closes the window between link creation and settlement.

use std::sync::Arc;

use serde::Serialize;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::catalog::{Coupon, DiscountType};
use crate::error::{BillingError, BillingResult};
use crate::payment::ItemType;
use crate::store::Store;

/// How long an unpaid checkout keeps its seat
pub const DEFAULT_HOLD_WINDOW: Duration = Duration::minutes(15);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum CouponError {
    #[error("coupon not found")]
    NotFound,
    #[error("coupon expired or not yet valid")]
    Expired,
    #[error("coupon usage limit reached")]
    Exhausted,
    #[error("coupon does not apply to this item")]
    NotApplicable,
    #[error("order total is below the coupon minimum of {minimum} agorot")]
    BelowMinimum { minimum: i64 },
}

/// Outcome of counting a payment against its coupon's usage limit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CouponRedemption {
    Recorded,
    /// This payment was already counted
    AlreadyRecorded,
    /// `used_count` had reached `max_uses`; nothing was counted
    Exhausted,
}

#[derive(Debug, Clone, Serialize)]
pub struct CapacityCheck {
    pub event_id: Uuid,
    pub capacity: i64,
    pub confirmed: i64,
    pub held: i64,
    pub available: i64,
}

#[derive(Clone)]
pub struct CapacityGuard {
    store: Arc<dyn Store>,
    hold_window: Duration,
}

impl CapacityGuard {
    pub fn new(store: Arc<dyn Store>, hold_window: Duration) -> Self {
        Self { store, hold_window }
    }

    pub fn hold_window(&self) -> Duration {
        self.hold_window
    }

    /// `capacity - confirmed - unexpired holds`, never below zero
    pub async fn check_capacity(
        &self,
        event_id: Uuid,
        excluding_payment: Option<Uuid>,
    ) -> BillingResult<CapacityCheck> {
        let event = self
            .store
            .get_event(event_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("event {}", event_id)))?;

        let confirmed = self.store.count_confirmed_registrations(event_id).await?;
        let held_since = OffsetDateTime::now_utc() - self.hold_window;
        let held = self
            .store
            .count_pending_holds(event_id, held_since, excluding_payment)
            .await?;

        let capacity = i64::from(event.capacity);
        Ok(CapacityCheck {
            event_id,
            capacity,
            confirmed,
            held,
            available: (capacity - confirmed - held).max(0),
        })
    }

    /// Fail fast with `SoldOut` when fewer than `seats` remain
    pub async fn ensure_available(&self, event_id: Uuid, seats: i64) -> BillingResult<CapacityCheck> {
        let check = self.check_capacity(event_id, None).await?;
        if check.available < seats {
            tracing::info!(
                event_id = %event_id,
                available = check.available,
                requested = seats,
                "Event sold out"
            );
            return Err(BillingError::SoldOut {
                event_id,
                available: check.available,
            });
        }
        Ok(check)
    }
}

/// Priced result of applying a coupon
#[derive(Debug, Clone, Serialize)]
pub struct CouponQuote {
    pub coupon_id: Uuid,
    pub code: String,
    pub discount_type: DiscountType,
    pub valid: bool,
    pub original_amount: i64,
    pub discount_amount: i64,
    pub final_amount: i64,
}

impl CouponQuote {
    /// Nothing left to charge; the purchase takes the zero-payment path
    pub fn is_free(&self) -> bool {
        self.final_amount == 0
    }
}

/// Discount in agorot for `amount`, never more than `amount`
pub fn discount_for(coupon: &Coupon, amount: i64) -> i64 {
    let discount = match coupon.discount_type {
        DiscountType::Percentage => amount * coupon.discount_value.clamp(0, 100) / 100,
        DiscountType::Fixed => coupon.discount_value.max(0),
        DiscountType::Free => amount,
    };
    discount.min(amount)
}

#[derive(Clone)]
pub struct CouponGuard {
    store: Arc<dyn Store>,
    hold_window: Duration,
}

impl CouponGuard {
    pub fn new(store: Arc<dyn Store>, hold_window: Duration) -> Self {
        Self { store, hold_window }
    }

    pub async fn validate_coupon(
        &self,
        code: &str,
        item_type: ItemType,
        amount: i64,
    ) -> BillingResult<CouponQuote> {
        let code = code.trim();
        let coupon = match self.store.get_coupon_by_code(code).await? {
            Some(c) if c.is_active => c,
            _ => return Err(CouponError::NotFound.into()),
        };
        let now = OffsetDateTime::now_utc();
        let quote = quote(&coupon, item_type, amount, now)?;

        if let Some(max_uses) = coupon.max_uses {
            let held = self
                .store
                .count_coupon_holds(&coupon.code, now - self.hold_window)
                .await?;
            if i64::from(coupon.used_count) + held >= i64::from(max_uses) {
                tracing::info!(
                    coupon = %coupon.code,
                    used = coupon.used_count,
                    held,
                    max_uses,
                    "Coupon uses taken by pending checkouts"
                );
                return Err(CouponError::Exhausted.into());
            }
        }
        Ok(quote)
    }
}

/// Pure coupon rules, evaluated against the row as read
pub fn quote(
    coupon: &Coupon,
    item_type: ItemType,
    amount: i64,
    now: OffsetDateTime,
) -> Result<CouponQuote, CouponError> {
    if coupon.valid_from.is_some_and(|from| now < from)
        || coupon.valid_until.is_some_and(|until| now > until)
    {
        return Err(CouponError::Expired);
    }
    if coupon.max_uses.is_some_and(|max| coupon.used_count >= max) {
        return Err(CouponError::Exhausted);
    }
    if !coupon.applies_to_item(item_type) {
        return Err(CouponError::NotApplicable);
    }
    if let Some(minimum) = coupon.min_amount {
        if amount < minimum {
            return Err(CouponError::BelowMinimum { minimum });
        }
    }

    let discount_amount = discount_for(coupon, amount);
    Ok(CouponQuote {
        coupon_id: coupon.id,
        code: coupon.code.clone(),
        discount_type: coupon.discount_type,
        valid: true,
        original_amount: amount,
        discount_amount,
        final_amount: amount - discount_amount,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn coupon(discount_type: DiscountType, value: i64) -> Coupon {
        Coupon {
            id: Uuid::new_v4(),
            code: "SUMMER".to_string(),
            discount_type,
            discount_value: value,
            applies_to: vec![],
            min_amount: None,
            max_uses: None,
            used_count: 0,
            valid_from: None,
            valid_until: None,
            is_active: true,
        }
    }

    const NOW: OffsetDateTime = datetime!(2026-07-01 12:00 UTC);

    #[test]
    fn percentage_rounds_discount_down() {
        let q = quote(&coupon(DiscountType::Percentage, 15), ItemType::Pass, 32_099, NOW).unwrap();
        assert_eq!(q.discount_amount, 4_814);
        assert_eq!(q.final_amount, 27_285);
    }

    #[test]
    fn fixed_discount_never_goes_negative() {
        let q = quote(&coupon(DiscountType::Fixed, 50_000), ItemType::Pass, 32_000, NOW).unwrap();
        assert_eq!(q.final_amount, 0);
        assert!(q.is_free());
    }

    #[test]
    fn free_coupon_zeroes_the_price() {
        let q = quote(&coupon(DiscountType::Free, 0), ItemType::EventRegistration, 6_000, NOW)
            .unwrap();
        assert_eq!(q.discount_amount, 6_000);
        assert!(q.is_free());
    }

    #[test]
    fn rule_failures_are_typed() {
        let mut c = coupon(DiscountType::Percentage, 10);
        c.valid_until = Some(datetime!(2026-06-30 23:59 UTC));
        assert_eq!(quote(&c, ItemType::Pass, 100, NOW).unwrap_err(), CouponError::Expired);

        let mut c = coupon(DiscountType::Percentage, 10);
        c.max_uses = Some(3);
        c.used_count = 3;
        assert_eq!(quote(&c, ItemType::Pass, 100, NOW).unwrap_err(), CouponError::Exhausted);

        let mut c = coupon(DiscountType::Percentage, 10);
        c.applies_to = vec![ItemType::EventRegistration];
        assert_eq!(
            quote(&c, ItemType::Pass, 100, NOW).unwrap_err(),
            CouponError::NotApplicable
        );

        let mut c = coupon(DiscountType::Percentage, 10);
        c.min_amount = Some(10_000);
        assert_eq!(
            quote(&c, ItemType::Pass, 9_999, NOW).unwrap_err(),
            CouponError::BelowMinimum { minimum: 10_000 }
        );
    }
}
