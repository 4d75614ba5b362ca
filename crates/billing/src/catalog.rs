//! Read-side catalog rows the billing core consults
//!
//! Card types, events and coupons are owned by the venue admin surface; this
//! crate only reads them (and bumps coupon usage on redemption).

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingError;
use crate::payment::ItemType;

/// A purchasable punch-card (e.g. "10 entries")
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CardType {
    pub id: Uuid,
    pub name: String,
    pub entries: i32,
    /// Price in agorot
    pub price: i64,
    /// Overrides the default pass validity window when set
    pub validity_months: Option<i32>,
    pub is_active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Draft,
    Published,
    Cancelled,
    Completed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Draft => "draft",
            EventStatus::Published => "published",
            EventStatus::Cancelled => "cancelled",
            EventStatus::Completed => "completed",
        }
    }
}

impl FromStr for EventStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(EventStatus::Draft),
            "published" => Ok(EventStatus::Published),
            "cancelled" => Ok(EventStatus::Cancelled),
            "completed" => Ok(EventStatus::Completed),
            other => Err(BillingError::InvalidInput(format!(
                "unknown event status '{}'",
                other
            ))),
        }
    }
}

/// Workshop or show with a seat limit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventInfo {
    pub id: Uuid,
    pub title: String,
    pub capacity: i32,
    /// Ticket price in agorot
    pub price: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub start_at: OffsetDateTime,
    pub status: EventStatus,
}

impl EventInfo {
    pub fn is_open_for_sale(&self, now: OffsetDateTime) -> bool {
        self.status == EventStatus::Published && self.start_at > now
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscountType {
    /// `discount_value` is a whole percentage (0..=100)
    Percentage,
    /// `discount_value` is an amount in agorot
    Fixed,
    /// Whole price waived; the purchase takes the zero-payment path
    Free,
}

impl DiscountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscountType::Percentage => "percentage",
            DiscountType::Fixed => "fixed",
            DiscountType::Free => "free",
        }
    }
}

impl FromStr for DiscountType {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "percentage" => Ok(DiscountType::Percentage),
            "fixed" => Ok(DiscountType::Fixed),
            "free" => Ok(DiscountType::Free),
            other => Err(BillingError::InvalidInput(format!(
                "unknown discount type '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Coupon {
    pub id: Uuid,
    pub code: String,
    pub discount_type: DiscountType,
    pub discount_value: i64,
    /// Empty means the coupon applies to every item type
    pub applies_to: Vec<ItemType>,
    pub min_amount: Option<i64>,
    pub max_uses: Option<i32>,
    pub used_count: i32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub valid_from: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub valid_until: Option<OffsetDateTime>,
    pub is_active: bool,
}

impl Coupon {
    pub fn applies_to_item(&self, item_type: ItemType) -> bool {
        self.applies_to.is_empty() || self.applies_to.contains(&item_type)
    }
}
