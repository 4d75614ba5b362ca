//! Payment records and their state machine
//!
//! A payment is created `pending` at checkout time and moves exactly once into
//! a settled state. The only legal edges are:
//!
//! ```text
//! pending ──► completed ──► refunded
//!    │
//!    └──────► failed
//! ```
//!
//! Every store implementation applies a transition as a single conditional
//! update keyed on the current status, so concurrent writers (webhook, sync
//! job, manual verification) cannot both win.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

pub const DEFAULT_CURRENCY: &str = "ILS";

/// Metadata keys shared between writers and readers
pub mod meta_keys {
    pub const PURCHASE: &str = "purchase";
    pub const COUPON_CODE: &str = "coupon_code";
    pub const ORIGINAL_AMOUNT: &str = "original_amount";
    pub const DISCOUNT_AMOUNT: &str = "discount_amount";
    pub const CUSTOMER_EMAIL: &str = "customer_email";
    pub const CUSTOMER_NAME: &str = "customer_name";
    pub const SETTLED_BY: &str = "settled_by";
    pub const STATUS_CODE: &str = "gateway_status_code";
    pub const FAILURE_REASON: &str = "failure_reason";
    pub const MANUAL_REFUND_REQUIRED: &str = "manual_refund_required";
    pub const MANUAL_REFUND_REASON: &str = "manual_refund_reason";
    pub const STUCK_FLAGGED_AT: &str = "stuck_flagged_at";
    pub const RECORDED_BY: &str = "recorded_by";
    pub const REFUNDED_AT: &str = "refunded_at";
}

/// Render agorot as a decimal shekel string ("320.00")
pub fn format_major_units(agorot: i64) -> String {
    let sign = if agorot < 0 { "-" } else { "" };
    let abs = agorot.unsigned_abs();
    format!("{}{}.{:02}", sign, abs / 100, abs % 100)
}

/// Parse a gateway decimal amount ("320", "320.5", "320.00") into agorot
///
/// Works on the textual form so no float rounding is involved. More than two
/// fractional digits is rejected rather than truncated.
pub fn parse_major_units(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    let (negative, digits) = match raw.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, raw),
    };
    let (whole, frac) = match digits.split_once('.') {
        Some((w, f)) => (w, f),
        None => (digits, ""),
    };
    if whole.is_empty() || frac.len() > 2 {
        return None;
    }
    if !whole.bytes().all(|b| b.is_ascii_digit()) || !frac.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let whole: i64 = whole.parse().ok()?;
    let frac: i64 = match frac.len() {
        0 => 0,
        1 => frac.parse::<i64>().ok()? * 10,
        _ => frac.parse().ok()?,
    };
    let value = whole.checked_mul(100)?.checked_add(frac)?;
    Some(if negative { -value } else { value })
}

/// Amount field that may arrive as a JSON number or a string
pub fn amount_from_json(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => parse_major_units(&n.to_string()),
        Value::String(s) => parse_major_units(s),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
        }
    }

    /// The single predecessor from which `self` may be entered
    pub fn predecessor(&self) -> Option<PaymentStatus> {
        match self {
            PaymentStatus::Pending => None,
            PaymentStatus::Completed | PaymentStatus::Failed => Some(PaymentStatus::Pending),
            PaymentStatus::Refunded => Some(PaymentStatus::Completed),
        }
    }

    pub fn can_transition_to(&self, to: PaymentStatus) -> bool {
        to.predecessor() == Some(*self)
    }

    /// Settled payments never return to `pending`
    pub fn is_settled(&self) -> bool {
        !matches!(self, PaymentStatus::Pending)
    }

    /// Classify a rejected transition attempt
    pub fn rejection(&self) -> TransitionRejection {
        if self.is_settled() {
            TransitionRejection::AlreadyTerminal
        } else {
            TransitionRejection::InvalidTransition
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PaymentStatus::Pending),
            "completed" => Ok(PaymentStatus::Completed),
            "failed" => Ok(PaymentStatus::Failed),
            "refunded" => Ok(PaymentStatus::Refunded),
            other => Err(BillingError::InvalidInput(format!(
                "unknown payment status '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionRejection {
    AlreadyTerminal,
    InvalidTransition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentType {
    OnlineCard,
    PosCash,
    PosCredit,
    PosBit,
    PosOther,
    FreeCoupon,
}

impl PaymentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentType::OnlineCard => "online_card",
            PaymentType::PosCash => "pos_cash",
            PaymentType::PosCredit => "pos_credit",
            PaymentType::PosBit => "pos_bit",
            PaymentType::PosOther => "pos_other",
            PaymentType::FreeCoupon => "free_coupon",
        }
    }

    pub fn is_pos(&self) -> bool {
        matches!(
            self,
            PaymentType::PosCash | PaymentType::PosCredit | PaymentType::PosBit | PaymentType::PosOther
        )
    }

    /// Only card payments move money through the gateway
    pub fn uses_gateway(&self) -> bool {
        matches!(self, PaymentType::OnlineCard)
    }
}

impl fmt::Display for PaymentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentType {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online_card" => Ok(PaymentType::OnlineCard),
            "pos_cash" => Ok(PaymentType::PosCash),
            "pos_credit" => Ok(PaymentType::PosCredit),
            "pos_bit" => Ok(PaymentType::PosBit),
            "pos_other" => Ok(PaymentType::PosOther),
            "free_coupon" => Ok(PaymentType::FreeCoupon),
            other => Err(BillingError::InvalidInput(format!(
                "unknown payment type '{}'",
                other
            ))),
        }
    }
}

/// Kind of entitlement a payment links to once materialized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    Pass,
    EventRegistration,
}

impl ItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemType::Pass => "pass",
            ItemType::EventRegistration => "event_registration",
        }
    }
}

impl FromStr for ItemType {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pass" => Ok(ItemType::Pass),
            "event_registration" => Ok(ItemType::EventRegistration),
            other => Err(BillingError::InvalidInput(format!(
                "unknown item type '{}'",
                other
            ))),
        }
    }
}

/// What the customer is buying
///
/// Stored under the `purchase` metadata key. Adding an entitlement kind means
/// adding a variant here and handling it in the materializer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Purchase {
    Pass {
        card_type_id: Uuid,
    },
    EventTicket {
        event_id: Uuid,
        #[serde(default = "default_ticket_type")]
        ticket_type: String,
    },
}

fn default_ticket_type() -> String {
    crate::entitlement::DEFAULT_TICKET_TYPE.to_string()
}

impl Purchase {
    pub fn item_type(&self) -> ItemType {
        match self {
            Purchase::Pass { .. } => ItemType::Pass,
            Purchase::EventTicket { .. } => ItemType::EventRegistration,
        }
    }

    pub fn event_id(&self) -> Option<Uuid> {
        match self {
            Purchase::EventTicket { event_id, .. } => Some(*event_id),
            Purchase::Pass { .. } => None,
        }
    }
}

/// Schemaless metadata bag attached to a payment
///
/// Writers insert freely; readers go through the typed accessors, which fail
/// closed with [`BillingError::Metadata`] instead of assuming a field exists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PaymentMetadata(Map<String, Value>);

impl PaymentMetadata {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn from_value(value: Value) -> BillingResult<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            Value::Null => Ok(Self::new()),
            other => Err(BillingError::Metadata(format!(
                "expected a JSON object, got {}",
                other
            ))),
        }
    }

    pub fn with_purchase(mut self, purchase: &Purchase) -> BillingResult<Self> {
        self.0
            .insert(meta_keys::PURCHASE.to_string(), serde_json::to_value(purchase)?);
        Ok(self)
    }

    pub fn insert(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Right-biased merge; keys in `other` win
    pub fn merge(&mut self, other: &PaymentMetadata) {
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), v.clone());
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn purchase(&self) -> BillingResult<Purchase> {
        let raw = self.0.get(meta_keys::PURCHASE).ok_or_else(|| {
            BillingError::Metadata(format!("missing '{}'", meta_keys::PURCHASE))
        })?;
        serde_json::from_value(raw.clone()).map_err(|e| {
            BillingError::Metadata(format!("invalid '{}': {}", meta_keys::PURCHASE, e))
        })
    }

    /// Optional string field; present-but-not-a-string is an error
    pub fn str_field(&self, key: &str) -> BillingResult<Option<&str>> {
        match self.0.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.as_str())),
            Some(other) => Err(BillingError::Metadata(format!(
                "'{}' must be a string, got {}",
                key, other
            ))),
        }
    }

    pub fn coupon_code(&self) -> BillingResult<Option<&str>> {
        self.str_field(meta_keys::COUPON_CODE)
    }

    pub fn manual_refund_required(&self) -> bool {
        matches!(
            self.0.get(meta_keys::MANUAL_REFUND_REQUIRED),
            Some(Value::Bool(true))
        )
    }

    pub fn as_value(&self) -> Value {
        Value::Object(self.0.clone())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentRecord {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    /// Amount in agorot (minor units)
    pub amount: i64,
    pub currency: String,
    pub payment_type: PaymentType,
    pub status: PaymentStatus,
    pub item_type: Option<ItemType>,
    pub item_id: Option<Uuid>,
    pub metadata: PaymentMetadata,
    pub transaction_uid: Option<String>,
    /// Identifier the gateway assigned to the hosted payment page
    pub gateway_correlation_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
}

impl PaymentRecord {
    pub fn is_materialized(&self) -> bool {
        self.item_id.is_some()
    }

    pub fn age(&self, now: OffsetDateTime) -> time::Duration {
        now - self.created_at
    }
}

/// Input for creating a pending payment
#[derive(Debug, Clone)]
pub struct NewPayment {
    pub user_id: Option<Uuid>,
    pub amount: i64,
    pub currency: String,
    pub payment_type: PaymentType,
    pub metadata: PaymentMetadata,
}

impl NewPayment {
    pub fn new(
        user_id: Option<Uuid>,
        amount: i64,
        payment_type: PaymentType,
        metadata: PaymentMetadata,
    ) -> BillingResult<Self> {
        if amount < 0 {
            return Err(BillingError::InvalidInput(format!(
                "payment amount must be non-negative, got {}",
                amount
            )));
        }
        Ok(Self {
            user_id,
            amount,
            currency: DEFAULT_CURRENCY.to_string(),
            payment_type,
            metadata,
        })
    }
}

/// Fields written alongside a status transition
#[derive(Debug, Clone, Default)]
pub struct TransitionUpdate {
    pub metadata: PaymentMetadata,
    pub transaction_uid: Option<String>,
}

impl TransitionUpdate {
    pub fn with_metadata(metadata: PaymentMetadata) -> Self {
        Self {
            metadata,
            transaction_uid: None,
        }
    }

    pub fn transaction_uid(mut self, uid: Option<String>) -> Self {
        self.transaction_uid = uid;
        self
    }
}

/// Result of a conditional status update
///
/// Rejections are ordinary outcomes: a late duplicate webhook lands here, not
/// in an error path.
#[derive(Debug, Clone)]
pub enum TransitionOutcome {
    Applied(PaymentRecord),
    AlreadyTerminal(PaymentRecord),
    InvalidTransition(PaymentRecord),
}

impl TransitionOutcome {
    pub fn record(&self) -> &PaymentRecord {
        match self {
            TransitionOutcome::Applied(r)
            | TransitionOutcome::AlreadyTerminal(r)
            | TransitionOutcome::InvalidTransition(r) => r,
        }
    }

    pub fn into_record(self) -> PaymentRecord {
        match self {
            TransitionOutcome::Applied(r)
            | TransitionOutcome::AlreadyTerminal(r)
            | TransitionOutcome::InvalidTransition(r) => r,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied(_))
    }

    pub(crate) fn rejected(current: PaymentRecord) -> Self {
        match current.status.rejection() {
            TransitionRejection::AlreadyTerminal => TransitionOutcome::AlreadyTerminal(current),
            TransitionRejection::InvalidTransition => TransitionOutcome::InvalidTransition(current),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [PaymentStatus; 4] = [
        PaymentStatus::Pending,
        PaymentStatus::Completed,
        PaymentStatus::Failed,
        PaymentStatus::Refunded,
    ];

    #[test]
    fn only_three_edges_are_legal() {
        let legal = [
            (PaymentStatus::Pending, PaymentStatus::Completed),
            (PaymentStatus::Pending, PaymentStatus::Failed),
            (PaymentStatus::Completed, PaymentStatus::Refunded),
        ];
        for from in ALL {
            for to in ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    legal.contains(&(from, to)),
                    "{} -> {}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn late_success_after_failure_is_already_terminal() {
        assert_eq!(
            PaymentStatus::Failed.rejection(),
            TransitionRejection::AlreadyTerminal
        );
        assert_eq!(
            PaymentStatus::Pending.rejection(),
            TransitionRejection::InvalidTransition
        );
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in ALL {
            assert_eq!(status.as_str().parse::<PaymentStatus>().unwrap(), status);
        }
        assert!("settled".parse::<PaymentStatus>().is_err());
    }

    #[test]
    fn purchase_is_read_back_typed() {
        let card_type_id = Uuid::new_v4();
        let meta = PaymentMetadata::new()
            .with_purchase(&Purchase::Pass { card_type_id })
            .unwrap();
        assert_eq!(meta.purchase().unwrap(), Purchase::Pass { card_type_id });
        assert_eq!(
            meta.as_value()["purchase"]["kind"],
            Value::String("pass".to_string())
        );
    }

    #[test]
    fn missing_or_malformed_purchase_fails_closed() {
        let empty = PaymentMetadata::new();
        assert!(matches!(empty.purchase(), Err(BillingError::Metadata(_))));

        let garbled = PaymentMetadata::new().with("purchase", serde_json::json!({"kind": "toy"}));
        assert!(matches!(garbled.purchase(), Err(BillingError::Metadata(_))));
    }

    #[test]
    fn non_string_coupon_code_is_rejected() {
        let meta = PaymentMetadata::new().with(meta_keys::COUPON_CODE, 42);
        assert!(meta.coupon_code().is_err());
        let meta = PaymentMetadata::new().with(meta_keys::COUPON_CODE, "SUMMER");
        assert_eq!(meta.coupon_code().unwrap(), Some("SUMMER"));
    }

    #[test]
    fn major_units_are_parsed_without_floats() {
        assert_eq!(parse_major_units("320"), Some(32_000));
        assert_eq!(parse_major_units("320.5"), Some(32_050));
        assert_eq!(parse_major_units("0.07"), Some(7));
        assert_eq!(parse_major_units("1.005"), None);
        assert_eq!(parse_major_units("abc"), None);
        assert_eq!(amount_from_json(&serde_json::json!(320.0)), Some(32_000));
        assert_eq!(format_major_units(32_050), "320.50");
    }

    #[test]
    fn negative_amount_is_rejected() {
        assert!(NewPayment::new(None, -1, PaymentType::PosCash, PaymentMetadata::new()).is_err());
    }
}
