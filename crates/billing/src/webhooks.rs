//! Gateway callback ingestion
//!
//! Every callback is claimed in `webhook_logs` before any work happens. The
//! claim is keyed by a hash of the payload's stable correlation fields, so a
//! redelivery of the same result finds the existing row: completed rows are
//! acknowledged without work, failed rows are reclaimed with
//! `retry_count + 1`, and rows stuck in `processing` for longer than
//! [`PROCESSING_TIMEOUT_MINUTES`] are recovered. A `rejected` row is final:
//! its redeliveries are answered from the row.
//!
//! The provider is always answered 200 except when the signature does not
//! verify. Processing failures are left for the scheduler's retry job.

use std::collections::BTreeMap;
use std::sync::Arc;

use base64::Engine as _;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::alerts::{AlertKind, AlertService, AlertSeverity};
use crate::client::SUCCESS_STATUS_CODE;
use crate::error::{BillingError, BillingResult};
use crate::payment::{amount_from_json, PaymentRecord};
use crate::settlement::{GatewayVerdict, SettledBy, Settlement, SettlementResult};
use crate::store::Store;

type HmacSha256 = Hmac<Sha256>;

pub const WEBHOOK_TYPE_PAYMENT_CALLBACK: &str = "payment_callback";

/// Header carrying the base64 HMAC-SHA256 of the raw body
pub const SIGNATURE_HEADER: &str = "hash";

/// Claims older than this are considered abandoned by a crashed worker
pub const PROCESSING_TIMEOUT_MINUTES: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookStatus {
    Processing,
    Completed,
    Failed,
    /// Deliberately refused (amount mismatch); never reprocessed
    Rejected,
}

impl WebhookStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookStatus::Processing => "processing",
            WebhookStatus::Completed => "completed",
            WebhookStatus::Failed => "failed",
            WebhookStatus::Rejected => "rejected",
        }
    }
}

impl std::str::FromStr for WebhookStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processing" => Ok(WebhookStatus::Processing),
            "completed" => Ok(WebhookStatus::Completed),
            "failed" => Ok(WebhookStatus::Failed),
            "rejected" => Ok(WebhookStatus::Rejected),
            other => Err(BillingError::InvalidInput(format!(
                "unknown webhook status '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WebhookLog {
    pub id: Uuid,
    pub webhook_type: String,
    pub idempotency_key: String,
    /// Raw body exactly as received; the signature is computed over it
    pub payload: String,
    pub headers: BTreeMap<String, String>,
    pub status: WebhookStatus,
    pub retry_count: i32,
    pub retryable: bool,
    pub error_message: Option<String>,
    pub payment_id: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339")]
    pub processing_started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_attempt_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct NewWebhookLog {
    pub id: Uuid,
    pub webhook_type: String,
    pub idempotency_key: String,
    pub payload: String,
    pub headers: BTreeMap<String, String>,
}

/// Result of the atomic claim on an idempotency key
#[derive(Debug, Clone)]
pub enum WebhookClaim {
    /// First delivery; a new `processing` row was inserted
    Claimed(WebhookLog),
    /// A failed or stale row was moved back to `processing`
    Reclaimed(WebhookLog),
    AlreadyCompleted(WebhookLog),
    AlreadyRejected(WebhookLog),
    /// Another worker holds a fresh claim
    InProgress(WebhookLog),
}

/// Gateway callback body
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayCallback {
    #[serde(default)]
    pub transaction_type: Option<String>,
    pub transaction: CallbackTransaction,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackTransaction {
    #[serde(default)]
    pub uid: Option<String>,
    #[serde(default)]
    pub payment_page_request_uid: Option<String>,
    /// Our payment id, echoed back from link creation
    #[serde(default)]
    pub more_info: Option<String>,
    #[serde(default)]
    pub status_code: Option<Value>,
    #[serde(default)]
    pub amount: Option<Value>,
    #[serde(default)]
    pub currency: Option<String>,
}

impl CallbackTransaction {
    pub fn status_code(&self) -> Option<String> {
        match &self.status_code {
            Some(Value::String(s)) => Some(s.trim().to_string()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn amount(&self) -> Option<i64> {
        self.amount.as_ref().and_then(amount_from_json)
    }

    fn has_correlation(&self) -> bool {
        self.uid.is_some() || self.payment_page_request_uid.is_some() || self.more_info.is_some()
    }

    /// Only the documented success code is success; anything else declines
    pub fn verdict(&self) -> GatewayVerdict {
        let status_code = self.status_code();
        if status_code.as_deref() == Some(SUCCESS_STATUS_CODE) {
            GatewayVerdict::Succeeded {
                transaction_uid: self.uid.clone(),
                status_code,
            }
        } else {
            let reason = format!(
                "gateway status code {}",
                status_code.as_deref().unwrap_or("missing")
            );
            GatewayVerdict::Declined {
                status_code,
                reason,
            }
        }
    }
}

pub fn parse_callback(raw_body: &str) -> BillingResult<GatewayCallback> {
    serde_json::from_str(raw_body)
        .map_err(|e| BillingError::InvalidInput(format!("unparseable callback: {}", e)))
}

/// Deterministic key from (transaction uid, page request uid, result code)
///
/// Never depends on arrival time. Bodies that cannot be parsed, or carry no
/// correlation fields at all, are keyed by the hash of the raw body.
pub fn idempotency_key(raw_body: &str) -> String {
    let mut hasher = Sha256::new();
    match parse_callback(raw_body) {
        Ok(cb) if cb.transaction.has_correlation() => {
            let t = &cb.transaction;
            let correlation = t
                .payment_page_request_uid
                .as_deref()
                .or(t.more_info.as_deref())
                .unwrap_or("");
            hasher.update(b"callback|");
            hasher.update(t.uid.as_deref().unwrap_or("").as_bytes());
            hasher.update(b"|");
            hasher.update(correlation.as_bytes());
            hasher.update(b"|");
            hasher.update(t.status_code().unwrap_or_default().as_bytes());
        }
        _ => {
            hasher.update(b"raw|");
            hasher.update(raw_body.as_bytes());
        }
    }
    hex::encode(hasher.finalize())
}

/// Base64 HMAC-SHA256 of the body, as the gateway computes it
pub fn sign_payload(secret: &str, raw_body: &str) -> BillingResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::GatewayNotConfigured("invalid webhook secret".to_string()))?;
    mac.update(raw_body.as_bytes());
    Ok(base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
}

/// Constant-time signature check
pub fn verify_signature(secret: &str, raw_body: &str, signature: &str) -> bool {
    let Ok(expected) = base64::engine::general_purpose::STANDARD.decode(signature.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(raw_body.as_bytes());
    mac.verify_slice(&expected).is_ok()
}

/// What the endpoint tells the provider (always with a 200)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum WebhookAck {
    Processed { payment_id: Uuid, outcome: String },
    Duplicate,
    InProgress,
    UnknownPayment,
    /// Permanently unprocessable (garbled body, amount mismatch)
    Rejected { reason: String },
    /// Recorded for the retry job
    Deferred,
}

enum Applied {
    Settled(SettlementResult),
    UnknownPayment,
    AmountMismatch { payment: PaymentRecord, reported: i64 },
}

fn rejection_reason(log: &WebhookLog) -> String {
    log.error_message
        .clone()
        .unwrap_or_else(|| "delivery was rejected".to_string())
}

#[derive(Clone)]
pub struct WebhookHandler {
    store: Arc<dyn Store>,
    settlement: Settlement,
    alerts: AlertService,
    secret: Option<String>,
}

impl WebhookHandler {
    pub fn new(
        store: Arc<dyn Store>,
        settlement: Settlement,
        alerts: AlertService,
        secret: Option<String>,
    ) -> Self {
        Self {
            store,
            settlement,
            alerts,
            secret,
        }
    }

    fn stale_before() -> OffsetDateTime {
        OffsetDateTime::now_utc() - time::Duration::minutes(PROCESSING_TIMEOUT_MINUTES)
    }

    /// Ingest one delivery
    ///
    /// Returns `Err(WebhookSignatureInvalid)` only for authentication
    /// failures; every other outcome is an acknowledgement.
    pub async fn handle(
        &self,
        raw_body: &str,
        headers: BTreeMap<String, String>,
    ) -> BillingResult<WebhookAck> {
        let key = idempotency_key(raw_body);
        let new_log = NewWebhookLog {
            id: Uuid::new_v4(),
            webhook_type: WEBHOOK_TYPE_PAYMENT_CALLBACK.to_string(),
            idempotency_key: key.clone(),
            payload: raw_body.to_string(),
            headers,
        };

        let claim = match self.store.claim_webhook(new_log, Self::stale_before()).await {
            Ok(claim) => claim,
            Err(e) => {
                // Nothing recorded; the sync job will find the payment by polling
                tracing::error!(
                    idempotency_key = %key,
                    error = %e,
                    "Failed to claim webhook for processing"
                );
                return Ok(WebhookAck::Deferred);
            }
        };

        let log = match claim {
            WebhookClaim::AlreadyCompleted(log) => {
                tracing::info!(
                    webhook_id = %log.id,
                    idempotency_key = %key,
                    "Duplicate webhook delivery - already processed"
                );
                return Ok(WebhookAck::Duplicate);
            }
            WebhookClaim::AlreadyRejected(log) => {
                tracing::info!(
                    webhook_id = %log.id,
                    idempotency_key = %key,
                    "Redelivery of a rejected webhook - not reprocessed"
                );
                return Ok(WebhookAck::Rejected {
                    reason: rejection_reason(&log),
                });
            }
            WebhookClaim::InProgress(log) => {
                tracing::info!(
                    webhook_id = %log.id,
                    idempotency_key = %key,
                    "Webhook currently being processed by another worker"
                );
                return Ok(WebhookAck::InProgress);
            }
            WebhookClaim::Claimed(log) => log,
            WebhookClaim::Reclaimed(log) => {
                tracing::info!(
                    webhook_id = %log.id,
                    retry_count = log.retry_count,
                    "Reprocessing previously failed webhook"
                );
                log
            }
        };

        self.process_log(&log).await
    }

    /// Verify and process a claimed log row
    ///
    /// Shared by live delivery, the retry job and admin replay; the signature
    /// is always re-checked against the stored raw body and headers.
    pub async fn process_log(&self, log: &WebhookLog) -> BillingResult<WebhookAck> {
        if !self.signature_valid(log) {
            tracing::warn!(
                webhook_id = %log.id,
                security_event = true,
                "Webhook signature verification failed"
            );
            self.mark_failed(log.id, None, "signature verification failed", false)
                .await;
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let callback = match parse_callback(&log.payload) {
            Ok(cb) => cb,
            Err(e) => {
                tracing::warn!(webhook_id = %log.id, error = %e, "Unparseable webhook body");
                self.mark_failed(log.id, None, &e.to_string(), false).await;
                return Ok(WebhookAck::Rejected {
                    reason: "unparseable body".to_string(),
                });
            }
        };

        let mut payment_id = None;
        match self.apply(&callback, &mut payment_id).await {
            Ok(Applied::Settled(result)) => {
                let payment_id = result.payment().id;
                self.mark_completed(log.id, Some(payment_id)).await;
                tracing::info!(
                    webhook_id = %log.id,
                    payment_id = %payment_id,
                    outcome = result.label(),
                    "Webhook processed"
                );
                Ok(WebhookAck::Processed {
                    payment_id,
                    outcome: result.label().to_string(),
                })
            }
            Ok(Applied::UnknownPayment) => {
                tracing::warn!(
                    webhook_id = %log.id,
                    more_info = ?callback.transaction.more_info,
                    page_request_uid = ?callback.transaction.payment_page_request_uid,
                    "Webhook references a payment this system never created"
                );
                self.mark_completed(log.id, None).await;
                Ok(WebhookAck::UnknownPayment)
            }
            Ok(Applied::AmountMismatch { payment, reported }) => {
                let reason = format!(
                    "gateway reported {} agorot, payment is {}",
                    reported, payment.amount
                );
                self.mark_rejected(log.id, payment.id, &reason).await;
                self.alerts
                    .raise(
                        AlertKind::AmountMismatch,
                        AlertSeverity::High,
                        format!("Amount mismatch on callback for payment {}", payment.id),
                        Some(payment.id),
                        serde_json::json!({
                            "expected": payment.amount,
                            "reported": reported,
                            "webhook_id": log.id,
                        }),
                    )
                    .await;
                Ok(WebhookAck::Rejected { reason })
            }
            Err(e) => {
                let retryable = !matches!(
                    e,
                    BillingError::Metadata(_) | BillingError::InvalidInput(_)
                );
                tracing::error!(
                    webhook_id = %log.id,
                    error = %e,
                    retryable,
                    "Webhook processing failed"
                );
                self.mark_failed(log.id, payment_id, &e.to_string(), retryable)
                    .await;
                Ok(WebhookAck::Deferred)
            }
        }
    }

    fn signature_valid(&self, log: &WebhookLog) -> bool {
        let Some(secret) = self.secret.as_deref() else {
            tracing::error!(
                webhook_id = %log.id,
                "Webhook secret not configured - cannot authenticate callbacks"
            );
            return false;
        };
        match log.headers.get(SIGNATURE_HEADER) {
            Some(signature) => verify_signature(secret, &log.payload, signature),
            None => false,
        }
    }

    async fn resolve_payment(
        &self,
        callback: &GatewayCallback,
    ) -> BillingResult<Option<PaymentRecord>> {
        let t = &callback.transaction;
        if let Some(id) = t.more_info.as_deref().and_then(|s| Uuid::parse_str(s.trim()).ok()) {
            if let Some(payment) = self.store.get_payment(id).await? {
                return Ok(Some(payment));
            }
        }
        match t.payment_page_request_uid.as_deref() {
            Some(page) => self.store.find_by_gateway_correlation(page).await,
            None => Ok(None),
        }
    }

    /// `resolved` is filled in as soon as the payment is known, so a later
    /// failure can still be linked to it
    async fn apply(
        &self,
        callback: &GatewayCallback,
        resolved: &mut Option<Uuid>,
    ) -> BillingResult<Applied> {
        let Some(payment) = self.resolve_payment(callback).await? else {
            return Ok(Applied::UnknownPayment);
        };
        *resolved = Some(payment.id);

        let verdict = callback.transaction.verdict();
        if let (GatewayVerdict::Succeeded { .. }, Some(reported)) =
            (&verdict, callback.transaction.amount())
        {
            if reported != payment.amount {
                return Ok(Applied::AmountMismatch { payment, reported });
            }
        }

        let result = self
            .settlement
            .settle(&payment, verdict, SettledBy::Webhook)
            .await?;
        Ok(Applied::Settled(result))
    }

    async fn mark_completed(&self, id: Uuid, payment_id: Option<Uuid>) {
        if let Err(e) = self.store.complete_webhook(id, payment_id).await {
            tracing::error!(
                webhook_id = %id,
                error = %e,
                "Failed to mark webhook completed; it will be reclaimed after the stale timeout"
            );
        }
    }

    async fn mark_failed(&self, id: Uuid, payment_id: Option<Uuid>, error: &str, retryable: bool) {
        if let Err(e) = self
            .store
            .fail_webhook(id, payment_id, error, retryable)
            .await
        {
            tracing::error!(webhook_id = %id, error = %e, "Failed to mark webhook failed");
        }
    }

    async fn mark_rejected(&self, id: Uuid, payment_id: Uuid, reason: &str) {
        if let Err(e) = self.store.reject_webhook(id, payment_id, reason).await {
            tracing::error!(webhook_id = %id, error = %e, "Failed to mark webhook rejected");
        }
    }

    /// Reprocess a stored delivery now, ignoring the backoff schedule
    pub async fn replay(&self, id: Uuid) -> BillingResult<WebhookAck> {
        let log = self
            .store
            .get_webhook(id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("webhook log {}", id)))?;

        match log.status {
            WebhookStatus::Completed => return Ok(WebhookAck::Duplicate),
            WebhookStatus::Rejected => {
                return Ok(WebhookAck::Rejected {
                    reason: rejection_reason(&log),
                })
            }
            WebhookStatus::Processing | WebhookStatus::Failed => {}
        }

        let Some(claimed) = self.store.reclaim_for_retry(id, Self::stale_before()).await? else {
            return Ok(WebhookAck::InProgress);
        };

        tracing::info!(
            webhook_id = %id,
            retry_count = claimed.retry_count,
            "Replaying webhook on operator request"
        );

        match self.process_log(&claimed).await {
            Err(BillingError::WebhookSignatureInvalid) => Ok(WebhookAck::Rejected {
                reason: "signature verification failed".to_string(),
            }),
            other => other,
        }
    }

    pub async fn list(
        &self,
        status: Option<WebhookStatus>,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<WebhookLog>> {
        self.store
            .list_webhooks(status, limit.clamp(1, 200), offset.max(0))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(uid: &str, code: &str) -> String {
        serde_json::json!({
            "transaction_type": "Charge",
            "transaction": {
                "uid": uid,
                "payment_page_request_uid": "pr-1",
                "more_info": "d3b07384-d9a0-4c9b-8f3e-1a2b3c4d5e6f",
                "status_code": code,
                "amount": 320,
            }
        })
        .to_string()
    }

    #[test]
    fn key_ignores_formatting_and_arrival() {
        let compact = body("tx-1", "000");
        let pretty = serde_json::to_string_pretty(
            &serde_json::from_str::<Value>(&compact).unwrap(),
        )
        .unwrap();
        assert_eq!(idempotency_key(&compact), idempotency_key(&pretty));
    }

    #[test]
    fn key_changes_with_result_code() {
        assert_ne!(
            idempotency_key(&body("tx-1", "000")),
            idempotency_key(&body("tx-1", "001"))
        );
    }

    #[test]
    fn garbage_bodies_do_not_share_a_key() {
        assert_ne!(idempotency_key("not json"), idempotency_key("also not json"));
        assert_ne!(
            idempotency_key(r#"{"transaction":{}}"#),
            idempotency_key(r#"{"transaction":{"amount":1}}"#)
        );
    }

    #[test]
    fn signature_round_trip() {
        let raw = body("tx-1", "000");
        let sig = sign_payload("s3cret", &raw).unwrap();
        assert!(verify_signature("s3cret", &raw, &sig));
        assert!(!verify_signature("other", &raw, &sig));
        assert!(!verify_signature("s3cret", &format!("{} ", raw), &sig));
        assert!(!verify_signature("s3cret", &raw, "not base64 !!"));
    }

    #[test]
    fn unknown_codes_decline() {
        for code in ["001", "", "OK", "0000", "success"] {
            let cb = parse_callback(&body("tx", code)).unwrap();
            assert!(
                matches!(cb.transaction.verdict(), GatewayVerdict::Declined { .. }),
                "code {:?}",
                code
            );
        }
        let cb = parse_callback(&body("tx", "000")).unwrap();
        assert!(matches!(cb.transaction.verdict(), GatewayVerdict::Succeeded { .. }));
    }

    #[test]
    fn numeric_code_zero_is_not_success() {
        let raw = r#"{"transaction":{"uid":"t","status_code":0}}"#;
        let cb = parse_callback(raw).unwrap();
        assert!(matches!(cb.transaction.verdict(), GatewayVerdict::Declined { .. }));
    }
}
