//! Operator alerts
//!
//! Conditions a human has to look at (money moved without an entitlement,
//! payments stuck in `pending`, webhook retries exhausted) are persisted as
//! alert rows and, when configured, forwarded to a Slack-compatible webhook.
//! Raising an alert never fails the caller.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingError;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Critical,
    High,
    Medium,
    Low,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Critical => "critical",
            AlertSeverity::High => "high",
            AlertSeverity::Medium => "medium",
            AlertSeverity::Low => "low",
        }
    }
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertSeverity::Critical => write!(f, "CRITICAL"),
            AlertSeverity::High => write!(f, "HIGH"),
            AlertSeverity::Medium => write!(f, "MEDIUM"),
            AlertSeverity::Low => write!(f, "LOW"),
        }
    }
}

impl std::str::FromStr for AlertSeverity {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "critical" => Ok(AlertSeverity::Critical),
            "high" => Ok(AlertSeverity::High),
            "medium" => Ok(AlertSeverity::Medium),
            "low" => Ok(AlertSeverity::Low),
            other => Err(BillingError::InvalidInput(format!(
                "unknown alert severity '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    MaterializationConflict,
    AmountMismatch,
    CouponExhausted,
    LateSettlement,
    StuckPayments,
    WebhookRetryExhausted,
    HighFailureRate,
    RefundFailed,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::MaterializationConflict => "materialization_conflict",
            AlertKind::AmountMismatch => "amount_mismatch",
            AlertKind::CouponExhausted => "coupon_exhausted",
            AlertKind::LateSettlement => "late_settlement",
            AlertKind::StuckPayments => "stuck_payments",
            AlertKind::WebhookRetryExhausted => "webhook_retry_exhausted",
            AlertKind::HighFailureRate => "high_failure_rate",
            AlertKind::RefundFailed => "refund_failed",
        }
    }
}

impl std::str::FromStr for AlertKind {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "materialization_conflict" => Ok(AlertKind::MaterializationConflict),
            "amount_mismatch" => Ok(AlertKind::AmountMismatch),
            "coupon_exhausted" => Ok(AlertKind::CouponExhausted),
            "late_settlement" => Ok(AlertKind::LateSettlement),
            "stuck_payments" => Ok(AlertKind::StuckPayments),
            "webhook_retry_exhausted" => Ok(AlertKind::WebhookRetryExhausted),
            "high_failure_rate" => Ok(AlertKind::HighFailureRate),
            "refund_failed" => Ok(AlertKind::RefundFailed),
            other => Err(BillingError::InvalidInput(format!(
                "unknown alert kind '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorAlert {
    pub id: Uuid,
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub message: String,
    pub context: serde_json::Value,
    pub payment_id: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Clone)]
pub struct AlertService {
    store: Arc<dyn Store>,
    http: reqwest::Client,
    slack_webhook_url: Option<String>,
}

impl AlertService {
    pub fn new(store: Arc<dyn Store>, slack_webhook_url: Option<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Failed to build alert HTTP client, using defaults");
                reqwest::Client::new()
            });
        Self {
            store,
            http,
            slack_webhook_url,
        }
    }

    pub fn slack_enabled(&self) -> bool {
        self.slack_webhook_url.is_some()
    }

    pub async fn raise(
        &self,
        kind: AlertKind,
        severity: AlertSeverity,
        message: impl Into<String>,
        payment_id: Option<Uuid>,
        context: serde_json::Value,
    ) -> OperatorAlert {
        let alert = OperatorAlert {
            id: Uuid::new_v4(),
            kind,
            severity,
            message: message.into(),
            context,
            payment_id,
            created_at: OffsetDateTime::now_utc(),
        };

        tracing::warn!(
            alert_id = %alert.id,
            kind = kind.as_str(),
            severity = %severity,
            payment_id = ?payment_id,
            message = %alert.message,
            "Operator alert raised"
        );

        if let Err(e) = self.store.insert_alert(&alert).await {
            tracing::error!(
                alert_id = %alert.id,
                error = %e,
                "Failed to persist operator alert"
            );
        }

        if let Some(url) = &self.slack_webhook_url {
            let body = serde_json::json!({
                "text": format!("[{}] {}: {}", severity, kind.as_str(), alert.message),
            });
            match self.http.post(url).json(&body).send().await {
                Ok(resp) if resp.status().is_success() => {}
                Ok(resp) => tracing::warn!(
                    alert_id = %alert.id,
                    status = resp.status().as_u16(),
                    "Slack alert delivery rejected"
                ),
                Err(e) => tracing::warn!(
                    alert_id = %alert.id,
                    error = %e,
                    "Slack alert delivery failed"
                ),
            }
        }

        alert
    }

    pub async fn recent(&self, limit: i64) -> Vec<OperatorAlert> {
        match self.store.list_alerts(limit).await {
            Ok(alerts) => alerts,
            Err(e) => {
                tracing::error!(error = %e, "Failed to list operator alerts");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    #[tokio::test]
    async fn alert_is_persisted() {
        let store = Arc::new(MemoryStore::new());
        let alerts = AlertService::new(store.clone(), None);

        let payment_id = Uuid::new_v4();
        alerts
            .raise(
                AlertKind::LateSettlement,
                AlertSeverity::High,
                "late",
                Some(payment_id),
                serde_json::json!({}),
            )
            .await;

        let stored = alerts.recent(10).await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].kind, AlertKind::LateSettlement);
        assert_eq!(stored[0].payment_id, Some(payment_id));
    }

    #[tokio::test]
    async fn slack_delivery_failure_does_not_fail_raise() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/hook")
            .with_status(500)
            .create_async()
            .await;

        let store = Arc::new(MemoryStore::new());
        let alerts = AlertService::new(store.clone(), Some(format!("{}/hook", server.url())));
        alerts
            .raise(
                AlertKind::StuckPayments,
                AlertSeverity::Medium,
                "stuck",
                None,
                serde_json::json!({"count": 2}),
            )
            .await;

        mock.assert_async().await;
        assert_eq!(alerts.recent(10).await.len(), 1);
    }
}
