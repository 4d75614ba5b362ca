//! Out-of-band reconciliation jobs
//!
//! Four independent jobs bring payment state in line with the gateway when
//! the webhook path is late, lost or failed:
//!
//! - `sync_pending` polls the gateway for young pending payments and repairs
//!   completed payments whose entitlement was never created
//! - `detect_stuck` flags payments pending far too long and alerts once
//! - `expire_abandoned` fails payments nobody paid within the hold window
//! - `retry_failed_webhooks` reprocesses failed callbacks on a backoff ladder
//!
//! Each record is processed in isolation: an error is counted and the batch
//! moves on. Every run is written to `reconciliation_runs`.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::alerts::{AlertKind, AlertService, AlertSeverity};
use crate::client::{PaymentGateway, StatusReport};
use crate::error::{BillingError, BillingResult};
use crate::guard::DEFAULT_HOLD_WINDOW;
use crate::payment::{meta_keys, PaymentMetadata, PaymentRecord, PaymentStatus};
use crate::settlement::{GatewayVerdict, SettledBy, Settlement, SettlementResult};
use crate::store::Store;
use crate::webhooks::{WebhookAck, WebhookHandler, WebhookLog, WebhookStatus, PROCESSING_TIMEOUT_MINUTES};

const MAX_ERROR_DETAILS: usize = 50;

/// Runs with at least this many records and half of them failing raise an alert
const FAILURE_ALERT_MIN_CHECKED: i32 = 5;

/// Backoff between webhook retries, indexed by `retry_count`
#[derive(Debug, Clone)]
pub struct RetrySchedule {
    delays: Vec<Duration>,
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self {
            delays: vec![
                Duration::minutes(1),
                Duration::minutes(5),
                Duration::minutes(15),
                Duration::hours(1),
                Duration::hours(6),
                Duration::hours(24),
            ],
        }
    }
}

impl RetrySchedule {
    pub fn delay_for(&self, retry_count: i32) -> Duration {
        let index = usize::try_from(retry_count.max(0)).unwrap_or(usize::MAX);
        self.delays
            .get(index)
            .or_else(|| self.delays.last())
            .copied()
            .unwrap_or(Duration::hours(24))
    }

    pub fn is_due(&self, log: &WebhookLog, now: OffsetDateTime) -> bool {
        now >= log.last_attempt_at + self.delay_for(log.retry_count)
    }
}

/// Independent thresholds; none is derived from another
#[derive(Debug, Clone)]
pub struct ReconciliationConfig {
    /// Younger pending payments are left to the in-flight webhook
    pub sync_min_age: Duration,
    pub sync_max_age: Duration,
    pub stuck_threshold: Duration,
    pub abandon_after: Duration,
    pub webhook_max_attempts: i32,
    pub batch_limit: i64,
    pub retry_schedule: RetrySchedule,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            sync_min_age: Duration::minutes(2),
            sync_max_age: Duration::hours(24),
            stuck_threshold: Duration::hours(1),
            abandon_after: DEFAULT_HOLD_WINDOW,
            webhook_max_attempts: 6,
            batch_limit: 100,
            retry_schedule: RetrySchedule::default(),
        }
    }
}

impl ReconciliationConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            sync_min_age: env_secs("SYNC_MIN_AGE_SECS").unwrap_or(defaults.sync_min_age),
            sync_max_age: env_secs("SYNC_MAX_AGE_SECS").unwrap_or(defaults.sync_max_age),
            stuck_threshold: env_secs("STUCK_THRESHOLD_SECS").unwrap_or(defaults.stuck_threshold),
            abandon_after: env_secs("ABANDON_AFTER_SECS").unwrap_or(defaults.abandon_after),
            webhook_max_attempts: std::env::var("WEBHOOK_MAX_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n: &i32| *n > 0)
                .unwrap_or(defaults.webhook_max_attempts),
            batch_limit: std::env::var("RECONCILE_BATCH_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n: &i64| *n > 0)
                .unwrap_or(defaults.batch_limit),
            retry_schedule: defaults.retry_schedule,
        }
    }
}

fn env_secs(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<i64>().ok())
        .filter(|secs| *secs > 0)
        .map(Duration::seconds)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    SyncPending,
    DetectStuck,
    ExpireAbandoned,
    RetryWebhooks,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::SyncPending => "sync_pending",
            JobKind::DetectStuck => "detect_stuck",
            JobKind::ExpireAbandoned => "expire_abandoned",
            JobKind::RetryWebhooks => "retry_webhooks",
        }
    }
}

/// Aggregate counts for one job run
#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationRun {
    pub id: Uuid,
    pub job: JobKind,
    pub checked: i32,
    pub updated: i32,
    pub failed: i32,
    pub skipped: i32,
    pub details: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub finished_at: OffsetDateTime,
}

impl ReconciliationRun {
    fn begin(job: JobKind) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: Uuid::new_v4(),
            job,
            checked: 0,
            updated: 0,
            failed: 0,
            skipped: 0,
            details: json!({ "errors": [] }),
            started_at: now,
            finished_at: now,
        }
    }

    fn record_error(&mut self, subject: Uuid, error: &BillingError) {
        self.failed += 1;
        if let Some(errors) = self.details["errors"].as_array_mut() {
            if errors.len() < MAX_ERROR_DETAILS {
                errors.push(json!({ "id": subject, "error": error.to_string() }));
            }
        }
    }

    fn note(&mut self, key: &str, value: Value) {
        if let Some(map) = self.details.as_object_mut() {
            map.insert(key.to_string(), value);
        }
    }

    pub fn failure_rate(&self) -> f64 {
        if self.checked == 0 {
            0.0
        } else {
            f64::from(self.failed) / f64::from(self.checked)
        }
    }
}

/// Result of a manual or status-page verification
#[derive(Debug, Clone, Serialize)]
pub struct VerifyOutcome {
    pub payment: PaymentRecord,
    /// Whether this call changed anything
    pub changed: bool,
    pub gateway_checked: bool,
}

#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn Store>,
    gateway: Arc<dyn PaymentGateway>,
    settlement: Settlement,
    webhooks: WebhookHandler,
    alerts: AlertService,
    config: ReconciliationConfig,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn Store>,
        gateway: Arc<dyn PaymentGateway>,
        settlement: Settlement,
        webhooks: WebhookHandler,
        alerts: AlertService,
        config: ReconciliationConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            settlement,
            webhooks,
            alerts,
            config,
        }
    }

    pub fn config(&self) -> &ReconciliationConfig {
        &self.config
    }

    /// Settle from a gateway report; `None` while the gateway shows no success
    async fn settle_from_report(
        &self,
        payment: &PaymentRecord,
        report: StatusReport,
        by: SettledBy,
    ) -> BillingResult<Option<SettlementResult>> {
        if !report.succeeded {
            return Ok(None);
        }
        if let Some(reported) = report.amount {
            if reported != payment.amount {
                return Err(BillingError::InvalidInput(format!(
                    "gateway reported {} agorot for a payment of {}",
                    reported, payment.amount
                )));
            }
        }
        let verdict = GatewayVerdict::Succeeded {
            transaction_uid: report.transaction_uid,
            status_code: report.status_code,
        };
        Ok(Some(self.settlement.settle(payment, verdict, by).await?))
    }

    async fn finish(&self, mut run: ReconciliationRun) -> ReconciliationRun {
        run.finished_at = OffsetDateTime::now_utc();

        tracing::info!(
            run_id = %run.id,
            job = run.job.as_str(),
            checked = run.checked,
            updated = run.updated,
            failed = run.failed,
            skipped = run.skipped,
            "Reconciliation run finished"
        );

        if run.checked >= FAILURE_ALERT_MIN_CHECKED && run.failure_rate() >= 0.5 {
            self.alerts
                .raise(
                    AlertKind::HighFailureRate,
                    AlertSeverity::High,
                    format!(
                        "{} failed {} of {} records",
                        run.job.as_str(),
                        run.failed,
                        run.checked
                    ),
                    None,
                    json!({ "run_id": run.id, "details": run.details }),
                )
                .await;
        }

        if let Err(e) = self.store.record_run(&run).await {
            tracing::error!(run_id = %run.id, error = %e, "Failed to record reconciliation run");
        }
        run
    }

    /// Poll the gateway for pending payments inside the sync window
    pub async fn sync_pending(&self) -> BillingResult<ReconciliationRun> {
        let mut run = ReconciliationRun::begin(JobKind::SyncPending);
        let now = OffsetDateTime::now_utc();

        let pending = self
            .store
            .list_pending(
                now - self.config.sync_min_age,
                Some(now - self.config.sync_max_age),
                self.config.batch_limit,
            )
            .await?;

        for payment in &pending {
            run.checked += 1;
            let Some(correlation) = payment
                .gateway_correlation_id
                .as_deref()
                .filter(|_| payment.payment_type.uses_gateway())
            else {
                run.skipped += 1;
                continue;
            };

            let result = match self.gateway.query_status(correlation).await {
                Ok(report) => {
                    self.settle_from_report(payment, report, SettledBy::Sync)
                        .await
                }
                Err(e) => Err(e),
            };

            match result {
                Ok(Some(outcome)) if outcome.changed_state() => {
                    tracing::info!(
                        payment_id = %payment.id,
                        outcome = outcome.label(),
                        "Pending payment settled by sync"
                    );
                    run.updated += 1;
                }
                Ok(Some(SettlementResult::ManualRefund { .. })) => run.updated += 1,
                Ok(_) => run.skipped += 1,
                Err(e) => {
                    tracing::warn!(payment_id = %payment.id, error = %e, "Sync check failed");
                    run.record_error(payment.id, &e);
                }
            }
        }

        let repaired = self.repair_unmaterialized(&mut run, now).await?;
        run.note("repaired_entitlements", json!(repaired));

        Ok(self.finish(run).await)
    }

    /// Completed payments whose materialization crashed or failed midway
    async fn repair_unmaterialized(
        &self,
        run: &mut ReconciliationRun,
        now: OffsetDateTime,
    ) -> BillingResult<i32> {
        let orphans = self
            .store
            .list_unmaterialized(now - self.config.sync_min_age, self.config.batch_limit)
            .await?;

        let mut repaired = 0;
        for payment in &orphans {
            run.checked += 1;
            match self.settlement.materializer().materialize(payment).await {
                Ok(entitlement) => {
                    tracing::info!(
                        payment_id = %payment.id,
                        item_id = %entitlement.id(),
                        "Repaired missing entitlement"
                    );
                    run.updated += 1;
                    repaired += 1;
                }
                // Already flagged and alerted by the materializer
                Err(BillingError::MaterializationConflict { .. }) => run.updated += 1,
                Err(e) => {
                    tracing::error!(
                        payment_id = %payment.id,
                        error = %e,
                        "Entitlement repair failed"
                    );
                    run.record_error(payment.id, &e);
                }
            }
        }
        Ok(repaired)
    }

    /// Flag payments pending past the stuck threshold; never fails them
    pub async fn detect_stuck(&self) -> BillingResult<ReconciliationRun> {
        let mut run = ReconciliationRun::begin(JobKind::DetectStuck);
        let now = OffsetDateTime::now_utc();

        let pending = self
            .store
            .list_pending(now - self.config.stuck_threshold, None, self.config.batch_limit)
            .await?;

        let mut newly_flagged = Vec::new();
        for payment in &pending {
            run.checked += 1;
            if payment.metadata.contains(meta_keys::STUCK_FLAGGED_AT) {
                run.skipped += 1;
                continue;
            }
            let marker =
                PaymentMetadata::new().with(meta_keys::STUCK_FLAGGED_AT, now.unix_timestamp());
            match self.store.annotate_payment(payment.id, marker).await {
                Ok(()) => {
                    run.updated += 1;
                    newly_flagged.push(json!({
                        "payment_id": payment.id,
                        "amount": payment.amount,
                        "age_minutes": payment.age(now).whole_minutes(),
                    }));
                }
                Err(e) => run.record_error(payment.id, &e),
            }
        }

        if !newly_flagged.is_empty() {
            tracing::warn!(count = newly_flagged.len(), "Stuck pending payments detected");
            self.alerts
                .raise(
                    AlertKind::StuckPayments,
                    AlertSeverity::Medium,
                    format!(
                        "{} payment(s) pending longer than {} minutes",
                        newly_flagged.len(),
                        self.config.stuck_threshold.whole_minutes()
                    ),
                    None,
                    json!({ "payments": newly_flagged }),
                )
                .await;
        }

        Ok(self.finish(run).await)
    }

    /// Fail pending payments older than the abandonment threshold
    ///
    /// A last gateway query runs first; a success found there settles the
    /// payment instead, and an unreachable gateway postpones the decision.
    pub async fn expire_abandoned(&self) -> BillingResult<ReconciliationRun> {
        let mut run = ReconciliationRun::begin(JobKind::ExpireAbandoned);
        let now = OffsetDateTime::now_utc();

        let pending = self
            .store
            .list_pending(now - self.config.abandon_after, None, self.config.batch_limit)
            .await?;

        for payment in &pending {
            run.checked += 1;

            if let Some(correlation) = payment
                .gateway_correlation_id
                .as_deref()
                .filter(|_| payment.payment_type.uses_gateway())
            {
                let settled = match self.gateway.query_status(correlation).await {
                    Ok(report) => self.settle_from_report(payment, report, SettledBy::Sync).await,
                    Err(e) => Err(e),
                };
                match settled {
                    Ok(Some(outcome)) => {
                        tracing::info!(
                            payment_id = %payment.id,
                            outcome = outcome.label(),
                            "Abandoned payment had settled at the gateway"
                        );
                        run.updated += 1;
                        continue;
                    }
                    Ok(None) => {}
                    Err(e) if e.is_transient() => {
                        tracing::warn!(
                            payment_id = %payment.id,
                            error = %e,
                            "Gateway unavailable, expiry postponed"
                        );
                        run.skipped += 1;
                        continue;
                    }
                    Err(e) => {
                        run.record_error(payment.id, &e);
                        continue;
                    }
                }
            }

            let verdict = GatewayVerdict::Declined {
                status_code: None,
                reason: format!(
                    "abandoned: no payment confirmation within {} minutes",
                    self.config.abandon_after.whole_minutes()
                ),
            };
            match self
                .settlement
                .settle(payment, verdict, SettledBy::Expiry)
                .await
            {
                Ok(SettlementResult::Failed { .. }) => {
                    tracing::info!(payment_id = %payment.id, "Abandoned payment expired");
                    run.updated += 1;
                }
                Ok(_) => run.skipped += 1,
                Err(e) => run.record_error(payment.id, &e),
            }
        }

        Ok(self.finish(run).await)
    }

    /// Reprocess failed webhooks whose backoff has elapsed
    pub async fn retry_failed_webhooks(&self) -> BillingResult<ReconciliationRun> {
        let mut run = ReconciliationRun::begin(JobKind::RetryWebhooks);
        let now = OffsetDateTime::now_utc();
        let stale_before = now - Duration::minutes(PROCESSING_TIMEOUT_MINUTES);

        let candidates = self
            .store
            .list_retry_candidates(stale_before, self.config.batch_limit)
            .await?;

        let mut exhausted = Vec::new();
        for log in &candidates {
            run.checked += 1;

            if log.retry_count >= self.config.webhook_max_attempts {
                if let Err(e) = self.store.mark_webhook_exhausted(log.id).await {
                    run.record_error(log.id, &e);
                    continue;
                }
                tracing::error!(
                    webhook_id = %log.id,
                    retry_count = log.retry_count,
                    "Webhook retries exhausted"
                );
                self.alerts
                    .raise(
                        AlertKind::WebhookRetryExhausted,
                        AlertSeverity::High,
                        format!(
                            "Webhook {} failed {} times and will not be retried",
                            log.id, log.retry_count
                        ),
                        log.payment_id,
                        json!({
                            "webhook_id": log.id,
                            "last_error": log.error_message,
                        }),
                    )
                    .await;
                exhausted.push(log.id);
                run.skipped += 1;
                continue;
            }

            if log.status == WebhookStatus::Failed && !self.config.retry_schedule.is_due(log, now)
            {
                run.skipped += 1;
                continue;
            }

            let claimed = match self.store.reclaim_for_retry(log.id, stale_before).await {
                Ok(Some(claimed)) => claimed,
                Ok(None) => {
                    run.skipped += 1;
                    continue;
                }
                Err(e) => {
                    run.record_error(log.id, &e);
                    continue;
                }
            };

            match self.webhooks.process_log(&claimed).await {
                Ok(WebhookAck::Processed { .. })
                | Ok(WebhookAck::UnknownPayment)
                | Ok(WebhookAck::Duplicate) => run.updated += 1,
                Ok(WebhookAck::InProgress) => run.skipped += 1,
                Ok(WebhookAck::Deferred) => {
                    run.record_error(log.id, &BillingError::Database("processing deferred".into()))
                }
                Ok(WebhookAck::Rejected { reason }) => {
                    run.record_error(log.id, &BillingError::InvalidInput(reason))
                }
                Err(e) => run.record_error(log.id, &e),
            }
        }

        run.note("exhausted", json!(exhausted));
        Ok(self.finish(run).await)
    }

    /// Ask the gateway about one payment right now
    ///
    /// Used by admin verification and by the purchaser's status page. A
    /// completed payment missing its entitlement is repaired on the way.
    pub async fn verify_payment(&self, payment_id: Uuid) -> BillingResult<VerifyOutcome> {
        let payment = self
            .store
            .get_payment(payment_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("payment {}", payment_id)))?;

        if payment.status == PaymentStatus::Completed
            && !payment.is_materialized()
            && !payment.metadata.manual_refund_required()
        {
            let result = self.settlement.materializer().materialize(&payment).await;
            let payment = self.reload(payment).await?;
            return match result {
                Ok(_) | Err(BillingError::MaterializationConflict { .. }) => Ok(VerifyOutcome {
                    payment,
                    changed: true,
                    gateway_checked: false,
                }),
                Err(e) => Err(e),
            };
        }

        let correlation = match (&payment.status, payment.gateway_correlation_id.as_deref()) {
            (PaymentStatus::Pending, Some(c)) if payment.payment_type.uses_gateway() => {
                c.to_string()
            }
            _ => {
                return Ok(VerifyOutcome {
                    payment,
                    changed: false,
                    gateway_checked: false,
                })
            }
        };

        let report = self.gateway.query_status(&correlation).await?;
        match self
            .settle_from_report(&payment, report, SettledBy::ManualVerify)
            .await?
        {
            Some(outcome) => Ok(VerifyOutcome {
                changed: outcome.changed_state(),
                payment: outcome.payment().clone(),
                gateway_checked: true,
            }),
            None => Ok(VerifyOutcome {
                payment,
                changed: false,
                gateway_checked: true,
            }),
        }
    }

    async fn reload(&self, payment: PaymentRecord) -> BillingResult<PaymentRecord> {
        Ok(self.store.get_payment(payment.id).await?.unwrap_or(payment))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn backoff_ladder_follows_retry_count() {
        let schedule = RetrySchedule::default();
        assert_eq!(schedule.delay_for(0), Duration::minutes(1));
        assert_eq!(schedule.delay_for(2), Duration::minutes(15));
        assert_eq!(schedule.delay_for(5), Duration::hours(24));
        assert_eq!(schedule.delay_for(40), Duration::hours(24));
        assert_eq!(schedule.delay_for(-1), Duration::minutes(1));
    }

    #[test]
    #[serial]
    fn thresholds_are_read_independently() {
        std::env::set_var("STUCK_THRESHOLD_SECS", "7200");
        std::env::set_var("ABANDON_AFTER_SECS", "not a number");
        let config = ReconciliationConfig::from_env();
        assert_eq!(config.stuck_threshold, Duration::hours(2));
        assert_eq!(config.abandon_after, Duration::minutes(15));
        assert_eq!(config.sync_min_age, Duration::minutes(2));
        std::env::remove_var("STUCK_THRESHOLD_SECS");
        std::env::remove_var("ABANDON_AFTER_SECS");
    }
}
