//! Playhouse Background Worker
//!
//! Runs the payment reconciliation jobs in-process:
//! - Sync pending payments with the gateway (every 5 minutes)
//! - Expire abandoned checkouts (every 5 minutes)
//! - Flag stuck payments (every 30 minutes)
//! - Retry failed webhooks (every minute)
//!
//! The same jobs can be triggered externally through `/api/cron/*`; the
//! store's conditional updates make overlapping runs safe.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use playhouse_api::{state::billing_settings, Config};
use playhouse_billing::{BillingResult, BillingService, ReconciliationRun};
use playhouse_shared::create_pool;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

fn log_run(name: &str, result: BillingResult<ReconciliationRun>) {
    match result {
        Ok(run) if run.failed > 0 => error!(
            job = name,
            checked = run.checked,
            updated = run.updated,
            failed = run.failed,
            details = %run.details,
            "Reconciliation job finished with errors"
        ),
        Ok(run) => info!(
            job = name,
            checked = run.checked,
            updated = run.updated,
            skipped = run.skipped,
            "Reconciliation job complete"
        ),
        Err(e) => error!(job = name, error = %e, "Reconciliation job failed"),
    }
}

/// Register one reconciliation job on `schedule`
async fn schedule<F, Fut>(
    scheduler: &JobScheduler,
    billing: &Arc<BillingService>,
    cron: &str,
    name: &'static str,
    run: F,
) -> anyhow::Result<()>
where
    F: Fn(Arc<BillingService>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = BillingResult<ReconciliationRun>> + Send + 'static,
{
    let billing = billing.clone();
    let run = Arc::new(run);
    scheduler
        .add(Job::new_async(cron, move |_uuid, _l| {
            let billing = billing.clone();
            let run = run.clone();
            Box::pin(async move {
                info!(job = name, "Running scheduled reconciliation job");
                log_run(name, run(billing).await);
            })
        })?)
        .await?;
    info!(job = name, cron = cron, "Scheduled");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting Playhouse Worker");

    let config = Config::from_env()?;
    let pool = create_pool(&config.database_url).await?;
    let billing = Arc::new(BillingService::with_pool(pool, billing_settings(&config)));

    let scheduler = JobScheduler::new().await?;

    schedule(&scheduler, &billing, "0 */5 * * * *", "sync_pending", |b| async move {
        b.reconciler.sync_pending().await
    })
    .await?;

    // Offset from sync so the final gateway query sees sync's result
    schedule(&scheduler, &billing, "30 */5 * * * *", "expire_abandoned", |b| async move {
        b.reconciler.expire_abandoned().await
    })
    .await?;

    schedule(&scheduler, &billing, "0 */30 * * * *", "detect_stuck", |b| async move {
        b.reconciler.detect_stuck().await
    })
    .await?;

    schedule(&scheduler, &billing, "15 * * * * *", "retry_webhooks", |b| async move {
        b.reconciler.retry_failed_webhooks().await
    })
    .await?;

    info!("Starting job scheduler");
    scheduler.start().await?;
    info!("Playhouse Worker started successfully with 4 scheduled jobs");

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
