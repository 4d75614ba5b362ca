//! Application state

use std::sync::Arc;

use playhouse_billing::{BillingService, BillingSettings, ReconciliationConfig};
use sqlx::PgPool;

use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub billing: Arc<BillingService>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> Self {
        let settings = billing_settings(&config);
        if settings.webhook_secret.is_none() {
            tracing::warn!("Gateway webhook secret not configured - callbacks will be rejected");
        }
        if settings.slack_webhook_url.is_some() {
            tracing::info!("Operator alerts will be forwarded to Slack");
        } else {
            tracing::warn!("Operator alerts stored only (missing SLACK_ALERT_WEBHOOK_URL)");
        }

        let billing = Arc::new(BillingService::with_pool(pool, settings));
        tracing::info!("Billing service initialized");

        Self { config, billing }
    }

    /// State over an already-built billing service
    pub fn with_billing(config: Config, billing: BillingService) -> Self {
        Self {
            config,
            billing: Arc::new(billing),
        }
    }
}

/// Billing settings derived from the server configuration
pub fn billing_settings(config: &Config) -> BillingSettings {
    let mut settings = BillingSettings::new(config.public_base_url.clone());
    settings.webhook_secret = config.gateway_webhook_secret.clone();
    settings.slack_webhook_url = config.slack_alert_webhook_url.clone();
    settings.reconciliation = ReconciliationConfig::from_env();
    settings
}
