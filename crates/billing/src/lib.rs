// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError carries gateway and conflict context
#![allow(clippy::too_many_arguments)] // Service constructors wire several collaborators
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Playhouse Billing Core
//!
//! Keeps local payment records consistent with the hosted card gateway and
//! turns settled payments into passes and event registrations.
//!
//! ## Features
//!
//! - **Checkout**: Price a purchase, apply a coupon, hold capacity, create the hosted payment page
//! - **Webhooks**: Verify, deduplicate and apply gateway callbacks
//! - **Settlement**: Conditional `pending -> completed | failed` transitions shared by every writer
//! - **Materialization**: Exactly one entitlement per completed payment
//! - **Reconciliation**: Sync pending payments, expire abandoned ones, flag stuck ones, retry webhooks
//! - **POS**: Front-desk cash, terminal and Bit sales
//! - **Refunds**: Full or partial refunds with entitlement revocation
//! - **Alerts**: Operator alerts persisted and forwarded to Slack

pub mod alerts;
pub mod catalog;
pub mod checkout;
pub mod client;
pub mod entitlement;
pub mod error;
pub mod guard;
pub mod payment;
pub mod poller;
pub mod pos;
pub mod reconciliation;
pub mod refund;
pub mod settlement;
pub mod store;
pub mod webhooks;


// Alerts
pub use alerts::{AlertKind, AlertService, AlertSeverity, OperatorAlert};

// Catalog
pub use catalog::{CardType, Coupon, DiscountType, EventInfo, EventStatus};

// Checkout
pub use checkout::{CheckoutOutcome, CheckoutRequest, CheckoutService};

// Client
pub use client::{GatewayClient, GatewayConfig, PaymentGateway, UnconfiguredGateway};
#[cfg(any(test, feature = "test-util"))]
pub use client::{ScriptedGateway, ScriptedStatus};

// Entitlement
pub use entitlement::{
    Entitlement, EntitlementMaterializer, EventRegistration, Pass, PassService, PassStatus,
    PassValidityPolicy, RegistrationStatus,
};

// Error
pub use error::{BillingError, BillingResult};

// Guards
pub use guard::{
    CapacityCheck, CapacityGuard, CouponError, CouponGuard, CouponQuote, CouponRedemption,
};

// Payment
pub use payment::{ItemType, PaymentRecord, PaymentStatus, PaymentType, Purchase};

// Poller
pub use poller::{PollOutcome, PollerConfig, StatusPoller};

// POS
pub use pos::{PosReceipt, PosSale, PosService};

// Reconciliation
pub use reconciliation::{
    JobKind, ReconciliationConfig, ReconciliationRun, Reconciler, RetrySchedule, VerifyOutcome,
};

// Refund
pub use refund::{Refund, RefundResult, RefundService, RefundStatus};

// Settlement
pub use settlement::{GatewayVerdict, SettledBy, Settlement, SettlementResult};

// Store
pub use store::{MemoryStore, PgStore, Store};

// Webhooks
pub use webhooks::{WebhookAck, WebhookHandler, WebhookLog, WebhookStatus};

use std::sync::Arc;

use url::Url;

/// Deployment settings the billing services need besides the store and gateway
#[derive(Debug, Clone)]
pub struct BillingSettings {
    /// Gateway secret used to verify callback signatures; `None` rejects every callback
    pub webhook_secret: Option<String>,
    pub slack_webhook_url: Option<String>,
    /// Public origin of the site, used to build return and callback URLs
    pub public_base_url: Url,
    pub reconciliation: ReconciliationConfig,
    pub pass_validity: PassValidityPolicy,
}

impl BillingSettings {
    pub fn new(public_base_url: Url) -> Self {
        Self {
            webhook_secret: None,
            slack_webhook_url: None,
            public_base_url,
            reconciliation: ReconciliationConfig::default(),
            pass_validity: PassValidityPolicy::default(),
        }
    }
}

/// Main billing service that combines all billing functionality
#[derive(Clone)]
pub struct BillingService {
    pub store: Arc<dyn Store>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub alerts: AlertService,
    pub settlement: Settlement,
    pub capacity: CapacityGuard,
    pub coupons: CouponGuard,
    pub checkout: CheckoutService,
    pub webhooks: WebhookHandler,
    pub reconciler: Reconciler,
    pub passes: PassService,
    pub pos: PosService,
    pub refunds: RefundService,
}

impl BillingService {
    pub fn new(
        store: Arc<dyn Store>,
        gateway: Arc<dyn PaymentGateway>,
        settings: BillingSettings,
    ) -> Self {
        let hold_window = settings.reconciliation.abandon_after;
        let alerts = AlertService::new(store.clone(), settings.slack_webhook_url.clone());
        let materializer = EntitlementMaterializer::new(
            store.clone(),
            alerts.clone(),
            settings.pass_validity,
            hold_window,
        );
        let settlement = Settlement::new(store.clone(), materializer, alerts.clone());
        let capacity = CapacityGuard::new(store.clone(), hold_window);
        let coupons = CouponGuard::new(store.clone(), hold_window);
        let webhooks = WebhookHandler::new(
            store.clone(),
            settlement.clone(),
            alerts.clone(),
            settings.webhook_secret.clone(),
        );

        Self {
            checkout: CheckoutService::new(
                store.clone(),
                gateway.clone(),
                settlement.clone(),
                capacity.clone(),
                coupons.clone(),
                settings.public_base_url.clone(),
            ),
            reconciler: Reconciler::new(
                store.clone(),
                gateway.clone(),
                settlement.clone(),
                webhooks.clone(),
                alerts.clone(),
                settings.reconciliation,
            ),
            passes: PassService::new(store.clone()),
            pos: PosService::new(store.clone(), settlement.clone(), capacity.clone()),
            refunds: RefundService::new(store.clone(), gateway.clone(), alerts.clone()),
            webhooks,
            settlement,
            capacity,
            coupons,
            alerts,
            gateway,
            store,
        }
    }

    /// Postgres store and the gateway from `GATEWAY_*` variables
    ///
    /// A missing gateway configuration is not fatal: checkout and sync fail
    /// with `GatewayNotConfigured` while POS sales keep working.
    pub fn with_pool(pool: sqlx::PgPool, settings: BillingSettings) -> Self {
        let gateway: Arc<dyn PaymentGateway> = match GatewayClient::from_env() {
            Ok(client) => Arc::new(client),
            Err(e) => {
                tracing::warn!(error = %e, "Payment gateway not configured");
                Arc::new(UnconfiguredGateway::new(e.to_string()))
            }
        };
        Self::new(Arc::new(PgStore::new(pool)), gateway, settings)
    }
}
