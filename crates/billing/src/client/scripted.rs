//! Scripted gateway for tests
//!
//! Built with `cfg(test)` or the `test-util` feature so downstream crates can
//! drive checkout and reconciliation without the HTTP client.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use super::{
    PaymentGateway, PaymentLink, PaymentLinkRequest, RefundReport, StatusReport,
    SUCCESS_STATUS_CODE,
};
use crate::error::{BillingError, BillingResult};

/// What a [`ScriptedGateway`] answers for one payment page
#[derive(Debug, Clone)]
pub enum ScriptedStatus {
    Succeeded { transaction_uid: String },
    Declined { status_code: String },
    NotFound,
    Unreachable,
}

#[derive(Default)]
struct ScriptState {
    statuses: HashMap<String, ScriptedStatus>,
    link_failures: Vec<BillingError>,
    refund_fails: bool,
    links_created: Vec<PaymentLinkRequest>,
    status_queries: usize,
    refunds: Vec<(String, i64)>,
}

/// In-process gateway with scripted answers
#[derive(Default)]
pub struct ScriptedGateway {
    state: Mutex<ScriptState>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_status(&self, gateway_correlation_id: &str, status: ScriptedStatus) {
        self.state
            .lock()
            .await
            .statuses
            .insert(gateway_correlation_id.to_string(), status);
    }

    /// Queue errors returned by the next link creations, in order
    pub async fn fail_next_link(&self, error: BillingError) {
        self.state.lock().await.link_failures.push(error);
    }

    pub async fn fail_refunds(&self, fail: bool) {
        self.state.lock().await.refund_fails = fail;
    }

    pub async fn links_created(&self) -> usize {
        self.state.lock().await.links_created.len()
    }

    pub async fn status_queries(&self) -> usize {
        self.state.lock().await.status_queries
    }

    pub async fn refunds(&self) -> Vec<(String, i64)> {
        self.state.lock().await.refunds.clone()
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    async fn create_payment_link(
        &self,
        request: &PaymentLinkRequest,
    ) -> BillingResult<PaymentLink> {
        let mut state = self.state.lock().await;
        if !state.link_failures.is_empty() {
            return Err(state.link_failures.remove(0));
        }
        state.links_created.push(request.clone());
        let gateway_correlation_id = format!("page-{}", request.correlation_ref);
        Ok(PaymentLink {
            payment_url: format!("https://pay.example.test/{}", gateway_correlation_id),
            gateway_correlation_id,
        })
    }

    async fn query_status(&self, gateway_correlation_id: &str) -> BillingResult<StatusReport> {
        let mut state = self.state.lock().await;
        state.status_queries += 1;
        match state.statuses.get(gateway_correlation_id).cloned() {
            None | Some(ScriptedStatus::NotFound) => Ok(StatusReport::not_found(Value::Null)),
            Some(ScriptedStatus::Unreachable) => Err(BillingError::GatewayUnreachable(
                "scripted outage".to_string(),
            )),
            Some(ScriptedStatus::Succeeded { transaction_uid }) => Ok(StatusReport {
                found: true,
                succeeded: true,
                transaction_uid: Some(transaction_uid),
                status_code: Some(SUCCESS_STATUS_CODE.to_string()),
                amount: None,
                raw: Value::Null,
            }),
            Some(ScriptedStatus::Declined { status_code }) => Ok(StatusReport {
                found: true,
                succeeded: false,
                transaction_uid: None,
                status_code: Some(status_code),
                amount: None,
                raw: Value::Null,
            }),
        }
    }

    async fn issue_refund(
        &self,
        transaction_uid: &str,
        amount: i64,
        _reason: &str,
    ) -> BillingResult<RefundReport> {
        let mut state = self.state.lock().await;
        if state.refund_fails {
            return Ok(RefundReport {
                succeeded: false,
                raw: serde_json::json!({"results": {"status": "error"}}),
            });
        }
        state.refunds.push((transaction_uid.to_string(), amount));
        Ok(RefundReport {
            succeeded: true,
            raw: serde_json::json!({"results": {"status": "success"}}),
        })
    }
}
