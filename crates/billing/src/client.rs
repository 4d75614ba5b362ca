//! Payment gateway client
//!
//! Hosted-payment-page provider spoken to over JSON/HTTP. Each call is a
//! single attempt with a request timeout; retry policy belongs to callers
//! (checkout retries link creation, the scheduler re-polls on its next run).

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::payment::{amount_from_json, format_major_units, DEFAULT_CURRENCY};

/// The only result code the gateway documents as a successful charge
pub const SUCCESS_STATUS_CODE: &str = "000";

const DEFAULT_TIMEOUT_SECS: u64 = 15;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub base_url: Url,
    pub api_key: String,
    pub secret_key: String,
    pub payment_page_uid: String,
    pub timeout: Duration,
}

impl GatewayConfig {
    /// Load gateway credentials from the environment
    ///
    /// Any missing key yields `GatewayNotConfigured`, which callers surface
    /// as "online payments unavailable" instead of silently skipping.
    pub fn from_env() -> BillingResult<Self> {
        let base_url = required_env("GATEWAY_BASE_URL")?;
        let base_url = Url::parse(&base_url).map_err(|e| {
            BillingError::GatewayNotConfigured(format!("GATEWAY_BASE_URL is not a URL: {}", e))
        })?;
        let timeout = std::env::var("GATEWAY_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(DEFAULT_TIMEOUT_SECS);

        Ok(Self {
            base_url,
            api_key: required_env("GATEWAY_API_KEY")?,
            secret_key: required_env("GATEWAY_SECRET_KEY")?,
            payment_page_uid: required_env("GATEWAY_PAYMENT_PAGE_UID")?,
            timeout: Duration::from_secs(timeout),
        })
    }
}

fn required_env(key: &str) -> BillingResult<String> {
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(BillingError::GatewayNotConfigured(format!("{} not set", key))),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Customer {
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineItem {
    pub name: String,
    pub quantity: u32,
    /// Unit price in agorot
    pub unit_price: i64,
}

#[derive(Debug, Clone)]
pub struct CallbackUrls {
    pub success: String,
    pub failure: String,
    pub callback: String,
}

#[derive(Debug, Clone)]
pub struct PaymentLinkRequest {
    /// Amount in agorot
    pub amount: i64,
    pub customer: Customer,
    pub products: Vec<LineItem>,
    /// Our payment id; round-trips in the callback as `more_info`
    pub correlation_ref: Uuid,
    pub callbacks: CallbackUrls,
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentLink {
    pub payment_url: String,
    pub gateway_correlation_id: String,
}

/// What the gateway currently knows about a payment page
#[derive(Debug, Clone)]
pub struct StatusReport {
    /// The gateway has a transaction for this page
    pub found: bool,
    pub succeeded: bool,
    pub transaction_uid: Option<String>,
    pub status_code: Option<String>,
    /// Charged amount in agorot, when reported
    pub amount: Option<i64>,
    pub raw: Value,
}

impl StatusReport {
    pub fn not_found(raw: Value) -> Self {
        Self {
            found: false,
            succeeded: false,
            transaction_uid: None,
            status_code: None,
            amount: None,
            raw,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RefundReport {
    pub succeeded: bool,
    pub raw: Value,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_payment_link(&self, request: &PaymentLinkRequest)
        -> BillingResult<PaymentLink>;

    /// "Not found" is reported as `found: false`, never as an error
    async fn query_status(&self, gateway_correlation_id: &str) -> BillingResult<StatusReport>;

    async fn issue_refund(
        &self,
        transaction_uid: &str,
        amount: i64,
        reason: &str,
    ) -> BillingResult<RefundReport>;
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    results: ResultsBlock,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Default, Deserialize)]
struct ResultsBlock {
    #[serde(default)]
    status: String,
    #[serde(default)]
    description: Option<String>,
}

impl Envelope {
    fn is_success(&self) -> bool {
        self.results.status.eq_ignore_ascii_case("success")
    }

    fn description(&self) -> String {
        self.results
            .description
            .clone()
            .unwrap_or_else(|| "no description".to_string())
    }
}

/// HTTP implementation of [`PaymentGateway`]
#[derive(Clone)]
pub struct GatewayClient {
    http: reqwest::Client,
    config: GatewayConfig,
}

impl GatewayClient {
    pub fn new(config: GatewayConfig) -> BillingResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| BillingError::GatewayNotConfigured(format!("HTTP client: {}", e)))?;
        Ok(Self { http, config })
    }

    pub fn from_env() -> BillingResult<Self> {
        Self::new(GatewayConfig::from_env()?)
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    fn endpoint(&self, path: &str) -> BillingResult<Url> {
        self.config
            .base_url
            .join(path)
            .map_err(|e| BillingError::GatewayNotConfigured(format!("bad endpoint {}: {}", path, e)))
    }

    async fn post(&self, path: &str, body: &Value) -> BillingResult<(reqwest::StatusCode, String)> {
        let url = self.endpoint(path)?;
        let resp = self
            .http
            .post(url)
            .header("api-key", &self.config.api_key)
            .header("secret-key", &self.config.secret_key)
            .json(body)
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;
        Ok((status, text))
    }
}

fn http_failure(status: reqwest::StatusCode, body: &str) -> BillingError {
    if status.is_server_error() {
        BillingError::GatewayUnreachable(format!("gateway returned {}", status.as_u16()))
    } else {
        BillingError::GatewayRejected(format!("status={} body={}", status.as_u16(), body))
    }
}

fn parse_envelope(body: &str) -> BillingResult<Envelope> {
    serde_json::from_str(body)
        .map_err(|e| BillingError::GatewayUnreachable(format!("invalid gateway response: {}", e)))
}

fn value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[async_trait]
impl PaymentGateway for GatewayClient {
    async fn create_payment_link(
        &self,
        request: &PaymentLinkRequest,
    ) -> BillingResult<PaymentLink> {
        if request.amount <= 0 {
            return Err(BillingError::GatewayRejected(format!(
                "amount must be positive, got {}",
                request.amount
            )));
        }

        let items: Vec<Value> = request
            .products
            .iter()
            .map(|item| {
                serde_json::json!({
                    "name": item.name,
                    "quantity": item.quantity,
                    "price": format_major_units(item.unit_price),
                })
            })
            .collect();

        let body = serde_json::json!({
            "payment_page_uid": self.config.payment_page_uid,
            "amount": format_major_units(request.amount),
            "currency_code": DEFAULT_CURRENCY,
            "more_info": request.correlation_ref.to_string(),
            "refURL_success": request.callbacks.success,
            "refURL_failure": request.callbacks.failure,
            "refURL_callback": request.callbacks.callback,
            "customer": {
                "customer_name": request.customer.name,
                "email": request.customer.email,
                "phone": request.customer.phone,
            },
            "items": items,
        });

        let (status, text) = self.post("PaymentPages/generateLink", &body).await?;
        if !status.is_success() {
            return Err(http_failure(status, &text));
        }

        let envelope = parse_envelope(&text)?;
        if !envelope.is_success() {
            return Err(BillingError::GatewayRejected(envelope.description()));
        }

        let payment_url = envelope.data["payment_page_link"].as_str().map(str::to_string);
        let correlation = envelope.data["page_request_uid"].as_str().map(str::to_string);
        match (payment_url, correlation) {
            (Some(payment_url), Some(gateway_correlation_id)) => {
                tracing::info!(
                    payment_id = %request.correlation_ref,
                    gateway_correlation_id = %gateway_correlation_id,
                    "Payment link created"
                );
                Ok(PaymentLink {
                    payment_url,
                    gateway_correlation_id,
                })
            }
            _ => Err(BillingError::GatewayUnreachable(
                "payment link response missing page link or request uid".to_string(),
            )),
        }
    }

    async fn query_status(&self, gateway_correlation_id: &str) -> BillingResult<StatusReport> {
        let body = serde_json::json!({ "payment_request_uid": gateway_correlation_id });
        let (status, text) = self.post("PaymentPages/ipn", &body).await?;

        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(StatusReport::not_found(Value::Null));
        }
        if !status.is_success() {
            return Err(http_failure(status, &text));
        }

        let raw: Value = serde_json::from_str(&text).map_err(|e| {
            BillingError::GatewayUnreachable(format!("invalid gateway response: {}", e))
        })?;
        let envelope = parse_envelope(&text)?;
        let transaction = &envelope.data["transaction"];

        // The gateway answers "error" for pages nobody has paid on yet
        if !envelope.is_success() || !transaction.is_object() {
            tracing::debug!(
                gateway_correlation_id = %gateway_correlation_id,
                description = %envelope.description(),
                "No settled transaction at gateway yet"
            );
            return Ok(StatusReport::not_found(raw));
        }

        let status_code = value_as_string(&transaction["status_code"]);
        Ok(StatusReport {
            found: true,
            succeeded: status_code.as_deref() == Some(SUCCESS_STATUS_CODE),
            transaction_uid: value_as_string(&transaction["uid"]),
            status_code,
            amount: amount_from_json(&transaction["amount"]),
            raw,
        })
    }

    async fn issue_refund(
        &self,
        transaction_uid: &str,
        amount: i64,
        reason: &str,
    ) -> BillingResult<RefundReport> {
        let body = serde_json::json!({
            "transaction_uid": transaction_uid,
            "amount": format_major_units(amount),
            "more_info": reason,
        });
        let (status, text) = self.post("Transactions/RefundByTransactionUID", &body).await?;
        if !status.is_success() {
            return Err(http_failure(status, &text));
        }
        let raw: Value = serde_json::from_str(&text).unwrap_or(Value::String(text.clone()));
        let envelope = parse_envelope(&text)?;
        Ok(RefundReport {
            succeeded: envelope.is_success(),
            raw,
        })
    }
}

/// Stand-in used when gateway credentials are absent
///
/// Every call fails with `GatewayNotConfigured` so free and POS flows keep
/// working while online checkout reports itself unavailable.
#[derive(Debug, Clone)]
pub struct UnconfiguredGateway {
    reason: String,
}

impl UnconfiguredGateway {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl PaymentGateway for UnconfiguredGateway {
    async fn create_payment_link(&self, _: &PaymentLinkRequest) -> BillingResult<PaymentLink> {
        Err(BillingError::GatewayNotConfigured(self.reason.clone()))
    }

    async fn query_status(&self, _: &str) -> BillingResult<StatusReport> {
        Err(BillingError::GatewayNotConfigured(self.reason.clone()))
    }

    async fn issue_refund(&self, _: &str, _: i64, _: &str) -> BillingResult<RefundReport> {
        Err(BillingError::GatewayNotConfigured(self.reason.clone()))
    }
}

#[cfg(any(test, feature = "test-util"))]
mod scripted;
#[cfg(any(test, feature = "test-util"))]
pub use scripted::{ScriptedGateway, ScriptedStatus};

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn client_for(server: &mockito::ServerGuard) -> GatewayClient {
        GatewayClient::new(GatewayConfig {
            base_url: Url::parse(&format!("{}/api/v1.0/", server.url())).unwrap(),
            api_key: "key".to_string(),
            secret_key: "secret".to_string(),
            payment_page_uid: "page-uid".to_string(),
            timeout: Duration::from_secs(2),
        })
        .unwrap()
    }

    fn link_request() -> PaymentLinkRequest {
        PaymentLinkRequest {
            amount: 32_000,
            customer: Customer {
                name: "Dana".to_string(),
                email: Some("dana@example.com".to_string()),
                phone: None,
            },
            products: vec![LineItem {
                name: "10 entries".to_string(),
                quantity: 1,
                unit_price: 32_000,
            }],
            correlation_ref: Uuid::new_v4(),
            callbacks: CallbackUrls {
                success: "https://venue.test/success".to_string(),
                failure: "https://venue.test/failure".to_string(),
                callback: "https://venue.test/api/payments/webhook".to_string(),
            },
        }
    }

    #[tokio::test]
    async fn creates_payment_link_with_credentials() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/v1.0/PaymentPages/generateLink")
            .match_header("api-key", "key")
            .match_header("secret-key", "secret")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "amount": "320.00",
                "payment_page_uid": "page-uid",
            })))
            .with_status(200)
            .with_body(
                r#"{"results":{"status":"success","code":0},
                    "data":{"page_request_uid":"pr-1","payment_page_link":"https://pay/pr-1"}}"#,
            )
            .create_async()
            .await;

        let link = client_for(&server)
            .create_payment_link(&link_request())
            .await
            .unwrap();
        mock.assert_async().await;
        assert_eq!(link.gateway_correlation_id, "pr-1");
        assert_eq!(link.payment_url, "https://pay/pr-1");
    }

    #[tokio::test]
    async fn provider_refusal_is_rejected_not_unreachable() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/v1.0/PaymentPages/generateLink")
            .with_status(200)
            .with_body(r#"{"results":{"status":"error","description":"invalid amount"}}"#)
            .create_async()
            .await;

        let err = client_for(&server)
            .create_payment_link(&link_request())
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::GatewayRejected(ref d) if d.contains("invalid amount")));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn server_error_is_transient() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/v1.0/PaymentPages/generateLink")
            .with_status(503)
            .create_async()
            .await;

        let err = client_for(&server)
            .create_payment_link(&link_request())
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn unpaid_page_is_not_found_rather_than_failed() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/v1.0/PaymentPages/ipn")
            .with_status(200)
            .with_body(r#"{"results":{"status":"error","description":"not found"}}"#)
            .create_async()
            .await;

        let report = client_for(&server).query_status("pr-1").await.unwrap();
        assert!(!report.found);
        assert!(!report.succeeded);
    }

    #[tokio::test]
    async fn only_documented_code_counts_as_success() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/v1.0/PaymentPages/ipn")
            .with_status(200)
            .with_body(
                r#"{"results":{"status":"success"},
                    "data":{"transaction":{"uid":"tx-9","status_code":"001","amount":320}}}"#,
            )
            .create_async()
            .await;

        let report = client_for(&server).query_status("pr-1").await.unwrap();
        assert!(report.found);
        assert!(!report.succeeded);
        assert_eq!(report.amount, Some(32_000));
        assert_eq!(report.status_code.as_deref(), Some("001"));
    }

    #[tokio::test]
    #[serial]
    async fn missing_credentials_are_explicit() {
        std::env::remove_var("GATEWAY_API_KEY");
        std::env::set_var("GATEWAY_BASE_URL", "https://gateway.test/api/");
        let err = GatewayConfig::from_env().unwrap_err();
        assert!(matches!(err, BillingError::GatewayNotConfigured(ref m) if m.contains("GATEWAY_API_KEY")));
        std::env::remove_var("GATEWAY_BASE_URL");
    }

    #[tokio::test]
    async fn unconfigured_gateway_never_pretends_success() {
        let gateway = UnconfiguredGateway::new("GATEWAY_API_KEY not set");
        assert!(matches!(
            gateway.query_status("x").await,
            Err(BillingError::GatewayNotConfigured(_))
        ));
    }
}
