//! Purchaser-side status polling
//!
//! After the redirect back from the hosted page the webhook may not have
//! arrived yet. The return page polls the status endpoint (which itself asks
//! the gateway) with exponential backoff, bounded by a total wait, and shows
//! "still processing" if the payment has not settled by then.

use std::time::Duration;

use serde::Deserialize;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::RetryIf;
use url::Url;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::payment::PaymentStatus;

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub first_delay: Duration,
    pub max_delay: Duration,
    /// Sum of all waits never exceeds this
    pub max_total: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            first_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            max_total: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Settled(PaymentStatus),
    StillPending,
}

#[derive(Debug, Deserialize)]
struct StatusBody {
    status: PaymentStatus,
}

enum Attempt {
    Pending,
    Failed(BillingError),
}

impl Attempt {
    fn should_retry(&self) -> bool {
        match self {
            Attempt::Pending => true,
            Attempt::Failed(e) => e.is_transient(),
        }
    }
}

pub struct StatusPoller {
    http: reqwest::Client,
    base_url: Url,
    config: PollerConfig,
}

impl StatusPoller {
    pub fn new(base_url: Url, config: PollerConfig) -> BillingResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| BillingError::InvalidInput(format!("HTTP client: {}", e)))?;
        Ok(Self {
            http,
            base_url,
            config,
        })
    }

    fn delays(&self) -> impl Iterator<Item = Duration> {
        let factor = u64::try_from(self.config.first_delay.as_millis() / 2)
            .unwrap_or(u64::MAX)
            .max(1);
        let max_total = self.config.max_total;
        ExponentialBackoff::from_millis(2)
            .factor(factor)
            .max_delay(self.config.max_delay)
            .scan(Duration::ZERO, move |elapsed, delay| {
                *elapsed += delay;
                (*elapsed <= max_total).then_some(delay)
            })
    }

    async fn fetch(&self, payment_id: Uuid) -> Result<PaymentStatus, Attempt> {
        let url = self
            .base_url
            .join(&format!("api/payments/{}/status", payment_id))
            .map_err(|e| Attempt::Failed(BillingError::InvalidInput(e.to_string())))?;

        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| Attempt::Failed(e.into()))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(Attempt::Failed(BillingError::NotFound(format!(
                "payment {}",
                payment_id
            ))));
        }
        if !resp.status().is_success() {
            return Err(Attempt::Failed(BillingError::GatewayUnreachable(format!(
                "status endpoint returned {}",
                resp.status().as_u16()
            ))));
        }
        let body: StatusBody = resp
            .json()
            .await
            .map_err(|e| Attempt::Failed(e.into()))?;
        match body.status {
            PaymentStatus::Pending => Err(Attempt::Pending),
            settled => Ok(settled),
        }
    }

    pub async fn wait_for_settlement(&self, payment_id: Uuid) -> BillingResult<PollOutcome> {
        match RetryIf::spawn(
            self.delays(),
            || self.fetch(payment_id),
            |attempt: &Attempt| attempt.should_retry(),
        )
        .await
        {
            Ok(status) => Ok(PollOutcome::Settled(status)),
            Err(Attempt::Pending) => Ok(PollOutcome::StillPending),
            Err(Attempt::Failed(e)) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast() -> PollerConfig {
        PollerConfig {
            first_delay: Duration::from_millis(2),
            max_delay: Duration::from_millis(10),
            max_total: Duration::from_millis(40),
        }
    }

    #[tokio::test]
    async fn returns_settled_status() {
        let mut server = mockito::Server::new_async().await;
        let id = Uuid::new_v4();
        server
            .mock("GET", format!("/api/payments/{}/status", id).as_str())
            .with_status(200)
            .with_body(r#"{"status":"completed"}"#)
            .create_async()
            .await;

        let poller = StatusPoller::new(Url::parse(&server.url()).unwrap(), fast()).unwrap();
        assert_eq!(
            poller.wait_for_settlement(id).await.unwrap(),
            PollOutcome::Settled(PaymentStatus::Completed)
        );
    }

    #[tokio::test]
    async fn gives_up_as_still_pending_within_budget() {
        let mut server = mockito::Server::new_async().await;
        let id = Uuid::new_v4();
        let mock = server
            .mock("GET", format!("/api/payments/{}/status", id).as_str())
            .with_status(200)
            .with_body(r#"{"status":"pending"}"#)
            .expect_at_least(2)
            .create_async()
            .await;

        let poller = StatusPoller::new(Url::parse(&server.url()).unwrap(), fast()).unwrap();
        let started = std::time::Instant::now();
        assert_eq!(
            poller.wait_for_settlement(id).await.unwrap(),
            PollOutcome::StillPending
        );
        assert!(started.elapsed() < Duration::from_secs(2));
        mock.assert_async().await;
    }

    #[test]
    fn total_wait_is_bounded() {
        let poller = StatusPoller::new(
            Url::parse("http://localhost").unwrap(),
            PollerConfig::default(),
        )
        .unwrap();
        let total: Duration = poller.delays().sum();
        assert!(total <= Duration::from_secs(120));
        assert!(poller.delays().all(|d| d <= Duration::from_secs(10)));
    }
}
