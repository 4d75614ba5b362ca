//! Checkout: price a purchase, hold it, and hand off to the gateway
//!
//! Paid purchases create a `pending` payment (which doubles as the capacity
//! hold for events) before asking the gateway for a hosted payment page.
//! Purchases priced at zero after the coupon skip the gateway and settle at
//! once through the same transition and materialization path.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use url::Url;
use uuid::Uuid;

use crate::client::{CallbackUrls, Customer, LineItem, PaymentGateway, PaymentLink, PaymentLinkRequest};
use crate::entitlement::Entitlement;
use crate::error::{BillingError, BillingResult};
use crate::guard::{CapacityGuard, CouponGuard, CouponQuote};
use crate::payment::{meta_keys, NewPayment, PaymentMetadata, PaymentType, Purchase};
use crate::settlement::{GatewayVerdict, SettledBy, Settlement, SettlementResult};
use crate::store::Store;

/// Retries after the first link-creation attempt, transient errors only
const LINK_RETRIES: usize = 1;

#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutRequest {
    pub user_id: Option<Uuid>,
    pub purchase: Purchase,
    #[serde(default)]
    pub coupon_code: Option<String>,
    pub customer: Customer,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "next", rename_all = "snake_case")]
pub enum CheckoutOutcome {
    /// Send the purchaser to the hosted payment page
    Redirect {
        payment_id: Uuid,
        payment_url: String,
        amount: i64,
    },
    /// Nothing to pay; the entitlement already exists
    Completed {
        payment_id: Uuid,
        entitlement: Entitlement,
    },
}

pub(crate) struct Priced {
    pub name: String,
    pub price: i64,
}

/// Current list price; refuses inactive card types, closed or full events
pub(crate) async fn price_purchase(
    store: &dyn Store,
    capacity: &CapacityGuard,
    purchase: &Purchase,
) -> BillingResult<Priced> {
    match purchase {
        Purchase::Pass { card_type_id } => {
            let card = store
                .get_card_type(*card_type_id)
                .await?
                .ok_or_else(|| BillingError::NotFound(format!("card type {}", card_type_id)))?;
            if !card.is_active {
                return Err(BillingError::ItemUnavailable(format!(
                    "card type '{}' is no longer sold",
                    card.name
                )));
            }
            Ok(Priced {
                name: card.name,
                price: card.price,
            })
        }
        Purchase::EventTicket { event_id, .. } => {
            let event = store
                .get_event(*event_id)
                .await?
                .ok_or_else(|| BillingError::NotFound(format!("event {}", event_id)))?;
            if !event.is_open_for_sale(OffsetDateTime::now_utc()) {
                return Err(BillingError::ItemUnavailable(format!(
                    "event '{}' is not open for registration",
                    event.title
                )));
            }
            capacity.ensure_available(*event_id, 1).await?;
            Ok(Priced {
                name: event.title,
                price: event.price,
            })
        }
    }
}

#[derive(Clone)]
pub struct CheckoutService {
    store: Arc<dyn Store>,
    gateway: Arc<dyn PaymentGateway>,
    settlement: Settlement,
    capacity: CapacityGuard,
    coupons: CouponGuard,
    public_base_url: Url,
}

impl CheckoutService {
    pub fn new(
        store: Arc<dyn Store>,
        gateway: Arc<dyn PaymentGateway>,
        settlement: Settlement,
        capacity: CapacityGuard,
        coupons: CouponGuard,
        public_base_url: Url,
    ) -> Self {
        Self {
            store,
            gateway,
            settlement,
            capacity,
            coupons,
            public_base_url,
        }
    }

    pub async fn start_checkout(&self, request: CheckoutRequest) -> BillingResult<CheckoutOutcome> {
        let priced = price_purchase(self.store.as_ref(), &self.capacity, &request.purchase).await?;
        let item_type = request.purchase.item_type();

        let quote: Option<CouponQuote> = match request.coupon_code.as_deref().map(str::trim) {
            Some(code) if !code.is_empty() => Some(
                self.coupons
                    .validate_coupon(code, item_type, priced.price)
                    .await?,
            ),
            _ => None,
        };
        let amount = quote.as_ref().map_or(priced.price, |q| q.final_amount);

        let mut metadata = PaymentMetadata::new()
            .with_purchase(&request.purchase)?
            .with(meta_keys::CUSTOMER_NAME, request.customer.name.as_str())
            .with(meta_keys::ORIGINAL_AMOUNT, priced.price);
        if let Some(email) = &request.customer.email {
            metadata.insert(meta_keys::CUSTOMER_EMAIL, email.as_str());
        }
        if let Some(q) = &quote {
            metadata.insert(meta_keys::COUPON_CODE, q.code.as_str());
            metadata.insert(meta_keys::DISCOUNT_AMOUNT, q.discount_amount);
        }

        if amount == 0 {
            self.complete_free(request.user_id, metadata).await
        } else {
            self.start_paid(request, priced, amount, metadata).await
        }
    }

    async fn complete_free(
        &self,
        user_id: Option<Uuid>,
        metadata: PaymentMetadata,
    ) -> BillingResult<CheckoutOutcome> {
        let payment = self
            .store
            .create_pending(NewPayment::new(user_id, 0, PaymentType::FreeCoupon, metadata)?)
            .await?;

        let verdict = GatewayVerdict::Succeeded {
            transaction_uid: None,
            status_code: None,
        };
        match self
            .settlement
            .settle(&payment, verdict, SettledBy::FreeCoupon)
            .await?
        {
            SettlementResult::Completed {
                payment,
                entitlement,
            }
            | SettlementResult::AlreadyCompleted {
                payment,
                entitlement,
            } => Ok(CheckoutOutcome::Completed {
                payment_id: payment.id,
                entitlement,
            }),
            SettlementResult::ManualRefund { payment, reason } => {
                Err(BillingError::MaterializationConflict {
                    payment_id: payment.id,
                    reason,
                })
            }
            other => Err(BillingError::InvalidTransition {
                from: other.payment().status.to_string(),
                to: "completed".to_string(),
            }),
        }
    }

    async fn start_paid(
        &self,
        request: CheckoutRequest,
        priced: Priced,
        amount: i64,
        metadata: PaymentMetadata,
    ) -> BillingResult<CheckoutOutcome> {
        let payment = self
            .store
            .create_pending(NewPayment::new(
                request.user_id,
                amount,
                PaymentType::OnlineCard,
                metadata,
            )?)
            .await?;

        let link_request = PaymentLinkRequest {
            amount,
            customer: request.customer,
            products: vec![LineItem {
                name: priced.name,
                quantity: 1,
                unit_price: amount,
            }],
            correlation_ref: payment.id,
            callbacks: self.callback_urls(payment.id)?,
        };

        match self.create_link_with_retry(&link_request).await {
            Ok(link) => {
                self.store
                    .set_gateway_correlation(payment.id, &link.gateway_correlation_id)
                    .await?;
                tracing::info!(
                    payment_id = %payment.id,
                    amount = amount,
                    "Checkout started"
                );
                Ok(CheckoutOutcome::Redirect {
                    payment_id: payment.id,
                    payment_url: link.payment_url,
                    amount,
                })
            }
            Err(e) => {
                tracing::warn!(
                    payment_id = %payment.id,
                    error = %e,
                    "Payment link creation failed, releasing hold"
                );
                let verdict = GatewayVerdict::Declined {
                    status_code: None,
                    reason: format!("payment link creation failed: {}", e),
                };
                if let Err(release_err) = self
                    .settlement
                    .settle(&payment, verdict, SettledBy::Checkout)
                    .await
                {
                    // The expiry job fails it later; the hold lapses by time anyway
                    tracing::error!(
                        payment_id = %payment.id,
                        error = %release_err,
                        "Failed to mark payment failed after link error"
                    );
                }
                Err(e)
            }
        }
    }

    async fn create_link_with_retry(
        &self,
        request: &PaymentLinkRequest,
    ) -> BillingResult<PaymentLink> {
        let strategy = ExponentialBackoff::from_millis(250)
            .max_delay(std::time::Duration::from_secs(2))
            .map(jitter)
            .take(LINK_RETRIES);

        RetryIf::spawn(
            strategy,
            || self.gateway.create_payment_link(request),
            |e: &BillingError| e.is_transient(),
        )
        .await
    }

    fn callback_urls(&self, payment_id: Uuid) -> BillingResult<CallbackUrls> {
        let join = |path: String| {
            self.public_base_url
                .join(&path)
                .map(String::from)
                .map_err(|e| BillingError::InvalidInput(format!("bad public URL: {}", e)))
        };
        Ok(CallbackUrls {
            success: join(format!("payment/success?payment_id={}", payment_id))?,
            failure: join(format!("payment/failure?payment_id={}", payment_id))?,
            callback: join("api/payments/webhook".to_string())?,
        })
    }
}
