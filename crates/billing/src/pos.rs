//! Front-desk sales (cash, card terminal, Bit)
//!
//! No gateway is involved: staff confirm the money in hand, so the payment is
//! created and settled in one call. It still goes through the conditional
//! transition and the materializer, like every other settlement.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::checkout::price_purchase;
use crate::entitlement::Entitlement;
use crate::error::{BillingError, BillingResult};
use crate::guard::CapacityGuard;
use crate::payment::{meta_keys, NewPayment, PaymentMetadata, PaymentRecord, PaymentType, Purchase};
use crate::settlement::{GatewayVerdict, SettledBy, Settlement, SettlementResult};
use crate::store::Store;

#[derive(Debug, Clone, Deserialize)]
pub struct PosSale {
    /// Customer account, when the sale is made on someone's behalf
    pub user_id: Option<Uuid>,
    pub purchase: Purchase,
    pub payment_type: PaymentType,
    /// Overrides the list price (staff discount); never above it
    #[serde(default)]
    pub amount: Option<i64>,
    pub recorded_by: String,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PosReceipt {
    pub payment: PaymentRecord,
    pub entitlement: Entitlement,
}

#[derive(Clone)]
pub struct PosService {
    store: Arc<dyn Store>,
    settlement: Settlement,
    capacity: CapacityGuard,
}

impl PosService {
    pub fn new(store: Arc<dyn Store>, settlement: Settlement, capacity: CapacityGuard) -> Self {
        Self {
            store,
            settlement,
            capacity,
        }
    }

    pub async fn record_sale(&self, sale: PosSale) -> BillingResult<PosReceipt> {
        if !sale.payment_type.is_pos() {
            return Err(BillingError::InvalidInput(format!(
                "{} is not a point-of-sale payment type",
                sale.payment_type
            )));
        }

        let priced = price_purchase(self.store.as_ref(), &self.capacity, &sale.purchase).await?;
        let amount = sale.amount.unwrap_or(priced.price);
        if amount > priced.price {
            return Err(BillingError::InvalidInput(format!(
                "amount {} exceeds list price {}",
                amount, priced.price
            )));
        }

        let mut metadata = PaymentMetadata::new()
            .with_purchase(&sale.purchase)?
            .with(meta_keys::RECORDED_BY, sale.recorded_by.as_str())
            .with(meta_keys::ORIGINAL_AMOUNT, priced.price);
        if let Some(note) = &sale.note {
            metadata.insert("note", note.as_str());
        }

        let payment = self
            .store
            .create_pending(NewPayment::new(sale.user_id, amount, sale.payment_type, metadata)?)
            .await?;

        let verdict = GatewayVerdict::Succeeded {
            transaction_uid: None,
            status_code: None,
        };
        match self
            .settlement
            .settle(&payment, verdict, SettledBy::Pos)
            .await?
        {
            SettlementResult::Completed {
                payment,
                entitlement,
            }
            | SettlementResult::AlreadyCompleted {
                payment,
                entitlement,
            } => {
                tracing::info!(
                    payment_id = %payment.id,
                    payment_type = %payment.payment_type,
                    amount = payment.amount,
                    recorded_by = %sale.recorded_by,
                    "POS sale recorded"
                );
                Ok(PosReceipt {
                    payment,
                    entitlement,
                })
            }
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
}
