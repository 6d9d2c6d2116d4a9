use crate::config::GatewayConfig;
use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::gateway::{OrderHandle, PaymentGateway, RefundHandle};
use crate::payments::utils::{verify_hmac_sha256_hex, BasicAuth, PaymentHttpClient, Replay};
use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone)]
pub struct RazorpayConfig {
    pub key_id: String,
    pub key_secret: String,
    pub webhook_secret: String,
    pub base_url: String,
    pub currency: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl From<&GatewayConfig> for RazorpayConfig {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            key_id: config.key_id.clone(),
            key_secret: config.key_secret.clone(),
            webhook_secret: config.webhook_secret.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            currency: config.currency.clone(),
            timeout_secs: config.timeout_secs,
            max_retries: config.max_retries,
        }
    }
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    id: String,
    amount: i64,
    currency: String,
    #[serde(default)]
    receipt: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RefundResponse {
    id: String,
    payment_id: String,
    amount: i64,
    #[serde(default)]
    receipt: Option<String>,
}

impl From<RefundResponse> for RefundHandle {
    fn from(response: RefundResponse) -> Self {
        RefundHandle {
            refund_id: response.id,
            transaction_ref: response.payment_id,
            amount: from_minor_units(response.amount),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RefundCollection {
    #[serde(default)]
    items: Vec<RefundResponse>,
}

pub struct RazorpayGateway {
    config: RazorpayConfig,
    http: PaymentHttpClient,
}

impl RazorpayGateway {
    pub fn new(config: RazorpayConfig) -> PaymentResult<Self> {
        if config.key_id.is_empty() || config.key_secret.is_empty() {
            return Err(PaymentError::Misconfigured(
                "Razorpay key id and secret are required".to_string(),
            ));
        }
        let http = PaymentHttpClient::new(
            "razorpay",
            Duration::from_secs(config.timeout_secs),
            config.max_retries,
        )?;
        Ok(Self { config, http })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url, path.trim_start_matches('/'))
    }

    fn auth(&self) -> BasicAuth<'_> {
        BasicAuth {
            username: &self.config.key_id,
            password: &self.config.key_secret,
        }
    }
}

/// Whole currency units to minor units (paise)
pub fn to_minor_units(amount: Decimal) -> PaymentResult<i64> {
    if amount.is_sign_negative() {
        return Err(PaymentError::InvalidPayload {
            message: "amount cannot be negative".to_string(),
            field: Some("amount".to_string()),
        });
    }
    (amount * Decimal::ONE_HUNDRED)
        .round()
        .to_i64()
        .ok_or_else(|| PaymentError::InvalidPayload {
            message: "amount out of range".to_string(),
            field: Some("amount".to_string()),
        })
}

pub fn from_minor_units(amount: i64) -> Decimal {
    Decimal::new(amount, 2)
}

#[async_trait]
impl PaymentGateway for RazorpayGateway {
    fn name(&self) -> &'static str {
        "razorpay"
    }

    async fn create_order(
        &self,
        reference_id: &str,
        amount: Decimal,
        metadata: &JsonValue,
    ) -> PaymentResult<OrderHandle> {
        let body = json!({
            "amount": to_minor_units(amount)?,
            "currency": self.config.currency,
            "receipt": reference_id,
            "notes": metadata,
        });

        let response: OrderResponse = self
            .http
            .request_json(
                reqwest::Method::POST,
                &self.endpoint("orders"),
                self.auth(),
                Some(&body),
                Replay::Safe,
            )
            .await?;

        info!(
            order_id = %response.id,
            reference_id = %reference_id,
            "Razorpay order created"
        );

        Ok(OrderHandle {
            order_id: response.id,
            reference_id: response
                .receipt
                .unwrap_or_else(|| reference_id.to_string()),
            amount: from_minor_units(response.amount),
            currency: response.currency,
        })
    }

    /// Looks for a refund already filed under `idempotency_key` (sent as the
    /// refund receipt) before creating one
    async fn refund_payment(
        &self,
        transaction_ref: &str,
        amount: Decimal,
        idempotency_key: &str,
    ) -> PaymentResult<RefundHandle> {
        let existing: RefundCollection = self
            .http
            .request_json(
                reqwest::Method::GET,
                &self.endpoint(&format!("payments/{}/refunds", transaction_ref)),
                self.auth(),
                None,
                Replay::Safe,
            )
            .await?;
        if let Some(refund) = find_refund(existing, idempotency_key) {
            info!(
                refund_id = %refund.refund_id,
                transaction_ref = %transaction_ref,
                "Razorpay refund already filed"
            );
            return Ok(refund);
        }

        let body = json!({
            "amount": to_minor_units(amount)?,
            "receipt": idempotency_key,
        });
        let response: RefundResponse = self
            .http
            .request_json(
                reqwest::Method::POST,
                &self.endpoint(&format!("payments/{}/refund", transaction_ref)),
                self.auth(),
                Some(&body),
                Replay::Unsafe,
            )
            .await?;

        info!(
            refund_id = %response.id,
            transaction_ref = %transaction_ref,
            "Razorpay refund issued"
        );

        Ok(response.into())
    }

    fn validate_signature(&self, signature: &str, secret: &str, raw_payload: &[u8]) -> bool {
        verify_hmac_sha256_hex(raw_payload, secret, signature)
    }

    fn webhook_secret(&self) -> &str {
        &self.config.webhook_secret
    }
}

fn find_refund(collection: RefundCollection, idempotency_key: &str) -> Option<RefundHandle> {
    collection
        .items
        .into_iter()
        .find(|r| r.receipt.as_deref() == Some(idempotency_key))
        .map(RefundHandle::from)
}
