//! Payment gateway seam and webhook wire format

use crate::payments::error::{PaymentError, PaymentResult};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Gateway order created for a pending reservation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderHandle {
    pub order_id: String,
    pub reference_id: String,
    pub amount: Decimal,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefundHandle {
    pub refund_id: String,
    pub transaction_ref: String,
    pub amount: Decimal,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn name(&self) -> &'static str;

    async fn create_order(
        &self,
        reference_id: &str,
        amount: Decimal,
        metadata: &JsonValue,
    ) -> PaymentResult<OrderHandle>;

    /// Refund part or all of a captured payment. Calls repeating an earlier
    /// `idempotency_key` return the refund already filed under it.
    async fn refund_payment(
        &self,
        transaction_ref: &str,
        amount: Decimal,
        idempotency_key: &str,
    ) -> PaymentResult<RefundHandle>;

    fn validate_signature(&self, signature: &str, secret: &str, raw_payload: &[u8]) -> bool;

    /// Secret used to sign webhooks delivered to us
    fn webhook_secret(&self) -> &str;
}

/// Webhook event kinds the engine distinguishes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookEventKind {
    PaymentAuthorized,
    PaymentCaptured,
    PaymentFailed,
    Other(String),
}

impl WebhookEventKind {
    pub fn parse(event: &str) -> Self {
        match event {
            "payment.authorized" => WebhookEventKind::PaymentAuthorized,
            "payment.captured" => WebhookEventKind::PaymentCaptured,
            "payment.failed" => WebhookEventKind::PaymentFailed,
            other => WebhookEventKind::Other(other.to_string()),
        }
    }
}

/// `{"event": "...", "payload": {"payment": {"entity": {...}}}}`
#[derive(Debug, Clone, Deserialize)]
struct WebhookEnvelope {
    event: String,
    #[serde(default)]
    payload: JsonValue,
}

#[derive(Debug, Clone, Deserialize)]
struct PaymentEntity {
    id: String,
    order_id: String,
    #[serde(default)]
    amount: Option<i64>,
    #[serde(default)]
    error_description: Option<String>,
}

/// Parsed webhook delivery
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookEvent {
    pub kind: WebhookEventKind,
    pub payment_id: Option<String>,
    pub order_id: Option<String>,
    /// Amount in minor units as reported by the gateway
    pub amount_minor: Option<i64>,
    pub failure_reason: Option<String>,
}

impl WebhookEvent {
    pub fn parse(raw_payload: &[u8]) -> PaymentResult<Self> {
        let envelope: WebhookEnvelope =
            serde_json::from_slice(raw_payload).map_err(|e| PaymentError::InvalidPayload {
                message: format!("invalid webhook payload: {}", e),
                field: None,
            })?;
        let kind = WebhookEventKind::parse(&envelope.event);

        let entity = envelope
            .payload
            .get("payment")
            .and_then(|p| p.get("entity"))
            .cloned();

        let entity = match (entity, &kind) {
            (Some(value), _) => Some(serde_json::from_value::<PaymentEntity>(value).map_err(
                |e| PaymentError::InvalidPayload {
                    message: format!("invalid payment entity: {}", e),
                    field: Some("payload.payment.entity".to_string()),
                },
            )?),
            (None, WebhookEventKind::PaymentCaptured | WebhookEventKind::PaymentFailed) => {
                return Err(PaymentError::InvalidPayload {
                    message: "payment entity missing".to_string(),
                    field: Some("payload.payment.entity".to_string()),
                })
            }
            (None, _) => None,
        };

        Ok(match entity {
            Some(entity) => WebhookEvent {
                kind,
                payment_id: Some(entity.id),
                order_id: Some(entity.order_id),
                amount_minor: entity.amount,
                failure_reason: entity.error_description,
            },
            None => WebhookEvent {
                kind,
                payment_id: None,
                order_id: None,
                amount_minor: None,
                failure_reason: None,
            },
        })
    }
}
