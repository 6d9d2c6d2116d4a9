//! In-process gateway for tests and local runs
//!
//! Records every order and refund, signs webhooks with HMAC-SHA256 like the
//! real gateway, and can be told to fail the next calls.

use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::gateway::{OrderHandle, PaymentGateway, RefundHandle};
use crate::payments::utils::{hmac_sha256_hex, verify_hmac_sha256_hex};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedOrder {
    pub handle: OrderHandle,
    pub metadata: JsonValue,
}

#[derive(Default)]
struct MockState {
    orders: Vec<RecordedOrder>,
    refunds: Vec<RefundHandle>,
    refund_keys: HashMap<String, RefundHandle>,
}

#[derive(Clone)]
pub struct MockPaymentGateway {
    webhook_secret: String,
    state: Arc<Mutex<MockState>>,
    sequence: Arc<AtomicU64>,
    fail_orders: Arc<AtomicBool>,
    fail_refunds: Arc<AtomicBool>,
}

impl MockPaymentGateway {
    pub fn new(webhook_secret: impl Into<String>) -> Self {
        Self {
            webhook_secret: webhook_secret.into(),
            state: Arc::new(Mutex::new(MockState::default())),
            sequence: Arc::new(AtomicU64::new(1)),
            fail_orders: Arc::new(AtomicBool::new(false)),
            fail_refunds: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn shared(webhook_secret: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::new(webhook_secret))
    }

    /// Fail order creation until reset
    pub fn set_fail_orders(&self, fail: bool) {
        self.fail_orders.store(fail, Ordering::SeqCst);
    }

    /// Fail refunds until reset
    pub fn set_fail_refunds(&self, fail: bool) {
        self.fail_refunds.store(fail, Ordering::SeqCst);
    }

    pub fn orders(&self) -> Vec<RecordedOrder> {
        self.state
            .lock()
            .map(|s| s.orders.clone())
            .unwrap_or_default()
    }

    pub fn refunds(&self) -> Vec<RefundHandle> {
        self.state
            .lock()
            .map(|s| s.refunds.clone())
            .unwrap_or_default()
    }

    /// Signature the gateway would attach to `raw_payload`
    pub fn sign(&self, raw_payload: &[u8]) -> String {
        hmac_sha256_hex(raw_payload, &self.webhook_secret).unwrap_or_default()
    }

    fn next_id(&self, prefix: &str) -> String {
        format!(
            "{}_{:08}",
            prefix,
            self.sequence.fetch_add(1, Ordering::SeqCst)
        )
    }
}

#[async_trait]
impl PaymentGateway for MockPaymentGateway {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn create_order(
        &self,
        reference_id: &str,
        amount: Decimal,
        metadata: &JsonValue,
    ) -> PaymentResult<OrderHandle> {
        if self.fail_orders.load(Ordering::SeqCst) {
            return Err(PaymentError::Rejected {
                gateway: "mock".to_string(),
                status: 503,
                message: "order creation unavailable".to_string(),
            });
        }

        let handle = OrderHandle {
            order_id: self.next_id("order"),
            reference_id: reference_id.to_string(),
            amount,
            currency: "INR".to_string(),
        };
        if let Ok(mut state) = self.state.lock() {
            state.orders.push(RecordedOrder {
                handle: handle.clone(),
                metadata: metadata.clone(),
            });
        }
        Ok(handle)
    }

    async fn refund_payment(
        &self,
        transaction_ref: &str,
        amount: Decimal,
        idempotency_key: &str,
    ) -> PaymentResult<RefundHandle> {
        if self.fail_refunds.load(Ordering::SeqCst) {
            return Err(PaymentError::Unavailable {
                gateway: "mock".to_string(),
                message: "refund endpoint unreachable".to_string(),
            });
        }

        let mut state = self.state.lock().map_err(|_| PaymentError::Unavailable {
            gateway: "mock".to_string(),
            message: "state poisoned".to_string(),
        })?;
        if let Some(existing) = state.refund_keys.get(idempotency_key) {
            return Ok(existing.clone());
        }

        let handle = RefundHandle {
            refund_id: self.next_id("rfnd"),
            transaction_ref: transaction_ref.to_string(),
            amount,
        };
        state.refunds.push(handle.clone());
        state
            .refund_keys
            .insert(idempotency_key.to_string(), handle.clone());
        Ok(handle)
    }

    fn validate_signature(&self, signature: &str, secret: &str, raw_payload: &[u8]) -> bool {
        verify_hmac_sha256_hex(raw_payload, secret, signature)
    }

    fn webhook_secret(&self) -> &str {
        &self.webhook_secret
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_orders_and_refunds() {
        let gateway = MockPaymentGateway::new("whsec");
        let order = gateway
            .create_order("res-1", Decimal::from(500), &serde_json::json!({}))
            .await
            .unwrap();
        let refund = gateway
            .refund_payment("pay_1", Decimal::from(200), "refund_1")
            .await
            .unwrap();

        assert_eq!(gateway.orders()[0].handle, order);
        assert_eq!(gateway.refunds(), vec![refund]);
    }

    #[tokio::test]
    async fn repeated_refund_key_returns_the_first_refund() {
        let gateway = MockPaymentGateway::new("whsec");
        let first = gateway
            .refund_payment("pay_1", Decimal::from(200), "refund_1")
            .await
            .unwrap();
        let again = gateway
            .refund_payment("pay_1", Decimal::from(200), "refund_1")
            .await
            .unwrap();
        let other = gateway
            .refund_payment("pay_1", Decimal::from(50), "refund_2")
            .await
            .unwrap();

        assert_eq!(first, again);
        assert_ne!(first.refund_id, other.refund_id);
        assert_eq!(gateway.refunds().len(), 2);
    }

    #[tokio::test]
    async fn injected_failure_is_retryable() {
        let gateway = MockPaymentGateway::new("whsec");
        gateway.set_fail_orders(true);
        let err = gateway
            .create_order("res-1", Decimal::from(500), &serde_json::json!({}))
            .await
            .unwrap_err();

        assert!(err.is_retryable());
        assert!(gateway.orders().is_empty());
    }

    #[test]
    fn signs_like_the_real_gateway() {
        let gateway = MockPaymentGateway::new("whsec");
        let raw = br#"{"event":"payment.captured"}"#;
        let signature = gateway.sign(raw);
        assert!(gateway.validate_signature(&signature, gateway.webhook_secret(), raw));
    }
}
