pub mod error;
pub mod gateway;
pub mod mock;
pub mod razorpay;
pub mod utils;

use std::sync::Arc;

use crate::config::{GatewayConfig, GatewayKind};
use error::PaymentResult;
use gateway::PaymentGateway;
use mock::MockPaymentGateway;
use razorpay::{RazorpayConfig, RazorpayGateway};

/// Build the configured gateway client
pub fn build_gateway(config: &GatewayConfig) -> PaymentResult<Arc<dyn PaymentGateway>> {
    match config.kind {
        GatewayKind::Razorpay => Ok(Arc::new(RazorpayGateway::new(RazorpayConfig::from(
            config,
        ))?)),
        GatewayKind::Mock => Ok(Arc::new(MockPaymentGateway::new(
            config.webhook_secret.clone(),
        ))),
    }
}
