use thiserror::Error;

pub type PaymentResult<T> = Result<T, PaymentError>;

/// Failures talking to, or hearing from, the payment gateway
#[derive(Debug, Clone, Error)]
pub enum PaymentError {
    /// Request or webhook body we cannot use
    #[error("invalid payload: {message}")]
    InvalidPayload {
        message: String,
        field: Option<String>,
    },

    /// Gateway answered with a non-success status
    #[error("{gateway} rejected the request (HTTP {status}): {message}")]
    Rejected {
        gateway: String,
        status: u16,
        message: String,
    },

    /// Transport failure or the gateway is down
    #[error("{gateway} unavailable: {message}")]
    Unavailable { gateway: String, message: String },

    #[error("{gateway} rate limit exceeded")]
    RateLimited { gateway: String },

    #[error("unexpected {gateway} response: {message}")]
    MalformedResponse { gateway: String, message: String },

    #[error("webhook signature mismatch")]
    SignatureMismatch,

    #[error("gateway client misconfigured: {0}")]
    Misconfigured(String),
}

impl PaymentError {
    pub fn is_retryable(&self) -> bool {
        match self {
            PaymentError::Unavailable { .. } | PaymentError::RateLimited { .. } => true,
            PaymentError::Rejected { status, .. } => *status >= 500,
            PaymentError::InvalidPayload { .. }
            | PaymentError::MalformedResponse { .. }
            | PaymentError::SignatureMismatch
            | PaymentError::Misconfigured(_) => false,
        }
    }
}

impl From<PaymentError> for crate::error::AppError {
    fn from(err: PaymentError) -> Self {
        use crate::error::{AppError, AppErrorKind, ExternalError, ValidationError};

        match err {
            PaymentError::SignatureMismatch => {
                AppError::new(AppErrorKind::External(ExternalError::InvalidSignature))
            }
            PaymentError::InvalidPayload { message, .. } => {
                AppError::validation(ValidationError::InvalidPayload { reason: message })
            }
            other => AppError::gateway(other.to_string(), other.is_retryable()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AppError, ErrorCode};

    #[test]
    fn only_transient_failures_are_retryable() {
        assert!(PaymentError::RateLimited {
            gateway: "razorpay".to_string()
        }
        .is_retryable());
        assert!(PaymentError::Rejected {
            gateway: "razorpay".to_string(),
            status: 503,
            message: "maintenance".to_string(),
        }
        .is_retryable());
        assert!(!PaymentError::Rejected {
            gateway: "razorpay".to_string(),
            status: 400,
            message: "bad amount".to_string(),
        }
        .is_retryable());
        assert!(!PaymentError::SignatureMismatch.is_retryable());
    }

    #[test]
    fn gateway_failures_hide_details_from_users() {
        let app: AppError = PaymentError::Unavailable {
            gateway: "razorpay".to_string(),
            message: "connection reset".to_string(),
        }
        .into();

        assert_eq!(app.error_code(), ErrorCode::PaymentGatewayError);
        assert!(app.is_retryable());
        assert!(!app.user_message().contains("connection reset"));
    }

    #[test]
    fn signature_and_payload_errors_keep_their_meaning() {
        let app: AppError = PaymentError::SignatureMismatch.into();
        assert_eq!(app.error_code(), ErrorCode::InvalidSignature);

        let app: AppError = PaymentError::InvalidPayload {
            message: "missing event".to_string(),
            field: None,
        }
        .into();
        assert_eq!(app.status_code(), 400);
    }
}
