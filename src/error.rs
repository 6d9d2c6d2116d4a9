//! Unified error handling for the settlement engine
//!
//! Every component returns its own error type; all of them convert into
//! [`AppError`], which carries a stable [`ErrorCode`], an HTTP status mapping
//! for whichever transport sits in front of the engine, and a user-facing
//! message.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Error codes for programmatic handling by clients
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCode {
    // Domain errors (4xx)
    #[serde(rename = "INSUFFICIENT_INVENTORY")]
    InsufficientInventory,
    #[serde(rename = "RESERVATION_NOT_FOUND")]
    ReservationNotFound,
    #[serde(rename = "UNIT_NOT_FOUND")]
    UnitNotFound,
    #[serde(rename = "OFFER_NOT_APPLICABLE")]
    OfferNotApplicable,
    #[serde(rename = "INVALID_RESERVATION_STATE")]
    InvalidReservationState,

    // Infrastructure errors (5xx)
    #[serde(rename = "DATABASE_ERROR")]
    DatabaseError,
    #[serde(rename = "CONFIGURATION_ERROR")]
    ConfigurationError,

    // Gateway errors (401, 502)
    #[serde(rename = "PAYMENT_GATEWAY_ERROR")]
    PaymentGatewayError,
    #[serde(rename = "INVALID_SIGNATURE")]
    InvalidSignature,

    // Generic
    #[serde(rename = "INTERNAL_ERROR")]
    InternalError,
    #[serde(rename = "VALIDATION_ERROR")]
    ValidationError,
}

/// Business rule violations
#[derive(Debug, Clone)]
pub enum DomainError {
    /// Not enough capacity left for the requested window
    InsufficientInventory { requested: i32, remaining: i32 },
    ReservationNotFound { reservation_id: String },
    UnitNotFound { unit_id: Uuid },
    /// Offer code exists but cannot be applied to this booking
    OfferNotApplicable { code: String, reason: String },
    /// Operation not allowed in the reservation's current state
    InvalidReservationState {
        reservation_id: Uuid,
        booking_status: String,
        payment_status: String,
    },
}

/// Infrastructure-level errors (database, configuration)
#[derive(Debug, Clone)]
pub enum InfrastructureError {
    Database { message: String, is_retryable: bool },
    Configuration { message: String },
}

/// Payment gateway errors
#[derive(Debug, Clone)]
pub enum ExternalError {
    PaymentGateway { message: String, is_retryable: bool },
    /// Webhook signature did not validate
    InvalidSignature,
}

/// Input validation errors, raised before any transaction opens
#[derive(Debug, Clone)]
pub enum ValidationError {
    InvalidDateRange { start: String, end: String, reason: String },
    InvalidCount { field: String, value: i64, reason: String },
    MissingField { field: String },
    InvalidPayload { reason: String },
}

/// Engine error: what went wrong plus, optionally, which booking it hit
#[derive(Debug, Clone)]
pub struct AppError {
    pub kind: AppErrorKind,
    pub context: Option<String>,
}

#[derive(Debug, Clone)]
pub enum AppErrorKind {
    Domain(DomainError),
    Infrastructure(InfrastructureError),
    External(ExternalError),
    Validation(ValidationError),
}

impl AppError {
    pub fn new(kind: AppErrorKind) -> Self {
        Self {
            kind,
            context: None,
        }
    }

    pub fn domain(err: DomainError) -> Self {
        Self::new(AppErrorKind::Domain(err))
    }

    pub fn validation(err: ValidationError) -> Self {
        Self::new(AppErrorKind::Validation(err))
    }

    pub fn gateway(message: impl Into<String>, is_retryable: bool) -> Self {
        Self::new(AppErrorKind::External(ExternalError::PaymentGateway {
            message: message.into(),
            is_retryable,
        }))
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Remaining capacity reported by an inventory rejection
    pub fn remaining_capacity(&self) -> Option<i32> {
        match &self.kind {
            AppErrorKind::Domain(DomainError::InsufficientInventory { remaining, .. }) => {
                Some(*remaining)
            }
            _ => None,
        }
    }

    /// Map error to HTTP status code
    pub fn status_code(&self) -> u16 {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::InsufficientInventory { .. } => 409,
                DomainError::ReservationNotFound { .. } => 404,
                DomainError::UnitNotFound { .. } => 404,
                DomainError::OfferNotApplicable { .. } => 422,
                DomainError::InvalidReservationState { .. } => 409,
            },
            AppErrorKind::Infrastructure(_) => 500,
            AppErrorKind::External(err) => match err {
                ExternalError::PaymentGateway { .. } => 502,
                ExternalError::InvalidSignature => 401,
            },
            AppErrorKind::Validation(_) => 400,
        }
    }

    /// Get error code for client handling
    pub fn error_code(&self) -> ErrorCode {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::InsufficientInventory { .. } => ErrorCode::InsufficientInventory,
                DomainError::ReservationNotFound { .. } => ErrorCode::ReservationNotFound,
                DomainError::UnitNotFound { .. } => ErrorCode::UnitNotFound,
                DomainError::OfferNotApplicable { .. } => ErrorCode::OfferNotApplicable,
                DomainError::InvalidReservationState { .. } => ErrorCode::InvalidReservationState,
            },
            AppErrorKind::Infrastructure(err) => match err {
                InfrastructureError::Database { .. } => ErrorCode::DatabaseError,
                InfrastructureError::Configuration { .. } => ErrorCode::ConfigurationError,
            },
            AppErrorKind::External(err) => match err {
                ExternalError::PaymentGateway { .. } => ErrorCode::PaymentGatewayError,
                ExternalError::InvalidSignature => ErrorCode::InvalidSignature,
            },
            AppErrorKind::Validation(_) => ErrorCode::ValidationError,
        }
    }

    /// Get user-friendly error message
    pub fn user_message(&self) -> String {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::InsufficientInventory {
                    requested,
                    remaining,
                } => format!(
                    "Only {} left for the selected dates (requested {})",
                    remaining, requested
                ),
                DomainError::ReservationNotFound { reservation_id } => {
                    format!("Reservation '{}' not found", reservation_id)
                }
                DomainError::UnitNotFound { unit_id } => {
                    format!("Inventory unit '{}' not found", unit_id)
                }
                DomainError::OfferNotApplicable { code, reason } => {
                    format!("Offer '{}' cannot be applied: {}", code, reason)
                }
                DomainError::InvalidReservationState {
                    reservation_id,
                    booking_status,
                    payment_status,
                } => format!(
                    "Reservation '{}' is {} with payment {}",
                    reservation_id, booking_status, payment_status
                ),
            },
            AppErrorKind::Infrastructure(_) => {
                "Service temporarily unavailable. Please try again later".to_string()
            }
            AppErrorKind::External(err) => match err {
                // gateway internals stay in the logs
                ExternalError::PaymentGateway { .. } => {
                    "Payment could not be initiated. Please try again".to_string()
                }
                ExternalError::InvalidSignature => "Invalid webhook signature".to_string(),
            },
            AppErrorKind::Validation(err) => match err {
                ValidationError::InvalidDateRange { start, end, reason } => {
                    format!("Invalid dates {} to {}: {}", start, end, reason)
                }
                ValidationError::InvalidCount {
                    field,
                    value,
                    reason,
                } => format!("Invalid {} '{}': {}", field, value, reason),
                ValidationError::MissingField { field } => {
                    format!("Required field '{}' is missing", field)
                }
                ValidationError::InvalidPayload { reason } => {
                    format!("Invalid payload: {}", reason)
                }
            },
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match &self.kind {
            AppErrorKind::Domain(_) => false,
            AppErrorKind::Infrastructure(err) => match err {
                InfrastructureError::Database { is_retryable, .. } => *is_retryable,
                InfrastructureError::Configuration { .. } => false,
            },
            AppErrorKind::External(err) => match err {
                ExternalError::PaymentGateway { is_retryable, .. } => *is_retryable,
                ExternalError::InvalidSignature => false,
            },
            AppErrorKind::Validation(_) => false,
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.context {
            Some(context) => write!(f, "{} ({})", self.user_message(), context),
            None => f.write_str(&self.user_message()),
        }
    }
}

impl std::error::Error for AppError {}

/// Result type for operations that can fail with AppError
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insufficient_inventory_error() {
        let error = AppError::domain(DomainError::InsufficientInventory {
            requested: 1,
            remaining: 0,
        });

        assert_eq!(error.status_code(), 409);
        assert_eq!(error.error_code(), ErrorCode::InsufficientInventory);
        assert_eq!(error.remaining_capacity(), Some(0));
        assert!(error.user_message().contains("Only 0 left"));
        assert!(!error.is_retryable());
    }

    #[test]
    fn test_gateway_error_is_generic() {
        let error = AppError::gateway("HTTP 500: upstream exploded", true);

        assert_eq!(error.status_code(), 502);
        assert_eq!(error.error_code(), ErrorCode::PaymentGatewayError);
        assert!(!error.user_message().contains("exploded"));
        assert!(error.is_retryable());
    }

    #[test]
    fn test_validation_error() {
        let error = AppError::validation(ValidationError::InvalidCount {
            field: "quantity".to_string(),
            value: -1,
            reason: "must be at least 1".to_string(),
        });

        assert_eq!(error.status_code(), 400);
        assert_eq!(error.error_code(), ErrorCode::ValidationError);
        assert!(error.remaining_capacity().is_none());
        assert!(!error.is_retryable());
    }

    #[test]
    fn test_invalid_signature_maps_to_unauthorized() {
        let error = AppError::new(AppErrorKind::External(ExternalError::InvalidSignature))
            .with_context("webhook");
        assert_eq!(error.status_code(), 401);
        assert_eq!(error.to_string(), "Invalid webhook signature (webhook)");
    }
}
