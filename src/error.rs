//! Unified error type for the HTTP and process boundary
//!
//! Domain code returns [`PaymentError`] or [`WebhookProcessorError`]; this module maps
//! them onto HTTP status codes, machine-readable error codes and client-safe messages.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::ConfigError;
use crate::database::error::{DatabaseError, DatabaseErrorKind};
use crate::payments::error::PaymentError;
use crate::services::webhook_processor::WebhookProcessorError;

/// Error codes for programmatic handling
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCode {
    // Payment errors (4xx)
    #[serde(rename = "VALIDATION_ERROR")]
    ValidationError,
    #[serde(rename = "LIMIT_EXCEEDED")]
    LimitExceeded,
    #[serde(rename = "TRANSACTION_NOT_FOUND")]
    TransactionNotFound,
    #[serde(rename = "UNKNOWN_PROVIDER")]
    UnknownProvider,
    #[serde(rename = "INVALID_TRANSITION")]
    InvalidTransition,
    #[serde(rename = "INVALID_SIGNATURE")]
    InvalidSignature,
    #[serde(rename = "INVALID_PAYLOAD")]
    InvalidPayload,

    // Infrastructure errors (5xx)
    #[serde(rename = "DATABASE_ERROR")]
    DatabaseError,
    #[serde(rename = "CACHE_ERROR")]
    CacheError,
    #[serde(rename = "CONFIGURATION_ERROR")]
    ConfigurationError,

    // External errors (502, 503)
    #[serde(rename = "PAYMENT_PROVIDER_ERROR")]
    PaymentProviderError,
    #[serde(rename = "PROVIDER_UNAVAILABLE")]
    ProviderUnavailable,
    #[serde(rename = "RECONCILIATION_ABORTED")]
    ReconciliationAborted,

    #[serde(rename = "INTERNAL_ERROR")]
    InternalError,
}

/// Infrastructure-level errors (database, cache, configuration)
#[derive(Debug, Clone)]
pub enum InfrastructureError {
    Database { message: String, is_retryable: bool },
    Cache { message: String },
    Configuration { message: String },
}

#[derive(Debug, Clone)]
pub struct AppError {
    pub kind: AppErrorKind,
    pub request_id: Option<String>,
    pub context: Option<String>,
}

#[derive(Debug, Clone)]
pub enum AppErrorKind {
    Payment(PaymentError),
    Webhook(WebhookProcessorError),
    Infrastructure(InfrastructureError),
}

impl AppError {
    pub fn new(kind: AppErrorKind) -> Self {
        Self {
            kind,
            request_id: None,
            context: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Map error to HTTP status code
    pub fn status_code(&self) -> u16 {
        match &self.kind {
            AppErrorKind::Payment(err) => err.http_status_code(),
            AppErrorKind::Webhook(err) => match err {
                WebhookProcessorError::InvalidSignature => 401,
                WebhookProcessorError::MissingSecret(_) => 401,
                WebhookProcessorError::UnknownProvider(_) => 404,
                WebhookProcessorError::TransactionNotFound(_) => 404,
                WebhookProcessorError::InvalidPayload(_) => 400,
                WebhookProcessorError::Processing(_) => 500,
            },
            AppErrorKind::Infrastructure(_) => 500,
        }
    }

    /// Get error code for client handling
    pub fn error_code(&self) -> ErrorCode {
        match &self.kind {
            AppErrorKind::Payment(err) => match err {
                PaymentError::ValidationError { .. } => ErrorCode::ValidationError,
                PaymentError::LimitExceeded { .. } => ErrorCode::LimitExceeded,
                PaymentError::ProviderUnavailable { .. } => ErrorCode::ProviderUnavailable,
                PaymentError::ProviderRejected { .. } => ErrorCode::PaymentProviderError,
                PaymentError::AuthenticationFailure { .. } => ErrorCode::PaymentProviderError,
                PaymentError::NotFound { .. } => ErrorCode::TransactionNotFound,
                PaymentError::ReconciliationAborted { .. } => ErrorCode::ReconciliationAborted,
                PaymentError::InvalidTransition { .. } => ErrorCode::InvalidTransition,
                PaymentError::WebhookVerificationError { .. } => ErrorCode::InvalidSignature,
                PaymentError::Persistence { .. } => ErrorCode::DatabaseError,
                PaymentError::Configuration { .. } => ErrorCode::ConfigurationError,
            },
            AppErrorKind::Webhook(err) => match err {
                WebhookProcessorError::InvalidSignature => ErrorCode::InvalidSignature,
                WebhookProcessorError::MissingSecret(_) => ErrorCode::InvalidSignature,
                WebhookProcessorError::UnknownProvider(_) => ErrorCode::UnknownProvider,
                WebhookProcessorError::TransactionNotFound(_) => ErrorCode::TransactionNotFound,
                WebhookProcessorError::InvalidPayload(_) => ErrorCode::InvalidPayload,
                WebhookProcessorError::Processing(_) => ErrorCode::InternalError,
            },
            AppErrorKind::Infrastructure(err) => match err {
                InfrastructureError::Database { .. } => ErrorCode::DatabaseError,
                InfrastructureError::Cache { .. } => ErrorCode::CacheError,
                InfrastructureError::Configuration { .. } => ErrorCode::ConfigurationError,
            },
        }
    }

    /// Get user-friendly error message
    pub fn user_message(&self) -> String {
        match &self.kind {
            AppErrorKind::Payment(err) => match err {
                PaymentError::ValidationError { message, .. } => message.clone(),
                PaymentError::LimitExceeded { message } => message.clone(),
                PaymentError::NotFound { message } => message.clone(),
                PaymentError::InvalidTransition { from, to } => {
                    format!("Transaction cannot move from {} to {}", from, to)
                }
                PaymentError::ProviderUnavailable { provider, .. } => format!(
                    "Payment provider ({}) is temporarily unavailable. Please try again",
                    provider
                ),
                PaymentError::ProviderRejected { provider, message, .. } => {
                    format!("Payment was declined by {}: {}", provider, message)
                }
                PaymentError::AuthenticationFailure { provider, .. } => format!(
                    "Payment provider ({}) could not be reached. Please contact support",
                    provider
                ),
                PaymentError::ReconciliationAborted { .. } => {
                    "Reconciliation could not complete. Please retry the run".to_string()
                }
                PaymentError::WebhookVerificationError { .. } => {
                    "Webhook signature verification failed".to_string()
                }
                PaymentError::Persistence { .. } | PaymentError::Configuration { .. } => {
                    "Service temporarily unavailable. Please try again later".to_string()
                }
            },
            AppErrorKind::Webhook(err) => match err {
                WebhookProcessorError::InvalidSignature
                | WebhookProcessorError::MissingSecret(_) => {
                    "Webhook signature verification failed".to_string()
                }
                WebhookProcessorError::UnknownProvider(code) => {
                    format!("Provider '{}' is not configured", code)
                }
                WebhookProcessorError::TransactionNotFound(reference) => {
                    format!("No transaction matches reference '{}'", reference)
                }
                WebhookProcessorError::InvalidPayload(reason) => {
                    format!("Invalid webhook payload: {}", reason)
                }
                WebhookProcessorError::Processing(_) => {
                    "Webhook could not be processed. Please retry".to_string()
                }
            },
            AppErrorKind::Infrastructure(_) => {
                "Service temporarily unavailable. Please try again later".to_string()
            }
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match &self.kind {
            AppErrorKind::Payment(err) => err.is_retryable(),
            AppErrorKind::Webhook(err) => matches!(err, WebhookProcessorError::Processing(_)),
            AppErrorKind::Infrastructure(err) => match err {
                InfrastructureError::Database { is_retryable, .. } => *is_retryable,
                InfrastructureError::Cache { .. } => true,
                InfrastructureError::Configuration { .. } => false,
            },
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.user_message())
    }
}

impl std::error::Error for AppError {}

impl From<PaymentError> for AppError {
    fn from(err: PaymentError) -> Self {
        AppError::new(AppErrorKind::Payment(err))
    }
}

impl From<WebhookProcessorError> for AppError {
    fn from(err: WebhookProcessorError) -> Self {
        AppError::new(AppErrorKind::Webhook(err))
    }
}

impl From<DatabaseError> for AppError {
    fn from(err: DatabaseError) -> Self {
        let is_retryable = matches!(err.kind, DatabaseErrorKind::ConnectionError { .. });
        AppError::new(AppErrorKind::Infrastructure(InfrastructureError::Database {
            message: err.to_string(),
            is_retryable,
        }))
    }
}

impl From<ConfigError> for AppError {
    fn from(err: ConfigError) -> Self {
        AppError::new(AppErrorKind::Infrastructure(
            InfrastructureError::Configuration {
                message: err.to_string(),
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_webhook_errors_map_to_http_status() {
        let cases = [
            (WebhookProcessorError::InvalidSignature, 401),
            (WebhookProcessorError::MissingSecret("mtn".to_string()), 401),
            (WebhookProcessorError::UnknownProvider("xyz".to_string()), 404),
            (WebhookProcessorError::TransactionNotFound("ref".to_string()), 404),
            (WebhookProcessorError::InvalidPayload("bad json".to_string()), 400),
            (WebhookProcessorError::Processing("db down".to_string()), 500),
        ];
        for (err, status) in cases {
            assert_eq!(AppError::from(err).status_code(), status);
        }
    }

    #[test]
    fn test_payment_errors_keep_their_status() {
        let err = AppError::from(PaymentError::LimitExceeded {
            message: "daily limit reached".to_string(),
        });
        assert_eq!(err.status_code(), 422);
        assert_eq!(err.error_code(), ErrorCode::LimitExceeded);
        assert_eq!(err.user_message(), "daily limit reached");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_infrastructure_errors_hide_details() {
        let err = AppError::from(DatabaseError::unknown("relation momo_transactions missing"));
        assert_eq!(err.status_code(), 500);
        assert!(!err.user_message().contains("momo_transactions"));
    }

    #[test]
    fn test_connection_errors_are_retryable() {
        let err = AppError::from(DatabaseError::new(DatabaseErrorKind::ConnectionError {
            message: "pool timed out".to_string(),
        }));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_request_id_is_attached() {
        let err = AppError::from(WebhookProcessorError::InvalidSignature)
            .with_request_id("req_123")
            .with_context("mtn webhook");
        assert_eq!(err.request_id.as_deref(), Some("req_123"));
        assert_eq!(err.context.as_deref(), Some("mtn webhook"));
    }
}
