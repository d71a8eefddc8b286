use thiserror::Error;

pub type PaymentResult<T> = Result<T, PaymentError>;

#[derive(Debug, Clone, Error)]
pub enum PaymentError {
    #[error("Validation error: {message}")]
    ValidationError {
        message: String,
        field: Option<String>,
    },

    #[error("Limit exceeded: {message}")]
    LimitExceeded { message: String },

    #[error("Provider unavailable: provider={provider}, message={message}")]
    ProviderUnavailable { provider: String, message: String },

    #[error("Provider rejected request: provider={provider}, message={message}")]
    ProviderRejected {
        provider: String,
        message: String,
        provider_code: Option<String>,
    },

    #[error("Authentication failed: provider={provider}, message={message}")]
    AuthenticationFailure { provider: String, message: String },

    #[error("Not found: {message}")]
    NotFound { message: String },

    #[error("Reconciliation aborted: {message}")]
    ReconciliationAborted { message: String },

    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Webhook verification failed: {message}")]
    WebhookVerificationError { message: String },

    #[error("Persistence error: {message}")]
    Persistence { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },
}

impl PaymentError {
    pub fn validation(message: impl Into<String>, field: &str) -> Self {
        PaymentError::ValidationError {
            message: message.into(),
            field: Some(field.to_string()),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        PaymentError::NotFound {
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            PaymentError::ValidationError { .. } => false,
            PaymentError::LimitExceeded { .. } => false,
            PaymentError::ProviderUnavailable { .. } => true,
            PaymentError::ProviderRejected { .. } => false,
            PaymentError::AuthenticationFailure { .. } => false,
            PaymentError::NotFound { .. } => false,
            PaymentError::ReconciliationAborted { .. } => false,
            PaymentError::InvalidTransition { .. } => false,
            PaymentError::WebhookVerificationError { .. } => false,
            PaymentError::Persistence { .. } => true,
            PaymentError::Configuration { .. } => false,
        }
    }

    /// Validation-class errors are the caller's fault and are returned synchronously.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            PaymentError::ValidationError { .. } | PaymentError::LimitExceeded { .. }
        )
    }

    pub fn http_status_code(&self) -> u16 {
        match self {
            PaymentError::ValidationError { .. } => 400,
            PaymentError::LimitExceeded { .. } => 422,
            PaymentError::ProviderUnavailable { .. } => 503,
            PaymentError::ProviderRejected { .. } => 402,
            PaymentError::AuthenticationFailure { .. } => 502,
            PaymentError::NotFound { .. } => 404,
            PaymentError::ReconciliationAborted { .. } => 502,
            PaymentError::InvalidTransition { .. } => 409,
            PaymentError::WebhookVerificationError { .. } => 401,
            PaymentError::Persistence { .. } => 500,
            PaymentError::Configuration { .. } => 500,
        }
    }

    /// Short machine-readable code stored on failed transactions.
    pub fn code(&self) -> &'static str {
        match self {
            PaymentError::ValidationError { .. } => "VALIDATION_ERROR",
            PaymentError::LimitExceeded { .. } => "LIMIT_EXCEEDED",
            PaymentError::ProviderUnavailable { .. } => "PROVIDER_UNAVAILABLE",
            PaymentError::ProviderRejected { .. } => "PROVIDER_REJECTED",
            PaymentError::AuthenticationFailure { .. } => "AUTHENTICATION_FAILURE",
            PaymentError::NotFound { .. } => "NOT_FOUND",
            PaymentError::ReconciliationAborted { .. } => "RECONCILIATION_ABORTED",
            PaymentError::InvalidTransition { .. } => "INVALID_TRANSITION",
            PaymentError::WebhookVerificationError { .. } => "WEBHOOK_VERIFICATION",
            PaymentError::Persistence { .. } => "PERSISTENCE_ERROR",
            PaymentError::Configuration { .. } => "CONFIGURATION_ERROR",
        }
    }
}

impl From<crate::database::error::DatabaseError> for PaymentError {
    fn from(err: crate::database::error::DatabaseError) -> Self {
        PaymentError::Persistence {
            message: err.to_string(),
        }
    }
}
