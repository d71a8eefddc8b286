use secrecy::ExposeSecret;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::context::RequestContext;
use crate::database::transaction_repository::Transaction;
use crate::payments::error::PaymentError;
use crate::services::payment_orchestrator::PaymentOrchestrator;

#[derive(Debug, Clone, Error)]
pub enum WebhookProcessorError {
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),
    #[error("Webhook secret not configured for provider: {0}")]
    MissingSecret(String),
    #[error("Transaction not found for reference: {0}")]
    TransactionNotFound(String),
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
    #[error("Processing error: {0}")]
    Processing(String),
}

impl From<PaymentError> for WebhookProcessorError {
    fn from(err: PaymentError) -> Self {
        match err {
            PaymentError::ValidationError { message, .. } => {
                WebhookProcessorError::InvalidPayload(message)
            }
            PaymentError::NotFound { message } => WebhookProcessorError::UnknownProvider(message),
            other => WebhookProcessorError::Processing(other.to_string()),
        }
    }
}

/// Verifies inbound provider callbacks and forwards them into the
/// orchestrator's status-transition path.
pub struct WebhookProcessor {
    orchestrator: Arc<PaymentOrchestrator>,
}

impl WebhookProcessor {
    pub fn new(orchestrator: Arc<PaymentOrchestrator>) -> Self {
        Self { orchestrator }
    }

    /// Header the provider puts its signature in.
    pub fn signature_header(&self, provider_code: &str) -> Result<&'static str, WebhookProcessorError> {
        let adapter = self
            .orchestrator
            .registry()
            .resolve(provider_code)
            .map_err(|_| WebhookProcessorError::UnknownProvider(provider_code.to_string()))?;
        Ok(adapter.webhook_signature_header())
    }

    /// `payload` must be the raw request body; the signature covers its bytes.
    pub async fn process_webhook(
        &self,
        ctx: &RequestContext,
        provider_code: &str,
        signature: Option<&str>,
        payload: &[u8],
    ) -> Result<Transaction, WebhookProcessorError> {
        let registry = self.orchestrator.registry();
        let adapter = registry
            .resolve(provider_code)
            .map_err(|_| WebhookProcessorError::UnknownProvider(provider_code.to_string()))?;
        let config = registry
            .provider_config(provider_code)
            .map_err(|_| WebhookProcessorError::UnknownProvider(provider_code.to_string()))?;

        let secret = config
            .credentials
            .webhook_secret
            .as_ref()
            .ok_or_else(|| WebhookProcessorError::MissingSecret(config.code.clone()))?;
        let signature = signature.ok_or(WebhookProcessorError::InvalidSignature)?;

        if !adapter.verify_webhook_signature(payload, signature, secret.expose_secret()) {
            error!(provider = %config.code, "invalid webhook signature");
            return Err(WebhookProcessorError::InvalidSignature);
        }

        let report = adapter.process_webhook(payload)?;

        let reference = report
            .provider_transaction_id
            .clone()
            .or_else(|| report.external_id.clone())
            .ok_or_else(|| {
                WebhookProcessorError::InvalidPayload("missing transaction reference".to_string())
            })?;

        let mut transaction = self
            .orchestrator
            .find_by_reference(&config.code, &reference)
            .await?;
        if transaction.is_none() {
            if let Some(external_id) = report.external_id.as_deref() {
                transaction = self
                    .orchestrator
                    .find_by_reference(&config.code, external_id)
                    .await?;
            }
        }
        let Some(transaction) = transaction else {
            warn!(provider = %config.code, reference = %reference, "webhook for unknown transaction");
            return Err(WebhookProcessorError::TransactionNotFound(reference));
        };

        let updated = self
            .orchestrator
            .ingest_status_report(ctx, transaction.id, report, "webhook")
            .await?;

        info!(
            provider = %config.code,
            transaction_number = %updated.transaction_number,
            status = %updated.status,
            "webhook processed"
        );
        Ok(updated)
    }
}
