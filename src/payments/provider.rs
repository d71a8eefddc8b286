use crate::context::RequestContext;
use crate::payments::error::PaymentResult;
use crate::payments::types::{
    BalanceOutcome, Connectivity, HistoryOutcome, HistoryQuery, PaymentOutcome, PaymentRequest,
    ProviderOutcome, RefundOutcome, RefundRequest, StatusOutcome, StatusReport, TransactionType,
};
use async_trait::async_trait;

/// Capability set every mobile money adapter implements.
///
/// Operations that reached the provider return `Ok(ProviderOutcome)`, with
/// business rejections as `ProviderOutcome::Failure`. `Err` is reserved for
/// transport failures, token acquisition failures and caller bugs.
#[async_trait]
pub trait MobileMoneyProvider: Send + Sync {
    fn code(&self) -> &str;

    fn currency(&self) -> &str;

    async fn initiate_payment(
        &self,
        ctx: &RequestContext,
        request: &PaymentRequest,
    ) -> PaymentResult<PaymentOutcome>;

    async fn check_payment_status(
        &self,
        ctx: &RequestContext,
        provider_transaction_id: &str,
        transaction_type: TransactionType,
    ) -> PaymentResult<StatusOutcome>;

    async fn process_payout(
        &self,
        ctx: &RequestContext,
        request: &PaymentRequest,
    ) -> PaymentResult<PaymentOutcome>;

    async fn process_refund(
        &self,
        ctx: &RequestContext,
        request: &RefundRequest,
    ) -> PaymentResult<RefundOutcome>;

    fn verify_webhook_signature(&self, payload: &[u8], signature: &str, secret: &str) -> bool;

    /// Header carrying the webhook signature for this provider.
    fn webhook_signature_header(&self) -> &'static str;

    /// Maps an inbound callback into the same shape `check_payment_status` returns.
    fn process_webhook(&self, payload: &[u8]) -> PaymentResult<StatusReport>;

    async fn get_account_balance(&self, ctx: &RequestContext) -> PaymentResult<BalanceOutcome>;

    async fn get_transaction_history(
        &self,
        ctx: &RequestContext,
        query: &HistoryQuery,
    ) -> PaymentResult<HistoryOutcome>;

    fn validate_phone_number(&self, phone_number: &str) -> bool;

    /// Number in the form the provider API expects.
    fn format_phone_number(&self, phone_number: &str) -> Option<String>;

    /// Lightweight probe; the registry turns every error into `available: false`.
    async fn health_check(&self, ctx: &RequestContext) -> PaymentResult<Connectivity> {
        Ok(match self.get_account_balance(ctx).await? {
            ProviderOutcome::Success(_) => Connectivity {
                available: true,
                message: format!("{} reachable", self.code()),
            },
            ProviderOutcome::Failure(failure) => Connectivity {
                available: false,
                message: failure.error_message,
            },
        })
    }
}
