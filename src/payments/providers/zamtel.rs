//! Zamtel Kwacha adapter. Password-grant OAuth; flat JSON bodies keyed by
//! `transaction_id` / `reference`. The API exposes no transaction history.

use crate::context::RequestContext;
use crate::database::provider_config_repository::{ProviderConfig, ProviderCredentials};
use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::http::{Auth, HttpReply, RetryMode};
use crate::payments::phone::{self, ZAMTEL_PREFIXES};
use crate::payments::provider::MobileMoneyProvider;
use crate::payments::signature::{verify_hmac_sha256, SignatureEncoding};
use crate::payments::token_cache::{IssuedToken, TokenCache};
use crate::payments::types::{
    lookup_status, AccountBalance, BalanceOutcome, CanonicalStatus, HistoryOutcome, HistoryQuery,
    PaymentAccepted, PaymentOutcome, PaymentRequest, ProviderFailure, ProviderOutcome,
    RefundAccepted, RefundMode, RefundOutcome, RefundRequest, StatusOutcome, StatusReport,
    TransactionType,
};
use async_trait::async_trait;
use reqwest::Method;
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tracing::{info, warn};

use super::{
    decimal_at, ensure_currency, failure_from_reply, invalid_phone, parse_token_reply,
    parse_webhook_json, AdapterCore, TokenGrant,
};

pub const CODE: &str = "zamtel";

const PURPOSE: &str = "api";

pub const STATUS_TABLE: &[(&str, CanonicalStatus)] = &[
    ("SUCCESS", CanonicalStatus::Completed),
    ("COMPLETED", CanonicalStatus::Completed),
    ("PENDING", CanonicalStatus::Pending),
    ("PROCESSING", CanonicalStatus::Pending),
    ("INITIATED", CanonicalStatus::Pending),
    ("FAILED", CanonicalStatus::Failed),
    ("DECLINED", CanonicalStatus::Failed),
    ("ERROR", CanonicalStatus::Failed),
    ("CANCELLED", CanonicalStatus::Cancelled),
];

pub fn map_zamtel_status(native: &str) -> CanonicalStatus {
    lookup_status(STATUS_TABLE, native)
}

/// Flat response shape shared by collect, disburse, status and callbacks.
#[derive(Debug, Default, Deserialize)]
struct ZamtelTransaction {
    #[serde(default)]
    transaction_id: Option<String>,
    #[serde(default)]
    reference: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl ZamtelTransaction {
    fn from_body(body: &JsonValue) -> Self {
        serde_json::from_value(body.clone()).unwrap_or_default()
    }
}

pub struct ZamtelProvider {
    core: AdapterCore,
}

impl ZamtelProvider {
    pub fn new(config: Arc<ProviderConfig>, tokens: Arc<TokenCache>) -> PaymentResult<Self> {
        Ok(Self {
            core: AdapterCore::new(config, tokens)?,
        })
    }

    async fn call(
        &self,
        ctx: &RequestContext,
        method: Method,
        path: &str,
        body: Option<&JsonValue>,
        mode: RetryMode,
    ) -> PaymentResult<HttpReply> {
        self.core
            .call(self, ctx, PURPOSE, method, path, &[], body, mode)
            .await
    }

    fn accepted(reply: &HttpReply, fallback_id: &str) -> PaymentAccepted {
        let txn = ZamtelTransaction::from_body(&reply.body);
        let status = match txn.status.as_deref().map(map_zamtel_status) {
            Some(CanonicalStatus::Unknown) | None => CanonicalStatus::Pending,
            Some(other) => other,
        };
        PaymentAccepted {
            provider_transaction_id: txn
                .transaction_id
                .unwrap_or_else(|| fallback_id.to_string()),
            status,
            raw_response: reply.body.clone(),
        }
    }

    fn report(body: JsonValue, provider_transaction_id: Option<String>) -> StatusReport {
        let txn = ZamtelTransaction::from_body(&body);
        let native = txn.status.unwrap_or_default();
        let status = map_zamtel_status(&native);
        StatusReport {
            provider_transaction_id: provider_transaction_id.or(txn.transaction_id),
            external_id: txn.reference,
            status,
            native_status: native,
            amount: decimal_at(&body, "/amount"),
            failure_reason: if status == CanonicalStatus::Failed {
                txn.message
            } else {
                None
            },
            raw_response: body,
        }
    }

    async fn submit(
        &self,
        ctx: &RequestContext,
        path: &str,
        request: &PaymentRequest,
    ) -> PaymentResult<PaymentOutcome> {
        request.validate()?;
        ensure_currency(&self.core.config, &request.currency)?;
        let msisdn = self
            .format_phone_number(&request.phone_number)
            .filter(|_| self.validate_phone_number(&request.phone_number))
            .ok_or_else(|| invalid_phone(CODE, &request.phone_number))?;
        let body = serde_json::json!({
            "amount": request.amount.round_dp(2).to_string(),
            "currency": request.currency,
            "msisdn": msisdn,
            "reference": request.external_id,
            "narration": request.note,
            "callback_url": self.core.config.callback_url,
        });

        let reply = self
            .call(ctx, Method::POST, path, Some(&body), RetryMode::ConnectOnly)
            .await?;
        if !reply.is_success() {
            let failure = failure_from_reply(&reply);
            warn!(provider = CODE, path, error = %failure.error_message, "zamtel request rejected");
            return Ok(ProviderOutcome::Failure(failure));
        }
        let accepted = Self::accepted(&reply, &request.external_id);
        info!(
            provider = CODE,
            path,
            provider_transaction_id = %accepted.provider_transaction_id,
            "zamtel request accepted"
        );
        Ok(ProviderOutcome::Success(accepted))
    }
}

#[async_trait]
impl TokenGrant for ZamtelProvider {
    async fn grant(&self, _purpose: &str) -> PaymentResult<IssuedToken> {
        let creds = &self.core.config.credentials;
        let client_id = ProviderCredentials::require(&creds.client_id, CODE, "client_id")?;
        let client_secret =
            ProviderCredentials::require(&creds.client_secret, CODE, "client_secret")?;
        let username = ProviderCredentials::require(&creds.username, CODE, "username")?;
        let password = ProviderCredentials::require(&creds.password, CODE, "password")?;
        let body = serde_json::json!({
            "grant_type": "password",
            "client_id": client_id.expose_secret(),
            "client_secret": client_secret.expose_secret(),
            "username": username.expose_secret(),
            "password": password.expose_secret(),
        });
        let reply = self
            .core
            .http
            .send(
                Method::POST,
                &self.core.url("/oauth/token"),
                Auth::None,
                &[],
                Some(&body),
                RetryMode::Idempotent,
            )
            .await?;
        parse_token_reply(CODE, reply)
    }
}

#[async_trait]
impl MobileMoneyProvider for ZamtelProvider {
    fn code(&self) -> &str {
        self.core.code()
    }

    fn currency(&self) -> &str {
        &self.core.config.currency
    }

    async fn initiate_payment(
        &self,
        ctx: &RequestContext,
        request: &PaymentRequest,
    ) -> PaymentResult<PaymentOutcome> {
        self.submit(ctx, "/api/v1/payments/collect", request).await
    }

    async fn check_payment_status(
        &self,
        ctx: &RequestContext,
        provider_transaction_id: &str,
        _transaction_type: TransactionType,
    ) -> PaymentResult<StatusOutcome> {
        let path = format!("/api/v1/payments/{}/status", provider_transaction_id);
        let reply = self
            .call(ctx, Method::GET, &path, None, RetryMode::Idempotent)
            .await?;
        if !reply.is_success() {
            return Ok(ProviderOutcome::Failure(failure_from_reply(&reply)));
        }
        Ok(ProviderOutcome::Success(Self::report(
            reply.body,
            Some(provider_transaction_id.to_string()),
        )))
    }

    async fn process_payout(
        &self,
        ctx: &RequestContext,
        request: &PaymentRequest,
    ) -> PaymentResult<PaymentOutcome> {
        self.submit(ctx, "/api/v1/payments/disburse", request).await
    }

    async fn process_refund(
        &self,
        ctx: &RequestContext,
        request: &RefundRequest,
    ) -> PaymentResult<RefundOutcome> {
        request.validate()?;
        let path = format!(
            "/api/v1/payments/{}/reverse",
            request.original_provider_transaction_id
        );
        let body = serde_json::json!({
            "amount": request.amount.round_dp(2).to_string(),
            "reference": request.external_id,
            "reason": request.reason,
        });
        let reply = self
            .call(ctx, Method::POST, &path, Some(&body), RetryMode::ConnectOnly)
            .await?;
        if !reply.is_success() {
            return Ok(ProviderOutcome::Failure(failure_from_reply(&reply)));
        }
        let accepted = Self::accepted(&reply, &request.external_id);
        Ok(ProviderOutcome::Success(RefundAccepted {
            provider_transaction_id: accepted.provider_transaction_id,
            status: accepted.status,
            mode: RefundMode::Native,
            raw_response: accepted.raw_response,
        }))
    }

    fn verify_webhook_signature(&self, payload: &[u8], signature: &str, secret: &str) -> bool {
        verify_hmac_sha256(payload, signature, secret, SignatureEncoding::Hex)
    }

    fn webhook_signature_header(&self) -> &'static str {
        "x-zamtel-signature"
    }

    fn process_webhook(&self, payload: &[u8]) -> PaymentResult<StatusReport> {
        let body = parse_webhook_json(CODE, payload)?;
        let txn = ZamtelTransaction::from_body(&body);
        if txn.transaction_id.is_none() && txn.reference.is_none() {
            return Err(PaymentError::validation(
                "zamtel callback has neither transaction_id nor reference",
                "transaction_id",
            ));
        }
        Ok(Self::report(body, None))
    }

    async fn get_account_balance(&self, ctx: &RequestContext) -> PaymentResult<BalanceOutcome> {
        let reply = self
            .call(
                ctx,
                Method::GET,
                "/api/v1/account/balance",
                None,
                RetryMode::Idempotent,
            )
            .await?;
        if !reply.is_success() {
            return Ok(ProviderOutcome::Failure(failure_from_reply(&reply)));
        }
        let Some(available) = decimal_at(&reply.body, "/balance") else {
            return Ok(ProviderOutcome::Failure(
                ProviderFailure::new("balance response has no balance", None).with_raw(reply.body),
            ));
        };
        Ok(ProviderOutcome::Success(AccountBalance {
            available,
            currency: reply
                .body
                .get("currency")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| self.core.config.currency.clone()),
            raw_response: reply.body,
        }))
    }

    async fn get_transaction_history(
        &self,
        _ctx: &RequestContext,
        _query: &HistoryQuery,
    ) -> PaymentResult<HistoryOutcome> {
        Ok(ProviderOutcome::Failure(ProviderFailure::new(
            "Zamtel does not provide a transaction history endpoint",
            Some("HISTORY_UNSUPPORTED".to_string()),
        )))
    }

    fn validate_phone_number(&self, phone_number: &str) -> bool {
        phone::matches_prefixes(phone_number, ZAMTEL_PREFIXES)
    }

    fn format_phone_number(&self, phone_number: &str) -> Option<String> {
        phone::normalize(phone_number)
    }
}
