//! MTN MoMo Open API adapter.
//!
//! Tokens come from a Basic-authenticated grant (API user + API key) per
//! product (`collection`, `disbursement`), and every call carries the
//! product's `Ocp-Apim-Subscription-Key`. Requests are asynchronous: MTN
//! answers `202 Accepted` and the outcome is read back by reference id.

use crate::context::RequestContext;
use crate::database::provider_config_repository::{ProviderConfig, ProviderCredentials};
use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::http::{Auth, RetryMode};
use crate::payments::phone::{self, MTN_PREFIXES};
use crate::payments::provider::MobileMoneyProvider;
use crate::payments::signature::{verify_hmac_sha256, SignatureEncoding};
use crate::payments::token_cache::{IssuedToken, TokenCache};
use crate::payments::types::{
    lookup_status, AccountBalance, BalanceOutcome, CanonicalStatus, HistoryOutcome, HistoryQuery,
    PaymentAccepted, PaymentOutcome, PaymentRequest, ProviderFailure, ProviderOutcome,
    ProviderTransaction, RefundAccepted, RefundMode, RefundOutcome, RefundRequest, StatusOutcome,
    StatusReport, TransactionHistory, TransactionType,
};
use async_trait::async_trait;
use reqwest::Method;
use secrecy::ExposeSecret;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use super::{
    decimal_at, ensure_currency, failure_from_reply, invalid_phone, parse_token_reply,
    parse_webhook_json, str_at, AdapterCore, TokenGrant,
};

pub const CODE: &str = "mtn";

const COLLECTION: &str = "collection";
const DISBURSEMENT: &str = "disbursement";

pub const STATUS_TABLE: &[(&str, CanonicalStatus)] = &[
    ("PENDING", CanonicalStatus::Pending),
    ("ONGOING", CanonicalStatus::Pending),
    ("SUCCESSFUL", CanonicalStatus::Completed),
    ("FAILED", CanonicalStatus::Failed),
    ("REJECTED", CanonicalStatus::Failed),
    ("TIMEOUT", CanonicalStatus::Failed),
];

pub fn map_mtn_status(native: &str) -> CanonicalStatus {
    lookup_status(STATUS_TABLE, native)
}

/// `X-Reference-Id` for a request. Derived from the external id so a resend
/// of the same logical request carries the same reference and MTN rejects
/// the duplicate instead of charging twice.
pub fn reference_id(product: &str, external_id: &str) -> Uuid {
    Uuid::new_v5(
        &Uuid::NAMESPACE_URL,
        format!("momo:mtn:{}:{}", product, external_id).as_bytes(),
    )
}

pub struct MtnProvider {
    core: AdapterCore,
}

impl MtnProvider {
    pub fn new(config: Arc<ProviderConfig>, tokens: Arc<TokenCache>) -> PaymentResult<Self> {
        Ok(Self {
            core: AdapterCore::new(config, tokens)?,
        })
    }

    fn credentials(&self) -> &ProviderCredentials {
        &self.core.config.credentials
    }

    fn subscription_key(&self, product: &str) -> PaymentResult<String> {
        let creds = self.credentials();
        let key = if product == DISBURSEMENT {
            creds
                .disbursement_subscription_key
                .as_ref()
                .or(creds.subscription_key.as_ref())
        } else {
            creds.subscription_key.as_ref()
        };
        key.map(|k| k.expose_secret().to_string())
            .ok_or_else(|| PaymentError::Configuration {
                message: "mtn credential 'subscription_key' is not configured".to_string(),
            })
    }

    fn target_environment(&self) -> String {
        self.credentials()
            .target_environment
            .clone()
            .unwrap_or_else(|| "sandbox".to_string())
    }

    fn headers(&self, product: &str) -> PaymentResult<Vec<(&'static str, String)>> {
        Ok(vec![
            ("Ocp-Apim-Subscription-Key", self.subscription_key(product)?),
            ("X-Target-Environment", self.target_environment()),
        ])
    }

    fn product_for(transaction_type: TransactionType) -> (&'static str, &'static str) {
        match transaction_type {
            TransactionType::Collection => (COLLECTION, "requesttopay"),
            // Refunds are synthetic transfers and live under disbursement.
            TransactionType::Disbursement | TransactionType::Refund => (DISBURSEMENT, "transfer"),
        }
    }

    /// Shared request-to-pay / transfer submission.
    async fn submit(
        &self,
        ctx: &RequestContext,
        product: &str,
        request: &PaymentRequest,
    ) -> PaymentResult<PaymentOutcome> {
        request.validate()?;
        ensure_currency(&self.core.config, &request.currency)?;
        let msisdn = self
            .format_phone_number(&request.phone_number)
            .filter(|_| self.validate_phone_number(&request.phone_number))
            .ok_or_else(|| invalid_phone(CODE, &request.phone_number))?;

        let reference = reference_id(product, &request.external_id).to_string();
        let (path, party_field) = if product == COLLECTION {
            ("/collection/v1_0/requesttopay", "payer")
        } else {
            ("/disbursement/v1_0/transfer", "payee")
        };
        let note = request.note.clone().unwrap_or_default();
        let mut body = serde_json::json!({
            "amount": request.amount.round_dp(2).to_string(),
            "currency": request.currency,
            "externalId": request.external_id,
            "payerMessage": note,
            "payeeNote": note,
        });
        body[party_field] = serde_json::json!({"partyIdType": "MSISDN", "partyId": msisdn});

        let mut headers = self.headers(product)?;
        headers.push(("X-Reference-Id", reference.clone()));
        if let Some(callback) = &self.core.config.callback_url {
            headers.push(("X-Callback-Url", callback.clone()));
        }

        let reply = self
            .core
            .call(
                self,
                ctx,
                product,
                Method::POST,
                path,
                &headers,
                Some(&body),
                RetryMode::ConnectOnly,
            )
            .await?;

        // 409: this reference id was already accepted by an earlier send.
        if reply.is_success() || reply.status == 409 {
            info!(
                provider = CODE,
                product,
                reference_id = %reference,
                external_id = %request.external_id,
                "mtn request accepted"
            );
            return Ok(ProviderOutcome::Success(PaymentAccepted {
                provider_transaction_id: reference.clone(),
                status: CanonicalStatus::Pending,
                raw_response: serde_json::json!({
                    "http_status": reply.status,
                    "reference_id": reference,
                    "body": reply.body,
                }),
            }));
        }

        let failure = failure_from_reply(&reply);
        warn!(
            provider = CODE,
            product,
            status = reply.status,
            error = %failure.error_message,
            "mtn request rejected"
        );
        Ok(ProviderOutcome::Failure(failure))
    }

    fn report_from_body(body: &JsonValue, provider_transaction_id: Option<String>) -> StatusReport {
        let native = str_at(body, "/status").unwrap_or_default();
        let status = map_mtn_status(&native);
        let failure_reason = if status == CanonicalStatus::Failed {
            str_at(body, "/reason/message")
                .or_else(|| str_at(body, "/reason/code"))
                .or_else(|| str_at(body, "/reason"))
                .or_else(|| Some(format!("MTN status {}", native)))
        } else {
            None
        };
        StatusReport {
            provider_transaction_id: provider_transaction_id
                .or_else(|| str_at(body, "/referenceId")),
            external_id: str_at(body, "/externalId"),
            status,
            native_status: native,
            amount: decimal_at(body, "/amount"),
            failure_reason,
            raw_response: body.clone(),
        }
    }
}

#[async_trait]
impl TokenGrant for MtnProvider {
    async fn grant(&self, purpose: &str) -> PaymentResult<IssuedToken> {
        let creds = self.credentials();
        let user = ProviderCredentials::require(&creds.api_user, CODE, "api_user")?;
        let key = ProviderCredentials::require(&creds.api_key, CODE, "api_key")?;
        let headers = vec![("Ocp-Apim-Subscription-Key", self.subscription_key(purpose)?)];
        let reply = self
            .core
            .http
            .send(
                Method::POST,
                &self.core.url(&format!("/{}/token/", purpose)),
                Auth::Basic {
                    username: user.expose_secret(),
                    password: key.expose_secret(),
                },
                &headers,
                None,
                RetryMode::Idempotent,
            )
            .await?;
        parse_token_reply(CODE, reply)
    }
}

#[async_trait]
impl MobileMoneyProvider for MtnProvider {
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
        self.submit(ctx, COLLECTION, request).await
    }

    async fn check_payment_status(
        &self,
        ctx: &RequestContext,
        provider_transaction_id: &str,
        transaction_type: TransactionType,
    ) -> PaymentResult<StatusOutcome> {
        let (product, resource) = Self::product_for(transaction_type);
        let path = format!("/{}/v1_0/{}/{}", product, resource, provider_transaction_id);
        let reply = self
            .core
            .call(
                self,
                ctx,
                product,
                Method::GET,
                &path,
                &self.headers(product)?,
                None,
                RetryMode::Idempotent,
            )
            .await?;
        if !reply.is_success() {
            return Ok(ProviderOutcome::Failure(failure_from_reply(&reply)));
        }
        Ok(ProviderOutcome::Success(Self::report_from_body(
            &reply.body,
            Some(provider_transaction_id.to_string()),
        )))
    }

    async fn process_payout(
        &self,
        ctx: &RequestContext,
        request: &PaymentRequest,
    ) -> PaymentResult<PaymentOutcome> {
        self.submit(ctx, DISBURSEMENT, request).await
    }

    /// MTN has no refund API. The refund is a transfer back to the original
    /// payer; the payer becomes the payee and the transfer carries its own
    /// reference, unrelated to the original payment.
    async fn process_refund(
        &self,
        ctx: &RequestContext,
        request: &RefundRequest,
    ) -> PaymentResult<RefundOutcome> {
        request.validate()?;
        let transfer = PaymentRequest {
            amount: request.amount,
            currency: request.currency.clone(),
            phone_number: request.phone_number.clone(),
            external_id: request.external_id.clone(),
            note: Some(
                request
                    .reason
                    .clone()
                    .unwrap_or_else(|| format!("Refund of {}", request.original_provider_transaction_id)),
            ),
        };
        Ok(match self.submit(ctx, DISBURSEMENT, &transfer).await? {
            ProviderOutcome::Success(accepted) => ProviderOutcome::Success(RefundAccepted {
                provider_transaction_id: accepted.provider_transaction_id,
                status: accepted.status,
                mode: RefundMode::SyntheticDisbursement,
                raw_response: accepted.raw_response,
            }),
            ProviderOutcome::Failure(failure) => ProviderOutcome::Failure(failure),
        })
    }

    fn verify_webhook_signature(&self, payload: &[u8], signature: &str, secret: &str) -> bool {
        verify_hmac_sha256(payload, signature, secret, SignatureEncoding::Hex)
    }

    fn webhook_signature_header(&self) -> &'static str {
        "x-mtn-signature"
    }

    fn process_webhook(&self, payload: &[u8]) -> PaymentResult<StatusReport> {
        let body = parse_webhook_json(CODE, payload)?;
        if str_at(&body, "/status").is_none() {
            return Err(PaymentError::validation(
                "mtn callback has no status",
                "status",
            ));
        }
        Ok(Self::report_from_body(&body, None))
    }

    async fn get_account_balance(&self, ctx: &RequestContext) -> PaymentResult<BalanceOutcome> {
        let reply = self
            .core
            .call(
                self,
                ctx,
                COLLECTION,
                Method::GET,
                "/collection/v1_0/account/balance",
                &self.headers(COLLECTION)?,
                None,
                RetryMode::Idempotent,
            )
            .await?;
        if !reply.is_success() {
            return Ok(ProviderOutcome::Failure(failure_from_reply(&reply)));
        }
        let available = decimal_at(&reply.body, "/availableBalance").ok_or_else(|| {
            PaymentError::ProviderRejected {
                provider: CODE.to_string(),
                message: "balance response has no availableBalance".to_string(),
                provider_code: None,
            }
        })?;
        Ok(ProviderOutcome::Success(AccountBalance {
            available,
            currency: str_at(&reply.body, "/currency")
                .unwrap_or_else(|| self.core.config.currency.clone()),
            raw_response: reply.body,
        }))
    }

    async fn get_transaction_history(
        &self,
        ctx: &RequestContext,
        query: &HistoryQuery,
    ) -> PaymentResult<HistoryOutcome> {
        let path = format!(
            "/collection/v1_0/transactions?startDate={}&endDate={}&limit={}&offset={}",
            urlencoding::encode(&query.from.to_rfc3339()),
            urlencoding::encode(&query.to.to_rfc3339()),
            query.limit,
            query.offset
        );
        let reply = self
            .core
            .call(
                self,
                ctx,
                COLLECTION,
                Method::GET,
                &path,
                &self.headers(COLLECTION)?,
                None,
                RetryMode::Idempotent,
            )
            .await?;
        if reply.status == 404 {
            return Ok(ProviderOutcome::Failure(
                ProviderFailure::new(
                    "transaction history is not available for this MTN account",
                    Some("HISTORY_UNSUPPORTED".to_string()),
                )
                .with_raw(reply.body),
            ));
        }
        if !reply.is_success() {
            return Ok(ProviderOutcome::Failure(failure_from_reply(&reply)));
        }

        let rows = reply
            .body
            .pointer("/transactions")
            .or_else(|| reply.body.pointer("/data"))
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        let transactions: Vec<ProviderTransaction> = rows
            .into_iter()
            .filter_map(|row| {
                let id = str_at(&row, "/referenceId").or_else(|| str_at(&row, "/financialTransactionId"))?;
                let amount = decimal_at(&row, "/amount")?;
                Some(ProviderTransaction {
                    id,
                    external_id: str_at(&row, "/externalId"),
                    amount,
                    currency: str_at(&row, "/currency")
                        .unwrap_or_else(|| self.core.config.currency.clone()),
                    status: map_mtn_status(&str_at(&row, "/status").unwrap_or_default()),
                    phone_number: str_at(&row, "/payer/partyId"),
                    occurred_at: str_at(&row, "/createdAt")
                        .and_then(|s| chrono::DateTime::parse_from_rfc3339(&s).ok())
                        .map(|d| d.with_timezone(&chrono::Utc)),
                    raw: row,
                })
            })
            .collect();
        let has_more = reply
            .body
            .pointer("/hasMore")
            .and_then(|v| v.as_bool())
            .unwrap_or(transactions.len() as u32 >= query.limit);
        Ok(ProviderOutcome::Success(TransactionHistory {
            transactions,
            has_more,
        }))
    }

    fn validate_phone_number(&self, phone_number: &str) -> bool {
        phone::matches_prefixes(phone_number, MTN_PREFIXES)
    }

    fn format_phone_number(&self, phone_number: &str) -> Option<String> {
        phone::normalize(phone_number)
    }
}
