//! Airtel Money (Open API) adapter. OAuth2 client credentials; every call is
//! scoped by `X-Country` / `X-Currency` headers and MSISDNs are sent without
//! the country code.

use crate::context::RequestContext;
use crate::database::provider_config_repository::{ProviderConfig, ProviderCredentials};
use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::http::{Auth, HttpReply, RetryMode};
use crate::payments::phone::{self, AIRTEL_PREFIXES};
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
use chrono::{TimeZone, Utc};
use reqwest::Method;
use secrecy::ExposeSecret;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tracing::{info, warn};

use super::{
    decimal_at, ensure_currency, failure_from_reply, invalid_phone, parse_token_reply,
    parse_webhook_json, str_at, AdapterCore, TokenGrant,
};

pub const CODE: &str = "airtel";

const PURPOSE: &str = "api";
const DEFAULT_COUNTRY: &str = "ZM";

pub const STATUS_TABLE: &[(&str, CanonicalStatus)] = &[
    ("TS", CanonicalStatus::Completed),
    ("TXN_SUCCESS", CanonicalStatus::Completed),
    ("TF", CanonicalStatus::Failed),
    ("TXN_FAILED", CanonicalStatus::Failed),
    ("TIP", CanonicalStatus::Pending),
    ("TA", CanonicalStatus::Pending),
    ("TXN_PENDING", CanonicalStatus::Pending),
    ("TE", CanonicalStatus::Cancelled),
];

pub fn map_airtel_status(native: &str) -> CanonicalStatus {
    lookup_status(STATUS_TABLE, native)
}

pub struct AirtelProvider {
    core: AdapterCore,
}

impl AirtelProvider {
    pub fn new(config: Arc<ProviderConfig>, tokens: Arc<TokenCache>) -> PaymentResult<Self> {
        Ok(Self {
            core: AdapterCore::new(config, tokens)?,
        })
    }

    fn country(&self) -> String {
        self.core
            .config
            .credentials
            .country
            .clone()
            .unwrap_or_else(|| DEFAULT_COUNTRY.to_string())
    }

    fn headers(&self) -> Vec<(&'static str, String)> {
        vec![
            ("X-Country", self.country()),
            ("X-Currency", self.core.config.currency.clone()),
        ]
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
            .call(self, ctx, PURPOSE, method, path, &self.headers(), body, mode)
            .await
    }

    /// Airtel reports business failures inside a 200 envelope as
    /// `status.success = false`.
    fn envelope_failure(reply: &HttpReply) -> Option<ProviderFailure> {
        if !reply.is_success() {
            return Some(failure_from_reply(reply));
        }
        match reply.body.pointer("/status/success").and_then(|v| v.as_bool()) {
            Some(false) => Some(
                ProviderFailure::new(
                    str_at(&reply.body, "/status/message")
                        .unwrap_or_else(|| "airtel request unsuccessful".to_string()),
                    str_at(&reply.body, "/status/result_code")
                        .or_else(|| str_at(&reply.body, "/status/code")),
                )
                .with_raw(reply.body.clone()),
            ),
            _ => None,
        }
    }

    fn accepted(reply: HttpReply, fallback_id: &str) -> PaymentAccepted {
        let id = str_at(&reply.body, "/data/transaction/id")
            .unwrap_or_else(|| fallback_id.to_string());
        let native = str_at(&reply.body, "/data/transaction/status").unwrap_or_default();
        let status = match map_airtel_status(&native) {
            CanonicalStatus::Unknown => CanonicalStatus::Pending,
            other => other,
        };
        PaymentAccepted {
            provider_transaction_id: id,
            status,
            raw_response: reply.body,
        }
    }

    async fn submit(
        &self,
        ctx: &RequestContext,
        transaction_type: TransactionType,
        request: &PaymentRequest,
    ) -> PaymentResult<PaymentOutcome> {
        request.validate()?;
        ensure_currency(&self.core.config, &request.currency)?;
        let msisdn = self
            .format_phone_number(&request.phone_number)
            .filter(|_| self.validate_phone_number(&request.phone_number))
            .ok_or_else(|| invalid_phone(CODE, &request.phone_number))?;
        let amount = request.amount.round_dp(2).to_string();
        let reference = request
            .note
            .clone()
            .unwrap_or_else(|| request.external_id.clone());

        let (path, body) = match transaction_type {
            TransactionType::Collection => (
                "/merchant/v1/payments/",
                serde_json::json!({
                    "reference": reference,
                    "subscriber": {
                        "country": self.country(),
                        "currency": request.currency,
                        "msisdn": msisdn,
                    },
                    "transaction": {
                        "amount": amount,
                        "country": self.country(),
                        "currency": request.currency,
                        "id": request.external_id,
                    }
                }),
            ),
            _ => (
                "/standard/v1/disbursements/",
                serde_json::json!({
                    "payee": {"msisdn": msisdn},
                    "reference": reference,
                    "transaction": {
                        "amount": amount,
                        "id": request.external_id,
                    }
                }),
            ),
        };

        let reply = self
            .call(ctx, Method::POST, path, Some(&body), RetryMode::ConnectOnly)
            .await?;
        if let Some(failure) = Self::envelope_failure(&reply) {
            warn!(
                provider = CODE,
                transaction_type = %transaction_type,
                error = %failure.error_message,
                "airtel request rejected"
            );
            return Ok(ProviderOutcome::Failure(failure));
        }
        let accepted = Self::accepted(reply, &request.external_id);
        info!(
            provider = CODE,
            transaction_type = %transaction_type,
            provider_transaction_id = %accepted.provider_transaction_id,
            "airtel request accepted"
        );
        Ok(ProviderOutcome::Success(accepted))
    }
}

#[async_trait]
impl TokenGrant for AirtelProvider {
    async fn grant(&self, _purpose: &str) -> PaymentResult<IssuedToken> {
        let creds = &self.core.config.credentials;
        let client_id = ProviderCredentials::require(&creds.client_id, CODE, "client_id")?;
        let client_secret =
            ProviderCredentials::require(&creds.client_secret, CODE, "client_secret")?;
        let body = serde_json::json!({
            "client_id": client_id.expose_secret(),
            "client_secret": client_secret.expose_secret(),
            "grant_type": "client_credentials",
        });
        let reply = self
            .core
            .http
            .send(
                Method::POST,
                &self.core.url("/auth/oauth2/token"),
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
impl MobileMoneyProvider for AirtelProvider {
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
        self.submit(ctx, TransactionType::Collection, request).await
    }

    async fn check_payment_status(
        &self,
        ctx: &RequestContext,
        provider_transaction_id: &str,
        transaction_type: TransactionType,
    ) -> PaymentResult<StatusOutcome> {
        let path = match transaction_type {
            TransactionType::Disbursement => {
                format!("/standard/v1/disbursements/{}", provider_transaction_id)
            }
            _ => format!("/standard/v1/payments/{}", provider_transaction_id),
        };
        let reply = self
            .call(ctx, Method::GET, &path, None, RetryMode::Idempotent)
            .await?;
        if let Some(failure) = Self::envelope_failure(&reply) {
            return Ok(ProviderOutcome::Failure(failure));
        }
        let native = str_at(&reply.body, "/data/transaction/status").unwrap_or_default();
        let status = map_airtel_status(&native);
        Ok(ProviderOutcome::Success(StatusReport {
            provider_transaction_id: Some(provider_transaction_id.to_string()),
            external_id: str_at(&reply.body, "/data/transaction/id"),
            status,
            failure_reason: (status == CanonicalStatus::Failed)
                .then(|| str_at(&reply.body, "/data/transaction/message"))
                .flatten(),
            native_status: native,
            amount: decimal_at(&reply.body, "/data/transaction/amount"),
            raw_response: reply.body,
        }))
    }

    async fn process_payout(
        &self,
        ctx: &RequestContext,
        request: &PaymentRequest,
    ) -> PaymentResult<PaymentOutcome> {
        self.submit(ctx, TransactionType::Disbursement, request).await
    }

    async fn process_refund(
        &self,
        ctx: &RequestContext,
        request: &RefundRequest,
    ) -> PaymentResult<RefundOutcome> {
        request.validate()?;
        let body = serde_json::json!({
            "transaction": {
                "airtel_money_id": request.original_provider_transaction_id,
                "amount": request.amount.round_dp(2).to_string(),
                "id": request.external_id,
            }
        });
        let reply = self
            .call(
                ctx,
                Method::POST,
                "/standard/v1/payments/refund",
                Some(&body),
                RetryMode::ConnectOnly,
            )
            .await?;
        if let Some(failure) = Self::envelope_failure(&reply) {
            return Ok(ProviderOutcome::Failure(failure));
        }
        let accepted = Self::accepted(reply, &request.external_id);
        Ok(ProviderOutcome::Success(RefundAccepted {
            provider_transaction_id: accepted.provider_transaction_id,
            status: accepted.status,
            mode: RefundMode::Native,
            raw_response: accepted.raw_response,
        }))
    }

    fn verify_webhook_signature(&self, payload: &[u8], signature: &str, secret: &str) -> bool {
        verify_hmac_sha256(payload, signature, secret, SignatureEncoding::Base64)
    }

    fn webhook_signature_header(&self) -> &'static str {
        "x-signature"
    }

    fn process_webhook(&self, payload: &[u8]) -> PaymentResult<StatusReport> {
        let body = parse_webhook_json(CODE, payload)?;
        let id = str_at(&body, "/transaction/id")
            .ok_or_else(|| PaymentError::validation("airtel callback has no transaction id", "transaction.id"))?;
        let native = str_at(&body, "/transaction/status_code")
            .or_else(|| str_at(&body, "/transaction/status"))
            .unwrap_or_default();
        let status = map_airtel_status(&native);
        Ok(StatusReport {
            provider_transaction_id: Some(id.clone()),
            external_id: Some(id),
            status,
            failure_reason: (status == CanonicalStatus::Failed)
                .then(|| str_at(&body, "/transaction/message"))
                .flatten(),
            native_status: native,
            amount: decimal_at(&body, "/transaction/amount"),
            raw_response: body,
        })
    }

    async fn get_account_balance(&self, ctx: &RequestContext) -> PaymentResult<BalanceOutcome> {
        let reply = self
            .call(
                ctx,
                Method::GET,
                "/standard/v1/users/balance",
                None,
                RetryMode::Idempotent,
            )
            .await?;
        if let Some(failure) = Self::envelope_failure(&reply) {
            return Ok(ProviderOutcome::Failure(failure));
        }
        let Some(available) = decimal_at(&reply.body, "/data/balance") else {
            return Ok(ProviderOutcome::Failure(
                ProviderFailure::new("balance response has no data.balance", None)
                    .with_raw(reply.body),
            ));
        };
        Ok(ProviderOutcome::Success(AccountBalance {
            available,
            currency: str_at(&reply.body, "/data/currency")
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
            "/standard/v1/transactions?from={}&to={}&limit={}&offset={}",
            query.from.timestamp_millis(),
            query.to.timestamp_millis(),
            query.limit,
            query.offset
        );
        let reply = self
            .call(ctx, Method::GET, &path, None, RetryMode::Idempotent)
            .await?;
        if let Some(failure) = Self::envelope_failure(&reply) {
            return Ok(ProviderOutcome::Failure(failure));
        }

        let rows = reply
            .body
            .pointer("/data/transactions")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        let transactions: Vec<ProviderTransaction> = rows
            .into_iter()
            .filter_map(|row| {
                let txn = row.get("transaction").cloned().unwrap_or_else(|| row.clone());
                let id = str_at(&txn, "/id")?;
                let amount = decimal_at(&txn, "/amount")?;
                Some(ProviderTransaction {
                    id,
                    external_id: str_at(&txn, "/airtel_money_id"),
                    amount,
                    currency: str_at(&txn, "/currency")
                        .unwrap_or_else(|| self.core.config.currency.clone()),
                    status: map_airtel_status(&str_at(&txn, "/status").unwrap_or_default()),
                    phone_number: str_at(&txn, "/msisdn"),
                    occurred_at: txn
                        .get("transaction_date")
                        .and_then(|v| v.as_i64())
                        .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
                    raw: row,
                })
            })
            .collect();
        let has_more = reply
            .body
            .pointer("/data/has_more")
            .and_then(|v| v.as_bool())
            .unwrap_or(transactions.len() as u32 >= query.limit);
        Ok(ProviderOutcome::Success(TransactionHistory {
            transactions,
            has_more,
        }))
    }

    fn validate_phone_number(&self, phone_number: &str) -> bool {
        phone::matches_prefixes(phone_number, AIRTEL_PREFIXES)
    }

    fn format_phone_number(&self, phone_number: &str) -> Option<String> {
        phone::national_number(phone_number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::providers::test_support::config_for;
    use crate::payments::signature::sign;
    use rust_decimal_macros::dec;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn provider(server: &MockServer) -> AirtelProvider {
        let config = config_for(
            CODE,
            &server.uri(),
            serde_json::json!({"client_id": "id", "client_secret": "secret"}),
        );
        Mock::given(method("POST"))
            .and(path("/auth/oauth2/token"))
            .and(body_partial_json(serde_json::json!({"grant_type": "client_credentials"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "airtel-token",
                "expires_in": "180",
                "token_type": "bearer"
            })))
            .mount(server)
            .await;
        AirtelProvider::new(config, Arc::new(TokenCache::new(60))).unwrap()
    }

    #[test]
    fn maps_airtel_status_codes() {
        assert_eq!(map_airtel_status("TS"), CanonicalStatus::Completed);
        assert_eq!(map_airtel_status("TXN_SUCCESS"), CanonicalStatus::Completed);
        assert_eq!(map_airtel_status("TF"), CanonicalStatus::Failed);
        assert_eq!(map_airtel_status("TIP"), CanonicalStatus::Pending);
        assert_eq!(map_airtel_status("XYZ"), CanonicalStatus::Unknown);
    }

    #[tokio::test]
    async fn collection_sends_national_msisdn_and_scoping_headers() {
        let server = MockServer::start().await;
        let provider = provider(&server).await;
        Mock::given(method("POST"))
            .and(path("/merchant/v1/payments/"))
            .and(header("Authorization", "Bearer airtel-token"))
            .and(header("X-Country", "ZM"))
            .and(header("X-Currency", "ZMW"))
            .and(body_partial_json(serde_json::json!({
                "subscriber": {"msisdn": "971234567"},
                "transaction": {"id": "MOMO-20260301-AB12"}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": {"transaction": {"id": "MOMO-20260301-AB12", "status": "Success."}},
                "status": {"code": "200", "message": "SUCCESS", "result_code": "ESB000010", "success": true}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let accepted = provider
            .initiate_payment(
                &RequestContext::system(),
                &PaymentRequest {
                    amount: dec!(100),
                    currency: "ZMW".to_string(),
                    phone_number: "260971234567".to_string(),
                    external_id: "MOMO-20260301-AB12".to_string(),
                    note: None,
                },
            )
            .await
            .unwrap()
            .success()
            .unwrap();
        assert_eq!(accepted.provider_transaction_id, "MOMO-20260301-AB12");
        assert_eq!(accepted.status, CanonicalStatus::Pending);
    }

    #[tokio::test]
    async fn unsuccessful_envelope_is_a_failure() {
        let server = MockServer::start().await;
        let provider = provider(&server).await;
        Mock::given(method("POST"))
            .and(path("/merchant/v1/payments/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": {"message": "Invalid MSISDN", "result_code": "ESB000041", "success": false}
            })))
            .mount(&server)
            .await;

        let outcome = provider
            .initiate_payment(
                &RequestContext::system(),
                &PaymentRequest {
                    amount: dec!(10),
                    currency: "ZMW".to_string(),
                    phone_number: "0771234567".to_string(),
                    external_id: "X1".to_string(),
                    note: None,
                },
            )
            .await
            .unwrap();
        let failure = outcome.failure().unwrap();
        assert_eq!(failure.error_message, "Invalid MSISDN");
        assert_eq!(failure.error_code.as_deref(), Some("ESB000041"));
    }

    #[tokio::test]
    async fn status_check_maps_ts_to_completed() {
        let server = MockServer::start().await;
        let provider = provider(&server).await;
        Mock::given(method("GET"))
            .and(path("/standard/v1/payments/MOMO-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": {"transaction": {"airtel_money_id": "C3648", "id": "MOMO-1", "status": "TS"}},
                "status": {"success": true}
            })))
            .mount(&server)
            .await;

        let report = provider
            .check_payment_status(&RequestContext::system(), "MOMO-1", TransactionType::Collection)
            .await
            .unwrap()
            .success()
            .unwrap();
        assert_eq!(report.status, CanonicalStatus::Completed);
        assert_eq!(report.native_status, "TS");
    }

    #[tokio::test]
    async fn history_is_paged_and_canonicalized() {
        let server = MockServer::start().await;
        let provider = provider(&server).await;
        Mock::given(method("GET"))
            .and(path("/standard/v1/transactions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": {
                    "transactions": [
                        {"transaction": {"id": "P1", "amount": "100.00", "status": "TS"}},
                        {"transaction": {"id": "P2", "amount": 50, "status": "TF"}},
                        {"transaction": {"status": "TS"}}
                    ],
                    "has_more": false
                },
                "status": {"success": true}
            })))
            .mount(&server)
            .await;

        let history = provider
            .get_transaction_history(
                &RequestContext::system(),
                &HistoryQuery {
                    from: Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap(),
                    to: Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap(),
                    limit: 1000,
                    offset: 0,
                },
            )
            .await
            .unwrap()
            .success()
            .unwrap();
        assert_eq!(history.transactions.len(), 2);
        assert_eq!(history.transactions[0].status, CanonicalStatus::Completed);
        assert_eq!(history.transactions[1].amount, dec!(50));
        assert!(!history.has_more);
    }

    #[test]
    fn webhook_signature_is_base64() {
        let config = config_for(CODE, "http://localhost:1", serde_json::json!({}));
        let provider = AirtelProvider::new(config, Arc::new(TokenCache::new(60))).unwrap();
        let payload = br#"{"transaction":{"id":"MOMO-1","status_code":"TS"}}"#;
        let signature = sign(payload, "whsec", SignatureEncoding::Base64);
        assert!(provider.verify_webhook_signature(payload, &signature, "whsec"));
        assert!(!provider.verify_webhook_signature(payload, &signature, "other"));

        let report = provider.process_webhook(payload).unwrap();
        assert_eq!(report.status, CanonicalStatus::Completed);
        assert_eq!(report.provider_transaction_id.as_deref(), Some("MOMO-1"));
    }
}
