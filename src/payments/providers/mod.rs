pub mod airtel;
pub mod mtn;
pub mod zamtel;

pub use airtel::AirtelProvider;
pub use mtn::MtnProvider;
pub use zamtel::ZamtelProvider;

use crate::context::RequestContext;
use crate::database::provider_config_repository::ProviderConfig;
use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::http::{Auth, HttpReply, PaymentHttpClient, RetryMode, RetryPolicy};
use crate::payments::token_cache::{IssuedToken, TokenCache};
use crate::payments::types::ProviderFailure;
use async_trait::async_trait;
use reqwest::Method;
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;
use std::str::FromStr;
use std::sync::Arc;
use tracing::warn;

/// Provider-specific grant flow that produces a bearer token for `purpose`.
#[async_trait]
pub(crate) trait TokenGrant: Send + Sync {
    async fn grant(&self, purpose: &str) -> PaymentResult<IssuedToken>;
}

/// Plumbing shared by the HTTP adapters: config, transport and token cache.
pub(crate) struct AdapterCore {
    pub config: Arc<ProviderConfig>,
    pub http: PaymentHttpClient,
    tokens: Arc<TokenCache>,
}

impl AdapterCore {
    pub fn new(config: Arc<ProviderConfig>, tokens: Arc<TokenCache>) -> PaymentResult<Self> {
        let http = PaymentHttpClient::new(
            &config.code,
            config.http_timeout(),
            RetryPolicy::fixed(config.retry_limit(), config.retry_delay()),
        )?;
        Ok(Self {
            config,
            http,
            tokens,
        })
    }

    pub fn code(&self) -> &str {
        &self.config.code
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url(), path)
    }

    /// Sends a bearer-authenticated request. A 401 means the cached token was
    /// revoked early and the request was not processed, so it is re-sent once
    /// with a fresh token.
    #[allow(clippy::too_many_arguments)]
    pub async fn call<G: TokenGrant>(
        &self,
        grant: &G,
        ctx: &RequestContext,
        purpose: &str,
        method: Method,
        path: &str,
        headers: &[(&str, String)],
        body: Option<&JsonValue>,
        mode: RetryMode,
    ) -> PaymentResult<HttpReply> {
        let url = self.url(path);
        let mut refreshed = false;
        loop {
            let token = self
                .tokens
                .get_or_refresh(ctx, self.code(), purpose, || grant.grant(purpose))
                .await?;
            let reply = self
                .http
                .send(
                    method.clone(),
                    &url,
                    Auth::Bearer(token.expose()),
                    headers,
                    body,
                    mode,
                )
                .await?;
            if reply.status == 401 && !refreshed {
                warn!(provider = %self.code(), purpose, "access token rejected, refreshing");
                self.tokens.invalidate(self.code(), purpose).await;
                refreshed = true;
                continue;
            }
            return Ok(reply);
        }
    }
}

/// Interprets a token endpoint reply. Anything but a 2xx carrying a token is
/// an authentication failure.
pub(crate) fn parse_token_reply(provider: &str, reply: HttpReply) -> PaymentResult<IssuedToken> {
    if !reply.is_success() {
        return Err(PaymentError::AuthenticationFailure {
            provider: provider.to_string(),
            message: format!(
                "token request rejected with HTTP {}: {}",
                reply.status,
                error_message(&reply.body).unwrap_or_else(|| "no message".to_string())
            ),
        });
    }
    let value = str_at(&reply.body, "/access_token").ok_or_else(|| {
        PaymentError::AuthenticationFailure {
            provider: provider.to_string(),
            message: "token response has no access_token".to_string(),
        }
    })?;
    let expires_in_secs = decimal_at(&reply.body, "/expires_in")
        .and_then(|d| d.trunc().to_string().parse::<i64>().ok())
        .unwrap_or(3600);
    Ok(IssuedToken {
        value,
        expires_in_secs,
    })
}

/// Normalized failure for a non-2xx reply from a business endpoint.
pub(crate) fn failure_from_reply(reply: &HttpReply) -> ProviderFailure {
    let message = error_message(&reply.body)
        .unwrap_or_else(|| format!("provider returned HTTP {}", reply.status));
    let code = ["/code", "/error_code", "/status/result_code", "/status/code", "/error"]
        .iter()
        .find_map(|p| str_at(&reply.body, p))
        .or_else(|| Some(reply.status.to_string()));
    ProviderFailure::new(message, code).with_raw(reply.body.clone())
}

fn error_message(body: &JsonValue) -> Option<String> {
    if let JsonValue::String(text) = body {
        return Some(text.clone());
    }
    [
        "/message",
        "/error_description",
        "/status/message",
        "/reason/message",
        "/reason",
        "/error",
    ]
    .iter()
    .find_map(|p| str_at(body, p))
}

/// String at a JSON pointer; numbers are rendered, empty strings are `None`.
pub(crate) fn str_at(body: &JsonValue, pointer: &str) -> Option<String> {
    match body.pointer(pointer)? {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Decimal at a JSON pointer; providers send amounts as strings or numbers.
pub(crate) fn decimal_at(body: &JsonValue, pointer: &str) -> Option<Decimal> {
    match body.pointer(pointer)? {
        JsonValue::String(s) => Decimal::from_str(s.trim()).ok(),
        JsonValue::Number(n) => Decimal::from_str(&n.to_string())
            .ok()
            .or_else(|| n.as_f64().and_then(|f| Decimal::try_from(f).ok())),
        _ => None,
    }
}

pub(crate) fn parse_webhook_json(provider: &str, payload: &[u8]) -> PaymentResult<JsonValue> {
    serde_json::from_slice(payload).map_err(|e| PaymentError::ValidationError {
        message: format!("invalid {} webhook payload: {}", provider, e),
        field: Some("payload".to_string()),
    })
}

pub(crate) fn invalid_phone(provider: &str, phone_number: &str) -> PaymentError {
    PaymentError::ValidationError {
        message: format!(
            "phone number {} is not a valid {} number",
            crate::logging::mask_phone_number(phone_number),
            provider
        ),
        field: Some("phone_number".to_string()),
    }
}

pub(crate) fn ensure_currency(config: &ProviderConfig, currency: &str) -> PaymentResult<()> {
    if !config.currency.eq_ignore_ascii_case(currency) {
        return Err(PaymentError::ValidationError {
            message: format!(
                "{} only supports {}, got {}",
                config.code, config.currency, currency
            ),
            field: Some("currency".to_string()),
        });
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::database::provider_config_repository::{parse_configs, ProviderConfig};
    use std::sync::Arc;

    /// Provider row pointing at a mock server, with retries disabled.
    pub fn config_for(code: &str, base_url: &str, credentials: serde_json::Value) -> Arc<ProviderConfig> {
        let row = serde_json::json!([{
            "code": code,
            "name": code.to_uppercase(),
            "currency": "ZMW",
            "sandbox_url": base_url,
            "production_url": base_url,
            "credentials": credentials,
            "min_amount": 1,
            "max_amount": 50000,
            "timeout_secs": 5,
            "max_retries": 0,
            "retry_delay_ms": 1
        }]);
        let mut configs = parse_configs(&row.to_string()).unwrap();
        Arc::new(configs.remove(0))
    }
}
