use crate::payments::error::{PaymentError, PaymentResult};
use reqwest::{Client, Method};
use serde_json::Value as JsonValue;
use std::time::Duration;
use tracing::warn;

/// Which failures a request may be re-sent after.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryMode {
    /// Reads and token grants: connect errors, timeouts, 5xx and 429 are retried.
    Idempotent,
    /// Money-moving POSTs: only a failure to establish the connection is
    /// retried, since the request provably never reached the provider.
    ConnectOnly,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay: Duration,
    pub exponential: bool,
}

impl RetryPolicy {
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            delay,
            exponential: false,
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        if self.exponential {
            self.delay.saturating_mul(1 << attempt.min(16))
        } else {
            self.delay
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(3, Duration::from_millis(1000))
    }
}

pub enum Auth<'a> {
    None,
    Bearer(&'a str),
    Basic { username: &'a str, password: &'a str },
}

/// Status and parsed body of a response that was not retried away.
/// Non-JSON bodies are kept as a JSON string; empty bodies are `Null`.
#[derive(Debug, Clone)]
pub struct HttpReply {
    pub status: u16,
    pub body: JsonValue,
}

impl HttpReply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Clone)]
pub struct PaymentHttpClient {
    client: Client,
    provider: String,
    timeout: Duration,
    policy: RetryPolicy,
}

impl PaymentHttpClient {
    pub fn new(provider: &str, timeout: Duration, policy: RetryPolicy) -> PaymentResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PaymentError::Configuration {
                message: format!("failed to initialize HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            provider: provider.to_string(),
            timeout,
            policy,
        })
    }

    fn unavailable(&self, message: String) -> PaymentError {
        PaymentError::ProviderUnavailable {
            provider: self.provider.clone(),
            message,
        }
    }

    /// Sends one logical request. 2xx and 4xx replies are returned to the caller;
    /// transport failures and 5xx/429 that exhaust the retry budget are
    /// `ProviderUnavailable`.
    pub async fn send(
        &self,
        method: Method,
        url: &str,
        auth: Auth<'_>,
        headers: &[(&str, String)],
        body: Option<&JsonValue>,
        mode: RetryMode,
    ) -> PaymentResult<HttpReply> {
        let mut attempt = 0;
        loop {
            let mut request = self.client.request(method.clone(), url).timeout(self.timeout);
            request = match &auth {
                Auth::None => request,
                Auth::Bearer(token) => request.bearer_auth(token),
                Auth::Basic { username, password } => request.basic_auth(username, Some(password)),
            };
            for (name, value) in headers {
                request = request.header(*name, value.as_str());
            }
            if let Some(payload) = body {
                request = request.json(payload);
            }

            let can_retry = attempt < self.policy.max_retries;
            match request.send().await {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    let text = resp.text().await.unwrap_or_default();
                    let retryable_status = status >= 500 || status == 429;

                    if retryable_status {
                        if mode == RetryMode::Idempotent && can_retry {
                            warn!(
                                provider = %self.provider,
                                status,
                                attempt = attempt + 1,
                                "provider returned retryable status, retrying"
                            );
                            tokio::time::sleep(self.policy.delay_for(attempt)).await;
                            attempt += 1;
                            continue;
                        }
                        return Err(self.unavailable(format!("HTTP {}: {}", status, text)));
                    }

                    return Ok(HttpReply {
                        status,
                        body: parse_body(&text),
                    });
                }
                Err(e) => {
                    let retryable = match mode {
                        RetryMode::Idempotent => e.is_connect() || e.is_timeout(),
                        RetryMode::ConnectOnly => e.is_connect(),
                    };
                    if retryable && can_retry {
                        warn!(
                            provider = %self.provider,
                            error = %e,
                            attempt = attempt + 1,
                            "provider request failed, retrying"
                        );
                        tokio::time::sleep(self.policy.delay_for(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(self.unavailable(format!("provider request failed: {}", e)));
                }
            }
        }
    }
}

fn parse_body(text: &str) -> JsonValue {
    if text.trim().is_empty() {
        return JsonValue::Null;
    }
    serde_json::from_str(text).unwrap_or_else(|_| JsonValue::String(text.to_string()))
}
