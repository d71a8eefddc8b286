use crate::context::RequestContext;
use crate::payments::error::PaymentResult;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use secrecy::{ExposeSecret, SecretString};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Cached bearer token. The value stays wrapped until an auth header is built.
#[derive(Clone)]
pub struct AccessToken {
    value: Arc<SecretString>,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    pub fn new(value: String, expires_at: DateTime<Utc>) -> Self {
        Self {
            value: Arc::new(SecretString::new(value)),
            expires_at,
        }
    }

    pub fn expose(&self) -> &str {
        self.value.expose_secret()
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("value", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Token as returned by a provider grant.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub value: String,
    pub expires_in_secs: i64,
}

/// Optional second tier shared between service instances.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn load(&self, key: &str) -> Option<(String, DateTime<Utc>)>;
    async fn save(&self, key: &str, value: &str, expires_at: DateTime<Utc>);
    async fn remove(&self, key: &str);
}

type Slot = Arc<tokio::sync::Mutex<Option<AccessToken>>>;

/// Access tokens keyed by `(provider, purpose)`.
///
/// Each key has its own async mutex: the first caller that finds the slot
/// empty or expired performs the grant while concurrent callers for the same
/// key wait on the lock and then read the fresh token.
pub struct TokenCache {
    slots: Mutex<HashMap<String, Slot>>,
    margin: Duration,
    store: Option<Arc<dyn TokenStore>>,
}

impl TokenCache {
    pub fn new(margin_secs: i64) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            margin: Duration::seconds(margin_secs.max(0)),
            store: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn TokenStore>) -> Self {
        self.store = Some(store);
        self
    }

    fn key(provider: &str, purpose: &str) -> String {
        format!("momo:token:{}:{}", provider, purpose)
    }

    fn slot(&self, key: &str) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(None)))
            .clone()
    }

    pub async fn get_or_refresh<F, Fut>(
        &self,
        ctx: &RequestContext,
        provider: &str,
        purpose: &str,
        fetch: F,
    ) -> PaymentResult<AccessToken>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = PaymentResult<IssuedToken>>,
    {
        let key = Self::key(provider, purpose);
        let slot = self.slot(&key);
        let mut guard = slot.lock().await;
        let now = ctx.now();

        if let Some(token) = guard.as_ref() {
            if token.expires_at > now {
                return Ok(token.clone());
            }
        }

        if let Some(store) = &self.store {
            if let Some((value, expires_at)) = store.load(&key).await {
                if expires_at > now {
                    let token = AccessToken::new(value, expires_at);
                    *guard = Some(token.clone());
                    return Ok(token);
                }
            }
        }

        let issued = fetch().await?;
        let expires_at = now + Duration::seconds(issued.expires_in_secs) - self.margin;
        let token = AccessToken::new(issued.value, expires_at);
        debug!(provider, purpose, expires_at = %expires_at, "access token refreshed");

        if expires_at > now {
            if let Some(store) = &self.store {
                store.save(&key, token.expose(), expires_at).await;
            }
            *guard = Some(token.clone());
        } else {
            // Lifetime shorter than the safety margin: use once, never cache.
            *guard = None;
        }
        Ok(token)
    }

    /// Drops a token the provider rejected.
    pub async fn invalidate(&self, provider: &str, purpose: &str) {
        let key = Self::key(provider, purpose);
        let slot = self.slot(&key);
        *slot.lock().await = None;
        if let Some(store) = &self.store {
            store.remove(&key).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::FixedClock;
    use crate::payments::error::PaymentError;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ctx_at(clock: Arc<FixedClock>) -> RequestContext {
        RequestContext::new(clock)
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_refresh() {
        let cache = Arc::new(TokenCache::new(60));
        let calls = Arc::new(AtomicUsize::new(0));
        let ctx = RequestContext::system();

        let tasks = (0..10).map(|_| {
            let cache = cache.clone();
            let calls = calls.clone();
            let ctx = ctx.clone();
            async move {
                cache
                    .get_or_refresh(&ctx, "mtn", "collection", move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                        Ok(IssuedToken {
                            value: "tok".to_string(),
                            expires_in_secs: 3600,
                        })
                    })
                    .await
            }
        });
        let results = futures::future::join_all(tasks).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| r.as_ref().unwrap().expose() == "tok"));
    }

    #[tokio::test]
    async fn token_expires_before_provider_ttl() {
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap();
        let clock = Arc::new(FixedClock::new(start));
        let ctx = ctx_at(clock.clone());
        let cache = TokenCache::new(60);
        let calls = AtomicUsize::new(0);
        let counter = &calls;

        let fetch = || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(IssuedToken {
                value: "tok".to_string(),
                expires_in_secs: 3600,
            })
        };

        let first = cache.get_or_refresh(&ctx, "airtel", "api", fetch).await.unwrap();
        assert_eq!(first.expires_at, start + Duration::seconds(3540));

        clock.advance(Duration::seconds(3539));
        cache.get_or_refresh(&ctx, "airtel", "api", fetch).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        clock.advance(Duration::seconds(1));
        cache.get_or_refresh(&ctx, "airtel", "api", fetch).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn purposes_are_cached_separately() {
        let cache = TokenCache::new(0);
        let ctx = RequestContext::system();
        let a = cache
            .get_or_refresh(&ctx, "mtn", "collection", || async {
                Ok(IssuedToken {
                    value: "c".to_string(),
                    expires_in_secs: 600,
                })
            })
            .await
            .unwrap();
        let b = cache
            .get_or_refresh(&ctx, "mtn", "disbursement", || async {
                Ok(IssuedToken {
                    value: "d".to_string(),
                    expires_in_secs: 600,
                })
            })
            .await
            .unwrap();
        assert_eq!(a.expose(), "c");
        assert_eq!(b.expose(), "d");
    }

    #[tokio::test]
    async fn failed_grant_is_surfaced_and_not_cached() {
        let cache = TokenCache::new(60);
        let ctx = RequestContext::system();
        let err = cache
            .get_or_refresh(&ctx, "zamtel", "api", || async {
                Err(PaymentError::AuthenticationFailure {
                    provider: "zamtel".to_string(),
                    message: "bad password".to_string(),
                })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::AuthenticationFailure { .. }));

        let ok = cache
            .get_or_refresh(&ctx, "zamtel", "api", || async {
                Ok(IssuedToken {
                    value: "z".to_string(),
                    expires_in_secs: 600,
                })
            })
            .await
            .unwrap();
        assert_eq!(ok.expose(), "z");
    }

    #[tokio::test]
    async fn invalidate_forces_refresh() {
        let cache = TokenCache::new(0);
        let ctx = RequestContext::system();
        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let fetch = || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(IssuedToken {
                value: "t".to_string(),
                expires_in_secs: 600,
            })
        };
        cache.get_or_refresh(&ctx, "mtn", "collection", fetch).await.unwrap();
        cache.invalidate("mtn", "collection").await;
        cache.get_or_refresh(&ctx, "mtn", "collection", fetch).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
