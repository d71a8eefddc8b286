use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::error::CacheResult;
use super::RedisPool;
use crate::payments::token_cache::TokenStore;

#[derive(Serialize, Deserialize)]
struct StoredToken {
    value: String,
    expires_at: DateTime<Utc>,
}

/// Second-tier token cache shared across instances. Entries expire in Redis
/// at the token's own expiry; failures read as a miss.
#[derive(Clone)]
pub struct RedisTokenStore {
    pool: RedisPool,
}

impl RedisTokenStore {
    pub fn new(pool: RedisPool) -> Self {
        Self { pool }
    }

    async fn get_raw(&self, key: &str) -> CacheResult<Option<StoredToken>> {
        let mut conn = self.pool.get().await?;
        let raw: Option<String> = conn.get(key).await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn set_raw(&self, key: &str, token: &StoredToken, ttl_secs: u64) -> CacheResult<()> {
        let payload = serde_json::to_string(token)?;
        let mut conn = self.pool.get().await?;
        let _: () = conn.set_ex(key, payload, ttl_secs).await?;
        Ok(())
    }

    async fn delete_raw(&self, key: &str) -> CacheResult<()> {
        let mut conn = self.pool.get().await?;
        let _: () = conn.del(key).await?;
        Ok(())
    }
}

#[async_trait]
impl TokenStore for RedisTokenStore {
    async fn load(&self, key: &str) -> Option<(String, DateTime<Utc>)> {
        match self.get_raw(key).await {
            Ok(stored) => stored.map(|t| (t.value, t.expires_at)),
            Err(e) => {
                warn!(key = %key, error = %e, "token store read failed");
                None
            }
        }
    }

    async fn save(&self, key: &str, value: &str, expires_at: DateTime<Utc>) {
        let ttl = (expires_at - Utc::now()).num_seconds();
        if ttl <= 0 {
            return;
        }
        let token = StoredToken {
            value: value.to_string(),
            expires_at,
        };
        if let Err(e) = self.set_raw(key, &token, ttl as u64).await {
            warn!(key = %key, error = %e, "token store write failed");
        }
    }

    async fn remove(&self, key: &str) {
        if let Err(e) = self.delete_raw(key).await {
            warn!(key = %key, error = %e, "token store delete failed");
        }
    }
}
