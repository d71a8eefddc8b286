use crate::database::error::DatabaseError;
use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::types::round_currency;
use rust_decimal::Decimal;
use secrecy::SecretString;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

#[cfg(feature = "database")]
use sqlx::{FromRow, PgPool};

/// Fee formula: `fixed + amount * percentage / 100`, clamped to `[min, max]`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FeeSchedule {
    #[serde(default)]
    pub fixed: Decimal,
    /// Percent, so `1.5` means 1.5%.
    #[serde(default)]
    pub percentage: Decimal,
    pub min: Option<Decimal>,
    pub max: Option<Decimal>,
}

impl FeeSchedule {
    pub fn compute(&self, amount: Decimal) -> Decimal {
        let mut fee = self.fixed + amount * self.percentage / Decimal::ONE_HUNDRED;
        if let Some(min) = self.min {
            fee = fee.max(min);
        }
        if let Some(max) = self.max {
            fee = fee.min(max);
        }
        round_currency(fee)
    }
}

/// Ledger accounts postings for this provider go to.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LedgerAccounts {
    pub cash: String,
    pub fee: String,
    pub receivable: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderCredentials {
    pub api_user: Option<SecretString>,
    pub api_key: Option<SecretString>,
    pub subscription_key: Option<SecretString>,
    pub disbursement_subscription_key: Option<SecretString>,
    pub client_id: Option<SecretString>,
    pub client_secret: Option<SecretString>,
    pub username: Option<SecretString>,
    pub password: Option<SecretString>,
    pub webhook_secret: Option<SecretString>,
    pub target_environment: Option<String>,
    pub country: Option<String>,
}

impl ProviderCredentials {
    pub fn require<'a>(
        value: &'a Option<SecretString>,
        provider: &str,
        field: &str,
    ) -> PaymentResult<&'a SecretString> {
        value.as_ref().ok_or_else(|| PaymentError::Configuration {
            message: format!("{} credential '{}' is not configured", provider, field),
        })
    }
}

fn default_true() -> bool {
    true
}

/// Used when neither the row nor the process configuration sets a value.
const FALLBACK_TIMEOUT_SECS: u64 = 30;
const FALLBACK_MAX_RETRIES: u32 = 3;
const FALLBACK_RETRY_DELAY_MS: u64 = 1000;

/// Provider configuration row. Read-only to the payment core.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub code: String,
    pub name: String,
    pub currency: String,
    pub sandbox_url: String,
    pub production_url: String,
    #[serde(default = "default_true")]
    pub use_sandbox: bool,
    #[serde(default)]
    pub credentials: ProviderCredentials,
    pub min_amount: Decimal,
    pub max_amount: Decimal,
    pub daily_limit: Option<Decimal>,
    #[serde(default)]
    pub fees: FeeSchedule,
    #[serde(default)]
    pub accounts: LedgerAccounts,
    #[serde(default)]
    pub auto_reconcile: bool,
    #[serde(default = "default_true")]
    pub is_active: bool,
    /// HTTP settings; unset ones come from `MOMO_HTTP_*`.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub retry_delay_ms: Option<u64>,
    pub callback_url: Option<String>,
}

impl ProviderConfig {
    pub fn base_url(&self) -> &str {
        let url = if self.use_sandbox {
            &self.sandbox_url
        } else {
            &self.production_url
        };
        url.trim_end_matches('/')
    }

    /// Amount must fall inside `[min_amount, max_amount]`.
    pub fn check_amount(&self, amount: Decimal) -> PaymentResult<()> {
        if amount < self.min_amount || amount > self.max_amount {
            return Err(PaymentError::LimitExceeded {
                message: format!(
                    "amount {} outside {} limits [{}, {}]",
                    amount, self.code, self.min_amount, self.max_amount
                ),
            });
        }
        Ok(())
    }

    /// Fills HTTP settings the row leaves unset with the process-wide
    /// defaults. Values the row sets, zero included, are kept.
    pub fn with_http_defaults(mut self, timeout_secs: u64, max_retries: u32, retry_delay_ms: u64) -> Self {
        self.timeout_secs.get_or_insert(timeout_secs);
        self.max_retries.get_or_insert(max_retries);
        self.retry_delay_ms.get_or_insert(retry_delay_ms);
        self
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.unwrap_or(FALLBACK_TIMEOUT_SECS))
    }

    /// Retries after the first attempt.
    pub fn retry_limit(&self) -> u32 {
        self.max_retries.unwrap_or(FALLBACK_MAX_RETRIES)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms.unwrap_or(FALLBACK_RETRY_DELAY_MS))
    }
}

/// Reads provider rows from a JSON array on disk.
pub fn load_from_file(path: &Path) -> Result<Vec<ProviderConfig>, DatabaseError> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        DatabaseError::unknown(format!("failed to read {}: {}", path.display(), e))
    })?;
    parse_configs(&raw)
}

pub fn parse_configs(raw: &str) -> Result<Vec<ProviderConfig>, DatabaseError> {
    Ok(serde_json::from_str(raw)?)
}

#[cfg(feature = "database")]
#[derive(Debug, FromRow)]
struct ProviderRow {
    code: String,
    is_active: bool,
    settings: serde_json::Value,
}

/// Provider rows stored in `momo_providers`, one `settings` document per code.
#[cfg(feature = "database")]
pub struct PgProviderConfigRepository {
    pool: PgPool,
}

#[cfg(feature = "database")]
impl PgProviderConfigRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn find_all(&self) -> Result<Vec<ProviderConfig>, DatabaseError> {
        let rows = sqlx::query_as::<_, ProviderRow>(
            "SELECT code, is_active, settings FROM momo_providers ORDER BY code",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        rows.into_iter()
            .map(|row| {
                let mut settings = row.settings;
                if let Some(obj) = settings.as_object_mut() {
                    obj.insert("code".to_string(), serde_json::Value::String(row.code));
                    obj.insert("is_active".to_string(), serde_json::Value::Bool(row.is_active));
                }
                serde_json::from_value::<ProviderConfig>(settings).map_err(DatabaseError::from)
            })
            .collect()
    }
}
