//! Application configuration module
//! Handles environment variable loading and validation

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

/// Main application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub cache: CacheConfig,
    pub logging: LoggingConfig,
    pub payments: PaymentsConfig,
    pub workers: WorkerConfig,
}

/// Webhook ingress bind address
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// PostgreSQL settings; without a URL the in-memory stores are used
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
}

/// Shared token store; without a URL tokens stay in-process
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub redis_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Plain,
}

/// Process-wide provider call defaults
#[derive(Debug, Clone)]
pub struct PaymentsConfig {
    pub http_timeout_secs: u64,
    pub http_max_retries: u32,
    pub http_retry_delay_ms: u64,
    pub token_expiry_margin_secs: i64,
    pub providers_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub reconcile_page_size: u32,
    pub status_poll_interval_secs: u64,
    pub status_poll_max_age_hours: i64,
    pub reconcile_interval_secs: u64,
}

fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(name.to_string())),
        _ => Ok(default),
    }
}

fn optional_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();

        Ok(AppConfig {
            server: ServerConfig::from_env()?,
            database: DatabaseConfig::from_env()?,
            cache: CacheConfig::from_env(),
            logging: LoggingConfig::from_env(),
            payments: PaymentsConfig::from_env()?,
            workers: WorkerConfig::from_env()?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate()?;
        self.database.validate()?;
        self.cache.validate()?;
        self.logging.validate()?;
        self.payments.validate()?;
        self.workers.validate()?;
        Ok(())
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(ServerConfig {
            host: env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: parse_var("SERVER_PORT", 8080)?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidValue(
                "SERVER_PORT cannot be 0".to_string(),
            ));
        }
        if self.host.is_empty() {
            return Err(ConfigError::InvalidValue(
                "SERVER_HOST cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl DatabaseConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(DatabaseConfig {
            url: optional_var("DATABASE_URL"),
            max_connections: parse_var("DB_MAX_CONNECTIONS", 10)?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::InvalidValue("DB_MAX_CONNECTIONS".to_string()));
        }
        Ok(())
    }
}

impl CacheConfig {
    pub fn from_env() -> Self {
        CacheConfig {
            redis_url: optional_var("REDIS_URL"),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(url) = &self.redis_url {
            if !url.starts_with("redis://") && !url.starts_with("rediss://") {
                return Err(ConfigError::InvalidValue(
                    "REDIS_URL must start with redis:// or rediss://".to_string(),
                ));
            }
        }
        Ok(())
    }
}

impl LoggingConfig {
    pub fn from_env() -> Self {
        LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            format: match env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "plain".to_string())
                .to_lowercase()
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Plain,
            },
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["TRACE", "DEBUG", "INFO", "WARN", "ERROR"];
        if !valid_levels.contains(&self.level.to_uppercase().as_str()) {
            return Err(ConfigError::InvalidValue("LOG_LEVEL".to_string()));
        }
        Ok(())
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Plain,
        }
    }
}

impl PaymentsConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(PaymentsConfig {
            http_timeout_secs: parse_var("MOMO_HTTP_TIMEOUT_SECS", 30)?,
            http_max_retries: parse_var("MOMO_HTTP_MAX_RETRIES", 3)?,
            http_retry_delay_ms: parse_var("MOMO_HTTP_RETRY_DELAY_MS", 1000)?,
            token_expiry_margin_secs: parse_var("MOMO_TOKEN_EXPIRY_MARGIN_SECS", 60)?,
            providers_file: optional_var("MOMO_PROVIDERS_FILE").map(PathBuf::from),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.http_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "MOMO_HTTP_TIMEOUT_SECS".to_string(),
            ));
        }
        if self.token_expiry_margin_secs < 0 {
            return Err(ConfigError::InvalidValue(
                "MOMO_TOKEN_EXPIRY_MARGIN_SECS".to_string(),
            ));
        }
        Ok(())
    }
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(WorkerConfig {
            reconcile_page_size: parse_var("RECONCILE_PAGE_SIZE", 1000)?,
            status_poll_interval_secs: parse_var("STATUS_POLL_INTERVAL_SECS", 60)?,
            status_poll_max_age_hours: parse_var("STATUS_POLL_MAX_AGE_HOURS", 48)?,
            reconcile_interval_secs: parse_var("RECONCILE_INTERVAL_SECS", 86_400)?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reconcile_page_size == 0 {
            return Err(ConfigError::InvalidValue("RECONCILE_PAGE_SIZE".to_string()));
        }
        if self.status_poll_interval_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "STATUS_POLL_INTERVAL_SECS".to_string(),
            ));
        }
        if self.status_poll_max_age_hours <= 0 {
            return Err(ConfigError::InvalidValue(
                "STATUS_POLL_MAX_AGE_HOURS".to_string(),
            ));
        }
        if self.reconcile_interval_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "RECONCILE_INTERVAL_SECS".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),

    #[error("Invalid value for configuration: {0}")]
    InvalidValue(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}
