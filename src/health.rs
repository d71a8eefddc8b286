//! Health check module
//! Reports the state of storage and of every active provider

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::context::RequestContext;
use crate::payments::registry::ProviderRegistry;

/// Health status response
#[derive(Debug, Serialize, Clone)]
pub struct HealthStatus {
    pub status: HealthState,
    pub checks: HashMap<String, ComponentHealth>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Overall health state
#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Individual component health status
#[derive(Debug, Serialize, Clone)]
pub struct ComponentHealth {
    pub status: ComponentState,
    pub response_time_ms: Option<u128>,
    pub details: Option<String>,
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub enum ComponentState {
    Up,
    Down,
    Warning,
}

impl HealthStatus {
    pub fn new() -> Self {
        Self {
            status: HealthState::Healthy,
            checks: HashMap::new(),
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self.status, HealthState::Healthy)
    }
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl ComponentHealth {
    pub fn up(response_time_ms: Option<u128>) -> Self {
        Self {
            status: ComponentState::Up,
            response_time_ms,
            details: None,
        }
    }

    pub fn down(details: Option<String>) -> Self {
        Self {
            status: ComponentState::Down,
            response_time_ms: None,
            details,
        }
    }

    pub fn warning(response_time_ms: Option<u128>, details: Option<String>) -> Self {
        Self {
            status: ComponentState::Warning,
            response_time_ms,
            details,
        }
    }
}

const STORAGE_CHECK_TIMEOUT: Duration = Duration::from_secs(5);
const PROVIDER_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Storage outages make the service unhealthy; an unreachable provider only
/// degrades it.
#[derive(Clone)]
pub struct HealthChecker {
    registry: Arc<ProviderRegistry>,
    #[cfg(feature = "database")]
    db_pool: Option<sqlx::PgPool>,
    #[cfg(feature = "cache")]
    cache: Option<crate::cache::RedisPool>,
}

impl HealthChecker {
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self {
            registry,
            #[cfg(feature = "database")]
            db_pool: None,
            #[cfg(feature = "cache")]
            cache: None,
        }
    }

    #[cfg(feature = "database")]
    pub fn with_database(mut self, pool: sqlx::PgPool) -> Self {
        self.db_pool = Some(pool);
        self
    }

    #[cfg(feature = "cache")]
    pub fn with_cache(mut self, pool: crate::cache::RedisPool) -> Self {
        self.cache = Some(pool);
        self
    }

    pub async fn check_health(&self, ctx: &RequestContext) -> HealthStatus {
        let mut health_status = HealthStatus::new();
        let mut storage_healthy = true;
        let mut providers_healthy = true;

        #[cfg(feature = "database")]
        if let Some(pool) = &self.db_pool {
            let start = Instant::now();
            let component = match timeout(STORAGE_CHECK_TIMEOUT, crate::database::health_check(pool)).await {
                Ok(Ok(())) => ComponentHealth::up(Some(start.elapsed().as_millis())),
                Ok(Err(e)) => {
                    error!("Database health check failed: {}", e);
                    ComponentHealth::down(Some(e.to_string()))
                }
                Err(_) => {
                    error!("Database health check timed out");
                    ComponentHealth::down(Some("Timeout".to_string()))
                }
            };
            storage_healthy &= component.status == ComponentState::Up;
            health_status.checks.insert("database".to_string(), component);
        }

        #[cfg(feature = "cache")]
        if let Some(pool) = &self.cache {
            let start = Instant::now();
            // The token store is optional, so a dead cache is only a warning.
            let component = match timeout(STORAGE_CHECK_TIMEOUT, crate::cache::health_check(pool)).await {
                Ok(Ok(())) => ComponentHealth::up(Some(start.elapsed().as_millis())),
                Ok(Err(e)) => {
                    warn!("Cache health check failed: {}", e);
                    ComponentHealth::warning(None, Some(e.to_string()))
                }
                Err(_) => ComponentHealth::warning(None, Some("Timeout".to_string())),
            };
            health_status.checks.insert("cache".to_string(), component);
        }

        for config in self.registry.active_providers() {
            let start = Instant::now();
            let component = match timeout(
                PROVIDER_CHECK_TIMEOUT,
                self.registry.test_connectivity(ctx, &config.code),
            )
            .await
            {
                Ok(connectivity) if connectivity.available => {
                    let elapsed = start.elapsed().as_millis();
                    info!(provider = %config.code, "Provider health check: OK ({}ms)", elapsed);
                    ComponentHealth::up(Some(elapsed))
                }
                Ok(connectivity) => {
                    warn!(provider = %config.code, message = %connectivity.message, "Provider health check failed");
                    ComponentHealth::down(Some(connectivity.message))
                }
                Err(_) => {
                    warn!(provider = %config.code, "Provider health check timed out");
                    ComponentHealth::down(Some("Timeout".to_string()))
                }
            };
            providers_healthy &= component.status == ComponentState::Up;
            health_status
                .checks
                .insert(format!("provider:{}", config.code), component);
        }

        health_status.status = match (storage_healthy, providers_healthy) {
            (false, _) => HealthState::Unhealthy,
            (true, false) => HealthState::Degraded,
            (true, true) => HealthState::Healthy,
        };

        health_status
    }
}
