//! Service wiring: storage, provider registry, orchestrator, reconciliation,
//! webhook ingress and background workers.

use axum::Router;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::api::{self, ApiState};
use crate::config::AppConfig;
use crate::context::{Clock, SystemClock};
use crate::database::provider_config_repository::{load_from_file, ProviderConfig};
use crate::database::reconciliation_repository::{
    InMemoryReconciliationRepository, ReconciliationRepository,
};
use crate::database::transaction_repository::{
    InMemoryTransactionRepository, TransactionRepository,
};
use crate::error::AppError;
use crate::health::HealthChecker;
use crate::payments::registry::ProviderRegistry;
use crate::payments::token_cache::TokenCache;
use crate::services::ledger::{InMemoryInvoiceStore, InMemoryLedger, InvoiceStore, LedgerPoster};
use crate::services::notification::{spawn_log_consumer, NotificationSink};
use crate::services::payment_orchestrator::PaymentOrchestrator;
use crate::services::reconciliation::ReconciliationEngine;
use crate::services::webhook_processor::WebhookProcessor;
use crate::workers::reconciliation_scheduler::ReconciliationScheduler;
use crate::workers::status_poller::StatusPollerWorker;

const NOTIFICATION_BUFFER: usize = 256;

/// Storage and collaborators the services are built on.
pub struct Backends {
    pub transactions: Arc<dyn TransactionRepository>,
    pub records: Arc<dyn ReconciliationRepository>,
    pub ledger: Arc<dyn LedgerPoster>,
    pub invoices: Arc<dyn InvoiceStore>,
}

impl Backends {
    pub fn in_memory() -> Self {
        Self {
            transactions: Arc::new(InMemoryTransactionRepository::new()),
            records: Arc::new(InMemoryReconciliationRepository::new()),
            ledger: Arc::new(InMemoryLedger::new()),
            invoices: Arc::new(InMemoryInvoiceStore::new()),
        }
    }
}

pub struct Services {
    pub registry: Arc<ProviderRegistry>,
    pub orchestrator: Arc<PaymentOrchestrator>,
    pub engine: Arc<ReconciliationEngine>,
    pub processor: Arc<WebhookProcessor>,
    pub health: HealthChecker,
    pub clock: Arc<dyn Clock>,
}

impl Services {
    pub fn assemble(
        registry: Arc<ProviderRegistry>,
        backends: Backends,
        notifications: NotificationSink,
        clock: Arc<dyn Clock>,
        reconcile_page_size: u32,
    ) -> Self {
        let orchestrator = Arc::new(PaymentOrchestrator::new(
            registry.clone(),
            backends.transactions,
            backends.ledger,
            backends.invoices,
            notifications,
        ));
        let engine = Arc::new(ReconciliationEngine::new(
            orchestrator.clone(),
            backends.records,
            reconcile_page_size,
        ));
        let processor = Arc::new(WebhookProcessor::new(orchestrator.clone()));
        let health = HealthChecker::new(registry.clone());

        Self {
            registry,
            orchestrator,
            engine,
            processor,
            health,
            clock,
        }
    }

    pub fn router(&self) -> Router {
        api::router(ApiState {
            processor: self.processor.clone(),
            health: self.health.clone(),
            clock: self.clock.clone(),
        })
    }

    pub fn spawn_workers(
        &self,
        config: &AppConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let poller = StatusPollerWorker::new(
            self.orchestrator.clone(),
            self.clock.clone(),
            (&config.workers).into(),
        );
        let scheduler = ReconciliationScheduler::new(
            self.engine.clone(),
            self.registry.clone(),
            self.clock.clone(),
            (&config.workers).into(),
        );
        vec![
            tokio::spawn(poller.run(shutdown_rx.clone())),
            tokio::spawn(scheduler.run(shutdown_rx)),
        ]
    }
}

/// Builds every service from configuration.
pub async fn bootstrap(config: &AppConfig) -> Result<Services, AppError> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    #[cfg(feature = "database")]
    let db_pool = match &config.database.url {
        Some(url) => {
            let pool = crate::database::init_pool_from_config(&config.database, url).await?;
            info!("using PostgreSQL repositories");
            Some(pool)
        }
        None => {
            warn!("DATABASE_URL not set, transactions are kept in memory");
            None
        }
    };
    #[cfg(not(feature = "database"))]
    if config.database.url.is_some() {
        warn!("DATABASE_URL ignored: built without the database feature");
    }

    let provider_configs: Vec<ProviderConfig> = match &config.payments.providers_file {
        Some(path) => load_from_file(path)?,
        None => {
            #[cfg(feature = "database")]
            let rows = match &db_pool {
                Some(pool) => {
                    crate::database::provider_config_repository::PgProviderConfigRepository::new(
                        pool.clone(),
                    )
                    .find_all()
                    .await?
                }
                None => Vec::new(),
            };
            #[cfg(not(feature = "database"))]
            let rows = Vec::new();
            rows
        }
    };
    if provider_configs.is_empty() {
        warn!("no provider configuration found, every payment will be rejected");
    }

    #[allow(unused_mut)]
    let mut tokens = TokenCache::new(config.payments.token_expiry_margin_secs);
    #[cfg(feature = "cache")]
    let cache_pool = match &config.cache.redis_url {
        Some(url) => {
            let pool = crate::cache::init_cache_pool(crate::cache::RedisPoolConfig::new(url.clone()))
                .await
                .map_err(|e| {
                    AppError::new(crate::error::AppErrorKind::Infrastructure(
                        crate::error::InfrastructureError::Cache {
                            message: e.to_string(),
                        },
                    ))
                })?;
            tokens = tokens.with_store(Arc::new(crate::cache::RedisTokenStore::new(pool.clone())));
            info!("sharing provider tokens through redis");
            Some(pool)
        }
        None => None,
    };
    #[cfg(not(feature = "cache"))]
    if config.cache.redis_url.is_some() {
        warn!("REDIS_URL ignored: built without the cache feature");
    }

    let registry = Arc::new(ProviderRegistry::with_default_adapters(Arc::new(tokens)));
    for provider in provider_configs {
        let provider = provider.with_http_defaults(
            config.payments.http_timeout_secs,
            config.payments.http_max_retries,
            config.payments.http_retry_delay_ms,
        );
        info!(
            provider = %provider.code,
            currency = %provider.currency,
            active = provider.is_active,
            "provider configured"
        );
        registry.upsert_provider(provider);
    }

    #[allow(unused_mut)]
    let mut backends = Backends::in_memory();
    #[cfg(feature = "database")]
    if let Some(pool) = &db_pool {
        backends.transactions = Arc::new(
            crate::database::transaction_repository::PgTransactionRepository::new(pool.clone()),
        );
        backends.records = Arc::new(
            crate::database::reconciliation_repository::PgReconciliationRepository::new(
                pool.clone(),
            ),
        );
    }

    let (notifications, events) = NotificationSink::channel(NOTIFICATION_BUFFER);
    spawn_log_consumer(events);

    #[allow(unused_mut)]
    let mut services = Services::assemble(
        registry,
        backends,
        notifications,
        clock,
        config.workers.reconcile_page_size,
    );

    #[cfg(feature = "database")]
    if let Some(pool) = db_pool {
        services.health = services.health.with_database(pool);
    }
    #[cfg(feature = "cache")]
    if let Some(pool) = cache_pool {
        services.health = services.health.with_cache(pool);
    }

    Ok(services)
}
