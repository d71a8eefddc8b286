//! Runs `auto_reconcile` for every active provider over the previous UTC day.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::WorkerConfig;
use crate::context::{Clock, RequestContext};
use crate::payments::registry::ProviderRegistry;
use crate::services::payment_orchestrator::start_of_day;
use crate::services::reconciliation::ReconciliationEngine;

#[derive(Debug, Clone)]
pub struct ReconciliationSchedulerConfig {
    pub interval: Duration,
}

impl Default for ReconciliationSchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(86_400),
        }
    }
}

impl From<&WorkerConfig> for ReconciliationSchedulerConfig {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            interval: Duration::from_secs(config.reconcile_interval_secs),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SchedulerStats {
    pub runs: usize,
    pub with_discrepancies: usize,
    pub failed: usize,
}

pub struct ReconciliationScheduler {
    engine: Arc<ReconciliationEngine>,
    registry: Arc<ProviderRegistry>,
    clock: Arc<dyn Clock>,
    config: ReconciliationSchedulerConfig,
}

/// `[yesterday 00:00, today 00:00)` in UTC.
pub fn previous_day(now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let to = start_of_day(now);
    (to - ChronoDuration::days(1), to)
}

impl ReconciliationScheduler {
    pub fn new(
        engine: Arc<ReconciliationEngine>,
        registry: Arc<ProviderRegistry>,
        clock: Arc<dyn Clock>,
        config: ReconciliationSchedulerConfig,
    ) -> Self {
        Self {
            engine,
            registry,
            clock,
            config,
        }
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            "reconciliation scheduler started"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("reconciliation scheduler stopping");
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.interval) => {
                    let stats = self.run_cycle().await;
                    info!(
                        runs = stats.runs,
                        with_discrepancies = stats.with_discrepancies,
                        failed = stats.failed,
                        "scheduled reconciliation finished"
                    );
                }
            }
        }

        info!("reconciliation scheduler stopped");
    }

    /// Providers are reconciled one after another; a failure for one does not
    /// stop the others.
    pub async fn run_cycle(&self) -> SchedulerStats {
        let ctx = RequestContext::new(self.clock.clone());
        let (from, to) = previous_day(ctx.now());

        let mut providers: Vec<String> = self
            .registry
            .active_providers()
            .into_iter()
            .map(|c| c.code.clone())
            .collect();
        providers.sort();

        let mut stats = SchedulerStats::default();
        for code in providers {
            match self.engine.auto_reconcile(&ctx, &code, from, to).await {
                Ok(report) => {
                    stats.runs += 1;
                    if report.has_discrepancies {
                        stats.with_discrepancies += 1;
                        warn!(
                            provider = %code,
                            record_id = %report.record.id,
                            "reconciliation found discrepancies"
                        );
                    }
                }
                Err(e) => {
                    stats.failed += 1;
                    error!(provider = %code, error = %e, "scheduled reconciliation failed");
                }
            }
        }
        stats
    }
}
