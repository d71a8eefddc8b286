//! Periodic status re-check for transactions still waiting on the provider.
//!
//! Webhooks are the fast path; this worker covers callbacks that never arrive.
//! Every result goes through `PaymentOrchestrator::check_status`, so the
//! poller and the webhook ingress share one transition path. Completed
//! transactions whose side effects were interrupted are finished here too.

use chrono::Duration as ChronoDuration;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::WorkerConfig;
use crate::context::{Clock, RequestContext};
use crate::services::payment_orchestrator::PaymentOrchestrator;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct StatusPollerConfig {
    pub poll_interval: Duration,
    /// Transactions older than this are left alone.
    pub max_age: ChronoDuration,
}

impl Default for StatusPollerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            max_age: ChronoDuration::hours(48),
        }
    }
}

impl From<&WorkerConfig> for StatusPollerConfig {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            poll_interval: Duration::from_secs(config.status_poll_interval_secs),
            max_age: ChronoDuration::hours(config.status_poll_max_age_hours),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PollStats {
    pub checked: usize,
    pub transitioned: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Completed transactions whose outstanding side effects were finished.
    pub resumed: usize,
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

pub struct StatusPollerWorker {
    orchestrator: Arc<PaymentOrchestrator>,
    clock: Arc<dyn Clock>,
    config: StatusPollerConfig,
}

impl StatusPollerWorker {
    pub fn new(
        orchestrator: Arc<PaymentOrchestrator>,
        clock: Arc<dyn Clock>,
        config: StatusPollerConfig,
    ) -> Self {
        Self {
            orchestrator,
            clock,
            config,
        }
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            max_age_hours = self.config.max_age.num_hours(),
            "status poller worker started"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("status poller worker stopping");
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    match self.run_cycle().await {
                        Ok(stats) if stats.checked > 0 || stats.resumed > 0 => info!(
                            checked = stats.checked,
                            transitioned = stats.transitioned,
                            resumed = stats.resumed,
                            failed = stats.failed,
                            "status poll cycle finished"
                        ),
                        Ok(_) => debug!("status poll cycle found nothing to check"),
                        Err(e) => warn!(error = %e, "status poll cycle failed"),
                    }
                }
            }
        }

        info!("status poller worker stopped");
    }

    /// One pass over every non-terminal transaction inside the window,
    /// followed by the completed ones still owed their side effects.
    pub async fn run_cycle(&self) -> anyhow::Result<PollStats> {
        let ctx = RequestContext::new(self.clock.clone());
        let since = ctx.now() - self.config.max_age;
        let pending = self
            .orchestrator
            .transactions()
            .find_non_terminal_since(since)
            .await?;

        let mut stats = PollStats::default();
        for txn in pending {
            // Nothing to ask the provider about until it has assigned a reference.
            if txn.provider_transaction_id.is_none() {
                stats.skipped += 1;
                continue;
            }
            stats.checked += 1;
            match self.orchestrator.check_status(&ctx, txn.id).await {
                Ok(updated) if updated.status != txn.status => stats.transitioned += 1,
                Ok(_) => {}
                Err(e) => {
                    stats.failed += 1;
                    warn!(
                        transaction_number = %txn.transaction_number,
                        provider = %txn.provider_code,
                        error = %e,
                        "status re-check failed"
                    );
                }
            }
        }

        let unsettled = self
            .orchestrator
            .transactions()
            .find_pending_settlement(since)
            .await?;
        for txn in unsettled {
            match self.orchestrator.resume_settlement(&ctx, txn.id).await {
                Ok(_) => stats.resumed += 1,
                Err(e) => {
                    stats.failed += 1;
                    warn!(
                        transaction_number = %txn.transaction_number,
                        provider = %txn.provider_code,
                        error = %e,
                        "completion side effects still failing"
                    );
                }
            }
        }
        Ok(stats)
    }
}
