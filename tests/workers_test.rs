mod common;

use chrono::Duration as ChronoDuration;
use common::{history_row, provider_row, Harness, LedgerFailingOnce};
use momo_core::database::transaction_repository::{Transaction, TransactionStatus};
use momo_core::payments::types::{CanonicalStatus, RefundMode};
use momo_core::services::payment_orchestrator::TransactionRequest;
use momo_core::workers::reconciliation_scheduler::{
    ReconciliationScheduler, ReconciliationSchedulerConfig, SchedulerStats,
};
use momo_core::workers::status_poller::{PollStats, StatusPollerConfig, StatusPollerWorker};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::time::Duration;
use tokio::sync::watch;

async fn pending(h: &Harness, amount: Decimal) -> Transaction {
    h.services
        .orchestrator
        .initiate_payment(
            &h.ctx(),
            TransactionRequest {
                provider_code: Some("mtn".to_string()),
                amount,
                phone_number: "0971234567".to_string(),
                ..TransactionRequest::default()
            },
        )
        .await
        .unwrap()
        .transaction
}

fn poller(h: &Harness) -> StatusPollerWorker {
    StatusPollerWorker::new(
        h.services.orchestrator.clone(),
        h.clock.clone(),
        StatusPollerConfig {
            poll_interval: Duration::from_millis(10),
            max_age: ChronoDuration::hours(48),
        },
    )
}

fn scheduler(h: &Harness) -> ReconciliationScheduler {
    ReconciliationScheduler::new(
        h.services.engine.clone(),
        h.services.registry.clone(),
        h.clock.clone(),
        ReconciliationSchedulerConfig::default(),
    )
}

#[tokio::test]
async fn poller_completes_waiting_transactions() {
    let h = Harness::new();
    let first = pending(&h, dec!(100)).await;
    let second = pending(&h, dec!(20)).await;
    h.stub.set_status(Some(CanonicalStatus::Completed));

    let stats = poller(&h).run_cycle().await.unwrap();
    assert_eq!(
        stats,
        PollStats {
            checked: 2,
            transitioned: 2,
            skipped: 0,
            failed: 0,
            resumed: 0,
        }
    );

    for id in [first.id, second.id] {
        let stored = h.services.orchestrator.find_transaction(id).await.unwrap();
        assert_eq!(stored.status, TransactionStatus::Completed);
    }

    // Terminal transactions drop out of the next cycle.
    let stats = poller(&h).run_cycle().await.unwrap();
    assert_eq!(stats.checked, 0);
}

#[tokio::test]
async fn poller_ignores_transactions_past_the_window() {
    let h = Harness::new();
    let stale = pending(&h, dec!(100)).await;
    h.clock.advance(ChronoDuration::hours(49));
    let fresh = pending(&h, dec!(20)).await;
    h.stub.set_status(Some(CanonicalStatus::Completed));

    let stats = poller(&h).run_cycle().await.unwrap();
    assert_eq!(stats.checked, 1);

    let stale = h.services.orchestrator.find_transaction(stale.id).await.unwrap();
    let fresh = h.services.orchestrator.find_transaction(fresh.id).await.unwrap();
    assert_eq!(stale.status, TransactionStatus::Pending);
    assert_eq!(fresh.status, TransactionStatus::Completed);
}

#[tokio::test]
async fn poller_counts_unanswered_checks() {
    let h = Harness::new();
    pending(&h, dec!(100)).await;
    h.stub.set_status(None);

    let stats = poller(&h).run_cycle().await.unwrap();
    assert_eq!(stats.checked, 1);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.transitioned, 0);
}

#[tokio::test]
async fn poller_finishes_completions_left_unsettled() {
    let h = Harness::build_with(provider_row("mtn"), RefundMode::Native, 1000, |backends| {
        backends.ledger = LedgerFailingOnce::wrap(backends.ledger.clone());
    });
    let txn = pending(&h, dec!(100)).await;
    h.stub.set_status(Some(CanonicalStatus::Completed));

    // The status check completes the transaction but the ledger post fails;
    // the settlement pass of the same cycle picks it up again.
    let stats = poller(&h).run_cycle().await.unwrap();
    assert_eq!(stats.checked, 1);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.resumed, 1);
    assert_eq!(h.ledger.entries_for(txn.id).len(), 3);

    let stored = h.services.orchestrator.find_transaction(txn.id).await.unwrap();
    assert_eq!(stored.status, TransactionStatus::Completed);
    assert!(!stored.settlement_pending());

    let stats = poller(&h).run_cycle().await.unwrap();
    assert_eq!(stats, PollStats::default());
}

#[tokio::test]
async fn poller_stops_on_shutdown() {
    let h = Harness::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(poller(&h).run(shutdown_rx));

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("poller did not stop")
        .unwrap();
}

#[tokio::test]
async fn scheduler_reconciles_the_previous_day() {
    let h = Harness::new();
    let txn = pending(&h, dec!(100)).await;
    h.stub.set_status(Some(CanonicalStatus::Completed));
    h.services
        .orchestrator
        .check_status(&h.ctx(), txn.id)
        .await
        .unwrap();
    h.stub
        .set_history(vec![history_row("P1", dec!(100), CanonicalStatus::Completed)]);

    h.clock.advance(ChronoDuration::days(1));
    let stats = scheduler(&h).run_cycle().await;
    assert_eq!(
        stats,
        SchedulerStats {
            runs: 1,
            with_discrepancies: 0,
            failed: 0,
        }
    );

    let runs = h.services.engine.recent_runs("mtn", 5).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].matched_count, 1);
    let stored = h.services.orchestrator.find_transaction(txn.id).await.unwrap();
    assert!(stored.is_reconciled);
}

#[tokio::test]
async fn scheduler_reports_failed_and_discrepant_runs() {
    let h = Harness::new();
    h.stub
        .set_history(vec![history_row("P77", dec!(5), CanonicalStatus::Completed)]);
    let stats = scheduler(&h).run_cycle().await;
    assert_eq!(stats.runs, 1);
    assert_eq!(stats.with_discrepancies, 1);

    h.stub.fail_history("statement endpoint timed out");
    let stats = scheduler(&h).run_cycle().await;
    assert_eq!(stats.runs, 0);
    assert_eq!(stats.failed, 1);
}
