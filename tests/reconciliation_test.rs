mod common;

use chrono::{DateTime, Duration, Utc};
use common::{history_row, provider_row, start_time, Harness, RecordsRejectingResults};
use momo_core::database::reconciliation_repository::{
    ReconciliationItemStatus, ReconciliationStatus,
};
use momo_core::database::transaction_repository::{Transaction, TransactionStatus};
use momo_core::payments::error::PaymentError;
use momo_core::payments::types::{CanonicalStatus, RefundMode};
use momo_core::services::payment_orchestrator::TransactionRequest;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::atomic::Ordering;

fn period() -> (DateTime<Utc>, DateTime<Utc>) {
    let from = start_time() - Duration::hours(9);
    (from, from + Duration::days(1))
}

async fn complete(h: &Harness, amount: Decimal) -> Transaction {
    let outcome = h
        .services
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
        .unwrap();
    h.stub.set_status(Some(CanonicalStatus::Completed));
    let txn = h
        .services
        .orchestrator
        .check_status(&h.ctx(), outcome.transaction.id)
        .await
        .unwrap();
    h.stub.set_status(Some(CanonicalStatus::Pending));
    assert_eq!(txn.status, TransactionStatus::Completed);
    txn
}

fn statuses(items: &[momo_core::database::reconciliation_repository::ReconciliationItem]) -> Vec<ReconciliationItemStatus> {
    items.iter().map(|i| i.status).collect()
}

#[tokio::test]
async fn matching_history_reconciles_cleanly() {
    let h = Harness::new();
    let txn = complete(&h, dec!(100.00)).await;
    h.stub
        .set_history(vec![history_row("P1", dec!(100.00), CanonicalStatus::Completed)]);

    let (from, to) = period();
    let report = h
        .services
        .engine
        .auto_reconcile(&h.ctx(), "mtn", from, to)
        .await
        .unwrap();

    assert!(!report.has_discrepancies);
    assert_eq!(report.record.status, ReconciliationStatus::Reconciled);
    assert_eq!(report.record.matched_count, 1);
    assert_eq!(report.record.unmatched_local_count, 0);
    assert_eq!(report.record.unmatched_provider_count, 0);
    assert_eq!(report.record.difference_amount, Decimal::ZERO);
    assert_eq!(statuses(&report.items), vec![ReconciliationItemStatus::Matched]);
    assert_eq!(report.items[0].transaction_id, Some(txn.id));

    let stored = h.services.orchestrator.find_transaction(txn.id).await.unwrap();
    assert!(stored.is_reconciled);
}

#[tokio::test]
async fn amount_mismatch_is_reported_on_both_sides() {
    let h = Harness::new();
    let txn = complete(&h, dec!(100.00)).await;
    h.stub
        .set_history(vec![history_row("P1", dec!(99.00), CanonicalStatus::Completed)]);

    let (from, to) = period();
    let report = h
        .services
        .engine
        .auto_reconcile(&h.ctx(), "mtn", from, to)
        .await
        .unwrap();

    assert!(report.has_discrepancies);
    assert_eq!(report.record.status, ReconciliationStatus::Discrepancies);
    assert_eq!(report.record.matched_count, 0);
    assert_eq!(report.record.unmatched_local_count, 1);
    assert_eq!(report.record.unmatched_provider_count, 1);
    assert_eq!(report.record.difference_amount, dec!(1.00));
    assert_eq!(
        statuses(&report.items),
        vec![
            ReconciliationItemStatus::UnmatchedLocal,
            ReconciliationItemStatus::UnmatchedProvider
        ]
    );

    let stored = h.services.orchestrator.find_transaction(txn.id).await.unwrap();
    assert!(!stored.is_reconciled);
}

#[tokio::test]
async fn non_completed_provider_rows_are_ignored() {
    let h = Harness::new();
    complete(&h, dec!(100)).await;
    h.stub.set_history(vec![
        history_row("P1", dec!(100), CanonicalStatus::Completed),
        history_row("P9", dec!(40), CanonicalStatus::Failed),
        history_row("P10", dec!(15), CanonicalStatus::Pending),
    ]);

    let (from, to) = period();
    let report = h
        .services
        .engine
        .auto_reconcile(&h.ctx(), "mtn", from, to)
        .await
        .unwrap();

    assert!(!report.has_discrepancies);
    assert_eq!(report.record.provider_count, 1);
    assert_eq!(report.record.provider_amount, dec!(100));
}

#[tokio::test]
async fn rerunning_the_same_period_gives_the_same_result() {
    let h = Harness::new();
    complete(&h, dec!(100)).await;
    complete(&h, dec!(25.50)).await;
    h.stub.set_history(vec![
        history_row("P1", dec!(100), CanonicalStatus::Completed),
        history_row("P7", dec!(12), CanonicalStatus::Completed),
    ]);

    let (from, to) = period();
    let first = h
        .services
        .engine
        .auto_reconcile(&h.ctx(), "mtn", from, to)
        .await
        .unwrap();
    let second = h
        .services
        .engine
        .auto_reconcile(&h.ctx(), "mtn", from, to)
        .await
        .unwrap();

    assert_ne!(first.record.id, second.record.id);
    assert_eq!(first.record.matched_count, second.record.matched_count);
    assert_eq!(
        first.record.unmatched_local_count,
        second.record.unmatched_local_count
    );
    assert_eq!(
        first.record.unmatched_provider_count,
        second.record.unmatched_provider_count
    );
    assert_eq!(first.record.difference_amount, second.record.difference_amount);
    assert_eq!(statuses(&first.items), statuses(&second.items));
    assert_eq!(first.record.difference_amount, dec!(13.50));

    let runs = h.services.engine.recent_runs("mtn", 10).await.unwrap();
    assert_eq!(runs.len(), 2);
}

#[tokio::test]
async fn history_failure_aborts_the_run() {
    let h = Harness::new();
    complete(&h, dec!(100)).await;
    h.stub.fail_history("statement service down");

    let (from, to) = period();
    let err = h
        .services
        .engine
        .auto_reconcile(&h.ctx(), "mtn", from, to)
        .await
        .unwrap_err();
    assert!(matches!(err, PaymentError::ReconciliationAborted { .. }));

    let runs = h.services.engine.recent_runs("mtn", 10).await.unwrap();
    assert_eq!(runs.len(), 1);
    let report = h.services.engine.find_report(runs[0].id).await.unwrap();
    assert_eq!(report.record.status, ReconciliationStatus::Failed);
    assert!(report
        .record
        .failure_reason
        .as_deref()
        .unwrap_or_default()
        .contains("statement service down"));
    assert!(report.items.is_empty());
}

#[tokio::test]
async fn storage_failure_while_finalizing_marks_the_run_failed() {
    let h = Harness::build_with(provider_row("mtn"), RefundMode::Native, 1000, |backends| {
        backends.records = RecordsRejectingResults::wrap(backends.records.clone());
    });
    let txn = complete(&h, dec!(100)).await;
    h.stub
        .set_history(vec![history_row("P1", dec!(100), CanonicalStatus::Completed)]);

    let (from, to) = period();
    let err = h
        .services
        .engine
        .auto_reconcile(&h.ctx(), "mtn", from, to)
        .await
        .unwrap_err();
    assert!(matches!(err, PaymentError::Persistence { .. }));

    let runs = h.services.engine.recent_runs("mtn", 10).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, ReconciliationStatus::Failed);
    assert!(runs[0].completed_at.is_some());
    assert!(runs[0]
        .failure_reason
        .as_deref()
        .unwrap_or_default()
        .contains("write failed"));

    let stored = h.services.orchestrator.find_transaction(txn.id).await.unwrap();
    assert!(!stored.is_reconciled);
}

#[tokio::test]
async fn unrecognised_provider_rows_are_discrepancies() {
    let h = Harness::new();
    complete(&h, dec!(100)).await;
    h.stub.set_history(vec![
        history_row("P1", dec!(100), CanonicalStatus::Completed),
        history_row("P12", dec!(30), CanonicalStatus::Unknown),
    ]);

    let (from, to) = period();
    let report = h
        .services
        .engine
        .auto_reconcile(&h.ctx(), "mtn", from, to)
        .await
        .unwrap();

    assert!(report.has_discrepancies);
    assert_eq!(report.record.status, ReconciliationStatus::Discrepancies);
    assert_eq!(report.record.matched_count, 1);
    assert_eq!(report.record.unmatched_provider_count, 1);
    assert_eq!(report.record.provider_amount, dec!(100));
    assert_eq!(
        statuses(&report.items),
        vec![
            ReconciliationItemStatus::Matched,
            ReconciliationItemStatus::UnmatchedProvider
        ]
    );
    assert_eq!(report.items[1].provider_transaction_id.as_deref(), Some("P12"));
}

#[tokio::test]
async fn history_is_fetched_page_by_page() {
    let h = Harness::build(provider_row("mtn"), RefundMode::Native, 2);
    complete(&h, dec!(100)).await;
    h.stub.set_history(vec![
        history_row("P1", dec!(100), CanonicalStatus::Completed),
        history_row("R2", dec!(5), CanonicalStatus::Completed),
        history_row("R3", dec!(6), CanonicalStatus::Completed),
        history_row("R4", dec!(7), CanonicalStatus::Completed),
        history_row("R5", dec!(8), CanonicalStatus::Completed),
    ]);

    let (from, to) = period();
    let report = h
        .services
        .engine
        .auto_reconcile(&h.ctx(), "mtn", from, to)
        .await
        .unwrap();

    assert_eq!(h.stub.history_calls.load(Ordering::SeqCst), 3);
    assert_eq!(report.record.provider_count, 5);
    assert_eq!(report.record.matched_count, 1);
    assert_eq!(report.record.unmatched_provider_count, 4);
}

#[tokio::test]
async fn transactions_outside_the_period_are_not_considered() {
    let h = Harness::new();
    complete(&h, dec!(100)).await;
    h.stub.set_history(Vec::new());

    let (from, _) = period();
    let report = h
        .services
        .engine
        .auto_reconcile(&h.ctx(), "mtn", from - Duration::days(1), from)
        .await
        .unwrap();
    assert_eq!(report.record.local_count, 0);
    assert!(!report.has_discrepancies);

    let err = h
        .services
        .engine
        .auto_reconcile(&h.ctx(), "mtn", from, from)
        .await
        .unwrap_err();
    assert!(matches!(err, PaymentError::ValidationError { .. }));
}

#[tokio::test]
async fn manual_overrides_are_audited() {
    let h = Harness::new();
    let txn = complete(&h, dec!(100)).await;
    let admin = uuid::Uuid::new_v4();
    let ctx = h.ctx().with_user(admin);

    let flagged = h
        .services
        .engine
        .mark_reconciled(&ctx, txn.id, Some("checked statement".to_string()))
        .await
        .unwrap();
    assert!(flagged.is_reconciled);

    let cleared = h
        .services
        .engine
        .mark_unreconciled(&ctx, txn.id, Some("statement reissued".to_string()))
        .await
        .unwrap();
    assert!(!cleared.is_reconciled);
    assert!(cleared.reconciled_at.is_none());

    let trail = h.services.orchestrator.audit_trail(txn.id).await.unwrap();
    let overrides: Vec<_> = trail
        .iter()
        .filter(|e| e.action.starts_with("mark_"))
        .collect();
    assert_eq!(overrides.len(), 2);
    assert_eq!(overrides[0].action, "mark_reconciled");
    assert_eq!(overrides[0].note.as_deref(), Some("checked statement"));
    assert_eq!(overrides[1].action, "mark_unreconciled");
    assert!(overrides.iter().all(|e| e.actor == admin.to_string()));
}

#[tokio::test]
async fn only_completed_transactions_can_be_marked_reconciled() {
    let h = Harness::new();
    let pending = h
        .services
        .orchestrator
        .initiate_payment(
            &h.ctx(),
            TransactionRequest {
                provider_code: Some("mtn".to_string()),
                amount: dec!(10),
                phone_number: "0971234567".to_string(),
                ..TransactionRequest::default()
            },
        )
        .await
        .unwrap()
        .transaction;

    let err = h
        .services
        .engine
        .mark_reconciled(&h.ctx(), pending.id, None)
        .await
        .unwrap_err();
    assert!(matches!(err, PaymentError::ValidationError { .. }));
}

#[tokio::test]
async fn recheck_runs_a_status_check_and_records_the_request() {
    let h = Harness::new();
    let pending = h
        .services
        .orchestrator
        .initiate_payment(
            &h.ctx(),
            TransactionRequest {
                provider_code: Some("mtn".to_string()),
                amount: dec!(10),
                phone_number: "0971234567".to_string(),
                ..TransactionRequest::default()
            },
        )
        .await
        .unwrap()
        .transaction;
    h.stub.set_status(Some(CanonicalStatus::Completed));

    let rechecked = h
        .services
        .engine
        .recheck_status(&h.ctx(), pending.id)
        .await
        .unwrap();
    assert_eq!(rechecked.status, TransactionStatus::Completed);

    let actions: Vec<String> = h
        .services
        .orchestrator
        .audit_trail(pending.id)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.action)
        .collect();
    assert_eq!(actions, vec!["created", "status_check", "recheck_status"]);
}
