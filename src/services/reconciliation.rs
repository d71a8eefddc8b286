//! Reconciliation engine
//!
//! Matches locally completed transactions against the provider's own history
//! in one hash-based pass keyed by `(provider transaction id, amount rounded to
//! 2dp)`, and provides the audited manual overrides.

use crate::context::RequestContext;
use crate::database::error::DatabaseError;
use crate::database::reconciliation_repository::{
    ReconciliationItem, ReconciliationItemStatus, ReconciliationRecord, ReconciliationRepository,
    ReconciliationStatus,
};
use crate::database::transaction_repository::{Transaction, TransactionRepository, TransactionStatus};
use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::provider::MobileMoneyProvider;
use crate::payments::registry::ProviderRegistry;
use crate::payments::types::{
    round_currency, CanonicalStatus, HistoryQuery, ProviderOutcome, ProviderTransaction,
};
use crate::services::notification::NotificationType;
use crate::services::payment_orchestrator::PaymentOrchestrator;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Currency-rounding epsilon for the aggregate amount comparison.
pub const AMOUNT_TOLERANCE: Decimal = Decimal::from_parts(1, 0, 0, false, 2);

pub const DEFAULT_PAGE_SIZE: u32 = 1000;

/// Upper bound on history pages fetched in one run.
const MAX_PAGES: u32 = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MatchKey(String, Decimal);

impl MatchKey {
    fn new(id: &str, amount: Decimal) -> Self {
        Self(id.to_string(), round_currency(amount).normalize())
    }
}

/// Output of one matching pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MatchOutcome {
    pub items: Vec<ReconciliationItem>,
    pub local_count: i64,
    pub provider_count: i64,
    pub matched_count: i64,
    pub unmatched_local_count: i64,
    pub unmatched_provider_count: i64,
    pub duplicate_count: i64,
    /// Provider rows whose status did not map to a canonical one. Each is
    /// also counted as unmatched on the provider side.
    pub unknown_status_count: i64,
    pub local_amount: Decimal,
    pub provider_amount: Decimal,
    pub matched_amount: Decimal,
    pub difference_amount: Decimal,
    pub matched_transaction_ids: Vec<Uuid>,
}

impl MatchOutcome {
    pub fn has_discrepancies(&self) -> bool {
        self.unmatched_local_count > 0
            || self.unmatched_provider_count > 0
            || self.duplicate_count > 0
            || self.difference_amount.abs() > AMOUNT_TOLERANCE
    }
}

/// Pairs local and provider transactions.
///
/// Only provider rows whose canonical status is completed take part in
/// matching. Rows with an unmapped status cannot be judged either way and are
/// reported as unmatched on the provider side; failed, pending and cancelled
/// rows are skipped. Repeated keys on either side are reported as duplicates
/// instead of being merged.
pub fn match_transactions(
    record_id: Uuid,
    local: &[Transaction],
    provider: &[ProviderTransaction],
) -> MatchOutcome {
    let mut outcome = MatchOutcome::default();
    let mut lookup: HashMap<MatchKey, &ProviderTransaction> = HashMap::with_capacity(provider.len());

    let mut unknown: Vec<&ProviderTransaction> = Vec::new();
    for row in provider {
        match row.status {
            CanonicalStatus::Completed => {}
            CanonicalStatus::Unknown => {
                unknown.push(row);
                continue;
            }
            _ => continue,
        }
        outcome.provider_count += 1;
        outcome.provider_amount += row.amount;
        let key = MatchKey::new(&row.id, row.amount);
        if lookup.contains_key(&key) {
            outcome.duplicate_count += 1;
            outcome.items.push(item(
                record_id,
                None,
                Some(row),
                ReconciliationItemStatus::DuplicateProvider,
                format!("provider transaction {} appears more than once", row.id),
            ));
        } else {
            lookup.insert(key, row);
        }
    }

    let mut seen: HashSet<MatchKey> = HashSet::with_capacity(local.len());
    for txn in local {
        outcome.local_count += 1;
        outcome.local_amount += txn.amount;

        let Some(reference) = txn.provider_transaction_id.as_deref() else {
            outcome.unmatched_local_count += 1;
            outcome.items.push(item(
                record_id,
                Some(txn),
                None,
                ReconciliationItemStatus::UnmatchedLocal,
                format!("{} has no provider reference", txn.transaction_number),
            ));
            continue;
        };

        let key = MatchKey::new(reference, txn.amount);
        if !seen.insert(key.clone()) {
            outcome.duplicate_count += 1;
            outcome.items.push(item(
                record_id,
                Some(txn),
                None,
                ReconciliationItemStatus::DuplicateLocal,
                format!(
                    "{} shares provider reference {} and amount with another transaction",
                    txn.transaction_number, reference
                ),
            ));
            continue;
        }

        match lookup.remove(&key) {
            Some(row) => {
                outcome.matched_count += 1;
                outcome.matched_amount += txn.amount;
                outcome.matched_transaction_ids.push(txn.id);
                outcome.items.push(item(
                    record_id,
                    Some(txn),
                    Some(row),
                    ReconciliationItemStatus::Matched,
                    format!("{} matched {}", txn.transaction_number, row.id),
                ));
            }
            None => {
                outcome.unmatched_local_count += 1;
                outcome.items.push(item(
                    record_id,
                    Some(txn),
                    None,
                    ReconciliationItemStatus::UnmatchedLocal,
                    format!(
                        "{} ({} {}) not found in provider history",
                        txn.transaction_number, reference, txn.amount
                    ),
                ));
            }
        }
    }

    let mut remaining: Vec<&ProviderTransaction> = lookup.into_values().collect();
    remaining.sort_by(|a, b| a.id.cmp(&b.id).then_with(|| a.amount.cmp(&b.amount)));
    for row in remaining {
        outcome.unmatched_provider_count += 1;
        outcome.items.push(item(
            record_id,
            None,
            Some(row),
            ReconciliationItemStatus::UnmatchedProvider,
            format!("provider transaction {} ({}) has no local match", row.id, row.amount),
        ));
    }

    unknown.sort_by(|a, b| a.id.cmp(&b.id));
    for row in unknown {
        outcome.unknown_status_count += 1;
        outcome.unmatched_provider_count += 1;
        outcome.items.push(item(
            record_id,
            None,
            Some(row),
            ReconciliationItemStatus::UnmatchedProvider,
            format!(
                "provider transaction {} ({}) has an unrecognised status",
                row.id, row.amount
            ),
        ));
    }

    outcome.difference_amount = round_currency(outcome.local_amount - outcome.provider_amount);
    outcome
}

fn item(
    record_id: Uuid,
    local: Option<&Transaction>,
    provider: Option<&ProviderTransaction>,
    status: ReconciliationItemStatus,
    description: String,
) -> ReconciliationItem {
    let local_amount = local.map(|t| t.amount);
    let provider_amount = provider.map(|p| p.amount);
    ReconciliationItem {
        id: Uuid::new_v4(),
        record_id,
        transaction_id: local.map(|t| t.id),
        provider_transaction_id: provider
            .map(|p| p.id.clone())
            .or_else(|| local.and_then(|t| t.provider_transaction_id.clone())),
        provider_snapshot: provider.and_then(|p| serde_json::to_value(p).ok()),
        local_amount,
        provider_amount,
        difference: local_amount.unwrap_or(Decimal::ZERO) - provider_amount.unwrap_or(Decimal::ZERO),
        status,
        description,
    }
}

/// Why a run stopped before its record was finalized.
enum RunFailure {
    History(String),
    Storage(PaymentError),
}

impl From<DatabaseError> for RunFailure {
    fn from(e: DatabaseError) -> Self {
        RunFailure::Storage(e.into())
    }
}

/// A finished run: the persisted record and its items.
#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationReport {
    pub record: ReconciliationRecord,
    pub items: Vec<ReconciliationItem>,
    pub has_discrepancies: bool,
}

pub struct ReconciliationEngine {
    registry: Arc<ProviderRegistry>,
    transactions: Arc<dyn TransactionRepository>,
    records: Arc<dyn ReconciliationRepository>,
    orchestrator: Arc<PaymentOrchestrator>,
    page_size: u32,
}

impl ReconciliationEngine {
    pub fn new(
        orchestrator: Arc<PaymentOrchestrator>,
        records: Arc<dyn ReconciliationRepository>,
        page_size: u32,
    ) -> Self {
        Self {
            registry: orchestrator.registry().clone(),
            transactions: orchestrator.transactions().clone(),
            records,
            orchestrator,
            page_size: page_size.max(1),
        }
    }

    /// Reconciles one provider over `[from, to)`.
    ///
    /// A history fetch failure marks the record failed without items and
    /// returns `ReconciliationAborted`. A storage failure after the record was
    /// created also marks it failed, and returns the storage error.
    pub async fn auto_reconcile(
        &self,
        ctx: &RequestContext,
        provider_code: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> PaymentResult<ReconciliationReport> {
        if from >= to {
            return Err(PaymentError::validation(
                "reconciliation period must not be empty",
                "from",
            ));
        }
        let config = self.registry.provider_config(provider_code)?;
        let adapter = self.registry.resolve(&config.code)?;

        let mut record =
            ReconciliationRecord::start(&config.code, from, to, ctx.actor(), ctx.now());
        self.records.create_record(&record).await?;
        info!(
            provider = %config.code,
            record_id = %record.id,
            from = %from,
            to = %to,
            "reconciliation started"
        );

        let outcome = match self.run(ctx, adapter.as_ref(), &mut record).await {
            Ok(outcome) => outcome,
            Err(RunFailure::History(reason)) => {
                return Err(self.abort(ctx, record, reason).await);
            }
            Err(RunFailure::Storage(e)) => {
                self.abort(ctx, record, e.to_string()).await;
                return Err(e);
            }
        };
        let has_discrepancies = outcome.has_discrepancies();

        // The record is final; flags below can be re-applied by another run.
        let now = record.completed_at.unwrap_or_else(|| ctx.now());
        for id in &outcome.matched_transaction_ids {
            self.transactions.set_reconciled(*id, true, Some(now)).await?;
        }

        if outcome.unknown_status_count > 0 {
            warn!(
                provider = %config.code,
                record_id = %record.id,
                rows = outcome.unknown_status_count,
                "provider history contains unrecognised statuses"
            );
        }
        if has_discrepancies {
            warn!(
                provider = %config.code,
                record_id = %record.id,
                unmatched_local = record.unmatched_local_count,
                unmatched_provider = record.unmatched_provider_count,
                duplicates = record.duplicate_count,
                difference = %record.difference_amount,
                "reconciliation found discrepancies"
            );
        } else {
            info!(
                provider = %config.code,
                record_id = %record.id,
                matched = record.matched_count,
                "reconciliation clean"
            );
        }

        Ok(ReconciliationReport {
            record,
            items: outcome.items,
            has_discrepancies,
        })
    }

    /// Fetches history, matches and finalizes `record`.
    async fn run(
        &self,
        ctx: &RequestContext,
        adapter: &dyn MobileMoneyProvider,
        record: &mut ReconciliationRecord,
    ) -> Result<MatchOutcome, RunFailure> {
        let (from, to) = (record.period_start, record.period_end);
        let mut history = Vec::new();
        let mut offset = 0u32;
        for _ in 0..MAX_PAGES {
            let query = HistoryQuery {
                from,
                to,
                limit: self.page_size,
                offset,
            };
            let failure = match adapter.get_transaction_history(ctx, &query).await {
                Ok(ProviderOutcome::Success(page)) => {
                    let fetched = page.transactions.len() as u32;
                    history.extend(page.transactions);
                    if !page.has_more || fetched == 0 {
                        break;
                    }
                    offset += fetched;
                    continue;
                }
                Ok(ProviderOutcome::Failure(failure)) => failure.reason(),
                Err(e) => e.to_string(),
            };
            return Err(RunFailure::History(failure));
        }

        let local = self
            .transactions
            .find_completed_in_range(&record.provider_code, from, to)
            .await?;
        let outcome = match_transactions(record.id, &local, &history);

        record.status = if outcome.has_discrepancies() {
            ReconciliationStatus::Discrepancies
        } else {
            ReconciliationStatus::Reconciled
        };
        record.local_count = outcome.local_count;
        record.provider_count = outcome.provider_count;
        record.matched_count = outcome.matched_count;
        record.unmatched_local_count = outcome.unmatched_local_count;
        record.unmatched_provider_count = outcome.unmatched_provider_count;
        record.duplicate_count = outcome.duplicate_count;
        record.local_amount = outcome.local_amount;
        record.provider_amount = outcome.provider_amount;
        record.matched_amount = outcome.matched_amount;
        record.difference_amount = outcome.difference_amount;
        record.completed_at = Some(ctx.now());

        self.records.finalize(record, &outcome.items).await?;
        Ok(outcome)
    }

    async fn abort(
        &self,
        ctx: &RequestContext,
        mut record: ReconciliationRecord,
        reason: String,
    ) -> PaymentError {
        error!(
            provider = %record.provider_code,
            record_id = %record.id,
            reason = %reason,
            "reconciliation aborted"
        );
        record.status = ReconciliationStatus::Failed;
        record.failure_reason = Some(reason.clone());
        record.completed_at = Some(ctx.now());
        if let Err(e) = self.records.finalize(&record, &[]).await {
            error!(record_id = %record.id, error = %e, "failed to mark reconciliation as failed");
        }
        PaymentError::ReconciliationAborted {
            message: format!("{}: {}", record.provider_code, reason),
        }
    }

    pub async fn find_report(&self, record_id: Uuid) -> PaymentResult<ReconciliationReport> {
        let record = self
            .records
            .find_record(record_id)
            .await?
            .ok_or_else(|| PaymentError::not_found(format!("reconciliation record {}", record_id)))?;
        let items = self.records.items_for(record_id).await?;
        Ok(ReconciliationReport {
            has_discrepancies: record.status == ReconciliationStatus::Discrepancies,
            record,
            items,
        })
    }

    pub async fn recent_runs(
        &self,
        provider_code: &str,
        limit: i64,
    ) -> PaymentResult<Vec<ReconciliationRecord>> {
        Ok(self.records.list_records(provider_code, limit).await?)
    }

    // =========================================================================
    // Manual overrides
    // =========================================================================

    /// Admin correction: flags a completed transaction as reconciled.
    pub async fn mark_reconciled(
        &self,
        ctx: &RequestContext,
        transaction_id: Uuid,
        note: Option<String>,
    ) -> PaymentResult<Transaction> {
        let transaction = self.orchestrator.find_transaction(transaction_id).await?;
        if transaction.status != TransactionStatus::Completed {
            return Err(PaymentError::validation(
                format!("cannot reconcile a {} transaction", transaction.status),
                "transaction_id",
            ));
        }
        self.set_flag(ctx, transaction, true, note).await
    }

    pub async fn mark_unreconciled(
        &self,
        ctx: &RequestContext,
        transaction_id: Uuid,
        note: Option<String>,
    ) -> PaymentResult<Transaction> {
        let transaction = self.orchestrator.find_transaction(transaction_id).await?;
        self.set_flag(ctx, transaction, false, note).await
    }

    /// Re-runs the provider status check and records who asked for it.
    pub async fn recheck_status(
        &self,
        ctx: &RequestContext,
        transaction_id: Uuid,
    ) -> PaymentResult<Transaction> {
        let before = self.orchestrator.find_transaction(transaction_id).await?;
        let after = self.orchestrator.check_status(ctx, transaction_id).await?;
        self.orchestrator
            .audit()
            .record(
                ctx,
                &after,
                "recheck_status",
                Some(before.status),
                None,
                NotificationType::ManualOverride,
            )
            .await?;
        Ok(after)
    }

    async fn set_flag(
        &self,
        ctx: &RequestContext,
        mut transaction: Transaction,
        reconciled: bool,
        note: Option<String>,
    ) -> PaymentResult<Transaction> {
        let now = ctx.now();
        self.transactions
            .set_reconciled(transaction.id, reconciled, Some(now))
            .await?;
        transaction.is_reconciled = reconciled;
        transaction.reconciled_at = reconciled.then_some(now);

        let action = if reconciled {
            "mark_reconciled"
        } else {
            "mark_unreconciled"
        };
        info!(
            transaction_number = %transaction.transaction_number,
            actor = %ctx.actor(),
            action,
            "manual reconciliation override"
        );
        self.orchestrator
            .audit()
            .record(
                ctx,
                &transaction,
                action,
                Some(transaction.status),
                note,
                NotificationType::ManualOverride,
            )
            .await?;
        Ok(transaction)
    }
}
