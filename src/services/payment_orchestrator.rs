//! Transaction orchestrator
//!
//! Owns the transaction lifecycle: validation, persistence, adapter calls and
//! every status transition. Adapter results, status checks and webhooks all
//! converge on [`PaymentOrchestrator::ingest_status_report`] so that the
//! forward-only state machine and its side effects hold regardless of source.

use crate::context::RequestContext;
use crate::database::provider_config_repository::ProviderConfig;
use crate::database::transaction_repository::{
    generate_transaction_number, AuditEntry, Transaction, TransactionRepository, TransactionStatus,
    INVOICE_APPLIED, SETTLEMENT_PENDING,
};
use crate::logging::mask_phone_number;
use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::phone;
use crate::payments::provider::MobileMoneyProvider;
use crate::payments::registry::ProviderRegistry;
use crate::payments::types::{
    CanonicalStatus, PaymentOutcome, PaymentRequest, ProviderFailure, ProviderOutcome,
    RefundOutcome, RefundRequest, StatusReport, TransactionType,
};
use crate::services::audit::AuditTrail;
use crate::services::ledger::{build_postings, InvoiceStatus, InvoiceStore, LedgerPoster};
use crate::services::notification::{NotificationSink, NotificationType};
use chrono::{DateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as JsonValue};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

// ============================================================================
// Request / Result Types
// ============================================================================

/// Caller input for collections and payouts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransactionRequest {
    /// Explicit provider code; auto-detected from the phone number when absent.
    pub provider_code: Option<String>,
    pub amount: Decimal,
    pub phone_number: String,
    /// Defaults to the provider currency.
    pub currency: Option<String>,
    /// Caller's own reference, kept in metadata.
    pub external_id: Option<String>,
    pub invoice_id: Option<Uuid>,
    pub note: Option<String>,
    pub metadata: Option<JsonValue>,
}

/// Result of an orchestrated call that got as far as persisting a transaction.
///
/// Upstream failures do not surface as `Err`: the transaction ends `failed`
/// and the error is carried here.
#[derive(Debug, Clone)]
pub struct TransactionOutcome {
    pub transaction: Transaction,
    pub error: Option<PaymentError>,
}

impl TransactionOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Field changes applied together with an optional status transition.
#[derive(Debug, Clone, Default)]
struct StatusUpdate {
    status: Option<TransactionStatus>,
    provider_transaction_id: Option<String>,
    provider_response: Option<JsonValue>,
    failure_reason: Option<String>,
    metadata: Option<JsonValue>,
}

impl StatusUpdate {
    fn from_report(report: StatusReport) -> Self {
        Self {
            status: TransactionStatus::from_canonical(report.status),
            provider_transaction_id: report.provider_transaction_id,
            provider_response: Some(report.raw_response),
            failure_reason: report.failure_reason,
            metadata: None,
        }
    }

    fn failed(reason: String, provider_response: Option<JsonValue>) -> Self {
        Self {
            status: Some(TransactionStatus::Failed),
            provider_response,
            failure_reason: Some(reason),
            ..Self::default()
        }
    }
}

// ============================================================================
// Per-transaction locks
// ============================================================================

/// One async mutex per transaction id, dropped once nobody holds it.
#[derive(Default)]
struct TransactionLocks {
    locks: Mutex<HashMap<Uuid, Weak<tokio::sync::Mutex<()>>>>,
}

impl TransactionLocks {
    async fn acquire(&self, id: Uuid) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            match locks.get(&id).and_then(Weak::upgrade) {
                Some(lock) => lock,
                None => {
                    locks.retain(|_, weak| weak.strong_count() > 0);
                    let lock = Arc::new(tokio::sync::Mutex::new(()));
                    locks.insert(id, Arc::downgrade(&lock));
                    lock
                }
            }
        };
        lock.lock_owned().await
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

pub struct PaymentOrchestrator {
    registry: Arc<ProviderRegistry>,
    transactions: Arc<dyn TransactionRepository>,
    ledger: Arc<dyn LedgerPoster>,
    invoices: Arc<dyn InvoiceStore>,
    audit: AuditTrail,
    locks: TransactionLocks,
}

impl PaymentOrchestrator {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        transactions: Arc<dyn TransactionRepository>,
        ledger: Arc<dyn LedgerPoster>,
        invoices: Arc<dyn InvoiceStore>,
        notifications: NotificationSink,
    ) -> Self {
        let audit = AuditTrail::new(transactions.clone(), notifications);
        Self {
            registry,
            transactions,
            ledger,
            invoices,
            audit,
            locks: TransactionLocks::default(),
        }
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn transactions(&self) -> &Arc<dyn TransactionRepository> {
        &self.transactions
    }

    pub(crate) fn audit(&self) -> &AuditTrail {
        &self.audit
    }

    // =========================================================================
    // Initiation
    // =========================================================================

    /// Collects `amount` from the customer's wallet.
    pub async fn initiate_payment(
        &self,
        ctx: &RequestContext,
        request: TransactionRequest,
    ) -> PaymentResult<TransactionOutcome> {
        self.start(ctx, request, TransactionType::Collection).await
    }

    /// Sends `amount` to the recipient's wallet.
    pub async fn process_payout(
        &self,
        ctx: &RequestContext,
        request: TransactionRequest,
    ) -> PaymentResult<TransactionOutcome> {
        self.start(ctx, request, TransactionType::Disbursement).await
    }

    async fn start(
        &self,
        ctx: &RequestContext,
        request: TransactionRequest,
        transaction_type: TransactionType,
    ) -> PaymentResult<TransactionOutcome> {
        if request.amount <= Decimal::ZERO {
            return Err(PaymentError::validation(
                "amount must be greater than zero",
                "amount",
            ));
        }
        if request.phone_number.trim().is_empty() {
            return Err(PaymentError::validation(
                "phone number is required",
                "phone_number",
            ));
        }

        let adapter = self.resolve_adapter(request.provider_code.as_deref(), &request.phone_number)?;
        let config = self.registry.provider_config(adapter.code())?;
        config.check_amount(request.amount)?;

        let currency = match request.currency.as_deref() {
            Some(c) if !c.eq_ignore_ascii_case(&config.currency) => {
                return Err(PaymentError::validation(
                    format!("{} only supports {}", config.code, config.currency),
                    "currency",
                ))
            }
            _ => config.currency.clone(),
        };

        if !adapter.validate_phone_number(&request.phone_number) {
            return Err(PaymentError::validation(
                format!(
                    "phone number {} is not a valid {} number",
                    mask_phone_number(&request.phone_number),
                    config.code
                ),
                "phone_number",
            ));
        }
        let normalized_phone = phone::normalize(&request.phone_number).ok_or_else(|| {
            PaymentError::validation("phone number cannot be normalized", "phone_number")
        })?;

        self.check_daily_limit(ctx, &config, request.amount).await?;

        let now = ctx.now();
        let mut metadata = object_or_empty(request.metadata.clone());
        if let Some(external_id) = &request.external_id {
            metadata.insert("external_id".to_string(), json!(external_id));
        }
        if let Some(note) = &request.note {
            metadata.insert("note".to_string(), json!(note));
        }

        let transaction = Transaction {
            id: Uuid::new_v4(),
            transaction_number: generate_transaction_number(now),
            provider_code: config.code.clone(),
            provider_transaction_id: None,
            transaction_type,
            status: TransactionStatus::Pending,
            amount: request.amount,
            currency: currency.clone(),
            fee_amount: config.fees.compute(request.amount),
            phone_number: request.phone_number.clone(),
            normalized_phone,
            invoice_id: request.invoice_id,
            initiated_by: ctx.user_id,
            metadata: JsonValue::Object(metadata),
            provider_response: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            is_reconciled: false,
            reconciled_at: None,
        };

        let _guard = self.locks.acquire(transaction.id).await;
        self.transactions.insert(&transaction).await?;
        self.audit
            .record(
                ctx,
                &transaction,
                "created",
                None,
                None,
                NotificationType::StatusChanged,
            )
            .await?;

        info!(
            transaction_number = %transaction.transaction_number,
            provider = %transaction.provider_code,
            transaction_type = %transaction_type.as_str(),
            amount = %transaction.amount,
            fee = %transaction.fee_amount,
            phone = %mask_phone_number(&transaction.phone_number),
            "transaction created"
        );

        let provider_request = PaymentRequest {
            amount: transaction.amount,
            currency,
            phone_number: transaction.phone_number.clone(),
            external_id: transaction.transaction_number.clone(),
            note: request.note,
        };
        let result = match transaction_type {
            TransactionType::Disbursement => adapter.process_payout(ctx, &provider_request).await,
            _ => adapter.initiate_payment(ctx, &provider_request).await,
        };

        self.settle_initiation(ctx, &transaction, &config, result).await
    }

    async fn settle_initiation(
        &self,
        ctx: &RequestContext,
        transaction: &Transaction,
        config: &ProviderConfig,
        result: PaymentResult<PaymentOutcome>,
    ) -> PaymentResult<TransactionOutcome> {
        let (update, error) = match result {
            Ok(ProviderOutcome::Success(accepted)) => (
                StatusUpdate {
                    status: TransactionStatus::from_canonical(accepted.status),
                    provider_transaction_id: Some(accepted.provider_transaction_id),
                    provider_response: Some(accepted.raw_response),
                    ..StatusUpdate::default()
                },
                None,
            ),
            Ok(ProviderOutcome::Failure(failure)) => rejected(config, failure),
            Err(e) => {
                error!(
                    transaction_number = %transaction.transaction_number,
                    provider = %config.code,
                    error = %e,
                    "provider call failed"
                );
                (StatusUpdate::failed(e.to_string(), None), Some(e))
            }
        };
        self.finish(ctx, transaction, config, update, error, "initiation_result")
            .await
    }

    /// Applies the initiation result while the caller still holds the id lock.
    async fn finish(
        &self,
        ctx: &RequestContext,
        transaction: &Transaction,
        config: &ProviderConfig,
        update: StatusUpdate,
        error: Option<PaymentError>,
        action: &str,
    ) -> PaymentResult<TransactionOutcome> {
        match self.apply_locked(ctx, transaction.id, update, action).await {
            Ok(updated) => Ok(TransactionOutcome {
                transaction: updated,
                error,
            }),
            Err(apply_error) => {
                error!(
                    transaction_number = %transaction.transaction_number,
                    provider = %config.code,
                    error = %apply_error,
                    "failed to record initiation result"
                );
                let current = self
                    .transactions
                    .find_by_id(transaction.id)
                    .await?
                    .unwrap_or_else(|| transaction.clone());
                Ok(TransactionOutcome {
                    transaction: current,
                    error: Some(error.unwrap_or(apply_error)),
                })
            }
        }
    }

    // =========================================================================
    // Refunds
    // =========================================================================

    /// Refunds part or all of a completed collection.
    pub async fn process_refund(
        &self,
        ctx: &RequestContext,
        original_transaction_id: Uuid,
        amount: Decimal,
        reason: Option<String>,
    ) -> PaymentResult<TransactionOutcome> {
        let original = self.find_transaction(original_transaction_id).await?;
        if original.transaction_type != TransactionType::Collection {
            return Err(PaymentError::validation(
                "only collections can be refunded",
                "original_transaction_id",
            ));
        }
        if original.status != TransactionStatus::Completed {
            return Err(PaymentError::validation(
                format!("cannot refund a {} transaction", original.status),
                "original_transaction_id",
            ));
        }
        let Some(original_reference) = original.provider_transaction_id.clone() else {
            return Err(PaymentError::validation(
                "original transaction has no provider reference",
                "original_transaction_id",
            ));
        };
        if amount <= Decimal::ZERO {
            return Err(PaymentError::validation(
                "amount must be greater than zero",
                "amount",
            ));
        }
        if amount > original.amount {
            return Err(PaymentError::validation(
                format!("refund {} exceeds original amount {}", amount, original.amount),
                "amount",
            ));
        }

        let adapter = self.registry.resolve(&original.provider_code)?;
        let config = self.registry.provider_config(&original.provider_code)?;

        let now = ctx.now();
        let mut metadata = Map::new();
        metadata.insert("refund_of".to_string(), json!(original.id));
        metadata.insert(
            "refund_of_number".to_string(),
            json!(original.transaction_number),
        );
        if let Some(reason) = &reason {
            metadata.insert("reason".to_string(), json!(reason));
        }

        let refund = Transaction {
            id: Uuid::new_v4(),
            transaction_number: generate_transaction_number(now),
            provider_code: original.provider_code.clone(),
            provider_transaction_id: None,
            transaction_type: TransactionType::Refund,
            status: TransactionStatus::Pending,
            amount,
            currency: original.currency.clone(),
            fee_amount: Decimal::ZERO,
            phone_number: original.phone_number.clone(),
            normalized_phone: original.normalized_phone.clone(),
            invoice_id: None,
            initiated_by: ctx.user_id,
            metadata: JsonValue::Object(metadata),
            provider_response: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            is_reconciled: false,
            reconciled_at: None,
        };

        let _guard = self.locks.acquire(refund.id).await;
        self.transactions.insert(&refund).await?;
        self.audit
            .record(
                ctx,
                &refund,
                "created",
                None,
                reason.clone(),
                NotificationType::StatusChanged,
            )
            .await?;

        info!(
            transaction_number = %refund.transaction_number,
            refund_of = %original.transaction_number,
            provider = %refund.provider_code,
            amount = %amount,
            "refund created"
        );

        let request = RefundRequest {
            original_provider_transaction_id: original_reference,
            amount,
            currency: refund.currency.clone(),
            phone_number: refund.phone_number.clone(),
            external_id: refund.transaction_number.clone(),
            reason,
        };
        let result: PaymentResult<RefundOutcome> = adapter.process_refund(ctx, &request).await;

        let (update, error) = match result {
            Ok(ProviderOutcome::Success(accepted)) => {
                let mut metadata = refund.metadata.clone();
                if let Some(obj) = metadata.as_object_mut() {
                    obj.insert("refund_mode".to_string(), json!(accepted.mode.as_str()));
                }
                (
                    StatusUpdate {
                        status: TransactionStatus::from_canonical(accepted.status),
                        provider_transaction_id: Some(accepted.provider_transaction_id),
                        provider_response: Some(accepted.raw_response),
                        metadata: Some(metadata),
                        ..StatusUpdate::default()
                    },
                    None,
                )
            }
            Ok(ProviderOutcome::Failure(failure)) => rejected(&config, failure),
            Err(e) => {
                error!(
                    transaction_number = %refund.transaction_number,
                    provider = %config.code,
                    error = %e,
                    "refund call failed"
                );
                (StatusUpdate::failed(e.to_string(), None), Some(e))
            }
        };
        self.finish(ctx, &refund, &config, update, error, "refund_result")
            .await
    }

    // =========================================================================
    // Status checks
    // =========================================================================

    /// Asks the provider for the current status and applies it.
    ///
    /// Terminal transactions are returned as stored without a provider call,
    /// after finishing any completion side effects still outstanding.
    /// A provider-side failure to answer leaves the transaction untouched.
    pub async fn check_status(
        &self,
        ctx: &RequestContext,
        transaction_id: Uuid,
    ) -> PaymentResult<Transaction> {
        let transaction = self.find_transaction(transaction_id).await?;
        if transaction.status.is_terminal() {
            if transaction.settlement_pending() {
                return self.resume_settlement(ctx, transaction_id).await;
            }
            return Ok(transaction);
        }
        let Some(reference) = transaction.provider_transaction_id.clone() else {
            warn!(
                transaction_number = %transaction.transaction_number,
                "status check skipped: no provider reference yet"
            );
            return Ok(transaction);
        };

        let adapter = self.registry.resolve(&transaction.provider_code)?;
        let outcome = adapter
            .check_payment_status(ctx, &reference, transaction.transaction_type)
            .await?;

        match outcome {
            ProviderOutcome::Success(report) => {
                self.ingest_status_report(ctx, transaction_id, report, "status_check")
                    .await
            }
            ProviderOutcome::Failure(failure) => {
                warn!(
                    transaction_number = %transaction.transaction_number,
                    provider = %transaction.provider_code,
                    reason = %failure.reason(),
                    "provider could not report status"
                );
                Err(PaymentError::ProviderRejected {
                    provider: transaction.provider_code,
                    message: failure.error_message,
                    provider_code: failure.error_code,
                })
            }
        }
    }

    /// The single status-transition path shared by status checks and webhooks.
    ///
    /// Serialized per transaction id. Reports that would move a transaction
    /// backwards, or touch a terminal one, are ignored.
    pub async fn ingest_status_report(
        &self,
        ctx: &RequestContext,
        transaction_id: Uuid,
        report: StatusReport,
        source: &str,
    ) -> PaymentResult<Transaction> {
        if report.status == CanonicalStatus::Unknown {
            debug!(
                transaction_id = %transaction_id,
                native_status = %report.native_status,
                "unmapped provider status"
            );
        }
        let _guard = self.locks.acquire(transaction_id).await;
        self.apply_locked(ctx, transaction_id, StatusUpdate::from_report(report), source)
            .await
    }

    /// Retries the completion side effects of a transaction whose earlier
    /// attempt stopped part-way. Does not call the provider.
    pub async fn resume_settlement(
        &self,
        ctx: &RequestContext,
        transaction_id: Uuid,
    ) -> PaymentResult<Transaction> {
        let _guard = self.locks.acquire(transaction_id).await;
        self.apply_locked(ctx, transaction_id, StatusUpdate::default(), "settlement_retry")
            .await
    }

    async fn apply_locked(
        &self,
        ctx: &RequestContext,
        transaction_id: Uuid,
        update: StatusUpdate,
        action: &str,
    ) -> PaymentResult<Transaction> {
        let current = self.find_transaction(transaction_id).await?;
        if current.status.is_terminal() {
            if let Some(target) = update.status.filter(|s| *s != current.status) {
                debug!(
                    transaction_number = %current.transaction_number,
                    from = %current.status,
                    to = %target,
                    "ignoring transition out of terminal state"
                );
            }
            if current.settlement_pending() {
                info!(
                    transaction_number = %current.transaction_number,
                    source = action,
                    "retrying completion side effects"
                );
                self.settle_completion(ctx, &current).await?;
                return self.find_transaction(transaction_id).await;
            }
            return Ok(current);
        }

        let transition = match update.status {
            Some(target) if target != current.status => {
                if current.status.can_transition_to(target) {
                    Some(target)
                } else {
                    debug!(
                        transaction_number = %current.transaction_number,
                        from = %current.status,
                        to = %target,
                        "ignoring backward transition"
                    );
                    None
                }
            }
            _ => None,
        };

        let mut next = current.clone();
        let mut changed = false;
        if next.provider_transaction_id.is_none() {
            if let Some(reference) = update.provider_transaction_id {
                next.provider_transaction_id = Some(reference);
                changed = true;
            }
        }
        if let Some(response) = update.provider_response {
            if next.provider_response.as_ref() != Some(&response) {
                next.provider_response = Some(response);
                changed = true;
            }
        }
        if let Some(metadata) = update.metadata {
            next.metadata = metadata;
            changed = true;
        }

        let now = ctx.now();
        if let Some(target) = transition {
            next.status = target;
            if target == TransactionStatus::Completed {
                next.completed_at = Some(now);
                next.set_metadata_flag(SETTLEMENT_PENDING, true);
            }
            if matches!(target, TransactionStatus::Failed | TransactionStatus::Cancelled) {
                next.failure_reason = update
                    .failure_reason
                    .or_else(|| Some(format!("provider reported {}", target)));
            }
            changed = true;
        }

        if !changed {
            return Ok(current);
        }
        next.updated_at = now;

        if !self.transactions.update(&next, current.status).await? {
            warn!(
                transaction_number = %current.transaction_number,
                "concurrent status update detected, keeping stored state"
            );
            return self.find_transaction(transaction_id).await;
        }

        if let Some(target) = transition {
            info!(
                transaction_number = %next.transaction_number,
                provider = %next.provider_code,
                from = %current.status,
                to = %target,
                source = action,
                "transaction status changed"
            );
            let note = next.failure_reason.clone();
            self.record_transition(ctx, &next, action, Some(current.status), note)
                .await;
            self.on_status_change(ctx, &next, current.status, target)
                .await?;
        }

        self.find_transaction(transaction_id).await
    }

    async fn on_status_change(
        &self,
        ctx: &RequestContext,
        transaction: &Transaction,
        old_status: TransactionStatus,
        new_status: TransactionStatus,
    ) -> PaymentResult<()> {
        match new_status {
            TransactionStatus::Completed => self.settle_completion(ctx, transaction).await?,
            TransactionStatus::Failed | TransactionStatus::Cancelled => {
                warn!(
                    transaction_number = %transaction.transaction_number,
                    provider = %transaction.provider_code,
                    from = %old_status,
                    reason = transaction.failure_reason.as_deref().unwrap_or(""),
                    "transaction did not complete"
                );
            }
            TransactionStatus::Pending | TransactionStatus::Processing => {}
        }
        Ok(())
    }

    /// Ledger postings, invoice credit and auto-reconciliation for a completed
    /// transaction. Steps already done are skipped, and the pending flag is
    /// cleared only once all of them succeed, so an interrupted attempt is
    /// finished by the next status check, webhook or poll.
    async fn settle_completion(
        &self,
        ctx: &RequestContext,
        transaction: &Transaction,
    ) -> PaymentResult<()> {
        let config = self.registry.provider_config(&transaction.provider_code)?;
        let mut settled = transaction.clone();

        if self.ledger.has_postings(transaction.id).await? {
            debug!(
                transaction_number = %transaction.transaction_number,
                "ledger already posted"
            );
        } else {
            let entries = build_postings(transaction, &config.accounts);
            self.ledger.post(&entries).await?;
        }

        if transaction.invoice_id.is_some() && !transaction.metadata_flag(INVOICE_APPLIED) {
            self.apply_to_invoice(transaction).await?;
            settled.set_metadata_flag(INVOICE_APPLIED, true);
            settled.updated_at = ctx.now();
            self.transactions
                .update(&settled, TransactionStatus::Completed)
                .await?;
        }

        if config.auto_reconcile && !settled.is_reconciled {
            let now = ctx.now();
            self.transactions
                .set_reconciled(settled.id, true, Some(now))
                .await?;
            settled.is_reconciled = true;
            settled.reconciled_at = Some(now);
            self.record_transition(ctx, &settled, "auto_reconciled", Some(settled.status), None)
                .await;
        }

        settled.set_metadata_flag(SETTLEMENT_PENDING, false);
        settled.updated_at = ctx.now();
        self.transactions
            .update(&settled, TransactionStatus::Completed)
            .await?;
        Ok(())
    }

    /// Audit write for a change that is already stored. A failure here is
    /// logged and does not undo or interrupt the transition.
    async fn record_transition(
        &self,
        ctx: &RequestContext,
        transaction: &Transaction,
        action: &str,
        from_status: Option<TransactionStatus>,
        note: Option<String>,
    ) {
        if let Err(e) = self
            .audit
            .record(
                ctx,
                transaction,
                action,
                from_status,
                note,
                NotificationType::StatusChanged,
            )
            .await
        {
            error!(
                transaction_number = %transaction.transaction_number,
                action,
                error = %e,
                "failed to write audit entry"
            );
        }
    }

    async fn apply_to_invoice(&self, transaction: &Transaction) -> PaymentResult<()> {
        let Some(invoice_id) = transaction.invoice_id else {
            return Ok(());
        };
        if transaction.transaction_type != TransactionType::Collection {
            return Ok(());
        }
        if self.invoices.find(invoice_id).await?.is_none() {
            warn!(
                transaction_number = %transaction.transaction_number,
                invoice_id = %invoice_id,
                "linked invoice not found"
            );
            return Ok(());
        }
        let invoice = self
            .invoices
            .increment_paid(invoice_id, transaction.amount)
            .await?;
        let status = InvoiceStatus::for_amounts(invoice.paid, invoice.total);
        self.invoices.update_status(invoice_id, status).await?;
        info!(
            invoice_id = %invoice_id,
            paid = %invoice.paid,
            total = %invoice.total,
            status = ?status,
            "invoice updated"
        );
        Ok(())
    }

    // =========================================================================
    // Lookups
    // =========================================================================

    pub async fn find_transaction(&self, id: Uuid) -> PaymentResult<Transaction> {
        self.transactions
            .find_by_id(id)
            .await?
            .ok_or_else(|| PaymentError::not_found(format!("transaction {}", id)))
    }

    pub async fn find_by_reference(
        &self,
        provider_code: &str,
        reference: &str,
    ) -> PaymentResult<Option<Transaction>> {
        if let Some(found) = self
            .transactions
            .find_by_provider_reference(provider_code, reference)
            .await?
        {
            return Ok(Some(found));
        }
        Ok(self
            .transactions
            .find_by_number(reference)
            .await?
            .filter(|t| t.provider_code == provider_code))
    }

    pub async fn audit_trail(&self, id: Uuid) -> PaymentResult<Vec<AuditEntry>> {
        self.find_transaction(id).await?;
        Ok(self.transactions.audit_trail(id).await?)
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn resolve_adapter(
        &self,
        provider_code: Option<&str>,
        phone_number: &str,
    ) -> PaymentResult<Arc<dyn MobileMoneyProvider>> {
        match provider_code {
            Some(code) => self.registry.resolve(code),
            None => self.registry.resolve_by_phone_number(phone_number).ok_or_else(|| {
                PaymentError::validation(
                    format!(
                        "no active provider accepts phone number {}",
                        mask_phone_number(phone_number)
                    ),
                    "phone_number",
                )
            }),
        }
    }

    async fn check_daily_limit(
        &self,
        ctx: &RequestContext,
        config: &ProviderConfig,
        amount: Decimal,
    ) -> PaymentResult<()> {
        let Some(limit) = config.daily_limit else {
            return Ok(());
        };
        let since = start_of_day(ctx.now());
        let used = self.transactions.sum_amount_since(&config.code, since).await?;
        if used + amount > limit {
            return Err(PaymentError::LimitExceeded {
                message: format!(
                    "daily limit {} for {} exceeded: {} already used",
                    limit, config.code, used
                ),
            });
        }
        Ok(())
    }
}

fn rejected(
    config: &ProviderConfig,
    failure: ProviderFailure,
) -> (StatusUpdate, Option<PaymentError>) {
    warn!(
        provider = %config.code,
        reason = %failure.reason(),
        "provider rejected request"
    );
    let error = PaymentError::ProviderRejected {
        provider: config.code.clone(),
        message: failure.error_message.clone(),
        provider_code: failure.error_code.clone(),
    };
    (
        StatusUpdate::failed(failure.reason(), Some(failure.raw_response)),
        Some(error),
    )
}

fn object_or_empty(value: Option<JsonValue>) -> Map<String, JsonValue> {
    match value {
        Some(JsonValue::Object(map)) => map,
        _ => Map::new(),
    }
}

pub(crate) fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive().and_time(NaiveTime::MIN).and_utc()
}
