#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use momo_core::app::{Backends, Services};
use momo_core::context::{FixedClock, RequestContext};
use momo_core::database::error::DatabaseError;
use momo_core::database::provider_config_repository::{parse_configs, ProviderConfig};
use momo_core::database::reconciliation_repository::{
    InMemoryReconciliationRepository, ReconciliationItem, ReconciliationRecord,
    ReconciliationRepository, ReconciliationStatus,
};
use momo_core::database::transaction_repository::InMemoryTransactionRepository;
use momo_core::payments::error::{PaymentError, PaymentResult};
use momo_core::payments::phone;
use momo_core::payments::provider::MobileMoneyProvider;
use momo_core::payments::registry::ProviderRegistry;
use momo_core::payments::signature::{sign, verify_hmac_sha256, SignatureEncoding};
use momo_core::payments::token_cache::TokenCache;
use momo_core::payments::types::{
    lookup_status, AccountBalance, BalanceOutcome, CanonicalStatus, HistoryOutcome, HistoryQuery,
    PaymentAccepted, PaymentOutcome, PaymentRequest, ProviderFailure, ProviderOutcome,
    ProviderTransaction, RefundAccepted, RefundMode, RefundOutcome, RefundRequest, StatusOutcome,
    StatusReport, TransactionHistory, TransactionType,
};
use momo_core::services::ledger::{
    InMemoryInvoiceStore, InMemoryLedger, Invoice, InvoiceStatus, InvoiceStore, LedgerEntry,
    LedgerPoster,
};
use momo_core::services::notification::NotificationSink;
use rust_decimal::Decimal;
use serde_json::{json, Value as JsonValue};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

pub const WEBHOOK_SECRET: &str = "stub-webhook-secret";
pub const SIGNATURE_HEADER: &str = "x-stub-signature";

const STUB_STATUSES: &[(&str, CanonicalStatus)] = &[
    ("PENDING", CanonicalStatus::Pending),
    ("SUCCESSFUL", CanonicalStatus::Completed),
    ("FAILED", CanonicalStatus::Failed),
    ("CANCELLED", CanonicalStatus::Cancelled),
];

/// How the stub answers initiation, payout and refund calls.
#[derive(Debug, Clone)]
pub enum Behavior {
    Accept,
    Reject { message: String, code: String },
    Unavailable,
}

/// Scriptable in-process adapter. Accepts any well-formed Zambian number.
pub struct StubProvider {
    code: String,
    currency: String,
    behavior: Mutex<Behavior>,
    status: Mutex<Option<CanonicalStatus>>,
    history: Mutex<Result<Vec<ProviderTransaction>, String>>,
    refund_mode: RefundMode,
    next_reference: AtomicUsize,
    pub initiate_calls: AtomicUsize,
    pub status_calls: AtomicUsize,
    pub history_calls: AtomicUsize,
}

impl StubProvider {
    pub fn new(code: &str, refund_mode: RefundMode) -> Self {
        Self {
            code: code.to_string(),
            currency: "ZMW".to_string(),
            behavior: Mutex::new(Behavior::Accept),
            status: Mutex::new(Some(CanonicalStatus::Pending)),
            history: Mutex::new(Ok(Vec::new())),
            refund_mode,
            next_reference: AtomicUsize::new(1),
            initiate_calls: AtomicUsize::new(0),
            status_calls: AtomicUsize::new(0),
            history_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    /// `None` makes status checks fail at the provider.
    pub fn set_status(&self, status: Option<CanonicalStatus>) {
        *self.status.lock().unwrap() = status;
    }

    pub fn set_history(&self, rows: Vec<ProviderTransaction>) {
        *self.history.lock().unwrap() = Ok(rows);
    }

    pub fn fail_history(&self, message: &str) {
        *self.history.lock().unwrap() = Err(message.to_string());
    }

    fn next_reference(&self) -> String {
        format!("P{}", self.next_reference.fetch_add(1, Ordering::SeqCst))
    }

    fn answer(&self) -> PaymentResult<PaymentOutcome> {
        self.initiate_calls.fetch_add(1, Ordering::SeqCst);
        match self.behavior.lock().unwrap().clone() {
            Behavior::Accept => Ok(ProviderOutcome::Success(PaymentAccepted {
                provider_transaction_id: self.next_reference(),
                status: CanonicalStatus::Pending,
                raw_response: json!({"status": "PENDING"}),
            })),
            Behavior::Reject { message, code } => Ok(ProviderOutcome::Failure(
                ProviderFailure::new(message, Some(code)).with_raw(json!({"status": "FAILED"})),
            )),
            Behavior::Unavailable => Err(PaymentError::ProviderUnavailable {
                provider: self.code.clone(),
                message: "connection refused".to_string(),
            }),
        }
    }
}

#[async_trait]
impl MobileMoneyProvider for StubProvider {
    fn code(&self) -> &str {
        &self.code
    }

    fn currency(&self) -> &str {
        &self.currency
    }

    async fn initiate_payment(
        &self,
        _ctx: &RequestContext,
        request: &PaymentRequest,
    ) -> PaymentResult<PaymentOutcome> {
        request.validate()?;
        self.answer()
    }

    async fn check_payment_status(
        &self,
        _ctx: &RequestContext,
        provider_transaction_id: &str,
        _transaction_type: TransactionType,
    ) -> PaymentResult<StatusOutcome> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let status = *self.status.lock().unwrap();
        Ok(match status {
            Some(status) => ProviderOutcome::Success(StatusReport {
                provider_transaction_id: Some(provider_transaction_id.to_string()),
                external_id: None,
                status,
                native_status: status.as_str().to_uppercase(),
                amount: None,
                failure_reason: None,
                raw_response: json!({"status": status.as_str()}),
            }),
            None => ProviderOutcome::Failure(ProviderFailure::new(
                "status lookup unavailable",
                Some("503".to_string()),
            )),
        })
    }

    async fn process_payout(
        &self,
        _ctx: &RequestContext,
        request: &PaymentRequest,
    ) -> PaymentResult<PaymentOutcome> {
        request.validate()?;
        self.answer()
    }

    async fn process_refund(
        &self,
        _ctx: &RequestContext,
        request: &RefundRequest,
    ) -> PaymentResult<RefundOutcome> {
        request.validate()?;
        Ok(match self.answer()? {
            ProviderOutcome::Success(accepted) => ProviderOutcome::Success(RefundAccepted {
                provider_transaction_id: accepted.provider_transaction_id,
                status: accepted.status,
                mode: self.refund_mode,
                raw_response: accepted.raw_response,
            }),
            ProviderOutcome::Failure(failure) => ProviderOutcome::Failure(failure),
        })
    }

    fn verify_webhook_signature(&self, payload: &[u8], signature: &str, secret: &str) -> bool {
        verify_hmac_sha256(payload, signature, secret, SignatureEncoding::Hex)
    }

    fn webhook_signature_header(&self) -> &'static str {
        SIGNATURE_HEADER
    }

    fn process_webhook(&self, payload: &[u8]) -> PaymentResult<StatusReport> {
        let body: JsonValue = serde_json::from_slice(payload)
            .map_err(|e| PaymentError::validation(e.to_string(), "payload"))?;
        let native = body["status"].as_str().unwrap_or_default().to_string();
        Ok(StatusReport {
            provider_transaction_id: body["reference"].as_str().map(str::to_string),
            external_id: body["external_id"].as_str().map(str::to_string),
            status: lookup_status(STUB_STATUSES, &native),
            native_status: native,
            amount: None,
            failure_reason: body["reason"].as_str().map(str::to_string),
            raw_response: body,
        })
    }

    async fn get_account_balance(&self, _ctx: &RequestContext) -> PaymentResult<BalanceOutcome> {
        Ok(ProviderOutcome::Success(AccountBalance {
            available: Decimal::ZERO,
            currency: self.currency.clone(),
            raw_response: json!({}),
        }))
    }

    async fn get_transaction_history(
        &self,
        _ctx: &RequestContext,
        query: &HistoryQuery,
    ) -> PaymentResult<HistoryOutcome> {
        self.history_calls.fetch_add(1, Ordering::SeqCst);
        let rows = match &*self.history.lock().unwrap() {
            Ok(rows) => rows.clone(),
            Err(message) => {
                return Ok(ProviderOutcome::Failure(ProviderFailure::new(
                    message.clone(),
                    None,
                )))
            }
        };
        let start = (query.offset as usize).min(rows.len());
        let end = (start + query.limit as usize).min(rows.len());
        Ok(ProviderOutcome::Success(TransactionHistory {
            transactions: rows[start..end].to_vec(),
            has_more: end < rows.len(),
        }))
    }

    fn validate_phone_number(&self, phone_number: &str) -> bool {
        phone::normalize(phone_number).is_some()
    }

    fn format_phone_number(&self, phone_number: &str) -> Option<String> {
        phone::normalize(phone_number)
    }
}

pub fn provider_row(code: &str) -> JsonValue {
    json!({
        "code": code,
        "name": code.to_uppercase(),
        "currency": "ZMW",
        "sandbox_url": "http://127.0.0.1:9",
        "production_url": "http://127.0.0.1:9",
        "min_amount": 1,
        "max_amount": 50000,
        "fees": {"fixed": "0.50", "percentage": "1.5"},
        "accounts": {"cash": "1010", "fee": "5020", "receivable": "1200"},
        "credentials": {"webhook_secret": WEBHOOK_SECRET},
        "timeout_secs": 1,
        "max_retries": 0
    })
}

pub fn config_from(row: JsonValue) -> ProviderConfig {
    parse_configs(&json!([row]).to_string()).unwrap().remove(0)
}

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 10, 9, 0, 0).unwrap()
}

pub fn history_row(id: &str, amount: Decimal, status: CanonicalStatus) -> ProviderTransaction {
    ProviderTransaction {
        id: id.to_string(),
        external_id: None,
        amount,
        currency: "ZMW".to_string(),
        status,
        phone_number: None,
        occurred_at: None,
        raw: json!({"id": id}),
    }
}

pub fn webhook_body(reference: &str, status: &str) -> Vec<u8> {
    json!({"reference": reference, "status": status})
        .to_string()
        .into_bytes()
}

pub fn signed(body: &[u8]) -> String {
    sign(body, WEBHOOK_SECRET, SignatureEncoding::Hex)
}

/// Orchestrator, engine and webhook processor over in-memory stores, with a
/// stub adapter registered as "mtn".
pub struct Harness {
    pub clock: Arc<FixedClock>,
    pub stub: Arc<StubProvider>,
    pub ledger: Arc<InMemoryLedger>,
    pub invoices: Arc<InMemoryInvoiceStore>,
    pub transactions: Arc<InMemoryTransactionRepository>,
    pub records: Arc<InMemoryReconciliationRepository>,
    pub services: Services,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_row(provider_row("mtn"), RefundMode::Native)
    }

    pub fn with_row(row: JsonValue, refund_mode: RefundMode) -> Self {
        Self::build(row, refund_mode, 1000)
    }

    pub fn build(row: JsonValue, refund_mode: RefundMode, page_size: u32) -> Self {
        Self::build_with(row, refund_mode, page_size, |_| {})
    }

    /// Like `build`, but lets a test wrap or swap backends before assembly.
    /// The in-memory stores on the harness stay the ones underneath.
    pub fn build_with(
        row: JsonValue,
        refund_mode: RefundMode,
        page_size: u32,
        customize: impl FnOnce(&mut Backends),
    ) -> Self {
        let clock = Arc::new(FixedClock::new(start_time()));
        let config = config_from(row);
        let stub = Arc::new(StubProvider::new(&config.code, refund_mode));

        let registry = Arc::new(ProviderRegistry::new(Arc::new(TokenCache::new(60))));
        registry.register_instance(&config.code, stub.clone());
        registry.upsert_provider(config);

        let ledger = Arc::new(InMemoryLedger::new());
        let invoices = Arc::new(InMemoryInvoiceStore::new());
        let transactions = Arc::new(InMemoryTransactionRepository::new());
        let records = Arc::new(InMemoryReconciliationRepository::new());

        let mut backends = Backends {
            transactions: transactions.clone(),
            records: records.clone(),
            ledger: ledger.clone(),
            invoices: invoices.clone(),
        };
        customize(&mut backends);
        let services = Services::assemble(
            registry,
            backends,
            NotificationSink::disabled(),
            clock.clone(),
            page_size,
        );

        Self {
            clock,
            stub,
            ledger,
            invoices,
            transactions,
            records,
            services,
        }
    }

    pub fn ctx(&self) -> RequestContext {
        RequestContext::new(self.clock.clone())
    }
}

/// Fails the first `post`, then delegates.
pub struct LedgerFailingOnce {
    inner: Arc<dyn LedgerPoster>,
    failed: AtomicBool,
}

impl LedgerFailingOnce {
    pub fn wrap(inner: Arc<dyn LedgerPoster>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            failed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl LedgerPoster for LedgerFailingOnce {
    async fn has_postings(&self, reference_id: Uuid) -> PaymentResult<bool> {
        self.inner.has_postings(reference_id).await
    }

    async fn post(&self, entries: &[LedgerEntry]) -> PaymentResult<()> {
        if !self.failed.swap(true, Ordering::SeqCst) {
            return Err(PaymentError::Persistence {
                message: "ledger down".to_string(),
            });
        }
        self.inner.post(entries).await
    }
}

/// Fails the first `increment_paid`, then delegates.
pub struct InvoicesFailingOnce {
    inner: Arc<dyn InvoiceStore>,
    failed: AtomicBool,
}

impl InvoicesFailingOnce {
    pub fn wrap(inner: Arc<dyn InvoiceStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            failed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl InvoiceStore for InvoicesFailingOnce {
    async fn find(&self, id: Uuid) -> PaymentResult<Option<Invoice>> {
        self.inner.find(id).await
    }

    async fn increment_paid(&self, id: Uuid, amount: Decimal) -> PaymentResult<Invoice> {
        if !self.failed.swap(true, Ordering::SeqCst) {
            return Err(PaymentError::Persistence {
                message: "invoice store down".to_string(),
            });
        }
        self.inner.increment_paid(id, amount).await
    }

    async fn update_status(&self, id: Uuid, status: InvoiceStatus) -> PaymentResult<()> {
        self.inner.update_status(id, status).await
    }
}

/// Rejects every `finalize` except the one marking a run failed.
pub struct RecordsRejectingResults {
    inner: Arc<dyn ReconciliationRepository>,
}

impl RecordsRejectingResults {
    pub fn wrap(inner: Arc<dyn ReconciliationRepository>) -> Arc<Self> {
        Arc::new(Self { inner })
    }
}

#[async_trait]
impl ReconciliationRepository for RecordsRejectingResults {
    async fn create_record(&self, record: &ReconciliationRecord) -> Result<(), DatabaseError> {
        self.inner.create_record(record).await
    }

    async fn finalize(
        &self,
        record: &ReconciliationRecord,
        items: &[ReconciliationItem],
    ) -> Result<(), DatabaseError> {
        if record.status != ReconciliationStatus::Failed {
            return Err(DatabaseError::unknown("write failed"));
        }
        self.inner.finalize(record, items).await
    }

    async fn find_record(&self, id: Uuid) -> Result<Option<ReconciliationRecord>, DatabaseError> {
        self.inner.find_record(id).await
    }

    async fn items_for(&self, record_id: Uuid) -> Result<Vec<ReconciliationItem>, DatabaseError> {
        self.inner.items_for(record_id).await
    }

    async fn list_records(
        &self,
        provider_code: &str,
        limit: i64,
    ) -> Result<Vec<ReconciliationRecord>, DatabaseError> {
        self.inner.list_records(provider_code, limit).await
    }
}
