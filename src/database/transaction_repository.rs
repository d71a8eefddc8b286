use crate::database::error::DatabaseError;
use crate::payments::types::{CanonicalStatus, TransactionType};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, RwLock};
use uuid::Uuid;

#[cfg(feature = "database")]
use sqlx::{FromRow, PgPool};

/// Lifecycle: `pending → [processing] → completed | failed | cancelled`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Processing => "processing",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Failed => "failed",
            TransactionStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(TransactionStatus::Pending),
            "processing" => Some(TransactionStatus::Processing),
            "completed" => Some(TransactionStatus::Completed),
            "failed" => Some(TransactionStatus::Failed),
            "cancelled" => Some(TransactionStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Completed | TransactionStatus::Failed | TransactionStatus::Cancelled
        )
    }

    /// Forward-only transitions. Staying in the same state is not a transition.
    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        use TransactionStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Completed)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Cancelled)
        )
    }

    /// `Unknown` carries no information and maps to nothing.
    pub fn from_canonical(status: CanonicalStatus) -> Option<Self> {
        match status {
            CanonicalStatus::Pending => Some(TransactionStatus::Pending),
            CanonicalStatus::Completed => Some(TransactionStatus::Completed),
            CanonicalStatus::Failed => Some(TransactionStatus::Failed),
            CanonicalStatus::Cancelled => Some(TransactionStatus::Cancelled),
            CanonicalStatus::Unknown => None,
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Transaction {
    pub id: Uuid,
    /// Immutable; doubles as the provider-facing external id.
    pub transaction_number: String,
    pub provider_code: String,
    pub provider_transaction_id: Option<String>,
    pub transaction_type: TransactionType,
    pub status: TransactionStatus,
    pub amount: Decimal,
    pub currency: String,
    /// Computed once at creation from the provider fee formula.
    pub fee_amount: Decimal,
    pub phone_number: String,
    pub normalized_phone: String,
    pub invoice_id: Option<Uuid>,
    pub initiated_by: Option<Uuid>,
    pub metadata: JsonValue,
    pub provider_response: Option<JsonValue>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub is_reconciled: bool,
    pub reconciled_at: Option<DateTime<Utc>>,
}

/// Metadata flag written together with the move to `completed` and cleared
/// once ledger postings, the invoice credit and auto-reconciliation are done.
pub const SETTLEMENT_PENDING: &str = "settlement_pending";

/// Metadata flag marking that the amount has been credited to the invoice.
pub const INVOICE_APPLIED: &str = "invoice_applied";

impl Transaction {
    pub fn metadata_flag(&self, key: &str) -> bool {
        self.metadata
            .get(key)
            .and_then(JsonValue::as_bool)
            .unwrap_or(false)
    }

    /// Sets `key` to `true`, or removes it when `value` is false.
    pub fn set_metadata_flag(&mut self, key: &str, value: bool) {
        if !self.metadata.is_object() {
            self.metadata = JsonValue::Object(Map::new());
        }
        if let Some(map) = self.metadata.as_object_mut() {
            if value {
                map.insert(key.to_string(), JsonValue::Bool(true));
            } else {
                map.remove(key);
            }
        }
    }

    /// Completed, but an earlier attempt at the completion side effects did
    /// not finish.
    pub fn settlement_pending(&self) -> bool {
        self.status == TransactionStatus::Completed && self.metadata_flag(SETTLEMENT_PENDING)
    }
}

/// `MOMO-YYYYMMDD-XXXXXXXXXXXX`, random suffix from a v4 UUID.
pub fn generate_transaction_number(now: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string().to_uppercase();
    format!("MOMO-{}-{}", now.format("%Y%m%d"), &suffix[..12])
}

/// Append-only record of a status change or manual override.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    pub id: Uuid,
    pub transaction_id: Uuid,
    pub action: String,
    pub from_status: Option<TransactionStatus>,
    pub to_status: Option<TransactionStatus>,
    pub actor: String,
    pub note: Option<String>,
    pub at: DateTime<Utc>,
}

#[async_trait]
pub trait TransactionRepository: Send + Sync {
    async fn insert(&self, transaction: &Transaction) -> Result<(), DatabaseError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Transaction>, DatabaseError>;

    async fn find_by_number(&self, number: &str) -> Result<Option<Transaction>, DatabaseError>;

    async fn find_by_provider_reference(
        &self,
        provider_code: &str,
        provider_transaction_id: &str,
    ) -> Result<Option<Transaction>, DatabaseError>;

    /// Compare-and-swap: writes only if the stored status still equals
    /// `expected_status`. Returns whether the row was written.
    async fn update(
        &self,
        transaction: &Transaction,
        expected_status: TransactionStatus,
    ) -> Result<bool, DatabaseError>;

    /// Completed transactions of a provider created in `[from, to)`.
    async fn find_completed_in_range(
        &self,
        provider_code: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Transaction>, DatabaseError>;

    async fn find_non_terminal_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<Transaction>, DatabaseError>;

    /// Completed transactions created since `since` whose side effects are
    /// still outstanding.
    async fn find_pending_settlement(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<Transaction>, DatabaseError>;

    /// Sum of amounts created since `since` that did not fail or get cancelled.
    async fn sum_amount_since(
        &self,
        provider_code: &str,
        since: DateTime<Utc>,
    ) -> Result<Decimal, DatabaseError>;

    async fn set_reconciled(
        &self,
        id: Uuid,
        reconciled: bool,
        at: Option<DateTime<Utc>>,
    ) -> Result<bool, DatabaseError>;

    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), DatabaseError>;

    async fn audit_trail(&self, transaction_id: Uuid) -> Result<Vec<AuditEntry>, DatabaseError>;
}

#[derive(Default)]
pub struct InMemoryTransactionRepository {
    rows: RwLock<HashMap<Uuid, Transaction>>,
    audit: Mutex<Vec<AuditEntry>>,
}

impl InMemoryTransactionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn select<F>(&self, predicate: F) -> Vec<Transaction>
    where
        F: Fn(&Transaction) -> bool,
    {
        let rows = self.rows.read().unwrap_or_else(|e| e.into_inner());
        let mut found: Vec<Transaction> = rows.values().filter(|t| predicate(t)).cloned().collect();
        found.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.transaction_number.cmp(&b.transaction_number))
        });
        found
    }
}

#[async_trait]
impl TransactionRepository for InMemoryTransactionRepository {
    async fn insert(&self, transaction: &Transaction) -> Result<(), DatabaseError> {
        let mut rows = self.rows.write().unwrap_or_else(|e| e.into_inner());
        if rows
            .values()
            .any(|t| t.transaction_number == transaction.transaction_number)
        {
            return Err(DatabaseError::new(
                crate::database::error::DatabaseErrorKind::UniqueViolation {
                    constraint: "momo_transactions_transaction_number_key".to_string(),
                },
            ));
        }
        rows.insert(transaction.id, transaction.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Transaction>, DatabaseError> {
        Ok(self
            .rows
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned())
    }

    async fn find_by_number(&self, number: &str) -> Result<Option<Transaction>, DatabaseError> {
        Ok(self.select(|t| t.transaction_number == number).into_iter().next())
    }

    async fn find_by_provider_reference(
        &self,
        provider_code: &str,
        provider_transaction_id: &str,
    ) -> Result<Option<Transaction>, DatabaseError> {
        Ok(self
            .select(|t| {
                t.provider_code == provider_code
                    && t.provider_transaction_id.as_deref() == Some(provider_transaction_id)
            })
            .into_iter()
            .next())
    }

    async fn update(
        &self,
        transaction: &Transaction,
        expected_status: TransactionStatus,
    ) -> Result<bool, DatabaseError> {
        let mut rows = self.rows.write().unwrap_or_else(|e| e.into_inner());
        match rows.get_mut(&transaction.id) {
            Some(stored) if stored.status == expected_status => {
                *stored = transaction.clone();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(DatabaseError::not_found("transaction", transaction.id)),
        }
    }

    async fn find_completed_in_range(
        &self,
        provider_code: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Transaction>, DatabaseError> {
        Ok(self.select(|t| {
            t.provider_code == provider_code
                && t.status == TransactionStatus::Completed
                && t.created_at >= from
                && t.created_at < to
        }))
    }

    async fn find_non_terminal_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<Transaction>, DatabaseError> {
        Ok(self.select(|t| !t.status.is_terminal() && t.created_at >= since))
    }

    async fn find_pending_settlement(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<Transaction>, DatabaseError> {
        Ok(self.select(|t| t.settlement_pending() && t.created_at >= since))
    }

    async fn sum_amount_since(
        &self,
        provider_code: &str,
        since: DateTime<Utc>,
    ) -> Result<Decimal, DatabaseError> {
        Ok(self
            .select(|t| {
                t.provider_code == provider_code
                    && t.created_at >= since
                    && !matches!(
                        t.status,
                        TransactionStatus::Failed | TransactionStatus::Cancelled
                    )
            })
            .iter()
            .map(|t| t.amount)
            .sum())
    }

    async fn set_reconciled(
        &self,
        id: Uuid,
        reconciled: bool,
        at: Option<DateTime<Utc>>,
    ) -> Result<bool, DatabaseError> {
        let mut rows = self.rows.write().unwrap_or_else(|e| e.into_inner());
        let Some(stored) = rows.get_mut(&id) else {
            return Ok(false);
        };
        stored.is_reconciled = reconciled;
        stored.reconciled_at = if reconciled { at } else { None };
        Ok(true)
    }

    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), DatabaseError> {
        self.audit
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(entry.clone());
        Ok(())
    }

    async fn audit_trail(&self, transaction_id: Uuid) -> Result<Vec<AuditEntry>, DatabaseError> {
        Ok(self
            .audit
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|e| e.transaction_id == transaction_id)
            .cloned()
            .collect())
    }
}

#[cfg(feature = "database")]
#[derive(Debug, FromRow)]
struct TransactionRow {
    id: Uuid,
    transaction_number: String,
    provider_code: String,
    provider_transaction_id: Option<String>,
    transaction_type: String,
    status: String,
    amount: Decimal,
    currency: String,
    fee_amount: Decimal,
    phone_number: String,
    normalized_phone: String,
    invoice_id: Option<Uuid>,
    initiated_by: Option<Uuid>,
    metadata: JsonValue,
    provider_response: Option<JsonValue>,
    failure_reason: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    is_reconciled: bool,
    reconciled_at: Option<DateTime<Utc>>,
}

#[cfg(feature = "database")]
impl TryFrom<TransactionRow> for Transaction {
    type Error = DatabaseError;

    fn try_from(row: TransactionRow) -> Result<Self, Self::Error> {
        let transaction_type = TransactionType::parse(&row.transaction_type).ok_or_else(|| {
            DatabaseError::unknown(format!("invalid transaction type: {}", row.transaction_type))
        })?;
        let status = TransactionStatus::parse(&row.status)
            .ok_or_else(|| DatabaseError::unknown(format!("invalid status: {}", row.status)))?;
        Ok(Transaction {
            id: row.id,
            transaction_number: row.transaction_number,
            provider_code: row.provider_code,
            provider_transaction_id: row.provider_transaction_id,
            transaction_type,
            status,
            amount: row.amount,
            currency: row.currency,
            fee_amount: row.fee_amount,
            phone_number: row.phone_number,
            normalized_phone: row.normalized_phone,
            invoice_id: row.invoice_id,
            initiated_by: row.initiated_by,
            metadata: row.metadata,
            provider_response: row.provider_response,
            failure_reason: row.failure_reason,
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
            is_reconciled: row.is_reconciled,
            reconciled_at: row.reconciled_at,
        })
    }
}

#[cfg(feature = "database")]
const SELECT_COLUMNS: &str = "SELECT id, transaction_number, provider_code, provider_transaction_id, \
     transaction_type, status, amount, currency, fee_amount, phone_number, normalized_phone, \
     invoice_id, initiated_by, metadata, provider_response, failure_reason, created_at, \
     updated_at, completed_at, is_reconciled, reconciled_at FROM momo_transactions";

#[cfg(feature = "database")]
pub struct PgTransactionRepository {
    pool: PgPool,
}

#[cfg(feature = "database")]
impl PgTransactionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_one_where(
        &self,
        clause: &str,
        binds: &[&str],
    ) -> Result<Option<Transaction>, DatabaseError> {
        let sql = format!("{} WHERE {} LIMIT 1", SELECT_COLUMNS, clause);
        let mut query = sqlx::query_as::<_, TransactionRow>(&sql);
        for value in binds {
            query = query.bind(*value);
        }
        query
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .map(Transaction::try_from)
            .transpose()
    }

    fn collect(rows: Vec<TransactionRow>) -> Result<Vec<Transaction>, DatabaseError> {
        rows.into_iter().map(Transaction::try_from).collect()
    }
}

#[cfg(feature = "database")]
#[async_trait]
impl TransactionRepository for PgTransactionRepository {
    async fn insert(&self, t: &Transaction) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO momo_transactions
             (id, transaction_number, provider_code, provider_transaction_id, transaction_type,
              status, amount, currency, fee_amount, phone_number, normalized_phone, invoice_id,
              initiated_by, metadata, provider_response, failure_reason, created_at, updated_at,
              completed_at, is_reconciled, reconciled_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                     $17, $18, $19, $20, $21)",
        )
        .bind(t.id)
        .bind(&t.transaction_number)
        .bind(&t.provider_code)
        .bind(&t.provider_transaction_id)
        .bind(t.transaction_type.as_str())
        .bind(t.status.as_str())
        .bind(t.amount)
        .bind(&t.currency)
        .bind(t.fee_amount)
        .bind(&t.phone_number)
        .bind(&t.normalized_phone)
        .bind(t.invoice_id)
        .bind(t.initiated_by)
        .bind(&t.metadata)
        .bind(&t.provider_response)
        .bind(&t.failure_reason)
        .bind(t.created_at)
        .bind(t.updated_at)
        .bind(t.completed_at)
        .bind(t.is_reconciled)
        .bind(t.reconciled_at)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Transaction>, DatabaseError> {
        let sql = format!("{} WHERE id = $1", SELECT_COLUMNS);
        sqlx::query_as::<_, TransactionRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .map(Transaction::try_from)
            .transpose()
    }

    async fn find_by_number(&self, number: &str) -> Result<Option<Transaction>, DatabaseError> {
        self.fetch_one_where("transaction_number = $1", &[number]).await
    }

    async fn find_by_provider_reference(
        &self,
        provider_code: &str,
        provider_transaction_id: &str,
    ) -> Result<Option<Transaction>, DatabaseError> {
        self.fetch_one_where(
            "provider_code = $1 AND provider_transaction_id = $2",
            &[provider_code, provider_transaction_id],
        )
        .await
    }

    async fn update(
        &self,
        t: &Transaction,
        expected_status: TransactionStatus,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE momo_transactions
             SET status = $3, provider_transaction_id = $4, provider_response = $5,
                 failure_reason = $6, metadata = $7, updated_at = $8, completed_at = $9
             WHERE id = $1 AND status = $2",
        )
        .bind(t.id)
        .bind(expected_status.as_str())
        .bind(t.status.as_str())
        .bind(&t.provider_transaction_id)
        .bind(&t.provider_response)
        .bind(&t.failure_reason)
        .bind(&t.metadata)
        .bind(t.updated_at)
        .bind(t.completed_at)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(result.rows_affected() == 1)
    }

    async fn find_completed_in_range(
        &self,
        provider_code: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Transaction>, DatabaseError> {
        let sql = format!(
            "{} WHERE provider_code = $1 AND status = 'completed' AND created_at >= $2 \
             AND created_at < $3 ORDER BY created_at, transaction_number",
            SELECT_COLUMNS
        );
        let rows = sqlx::query_as::<_, TransactionRow>(&sql)
            .bind(provider_code)
            .bind(from)
            .bind(to)
            .fetch_all(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        Self::collect(rows)
    }

    async fn find_non_terminal_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<Transaction>, DatabaseError> {
        let sql = format!(
            "{} WHERE status IN ('pending', 'processing') AND created_at >= $1 ORDER BY created_at",
            SELECT_COLUMNS
        );
        let rows = sqlx::query_as::<_, TransactionRow>(&sql)
            .bind(since)
            .fetch_all(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        Self::collect(rows)
    }

    async fn find_pending_settlement(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<Transaction>, DatabaseError> {
        let sql = format!(
            "{} WHERE status = 'completed' AND metadata @> '{{\"settlement_pending\": true}}'::jsonb \
             AND created_at >= $1 ORDER BY created_at",
            SELECT_COLUMNS
        );
        let rows = sqlx::query_as::<_, TransactionRow>(&sql)
            .bind(since)
            .fetch_all(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        Self::collect(rows)
    }

    async fn sum_amount_since(
        &self,
        provider_code: &str,
        since: DateTime<Utc>,
    ) -> Result<Decimal, DatabaseError> {
        let total: Option<Decimal> = sqlx::query_scalar(
            "SELECT SUM(amount) FROM momo_transactions
             WHERE provider_code = $1 AND created_at >= $2
               AND status NOT IN ('failed', 'cancelled')",
        )
        .bind(provider_code)
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(total.unwrap_or(Decimal::ZERO))
    }

    async fn set_reconciled(
        &self,
        id: Uuid,
        reconciled: bool,
        at: Option<DateTime<Utc>>,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE momo_transactions SET is_reconciled = $2, reconciled_at = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(reconciled)
        .bind(if reconciled { at } else { None })
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(result.rows_affected() == 1)
    }

    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO momo_transaction_audit
             (id, transaction_id, action, from_status, to_status, actor, note, at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(entry.id)
        .bind(entry.transaction_id)
        .bind(&entry.action)
        .bind(entry.from_status.map(|s| s.as_str()))
        .bind(entry.to_status.map(|s| s.as_str()))
        .bind(&entry.actor)
        .bind(&entry.note)
        .bind(entry.at)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(())
    }

    async fn audit_trail(&self, transaction_id: Uuid) -> Result<Vec<AuditEntry>, DatabaseError> {
        #[derive(FromRow)]
        struct AuditRow {
            id: Uuid,
            transaction_id: Uuid,
            action: String,
            from_status: Option<String>,
            to_status: Option<String>,
            actor: String,
            note: Option<String>,
            at: DateTime<Utc>,
        }

        let rows = sqlx::query_as::<_, AuditRow>(
            "SELECT id, transaction_id, action, from_status, to_status, actor, note, at
             FROM momo_transaction_audit WHERE transaction_id = $1 ORDER BY at, id",
        )
        .bind(transaction_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        Ok(rows
            .into_iter()
            .map(|row| AuditEntry {
                id: row.id,
                transaction_id: row.transaction_id,
                action: row.action,
                from_status: row.from_status.as_deref().and_then(TransactionStatus::parse),
                to_status: row.to_status.as_deref().and_then(TransactionStatus::parse),
                actor: row.actor,
                note: row.note,
                at: row.at,
            })
            .collect())
    }
}
