use crate::database::error::DatabaseError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

#[cfg(feature = "database")]
use sqlx::{FromRow, PgPool};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReconciliationStatus {
    InProgress,
    Reconciled,
    Discrepancies,
    /// History fetch failed; the record carries no items.
    Failed,
}

impl ReconciliationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconciliationStatus::InProgress => "in_progress",
            ReconciliationStatus::Reconciled => "reconciled",
            ReconciliationStatus::Discrepancies => "discrepancies",
            ReconciliationStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "in_progress" => Some(ReconciliationStatus::InProgress),
            "reconciled" => Some(ReconciliationStatus::Reconciled),
            "discrepancies" => Some(ReconciliationStatus::Discrepancies),
            "failed" => Some(ReconciliationStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconciliationRecord {
    pub id: Uuid,
    pub provider_code: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub status: ReconciliationStatus,
    pub local_count: i64,
    pub provider_count: i64,
    pub matched_count: i64,
    pub unmatched_local_count: i64,
    pub unmatched_provider_count: i64,
    pub duplicate_count: i64,
    pub local_amount: Decimal,
    pub provider_amount: Decimal,
    pub matched_amount: Decimal,
    pub difference_amount: Decimal,
    pub failure_reason: Option<String>,
    pub initiated_by: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ReconciliationRecord {
    pub fn start(
        provider_code: &str,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
        initiated_by: String,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            provider_code: provider_code.to_string(),
            period_start,
            period_end,
            status: ReconciliationStatus::InProgress,
            local_count: 0,
            provider_count: 0,
            matched_count: 0,
            unmatched_local_count: 0,
            unmatched_provider_count: 0,
            duplicate_count: 0,
            local_amount: Decimal::ZERO,
            provider_amount: Decimal::ZERO,
            matched_amount: Decimal::ZERO,
            difference_amount: Decimal::ZERO,
            failure_reason: None,
            initiated_by,
            started_at,
            completed_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReconciliationItemStatus {
    Matched,
    UnmatchedLocal,
    UnmatchedProvider,
    DuplicateLocal,
    DuplicateProvider,
}

impl ReconciliationItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconciliationItemStatus::Matched => "matched",
            ReconciliationItemStatus::UnmatchedLocal => "unmatched_local",
            ReconciliationItemStatus::UnmatchedProvider => "unmatched_provider",
            ReconciliationItemStatus::DuplicateLocal => "duplicate_local",
            ReconciliationItemStatus::DuplicateProvider => "duplicate_provider",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "matched" => Some(ReconciliationItemStatus::Matched),
            "unmatched_local" => Some(ReconciliationItemStatus::UnmatchedLocal),
            "unmatched_provider" => Some(ReconciliationItemStatus::UnmatchedProvider),
            "duplicate_local" => Some(ReconciliationItemStatus::DuplicateLocal),
            "duplicate_provider" => Some(ReconciliationItemStatus::DuplicateProvider),
            _ => None,
        }
    }
}

/// Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconciliationItem {
    pub id: Uuid,
    pub record_id: Uuid,
    pub transaction_id: Option<Uuid>,
    pub provider_transaction_id: Option<String>,
    pub provider_snapshot: Option<JsonValue>,
    pub local_amount: Option<Decimal>,
    pub provider_amount: Option<Decimal>,
    pub difference: Decimal,
    pub status: ReconciliationItemStatus,
    pub description: String,
}

#[async_trait]
pub trait ReconciliationRepository: Send + Sync {
    async fn create_record(&self, record: &ReconciliationRecord) -> Result<(), DatabaseError>;

    /// Writes the final record state and all of its items as one unit.
    async fn finalize(
        &self,
        record: &ReconciliationRecord,
        items: &[ReconciliationItem],
    ) -> Result<(), DatabaseError>;

    async fn find_record(&self, id: Uuid) -> Result<Option<ReconciliationRecord>, DatabaseError>;

    async fn items_for(&self, record_id: Uuid) -> Result<Vec<ReconciliationItem>, DatabaseError>;

    /// Most recent first.
    async fn list_records(
        &self,
        provider_code: &str,
        limit: i64,
    ) -> Result<Vec<ReconciliationRecord>, DatabaseError>;
}

#[derive(Default)]
struct Store {
    records: HashMap<Uuid, ReconciliationRecord>,
    items: HashMap<Uuid, Vec<ReconciliationItem>>,
}

#[derive(Default)]
pub struct InMemoryReconciliationRepository {
    store: RwLock<Store>,
}

impl InMemoryReconciliationRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReconciliationRepository for InMemoryReconciliationRepository {
    async fn create_record(&self, record: &ReconciliationRecord) -> Result<(), DatabaseError> {
        self.store
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .records
            .insert(record.id, record.clone());
        Ok(())
    }

    async fn finalize(
        &self,
        record: &ReconciliationRecord,
        items: &[ReconciliationItem],
    ) -> Result<(), DatabaseError> {
        let mut store = self.store.write().unwrap_or_else(|e| e.into_inner());
        if !store.records.contains_key(&record.id) {
            return Err(DatabaseError::not_found("reconciliation record", record.id));
        }
        store.records.insert(record.id, record.clone());
        store.items.insert(record.id, items.to_vec());
        Ok(())
    }

    async fn find_record(&self, id: Uuid) -> Result<Option<ReconciliationRecord>, DatabaseError> {
        Ok(self
            .store
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .records
            .get(&id)
            .cloned())
    }

    async fn items_for(&self, record_id: Uuid) -> Result<Vec<ReconciliationItem>, DatabaseError> {
        Ok(self
            .store
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .items
            .get(&record_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_records(
        &self,
        provider_code: &str,
        limit: i64,
    ) -> Result<Vec<ReconciliationRecord>, DatabaseError> {
        let store = self.store.read().unwrap_or_else(|e| e.into_inner());
        let mut records: Vec<ReconciliationRecord> = store
            .records
            .values()
            .filter(|r| r.provider_code == provider_code)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        records.truncate(limit.max(0) as usize);
        Ok(records)
    }
}

#[cfg(feature = "database")]
#[derive(Debug, FromRow)]
struct RecordRow {
    id: Uuid,
    provider_code: String,
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
    status: String,
    local_count: i64,
    provider_count: i64,
    matched_count: i64,
    unmatched_local_count: i64,
    unmatched_provider_count: i64,
    duplicate_count: i64,
    local_amount: Decimal,
    provider_amount: Decimal,
    matched_amount: Decimal,
    difference_amount: Decimal,
    failure_reason: Option<String>,
    initiated_by: String,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

#[cfg(feature = "database")]
impl TryFrom<RecordRow> for ReconciliationRecord {
    type Error = DatabaseError;

    fn try_from(row: RecordRow) -> Result<Self, Self::Error> {
        let status = ReconciliationStatus::parse(&row.status).ok_or_else(|| {
            DatabaseError::unknown(format!("invalid reconciliation status: {}", row.status))
        })?;
        Ok(ReconciliationRecord {
            id: row.id,
            provider_code: row.provider_code,
            period_start: row.period_start,
            period_end: row.period_end,
            status,
            local_count: row.local_count,
            provider_count: row.provider_count,
            matched_count: row.matched_count,
            unmatched_local_count: row.unmatched_local_count,
            unmatched_provider_count: row.unmatched_provider_count,
            duplicate_count: row.duplicate_count,
            local_amount: row.local_amount,
            provider_amount: row.provider_amount,
            matched_amount: row.matched_amount,
            difference_amount: row.difference_amount,
            failure_reason: row.failure_reason,
            initiated_by: row.initiated_by,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

#[cfg(feature = "database")]
#[derive(Debug, FromRow)]
struct ItemRow {
    id: Uuid,
    record_id: Uuid,
    transaction_id: Option<Uuid>,
    provider_transaction_id: Option<String>,
    provider_snapshot: Option<JsonValue>,
    local_amount: Option<Decimal>,
    provider_amount: Option<Decimal>,
    difference: Decimal,
    status: String,
    description: String,
}

#[cfg(feature = "database")]
const RECORD_COLUMNS: &str = "id, provider_code, period_start, period_end, status, local_count, \
     provider_count, matched_count, unmatched_local_count, unmatched_provider_count, \
     duplicate_count, local_amount, provider_amount, matched_amount, difference_amount, \
     failure_reason, initiated_by, started_at, completed_at";

#[cfg(feature = "database")]
pub struct PgReconciliationRepository {
    pool: PgPool,
}

#[cfg(feature = "database")]
impl PgReconciliationRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[cfg(feature = "database")]
#[async_trait]
impl ReconciliationRepository for PgReconciliationRepository {
    async fn create_record(&self, r: &ReconciliationRecord) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO momo_reconciliation_records
             (id, provider_code, period_start, period_end, status, initiated_by, started_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(r.id)
        .bind(&r.provider_code)
        .bind(r.period_start)
        .bind(r.period_end)
        .bind(r.status.as_str())
        .bind(&r.initiated_by)
        .bind(r.started_at)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(())
    }

    async fn finalize(
        &self,
        r: &ReconciliationRecord,
        items: &[ReconciliationItem],
    ) -> Result<(), DatabaseError> {
        let mut tx = self.pool.begin().await.map_err(DatabaseError::from_sqlx)?;

        sqlx::query(
            "UPDATE momo_reconciliation_records
             SET status = $2, local_count = $3, provider_count = $4, matched_count = $5,
                 unmatched_local_count = $6, unmatched_provider_count = $7, duplicate_count = $8,
                 local_amount = $9, provider_amount = $10, matched_amount = $11,
                 difference_amount = $12, failure_reason = $13, completed_at = $14
             WHERE id = $1",
        )
        .bind(r.id)
        .bind(r.status.as_str())
        .bind(r.local_count)
        .bind(r.provider_count)
        .bind(r.matched_count)
        .bind(r.unmatched_local_count)
        .bind(r.unmatched_provider_count)
        .bind(r.duplicate_count)
        .bind(r.local_amount)
        .bind(r.provider_amount)
        .bind(r.matched_amount)
        .bind(r.difference_amount)
        .bind(&r.failure_reason)
        .bind(r.completed_at)
        .execute(&mut *tx)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        for item in items {
            sqlx::query(
                "INSERT INTO momo_reconciliation_items
                 (id, record_id, transaction_id, provider_transaction_id, provider_snapshot,
                  local_amount, provider_amount, difference, status, description)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            )
            .bind(item.id)
            .bind(item.record_id)
            .bind(item.transaction_id)
            .bind(&item.provider_transaction_id)
            .bind(&item.provider_snapshot)
            .bind(item.local_amount)
            .bind(item.provider_amount)
            .bind(item.difference)
            .bind(item.status.as_str())
            .bind(&item.description)
            .execute(&mut *tx)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        }

        tx.commit().await.map_err(DatabaseError::from_sqlx)?;
        Ok(())
    }

    async fn find_record(&self, id: Uuid) -> Result<Option<ReconciliationRecord>, DatabaseError> {
        let sql = format!(
            "SELECT {} FROM momo_reconciliation_records WHERE id = $1",
            RECORD_COLUMNS
        );
        sqlx::query_as::<_, RecordRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .map(ReconciliationRecord::try_from)
            .transpose()
    }

    async fn items_for(&self, record_id: Uuid) -> Result<Vec<ReconciliationItem>, DatabaseError> {
        let rows = sqlx::query_as::<_, ItemRow>(
            "SELECT id, record_id, transaction_id, provider_transaction_id, provider_snapshot,
                    local_amount, provider_amount, difference, status, description
             FROM momo_reconciliation_items WHERE record_id = $1 ORDER BY id",
        )
        .bind(record_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        rows.into_iter()
            .map(|row| {
                let status = ReconciliationItemStatus::parse(&row.status).ok_or_else(|| {
                    DatabaseError::unknown(format!("invalid item status: {}", row.status))
                })?;
                Ok(ReconciliationItem {
                    id: row.id,
                    record_id: row.record_id,
                    transaction_id: row.transaction_id,
                    provider_transaction_id: row.provider_transaction_id,
                    provider_snapshot: row.provider_snapshot,
                    local_amount: row.local_amount,
                    provider_amount: row.provider_amount,
                    difference: row.difference,
                    status,
                    description: row.description,
                })
            })
            .collect()
    }

    async fn list_records(
        &self,
        provider_code: &str,
        limit: i64,
    ) -> Result<Vec<ReconciliationRecord>, DatabaseError> {
        let sql = format!(
            "SELECT {} FROM momo_reconciliation_records WHERE provider_code = $1 \
             ORDER BY started_at DESC LIMIT $2",
            RECORD_COLUMNS
        );
        let rows = sqlx::query_as::<_, RecordRow>(&sql)
            .bind(provider_code)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        rows.into_iter().map(ReconciliationRecord::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn finalize_replaces_record_and_stores_items() {
        let repo = InMemoryReconciliationRepository::new();
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        let mut record = ReconciliationRecord::start(
            "mtn",
            start,
            start + Duration::days(1),
            "system".to_string(),
            start,
        );
        repo.create_record(&record).await.unwrap();

        record.status = ReconciliationStatus::Reconciled;
        record.matched_count = 1;
        let item = ReconciliationItem {
            id: Uuid::new_v4(),
            record_id: record.id,
            transaction_id: Some(Uuid::new_v4()),
            provider_transaction_id: Some("P1".to_string()),
            provider_snapshot: None,
            local_amount: Some(dec!(100)),
            provider_amount: Some(dec!(100)),
            difference: dec!(0),
            status: ReconciliationItemStatus::Matched,
            description: "matched".to_string(),
        };
        repo.finalize(&record, std::slice::from_ref(&item)).await.unwrap();

        let stored = repo.find_record(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ReconciliationStatus::Reconciled);
        assert_eq!(repo.items_for(record.id).await.unwrap(), vec![item]);
        assert_eq!(repo.list_records("mtn", 10).await.unwrap().len(), 1);
        assert!(repo.list_records("airtel", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn finalize_requires_existing_record() {
        let repo = InMemoryReconciliationRepository::new();
        let now = Utc::now();
        let record = ReconciliationRecord::start("mtn", now, now, "system".to_string(), now);
        assert!(repo.finalize(&record, &[]).await.is_err());
    }
}
