//! Ledger and invoice collaborators.
//!
//! The core only talks to these through traits; the in-memory versions back
//! tests and the standalone binary.

use crate::database::provider_config_repository::LedgerAccounts;
use crate::database::transaction_repository::Transaction;
use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::types::TransactionType;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

pub const REFERENCE_TYPE: &str = "momo_transaction";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub account_id: String,
    pub debit: Decimal,
    pub credit: Decimal,
    pub description: String,
    pub reference_type: String,
    pub reference_id: Uuid,
}

impl LedgerEntry {
    fn debit(account_id: &str, amount: Decimal, description: &str, reference_id: Uuid) -> Self {
        Self {
            account_id: account_id.to_string(),
            debit: amount,
            credit: Decimal::ZERO,
            description: description.to_string(),
            reference_type: REFERENCE_TYPE.to_string(),
            reference_id,
        }
    }

    fn credit(account_id: &str, amount: Decimal, description: &str, reference_id: Uuid) -> Self {
        Self {
            account_id: account_id.to_string(),
            debit: Decimal::ZERO,
            credit: amount,
            description: description.to_string(),
            reference_type: REFERENCE_TYPE.to_string(),
            reference_id,
        }
    }
}

/// Balanced postings for a completed transaction.
///
/// Collections debit cash net of fee and the fee expense, and credit the
/// receivable with the gross amount. Outbound transactions (payouts and
/// refunds) debit the receivable and the fee expense and credit cash with the
/// gross outflow. Zero-value lines are omitted.
pub fn build_postings(transaction: &Transaction, accounts: &LedgerAccounts) -> Vec<LedgerEntry> {
    let id = transaction.id;
    let amount = transaction.amount;
    let fee = transaction.fee_amount;
    let description = format!(
        "{} {} via {}",
        transaction.transaction_type.as_str(),
        transaction.transaction_number,
        transaction.provider_code
    );

    let entries = match transaction.transaction_type {
        TransactionType::Collection => vec![
            LedgerEntry::debit(&accounts.cash, amount - fee, &description, id),
            LedgerEntry::debit(&accounts.fee, fee, &description, id),
            LedgerEntry::credit(&accounts.receivable, amount, &description, id),
        ],
        TransactionType::Disbursement | TransactionType::Refund => vec![
            LedgerEntry::debit(&accounts.receivable, amount, &description, id),
            LedgerEntry::debit(&accounts.fee, fee, &description, id),
            LedgerEntry::credit(&accounts.cash, amount + fee, &description, id),
        ],
    };

    entries
        .into_iter()
        .filter(|e| !(e.debit.is_zero() && e.credit.is_zero()))
        .collect()
}

#[async_trait]
pub trait LedgerPoster: Send + Sync {
    /// Whether entries have already been posted for this transaction.
    async fn has_postings(&self, reference_id: Uuid) -> PaymentResult<bool>;

    /// Posts one balanced batch. Implementations reject unbalanced batches.
    async fn post(&self, entries: &[LedgerEntry]) -> PaymentResult<()>;
}

#[derive(Default)]
pub struct InMemoryLedger {
    entries: RwLock<Vec<LedgerEntry>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries_for(&self, reference_id: Uuid) -> Vec<LedgerEntry> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|e| e.reference_id == reference_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl LedgerPoster for InMemoryLedger {
    async fn has_postings(&self, reference_id: Uuid) -> PaymentResult<bool> {
        Ok(self
            .entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|e| e.reference_id == reference_id))
    }

    async fn post(&self, entries: &[LedgerEntry]) -> PaymentResult<()> {
        let debits: Decimal = entries.iter().map(|e| e.debit).sum();
        let credits: Decimal = entries.iter().map(|e| e.credit).sum();
        if debits != credits {
            return Err(PaymentError::Persistence {
                message: format!("unbalanced ledger batch: debits {} credits {}", debits, credits),
            });
        }
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(entries);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Unpaid,
    Partial,
    Paid,
}

impl InvoiceStatus {
    /// `partial` while `0 < paid < total`, `paid` once `paid >= total`.
    pub fn for_amounts(paid: Decimal, total: Decimal) -> Self {
        if paid >= total {
            InvoiceStatus::Paid
        } else if paid > Decimal::ZERO {
            InvoiceStatus::Partial
        } else {
            InvoiceStatus::Unpaid
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: Uuid,
    pub total: Decimal,
    pub paid: Decimal,
    pub status: InvoiceStatus,
}

/// Authoritative for invoice totals.
#[async_trait]
pub trait InvoiceStore: Send + Sync {
    async fn find(&self, id: Uuid) -> PaymentResult<Option<Invoice>>;

    /// Adds to the paid amount and returns the updated invoice.
    async fn increment_paid(&self, id: Uuid, amount: Decimal) -> PaymentResult<Invoice>;

    async fn update_status(&self, id: Uuid, status: InvoiceStatus) -> PaymentResult<()>;
}

#[derive(Default)]
pub struct InMemoryInvoiceStore {
    invoices: RwLock<HashMap<Uuid, Invoice>>,
}

impl InMemoryInvoiceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, total: Decimal) -> Invoice {
        let invoice = Invoice {
            id: Uuid::new_v4(),
            total,
            paid: Decimal::ZERO,
            status: InvoiceStatus::Unpaid,
        };
        self.invoices
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(invoice.id, invoice.clone());
        invoice
    }
}

#[async_trait]
impl InvoiceStore for InMemoryInvoiceStore {
    async fn find(&self, id: Uuid) -> PaymentResult<Option<Invoice>> {
        Ok(self
            .invoices
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned())
    }

    async fn increment_paid(&self, id: Uuid, amount: Decimal) -> PaymentResult<Invoice> {
        let mut invoices = self.invoices.write().unwrap_or_else(|e| e.into_inner());
        let invoice = invoices
            .get_mut(&id)
            .ok_or_else(|| PaymentError::not_found(format!("invoice {}", id)))?;
        invoice.paid += amount;
        Ok(invoice.clone())
    }

    async fn update_status(&self, id: Uuid, status: InvoiceStatus) -> PaymentResult<()> {
        let mut invoices = self.invoices.write().unwrap_or_else(|e| e.into_inner());
        let invoice = invoices
            .get_mut(&id)
            .ok_or_else(|| PaymentError::not_found(format!("invoice {}", id)))?;
        invoice.status = status;
        Ok(())
    }
}
