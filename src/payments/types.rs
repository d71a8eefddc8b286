use crate::payments::error::{PaymentError, PaymentResult};
use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

/// Provider-agnostic status vocabulary every adapter maps into.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalStatus {
    Pending,
    Completed,
    Failed,
    Cancelled,
    Unknown,
}

impl CanonicalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CanonicalStatus::Pending => "pending",
            CanonicalStatus::Completed => "completed",
            CanonicalStatus::Failed => "failed",
            CanonicalStatus::Cancelled => "cancelled",
            CanonicalStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for CanonicalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Looks `native` up in a per-adapter status table, case-insensitively.
/// Anything absent from the table is `Unknown`.
pub fn lookup_status(table: &[(&str, CanonicalStatus)], native: &str) -> CanonicalStatus {
    let native = native.trim();
    table
        .iter()
        .find(|(code, _)| code.eq_ignore_ascii_case(native))
        .map(|(_, status)| *status)
        .unwrap_or(CanonicalStatus::Unknown)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Collection,
    Disbursement,
    Refund,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Collection => "collection",
            TransactionType::Disbursement => "disbursement",
            TransactionType::Refund => "refund",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "collection" => Some(TransactionType::Collection),
            "disbursement" => Some(TransactionType::Disbursement),
            "refund" => Some(TransactionType::Refund),
            _ => None,
        }
    }

    /// Money leaves the business account.
    pub fn is_outbound(&self) -> bool {
        !matches!(self, TransactionType::Collection)
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rounds to currency precision, half away from zero.
pub fn round_currency(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Canonical request for both collections and payouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub amount: Decimal,
    pub currency: String,
    pub phone_number: String,
    /// Reference sent to the provider. Retries must reuse it unchanged.
    pub external_id: String,
    pub note: Option<String>,
}

impl PaymentRequest {
    pub fn validate(&self) -> PaymentResult<()> {
        if self.amount <= Decimal::ZERO {
            return Err(PaymentError::validation(
                "amount must be greater than zero",
                "amount",
            ));
        }
        if self.phone_number.trim().is_empty() {
            return Err(PaymentError::validation(
                "phone number is required",
                "phone_number",
            ));
        }
        if self.external_id.trim().is_empty() {
            return Err(PaymentError::validation(
                "external id is required",
                "external_id",
            ));
        }
        if self.currency.trim().is_empty() {
            return Err(PaymentError::validation("currency is required", "currency"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundRequest {
    pub original_provider_transaction_id: String,
    pub amount: Decimal,
    pub currency: String,
    /// Original payer; synthetic refunds pay this number.
    pub phone_number: String,
    pub external_id: String,
    pub reason: Option<String>,
}

impl RefundRequest {
    pub fn validate(&self) -> PaymentResult<()> {
        if self.original_provider_transaction_id.trim().is_empty() {
            return Err(PaymentError::validation(
                "original provider transaction id is required",
                "original_provider_transaction_id",
            ));
        }
        if self.amount <= Decimal::ZERO {
            return Err(PaymentError::validation(
                "amount must be greater than zero",
                "amount",
            ));
        }
        if self.external_id.trim().is_empty() {
            return Err(PaymentError::validation(
                "external id is required",
                "external_id",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentAccepted {
    pub provider_transaction_id: String,
    pub status: CanonicalStatus,
    pub raw_response: JsonValue,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RefundMode {
    Native,
    /// The provider has no refund API; money is returned as a disbursement
    /// to the original payer under a fresh provider reference.
    SyntheticDisbursement,
}

impl RefundMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefundMode::Native => "native",
            RefundMode::SyntheticDisbursement => "synthetic_disbursement",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundAccepted {
    pub provider_transaction_id: String,
    pub status: CanonicalStatus,
    pub mode: RefundMode,
    pub raw_response: JsonValue,
}

/// One canonical status observation, from polling or from a webhook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub provider_transaction_id: Option<String>,
    pub external_id: Option<String>,
    pub status: CanonicalStatus,
    pub native_status: String,
    pub amount: Option<Decimal>,
    pub failure_reason: Option<String>,
    pub raw_response: JsonValue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountBalance {
    pub available: Decimal,
    pub currency: String,
    pub raw_response: JsonValue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryQuery {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub limit: u32,
    pub offset: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderTransaction {
    pub id: String,
    pub external_id: Option<String>,
    pub amount: Decimal,
    pub currency: String,
    pub status: CanonicalStatus,
    pub phone_number: Option<String>,
    pub occurred_at: Option<DateTime<Utc>>,
    pub raw: JsonValue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionHistory {
    pub transactions: Vec<ProviderTransaction>,
    pub has_more: bool,
}

/// Normalized upstream rejection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderFailure {
    pub error_message: String,
    pub error_code: Option<String>,
    pub raw_response: JsonValue,
}

impl ProviderFailure {
    pub fn new(error_message: impl Into<String>, error_code: Option<String>) -> Self {
        Self {
            error_message: error_message.into(),
            error_code,
            raw_response: JsonValue::Null,
        }
    }

    pub fn with_raw(mut self, raw_response: JsonValue) -> Self {
        self.raw_response = raw_response;
        self
    }

    /// Reason string stored on a failed transaction.
    pub fn reason(&self) -> String {
        match &self.error_code {
            Some(code) => format!("{} ({})", self.error_message, code),
            None => self.error_message.clone(),
        }
    }
}

/// Result of a provider operation that reached the provider.
///
/// Transport failures and caller bugs are `Err(PaymentError)` instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProviderOutcome<T> {
    Success(T),
    Failure(ProviderFailure),
}

impl<T> ProviderOutcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, ProviderOutcome::Success(_))
    }

    pub fn success(self) -> Option<T> {
        match self {
            ProviderOutcome::Success(value) => Some(value),
            ProviderOutcome::Failure(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&ProviderFailure> {
        match self {
            ProviderOutcome::Success(_) => None,
            ProviderOutcome::Failure(failure) => Some(failure),
        }
    }
}

pub type PaymentOutcome = ProviderOutcome<PaymentAccepted>;
pub type RefundOutcome = ProviderOutcome<RefundAccepted>;
pub type StatusOutcome = ProviderOutcome<StatusReport>;
pub type BalanceOutcome = ProviderOutcome<AccountBalance>;
pub type HistoryOutcome = ProviderOutcome<TransactionHistory>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Connectivity {
    pub available: bool,
    pub message: String,
}
