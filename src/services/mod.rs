//! Services module for business logic and integrations

pub mod audit;
pub mod ledger;
pub mod notification;
pub mod payment_orchestrator;
pub mod reconciliation;
pub mod webhook_processor;

pub use crate::services::payment_orchestrator::{
    PaymentOrchestrator, TransactionOutcome, TransactionRequest,
};
pub use crate::services::reconciliation::{ReconciliationEngine, ReconciliationReport};
