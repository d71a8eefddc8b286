//! Mobile Money (MoMo) payment integration and reconciliation core.
//!
//! Provider adapters (MTN, Airtel, Zamtel) sit behind [`payments::provider::MobileMoneyProvider`],
//! the [`services::payment_orchestrator::PaymentOrchestrator`] owns the transaction
//! lifecycle and the [`services::reconciliation::ReconciliationEngine`] matches local
//! transactions against provider histories.

pub mod api;
pub mod app;
#[cfg(feature = "cache")]
pub mod cache;
pub mod config;
pub mod context;
pub mod database;
pub mod error;
pub mod health;
pub mod logging;
pub mod middleware;
pub mod payments;
pub mod services;
pub mod workers;
