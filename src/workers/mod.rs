//! Background loops. Each worker runs until the shutdown channel flips to `true`.

pub mod reconciliation_scheduler;
pub mod status_poller;
