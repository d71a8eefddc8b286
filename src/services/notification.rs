use crate::database::transaction_repository::{Transaction, TransactionStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    StatusChanged,
    ManualOverride,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusEvent {
    pub notification_type: NotificationType,
    pub transaction_id: Uuid,
    pub transaction_number: String,
    pub provider_code: String,
    pub action: String,
    pub from_status: Option<TransactionStatus>,
    pub to_status: Option<TransactionStatus>,
    pub actor: String,
    pub at: DateTime<Utc>,
}

impl StatusEvent {
    pub fn for_transaction(
        notification_type: NotificationType,
        transaction: &Transaction,
        action: &str,
        from_status: Option<TransactionStatus>,
        actor: String,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            notification_type,
            transaction_id: transaction.id,
            transaction_number: transaction.transaction_number.clone(),
            provider_code: transaction.provider_code.clone(),
            action: action.to_string(),
            from_status,
            to_status: Some(transaction.status),
            actor,
            at,
        }
    }
}

/// Fire-and-forget publisher over a bounded channel.
///
/// A full or closed channel drops the event with a warning; callers are never
/// blocked by slow consumers.
#[derive(Clone)]
pub struct NotificationSink {
    sender: Option<mpsc::Sender<StatusEvent>>,
}

impl NotificationSink {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<StatusEvent>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (
            Self {
                sender: Some(sender),
            },
            receiver,
        )
    }

    /// Sink that discards everything.
    pub fn disabled() -> Self {
        Self { sender: None }
    }

    pub fn publish(&self, event: StatusEvent) {
        let Some(sender) = &self.sender else {
            return;
        };
        if let Err(e) = sender.try_send(event) {
            let (kind, event) = match e {
                mpsc::error::TrySendError::Full(event) => ("full", event),
                mpsc::error::TrySendError::Closed(event) => ("closed", event),
            };
            warn!(
                transaction_number = %event.transaction_number,
                channel = kind,
                "dropping notification event"
            );
        }
    }
}

/// Consumer that writes each event to the log.
pub fn spawn_log_consumer(mut receiver: mpsc::Receiver<StatusEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = receiver.recv().await {
            match event.to_status {
                Some(TransactionStatus::Failed) => error!(
                    transaction_number = %event.transaction_number,
                    provider = %event.provider_code,
                    action = %event.action,
                    actor = %event.actor,
                    "notification: transaction failed"
                ),
                _ => info!(
                    transaction_number = %event.transaction_number,
                    provider = %event.provider_code,
                    action = %event.action,
                    from = ?event.from_status,
                    to = ?event.to_status,
                    actor = %event.actor,
                    "notification: transaction updated"
                ),
            }
        }
    })
}
