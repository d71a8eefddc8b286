use crate::context::RequestContext;
use crate::database::transaction_repository::{
    AuditEntry, Transaction, TransactionRepository, TransactionStatus,
};
use crate::payments::error::PaymentResult;
use crate::services::notification::{NotificationSink, NotificationType, StatusEvent};
use std::sync::Arc;
use uuid::Uuid;

/// Writes audit entries and mirrors each one onto the notification sink.
#[derive(Clone)]
pub struct AuditTrail {
    transactions: Arc<dyn TransactionRepository>,
    notifications: NotificationSink,
}

impl AuditTrail {
    pub fn new(transactions: Arc<dyn TransactionRepository>, notifications: NotificationSink) -> Self {
        Self {
            transactions,
            notifications,
        }
    }

    pub async fn record(
        &self,
        ctx: &RequestContext,
        transaction: &Transaction,
        action: &str,
        from_status: Option<TransactionStatus>,
        note: Option<String>,
        kind: NotificationType,
    ) -> PaymentResult<AuditEntry> {
        let at = ctx.now();
        let entry = AuditEntry {
            id: Uuid::new_v4(),
            transaction_id: transaction.id,
            action: action.to_string(),
            from_status,
            to_status: Some(transaction.status),
            actor: ctx.actor(),
            note,
            at,
        };
        self.transactions.append_audit(&entry).await?;
        self.notifications.publish(StatusEvent::for_transaction(
            kind,
            transaction,
            action,
            from_status,
            entry.actor.clone(),
            at,
        ));
        Ok(entry)
    }
}
