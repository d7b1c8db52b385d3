//! Notification sink.
//!
//! Session and table events are pushed to a [`Notifier`] after the
//! primary write has been committed.  Delivery is best effort: the
//! service logs a failed dispatch and carries on.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Event emitted after a successful session or table operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum Notification {
    SessionStarted {
        session_id: Uuid,
        device_number: String,
        customer_name: String,
    },
    SessionEnded {
        session_id: Uuid,
        device_number: String,
        final_cost: rust_decimal::Decimal,
    },
    TableLinked {
        session_id: Uuid,
        bill_id: Uuid,
        table_number: String,
    },
    TableUnlinked {
        session_id: Uuid,
        bill_id: Uuid,
        table_number: String,
    },
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, organization: &str, event: Notification) -> anyhow::Result<()>;
}

/// Writes notifications to the log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, organization: &str, event: Notification) -> anyhow::Result<()> {
        tracing::info!(organization, event = ?event, "notification");
        Ok(())
    }
}

/// Sends `event` and logs a failure instead of returning it.
pub async fn dispatch(notifier: &dyn Notifier, organization: &str, event: Notification) {
    if let Err(err) = notifier.notify(organization, event).await {
        tracing::warn!(organization, error = %err, "notification dispatch failed");
    }
}
