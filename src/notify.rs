// 📣 Notifications
// Best-effort messages sent after a transaction commits. Delivery failures are
// logged and dropped; they never affect the ledger.

use crate::allocation::AllocationKind;
use crate::workflow::RequestStatus;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notification {
    RequestSubmitted {
        request_id: String,
        practice_id: String,
        amount: Decimal,
        requestor_email: String,
    },
    RequestApproved {
        request_id: String,
        status: RequestStatus,
        approver_email: String,
    },
    RequestRejected {
        request_id: String,
        requestor_email: String,
        reason: String,
    },
    AllocationCompleted {
        allocation_id: String,
        kind: AllocationKind,
        total: Decimal,
    },
}

impl Notification {
    pub fn subject(&self) -> String {
        match self {
            Notification::RequestSubmitted { practice_id, amount, .. } => {
                format!("New stipend request for {} (${:.2})", practice_id, amount)
            }
            Notification::RequestApproved { request_id, status, .. } => {
                format!("Stipend request {} is now {}", request_id, status)
            }
            Notification::RequestRejected { request_id, .. } => {
                format!("Stipend request {} was rejected", request_id)
            }
            Notification::AllocationCompleted { kind, total, .. } => {
                format!("Allocation completed: {} ${:.2}", kind, total)
            }
        }
    }
}

pub trait NotificationSink: Send + Sync {
    fn deliver(&self, notification: &Notification) -> anyhow::Result<()>;
}

/// Send and swallow: failures only reach the log
pub fn dispatch(sink: &dyn NotificationSink, notification: &Notification) {
    if let Err(e) = sink.deliver(notification) {
        warn!(error = %e, subject = %notification.subject(), "notification delivery failed");
    }
}

/// Default sink: writes each notification to the log
#[derive(Debug, Default)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn deliver(&self, notification: &Notification) -> anyhow::Result<()> {
        info!(subject = %notification.subject(), "notification");
        Ok(())
    }
}

/// Keeps everything it is sent
#[derive(Debug, Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().clone()
    }
}

impl NotificationSink for RecordingSink {
    fn deliver(&self, notification: &Notification) -> anyhow::Result<()> {
        self.sent.lock().push(notification.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::dec;

    struct BrokenSink;

    impl NotificationSink for BrokenSink {
        fn deliver(&self, _: &Notification) -> anyhow::Result<()> {
            anyhow::bail!("smtp unreachable")
        }
    }

    fn sample() -> Notification {
        Notification::AllocationCompleted {
            allocation_id: "a-1".to_string(),
            kind: AllocationKind::PracticeToPractice,
            total: dec("2000"),
        }
    }

    #[test]
    fn test_recording_sink_keeps_order() {
        let sink = RecordingSink::new();
        dispatch(&sink, &sample());
        dispatch(
            &sink,
            &Notification::RequestRejected {
                request_id: "r-1".to_string(),
                requestor_email: "psm@example.com".to_string(),
                reason: "duplicate".to_string(),
            },
        );
        let sent = sink.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], sample());
    }

    #[test]
    fn test_failed_delivery_is_swallowed() {
        dispatch(&BrokenSink, &sample());
    }

    #[test]
    fn test_subject_and_json_shape() {
        assert_eq!(sample().subject(), "Allocation completed: practice_to_practice $2000.00");
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["event"], "allocation_completed");
    }
}
