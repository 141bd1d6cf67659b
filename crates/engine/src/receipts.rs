//! Inbound delivery receipts from providers.

use serde::{Deserialize, Serialize};

use relay_common::types::{Notification, NotificationStatus};

use crate::callback::CallbackDispatcher;
use crate::error::{EngineError, Result};
use crate::ledger::{StatusChange, StatusLedger, StatusUpdate};

/// A provider's report about a message it was handed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    /// Reference the provider returned on send.
    pub reference: String,
    pub status: NotificationStatus,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub provider_payload: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub enum ReceiptOutcome {
    /// The receipt moved the notification.
    Applied {
        notification: Notification,
        callback_queued: bool,
    },
    /// Duplicate, late or out-of-order receipt; nothing changed.
    Unchanged { current: NotificationStatus },
}

#[derive(Clone)]
pub struct ReceiptProcessor {
    ledger: StatusLedger,
    callbacks: CallbackDispatcher,
}

impl ReceiptProcessor {
    pub fn new(ledger: StatusLedger, callbacks: CallbackDispatcher) -> Self {
        Self { ledger, callbacks }
    }

    /// Correlate a receipt with its notification and apply it.
    ///
    /// An unknown reference is an error so the sender can retry once the
    /// dispatch write lands.
    pub async fn process(&self, receipt: DeliveryReceipt) -> Result<ReceiptOutcome> {
        let notification = self
            .ledger
            .get_by_reference(&receipt.reference)
            .await?
            .ok_or_else(|| EngineError::UnknownReference(receipt.reference.clone()))?;

        if notification.status == receipt.status {
            tracing::debug!(
                notification_id = %notification.id,
                status = %receipt.status,
                "Receipt repeats current status"
            );
            return Ok(ReceiptOutcome::Unchanged {
                current: notification.status,
            });
        }

        let mut change = StatusChange::new(receipt.status);
        if let Some(reason) = receipt.reason {
            change = change.with_reason(reason);
        }

        let update = self.ledger.apply_status(notification.id, change).await?;
        let callback_queued = self
            .callbacks
            .dispatch_if_terminal(&update, receipt.provider_payload)
            .await;

        match update {
            StatusUpdate::Applied { notification, .. } => Ok(ReceiptOutcome::Applied {
                notification,
                callback_queued,
            }),
            StatusUpdate::Ignored { current, .. } => Ok(ReceiptOutcome::Unchanged { current }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use relay_common::types::{CallbackEndpoint, ChannelType};

    use crate::memory::{
        MemoryNotificationStore, MemoryServiceConfigStore, MemoryTaskQueue, test_notification,
    };
    use crate::queue::Task;
    use crate::store::NotificationStore;

    async fn setup(include_provider_payload: bool) -> (ReceiptProcessor, Arc<MemoryTaskQueue>, Notification) {
        let store = Arc::new(MemoryNotificationStore::new());
        let queue = Arc::new(MemoryTaskQueue::new());
        let mut n = test_notification(ChannelType::Sms);
        n.status = NotificationStatus::Sending;
        n.reference = Some("SM123".to_string());
        store.insert(&n).await.unwrap();

        let config = MemoryServiceConfigStore::new().with_callback_endpoint(CallbackEndpoint {
            service_id: n.service_id,
            url: "https://service.example/cb".to_string(),
            bearer_token: "t".to_string(),
            include_provider_payload,
        });
        let processor = ReceiptProcessor::new(
            StatusLedger::new(store),
            CallbackDispatcher::new(Arc::new(config), queue.clone()),
        );
        (processor, queue, n)
    }

    fn receipt(status: NotificationStatus) -> DeliveryReceipt {
        DeliveryReceipt {
            reference: "SM123".to_string(),
            status,
            reason: None,
            provider_payload: Some(serde_json::json!({"MessageStatus": "delivered"})),
        }
    }

    #[tokio::test]
    async fn test_duplicate_receipts_fire_one_callback() {
        let (processor, queue, _) = setup(true).await;

        let first = processor
            .process(receipt(NotificationStatus::Delivered))
            .await
            .unwrap();
        assert!(matches!(
            first,
            ReceiptOutcome::Applied {
                callback_queued: true,
                ..
            }
        ));

        let second = processor
            .process(receipt(NotificationStatus::Delivered))
            .await
            .unwrap();
        assert!(matches!(
            second,
            ReceiptOutcome::Unchanged {
                current: NotificationStatus::Delivered
            }
        ));

        let late = processor
            .process(receipt(NotificationStatus::Sent))
            .await
            .unwrap();
        assert!(matches!(late, ReceiptOutcome::Unchanged { .. }));

        let pushed = queue.pushed().await;
        assert_eq!(pushed.len(), 1);
        let Task::Callback(task) = &pushed[0].task else {
            panic!("expected callback")
        };
        assert_eq!(
            task.payload.provider_payload,
            Some(serde_json::json!({"MessageStatus": "delivered"}))
        );
    }

    #[tokio::test]
    async fn test_non_terminal_receipt_no_callback() {
        let (processor, queue, n) = setup(false).await;
        let outcome = processor
            .process(receipt(NotificationStatus::Sent))
            .await
            .unwrap();
        let ReceiptOutcome::Applied {
            notification,
            callback_queued,
        } = outcome
        else {
            panic!("expected applied")
        };
        assert_eq!(notification.id, n.id);
        assert_eq!(notification.status, NotificationStatus::Sent);
        assert!(!callback_queued);
        assert!(queue.pushed().await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_reference() {
        let (processor, _, _) = setup(false).await;
        let err = processor
            .process(DeliveryReceipt {
                reference: "nope".to_string(),
                status: NotificationStatus::Delivered,
                reason: None,
                provider_payload: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownReference(r) if r == "nope"));
    }

    #[test]
    fn test_receipt_deserializes_kebab_status() {
        let receipt: DeliveryReceipt = serde_json::from_str(
            r#"{"reference": "SM1", "status": "permanent-failure", "reason": "Unreachable"}"#,
        )
        .unwrap();
        assert_eq!(receipt.status, NotificationStatus::PermanentFailure);
        assert!(receipt.provider_payload.is_none());
    }
}
