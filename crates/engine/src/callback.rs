//! Service callbacks on terminal status transitions.
//!
//! Only the enqueue half lives here. HTTP delivery of queued callbacks is
//! done by `relay-notifier`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use relay_common::types::{ChannelType, Notification, NotificationStatus};

use crate::ledger::StatusUpdate;
use crate::queue::{QueueName, Task, TaskQueue};
use crate::store::ServiceConfigStore;

/// JSON body posted to a service's callback endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackPayload {
    pub id: Uuid,
    pub reference: Option<String>,
    pub to: Option<String>,
    pub status: NotificationStatus,
    pub status_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub notification_type: ChannelType,
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_payload: Option<serde_json::Value>,
}

impl CallbackPayload {
    pub fn from_notification(
        notification: &Notification,
        provider_payload: Option<serde_json::Value>,
    ) -> Self {
        let completed_at = if notification.status.is_terminal() {
            notification.updated_at
        } else {
            None
        };

        Self {
            id: notification.id,
            reference: notification.client_reference.clone(),
            to: notification.recipient.clone(),
            status: notification.status,
            status_reason: notification.status_reason.clone(),
            created_at: notification.created_at,
            completed_at,
            sent_at: notification.sent_at,
            notification_type: notification.notification_type,
            provider: notification.sent_by.clone(),
            provider_payload,
        }
    }
}

/// Queued callback delivery. The endpoint is looked up at delivery time so
/// rotated credentials apply to callbacks already in flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackTask {
    pub service_id: Uuid,
    pub payload: CallbackPayload,
    /// 1-based delivery attempt.
    pub attempt: u32,
}

impl CallbackTask {
    pub fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt.saturating_add(1),
            ..self.clone()
        }
    }
}

#[derive(Clone)]
pub struct CallbackDispatcher {
    config: Arc<dyn ServiceConfigStore>,
    queue: Arc<dyn TaskQueue>,
}

impl CallbackDispatcher {
    pub fn new(config: Arc<dyn ServiceConfigStore>, queue: Arc<dyn TaskQueue>) -> Self {
        Self { config, queue }
    }

    /// Enqueue a callback if `update` moved the notification into a terminal
    /// status. Returns whether a callback was queued.
    ///
    /// Failures are logged; the status write that triggered the callback stands.
    pub async fn dispatch_if_terminal(
        &self,
        update: &StatusUpdate,
        provider_payload: Option<serde_json::Value>,
    ) -> bool {
        let Some(notification) = update.changed() else {
            return false;
        };
        if !notification.status.is_terminal() {
            return false;
        }

        let endpoint = match self.config.callback_endpoint(notification.service_id).await {
            Ok(Some(endpoint)) => endpoint,
            Ok(None) => {
                tracing::debug!(
                    notification_id = %notification.id,
                    service_id = %notification.service_id,
                    "No callback endpoint registered"
                );
                return false;
            }
            Err(e) => {
                tracing::error!(
                    notification_id = %notification.id,
                    error = %e,
                    "Failed to load callback endpoint"
                );
                return false;
            }
        };

        let provider_payload = provider_payload.filter(|_| endpoint.include_provider_payload);
        let task = CallbackTask {
            service_id: notification.service_id,
            payload: CallbackPayload::from_notification(notification, provider_payload),
            attempt: 1,
        };

        match self
            .queue
            .push(QueueName::ServiceCallbacks, Task::Callback(task), Duration::ZERO)
            .await
        {
            Ok(task_id) => {
                tracing::info!(
                    notification_id = %notification.id,
                    status = %notification.status,
                    task_id = %task_id,
                    "Callback enqueued"
                );
                true
            }
            Err(e) => {
                tracing::error!(
                    notification_id = %notification.id,
                    status = %notification.status,
                    error = %e,
                    "Failed to enqueue callback"
                );
                false
            }
        }
    }
}
