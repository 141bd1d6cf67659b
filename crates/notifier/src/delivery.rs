//! Delivery of queued service callbacks.
//!
//! Callbacks run under their own retry policy, separate from the stage
//! attempts: a service endpoint being down for an hour must not lose the
//! notification's final status.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use relay_common::types::CallbackEndpoint;
use relay_engine::callback::{CallbackPayload, CallbackTask};
use relay_engine::classifier::{Classification, Classify};
use relay_engine::collaborators::TransportError;
use relay_engine::error::Result;
use relay_engine::retry::{Backoff, should_retry};
use relay_engine::store::ServiceConfigStore;

/// Posts one callback payload to a service endpoint.
#[async_trait]
pub trait CallbackTransport: Send + Sync {
    async fn post(
        &self,
        endpoint: &CallbackEndpoint,
        payload: &CallbackPayload,
    ) -> std::result::Result<(), TransportError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for CallbackPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 60,
            backoff: Backoff {
                base_delay: Duration::from_secs(60),
                max_delay: Duration::from_secs(3600),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryResult {
    Delivered,
    /// Re-queue `task` after `delay`.
    Retry { task: CallbackTask, delay: Duration },
    /// Given up; the callback is not sent.
    Dropped { reason: String },
}

#[derive(Clone)]
pub struct CallbackDelivery {
    config: Arc<dyn ServiceConfigStore>,
    transport: Arc<dyn CallbackTransport>,
    policy: CallbackPolicy,
}

impl CallbackDelivery {
    pub fn new(
        config: Arc<dyn ServiceConfigStore>,
        transport: Arc<dyn CallbackTransport>,
        policy: CallbackPolicy,
    ) -> Self {
        Self {
            config,
            transport,
            policy,
        }
    }

    /// Attempt one delivery of `task`.
    ///
    /// Only errors loading the endpoint propagate; everything the remote side
    /// does is folded into the result.
    pub async fn deliver(&self, task: &CallbackTask) -> Result<DeliveryResult> {
        let notification_id = task.payload.id;

        let Some(endpoint) = self.config.callback_endpoint(task.service_id).await? else {
            tracing::warn!(
                notification_id = %notification_id,
                service_id = %task.service_id,
                "Callback endpoint removed before delivery"
            );
            return Ok(DeliveryResult::Dropped {
                reason: "callback endpoint no longer registered".to_string(),
            });
        };

        let err = match self.transport.post(&endpoint, &task.payload).await {
            Ok(()) => {
                tracing::info!(
                    notification_id = %notification_id,
                    status = %task.payload.status,
                    attempt = task.attempt,
                    "Callback delivered"
                );
                return Ok(DeliveryResult::Delivered);
            }
            Err(e) => e,
        };

        let retryable = err.classify() == Classification::Retryable;
        if retryable && should_retry(task.attempt, self.policy.max_attempts) {
            let delay = self.policy.backoff.delay_for_attempt(task.attempt);
            tracing::warn!(
                notification_id = %notification_id,
                attempt = task.attempt,
                delay_secs = delay.as_secs(),
                error = %err,
                "Callback failed, will retry"
            );
            return Ok(DeliveryResult::Retry {
                task: task.next_attempt(),
                delay,
            });
        }

        let reason = if retryable {
            format!("retries exceeded after {} attempts: {}", task.attempt, err)
        } else {
            err.to_string()
        };
        tracing::error!(
            notification_id = %notification_id,
            service_id = %task.service_id,
            attempt = task.attempt,
            error = %err,
            "Callback dropped"
        );
        Ok(DeliveryResult::Dropped { reason })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    use chrono::Utc;
    use tokio::sync::Mutex;
    use uuid::Uuid;

    use relay_common::types::{ChannelType, NotificationStatus};
    use relay_engine::memory::MemoryServiceConfigStore;

    struct ScriptedTransport {
        responses: Mutex<VecDeque<std::result::Result<(), TransportError>>>,
        posted: Mutex<Vec<(String, CallbackPayload)>>,
    }

    impl ScriptedTransport {
        fn new(responses: Vec<std::result::Result<(), TransportError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                posted: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl CallbackTransport for ScriptedTransport {
        async fn post(
            &self,
            endpoint: &CallbackEndpoint,
            payload: &CallbackPayload,
        ) -> std::result::Result<(), TransportError> {
            self.posted
                .lock()
                .await
                .push((endpoint.url.clone(), payload.clone()));
            self.responses.lock().await.pop_front().unwrap_or(Ok(()))
        }
    }

    fn task(service_id: Uuid) -> CallbackTask {
        CallbackTask {
            service_id,
            payload: CallbackPayload {
                id: Uuid::new_v4(),
                reference: Some("client-ref".to_string()),
                to: Some("+15555550100".to_string()),
                status: NotificationStatus::Delivered,
                status_reason: None,
                created_at: Utc::now(),
                completed_at: Some(Utc::now()),
                sent_at: Some(Utc::now()),
                notification_type: ChannelType::Sms,
                provider: Some("gateway".to_string()),
                provider_payload: None,
            },
            attempt: 1,
        }
    }

    fn delivery(
        service_id: Uuid,
        transport: Arc<ScriptedTransport>,
        max_attempts: u32,
    ) -> CallbackDelivery {
        let config = MemoryServiceConfigStore::new().with_callback_endpoint(CallbackEndpoint {
            service_id,
            url: "https://service.example/cb".to_string(),
            bearer_token: "secret".to_string(),
            include_provider_payload: false,
        });
        CallbackDelivery::new(
            Arc::new(config),
            transport,
            CallbackPolicy {
                max_attempts,
                ..Default::default()
            },
        )
    }

    fn http(status: u16) -> TransportError {
        TransportError::Http {
            status,
            message: String::new(),
        }
    }

    #[tokio::test]
    async fn test_delivered() {
        let service_id = Uuid::new_v4();
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(())]));
        let result = delivery(service_id, transport.clone(), 60)
            .deliver(&task(service_id))
            .await
            .unwrap();
        assert_eq!(result, DeliveryResult::Delivered);

        let posted = transport.posted.lock().await;
        assert_eq!(posted.len(), 1);
        assert_eq!(posted[0].0, "https://service.example/cb");
    }

    #[tokio::test]
    async fn test_server_error_retried_with_backoff() {
        let service_id = Uuid::new_v4();
        let transport = Arc::new(ScriptedTransport::new(vec![Err(http(503))]));
        let d = delivery(service_id, transport, 60);

        let mut t = task(service_id);
        t.attempt = 3;
        let DeliveryResult::Retry { task: next, delay } = d.deliver(&t).await.unwrap() else {
            panic!("expected retry")
        };
        assert_eq!(next.attempt, 4);
        assert_eq!(next.payload, t.payload);
        assert_eq!(delay, Duration::from_secs(240));
    }

    #[tokio::test]
    async fn test_backoff_capped_at_one_hour() {
        let policy = CallbackPolicy::default();
        assert_eq!(
            policy.backoff.delay_for_attempt(30),
            Duration::from_secs(3600)
        );
    }

    #[tokio::test]
    async fn test_client_error_dropped() {
        let service_id = Uuid::new_v4();
        let transport = Arc::new(ScriptedTransport::new(vec![Err(http(404))]));
        let result = delivery(service_id, transport, 60)
            .deliver(&task(service_id))
            .await
            .unwrap();
        assert!(matches!(result, DeliveryResult::Dropped { .. }));
    }

    #[tokio::test]
    async fn test_timeout_and_rate_limit_retried() {
        let service_id = Uuid::new_v4();
        let transport = Arc::new(ScriptedTransport::new(vec![
            Err(TransportError::Timeout),
            Err(http(429)),
        ]));
        let d = delivery(service_id, transport, 60);
        for _ in 0..2 {
            assert!(matches!(
                d.deliver(&task(service_id)).await.unwrap(),
                DeliveryResult::Retry { .. }
            ));
        }
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let service_id = Uuid::new_v4();
        let transport = Arc::new(ScriptedTransport::new(vec![Err(http(500))]));
        let mut t = task(service_id);
        t.attempt = 5;
        let result = delivery(service_id, transport, 5).deliver(&t).await.unwrap();
        let DeliveryResult::Dropped { reason } = result else {
            panic!("expected drop")
        };
        assert!(reason.starts_with("retries exceeded after 5 attempts"));
    }

    #[tokio::test]
    async fn test_missing_endpoint_dropped_without_post() {
        let transport = Arc::new(ScriptedTransport::new(vec![]));
        let result = delivery(Uuid::new_v4(), transport.clone(), 60)
            .deliver(&task(Uuid::new_v4()))
            .await
            .unwrap();
        assert!(matches!(result, DeliveryResult::Dropped { .. }));
        assert!(transport.posted.lock().await.is_empty());
    }
}
