use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use relay_common::config::AppConfig;
use relay_common::types::{Notification, NotificationStatus};

use crate::error::{EngineError, Result};
use crate::planner::{PipelinePlan, PlanInput, PlannerConfig, plan};
use crate::queue::{QueueName, Task, TaskQueue};
use crate::stage::{PlannedStage, StageKind, StageTask};
use crate::store::ServiceConfigStore;

/// Per-request knobs that are not part of the notification row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    pub research_mode: bool,
    pub override_queue: Option<QueueName>,
}

/// Entry point for new notifications: plans the pipeline and queues its first stage.
#[derive(Clone)]
pub struct Pipeline {
    config: Arc<dyn ServiceConfigStore>,
    queue: Arc<dyn TaskQueue>,
    planner: PlannerConfig,
    simulated_recipients: Vec<String>,
}

impl Pipeline {
    pub fn new(
        config: Arc<dyn ServiceConfigStore>,
        queue: Arc<dyn TaskQueue>,
        planner: PlannerConfig,
    ) -> Self {
        Self {
            config,
            queue,
            planner,
            simulated_recipients: Vec::new(),
        }
    }

    pub fn from_app_config(
        config: Arc<dyn ServiceConfigStore>,
        queue: Arc<dyn TaskQueue>,
        app: &AppConfig,
    ) -> Self {
        Self::new(config, queue, PlannerConfig::from(app))
            .with_simulated_recipients(
                app.simulated_email_addresses
                    .iter()
                    .chain(app.simulated_sms_numbers.iter())
                    .cloned(),
            )
    }

    pub fn with_simulated_recipients(mut self, recipients: impl IntoIterator<Item = String>) -> Self {
        self.simulated_recipients = recipients.into_iter().collect();
        self
    }

    pub async fn enqueue(&self, notification: &Notification) -> Result<PipelinePlan> {
        self.enqueue_with(notification, &EnqueueOptions::default())
            .await
    }

    /// Plan and queue a persisted `created` notification.
    ///
    /// Errors are returned to the caller, which owns the row and decides
    /// whether to delete it.
    pub async fn enqueue_with(
        &self,
        notification: &Notification,
        options: &EnqueueOptions,
    ) -> Result<PipelinePlan> {
        if notification.status != NotificationStatus::Created {
            return Err(EngineError::Validation(format!(
                "notification {} is {}, only created notifications can be enqueued",
                notification.id, notification.status
            )));
        }

        let identifier = notification.primary_identifier();
        if notification.recipient.is_none() && identifier.is_none() {
            return Err(EngineError::Validation(format!(
                "notification {} has neither a recipient nor a recipient identifier",
                notification.id
            )));
        }

        let communication_item = match notification.communication_item_id {
            Some(id) => Some(self.config.communication_item(id).await?.ok_or_else(|| {
                EngineError::Config(format!("communication item {} does not exist", id))
            })?),
            None => None,
        };

        let sender_rate_limit = match notification.sms_sender_id {
            Some(sender_id) => self.config.sender_rate_limit(sender_id).await?,
            None => None,
        };

        let simulated_recipient = notification
            .recipient
            .as_deref()
            .is_some_and(|to| self.is_simulated(to));

        let input = PlanInput {
            channel: notification.notification_type,
            has_recipient: notification.recipient.is_some(),
            identifier_type: identifier.map(|i| i.id_type),
            communication_item,
            sender_rate_limit,
            key_type: notification.key_type,
            research_mode: options.research_mode,
            simulated_recipient,
            override_queue: options.override_queue,
        };

        let plan = plan(&self.planner, &input);
        schedule_stages(self.queue.as_ref(), notification.id, plan.stages.clone()).await?;

        tracing::info!(
            notification_id = %notification.id,
            stages = plan.stages.len(),
            dispatch_queue = %plan.dispatch_queue,
            "Notification pipeline planned"
        );
        Ok(plan)
    }

    fn is_simulated(&self, recipient: &str) -> bool {
        self.simulated_recipients
            .iter()
            .any(|simulated| simulated.eq_ignore_ascii_case(recipient))
    }
}

/// Queue the next step of a pipeline.
///
/// Leading side stages are queued on their own with no continuation, then the
/// first main stage is queued carrying everything after it. Returns the kind
/// of the main stage queued, or `None` when the pipeline is finished.
pub async fn schedule_stages(
    queue: &dyn TaskQueue,
    notification_id: Uuid,
    stages: Vec<PlannedStage>,
) -> Result<Option<StageKind>> {
    let mut stages = stages.into_iter();

    while let Some(next) = stages.next() {
        if next.stage.is_side_stage() {
            let side_queue = next.queue;
            let kind = next.stage.kind();
            let task = StageTask::first(notification_id, next, Vec::new());
            if let Err(e) = queue
                .push(side_queue, Task::Stage(task), Duration::ZERO)
                .await
            {
                tracing::warn!(
                    notification_id = %notification_id,
                    stage = %kind,
                    error = %e,
                    "Failed to queue side stage"
                );
            }
            continue;
        }

        let kind = next.stage.kind();
        let main_queue = next.queue;
        let task = StageTask::first(notification_id, next, stages.collect());
        queue
            .push(main_queue, Task::Stage(task), Duration::ZERO)
            .await?;
        return Ok(Some(kind));
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryServiceConfigStore, MemoryTaskQueue};
    use crate::stage::{DispatchMode, Stage};
    use relay_common::types::{ChannelType, CommunicationItem, IdentifierType, SenderRateLimit};

    fn pipeline(config: MemoryServiceConfigStore, queue: Arc<MemoryTaskQueue>) -> Pipeline {
        Pipeline::new(
            Arc::new(config),
            queue,
            PlannerConfig {
                combine_contact_and_permission_lookup: false,
                check_communication_permissions: true,
                apply_sender_rate_limit: true,
                notify_onsite: true,
            },
        )
        .with_simulated_recipients(["+16132532222".to_string()])
    }

    #[tokio::test]
    async fn test_enqueue_queues_first_main_stage_with_rest() {
        let item = CommunicationItem {
            id: Uuid::new_v4(),
            name: "Reminders".to_string(),
            permission_key: "reminders".to_string(),
            default_allow: true,
        };
        let limit = SenderRateLimit {
            sender_id: Uuid::new_v4(),
            rate_limit: 5,
            rate_limit_interval_secs: 1,
        };
        let config = MemoryServiceConfigStore::new()
            .with_communication_item(item.clone())
            .with_sender_rate_limit(limit.clone());
        let queue = Arc::new(MemoryTaskQueue::new());

        let n = Notification::new(Uuid::new_v4(), ChannelType::Sms, Uuid::new_v4())
            .with_identifier(IdentifierType::Icn, "1008596379V859838")
            .with_communication_item(item.id)
            .with_sms_sender(limit.sender_id);

        let plan = pipeline(config, queue.clone()).enqueue(&n).await.unwrap();
        assert_eq!(plan.stages.len(), 5);

        let pushed = queue.pushed().await;
        assert_eq!(pushed.len(), 1);
        assert_eq!(pushed[0].queue, QueueName::LookupProfileId);
        let Task::Stage(task) = &pushed[0].task else {
            panic!("expected stage task")
        };
        assert_eq!(task.notification_id, n.id);
        assert_eq!(task.attempt, 1);
        assert_eq!(task.current.stage, Stage::ResolveIdentifierToInternalProfile);
        assert_eq!(task.remaining.len(), 4);
    }

    #[tokio::test]
    async fn test_schedule_fires_side_stage_then_main() {
        let queue = MemoryTaskQueue::new();
        let id = Uuid::new_v4();
        let stages = vec![
            PlannedStage {
                stage: Stage::NotifyOnsiteChannel,
                queue: QueueName::OnsiteNotifications,
            },
            PlannedStage {
                stage: Stage::LookupContactInfo { permission: None },
                queue: QueueName::LookupContactInfo,
            },
            PlannedStage {
                stage: Stage::DispatchToProvider {
                    mode: DispatchMode::Direct,
                },
                queue: QueueName::SendSms,
            },
        ];

        let next = schedule_stages(&queue, id, stages).await.unwrap();
        assert_eq!(next, Some(StageKind::LookupContact));

        let pushed = queue.pushed().await;
        assert_eq!(pushed.len(), 2);
        assert_eq!(pushed[0].queue, QueueName::OnsiteNotifications);
        let Task::Stage(side) = &pushed[0].task else {
            panic!("expected stage task")
        };
        assert!(side.remaining.is_empty());
        let Task::Stage(main) = &pushed[1].task else {
            panic!("expected stage task")
        };
        assert_eq!(main.remaining.len(), 1);

        assert_eq!(schedule_stages(&queue, id, Vec::new()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_simulated_recipient_goes_to_research_queue() {
        let queue = Arc::new(MemoryTaskQueue::new());
        let n = Notification::new(Uuid::new_v4(), ChannelType::Sms, Uuid::new_v4())
            .with_recipient("+16132532222");

        let plan = pipeline(MemoryServiceConfigStore::new(), queue.clone())
            .enqueue(&n)
            .await
            .unwrap();
        assert_eq!(plan.dispatch_queue, QueueName::ResearchMode);
        assert_eq!(queue.pushed().await[0].queue, QueueName::ResearchMode);
    }

    #[tokio::test]
    async fn test_enqueue_rejects_unaddressable_and_non_created() {
        let queue = Arc::new(MemoryTaskQueue::new());
        let p = pipeline(MemoryServiceConfigStore::new(), queue.clone());

        let bare = Notification::new(Uuid::new_v4(), ChannelType::Email, Uuid::new_v4());
        assert!(matches!(
            p.enqueue(&bare).await.unwrap_err(),
            EngineError::Validation(_)
        ));

        let mut sent = bare.with_recipient("a@b.c");
        sent.status = NotificationStatus::Sending;
        assert!(matches!(
            p.enqueue(&sent).await.unwrap_err(),
            EngineError::Validation(_)
        ));

        let missing_item = Notification::new(Uuid::new_v4(), ChannelType::Email, Uuid::new_v4())
            .with_recipient("a@b.c")
            .with_communication_item(Uuid::new_v4());
        assert!(matches!(
            p.enqueue(&missing_item).await.unwrap_err(),
            EngineError::Config(_)
        ));
        assert!(queue.pushed().await.is_empty());
    }
}
