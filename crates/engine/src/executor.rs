//! Stage execution.
//!
//! Every stage returns a [`StageOutcome`] and the executor consumes it the
//! same way regardless of which stage produced it: success queues the rest of
//! the pipeline, retries and deferrals re-queue the same task with a delay,
//! and a terminal outcome goes through the ledger and drops what remains.

use std::sync::Arc;
use std::time::Duration;

use relay_common::types::{IdentifierType, Notification, NotificationStatus, RecipientIdentifier};

use crate::callback::CallbackDispatcher;
use crate::classifier::{Classification, Classify};
use crate::collaborators::{Collaborators, ContactLookupError, PermissionDecision, PermissionError};
use crate::error::Result;
use crate::ledger::{StatusChange, StatusLedger, StatusUpdate};
use crate::pipeline::schedule_stages;
use crate::queue::{QueueName, Task, TaskQueue};
use crate::rate_limit::RateLimiter;
use crate::retry::RetryConfig;
use crate::stage::{DispatchMode, PermissionCheck, Stage, StageKind, StageOutcome, StageTask};
use crate::store::ServiceConfigStore;

/// What executing a task did, for logging and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageReport {
    /// Nothing ran: the notification is final or no longer eligible.
    Skipped { reason: String },
    /// Stage succeeded; `next` is the main stage queued after it, if any.
    Advanced { next: Option<StageKind> },
    Retrying { attempt: u32, delay: Duration },
    Deferred { delay: Duration },
    Terminated {
        status: NotificationStatus,
        applied: bool,
    },
}

#[derive(Clone)]
pub struct StageExecutor {
    ledger: StatusLedger,
    config: Arc<dyn ServiceConfigStore>,
    queue: Arc<dyn TaskQueue>,
    collaborators: Collaborators,
    rate_limiter: Arc<dyn RateLimiter>,
    retry: RetryConfig,
    callbacks: CallbackDispatcher,
}

impl StageExecutor {
    pub fn new(
        ledger: StatusLedger,
        config: Arc<dyn ServiceConfigStore>,
        queue: Arc<dyn TaskQueue>,
        collaborators: Collaborators,
        rate_limiter: Arc<dyn RateLimiter>,
        retry: RetryConfig,
    ) -> Self {
        let callbacks = CallbackDispatcher::new(config.clone(), queue.clone());
        Self {
            ledger,
            config,
            queue,
            collaborators,
            rate_limiter,
            retry,
            callbacks,
        }
    }

    pub fn ledger(&self) -> &StatusLedger {
        &self.ledger
    }

    pub fn callbacks(&self) -> &CallbackDispatcher {
        &self.callbacks
    }

    /// Run one stage task.
    ///
    /// Infrastructure errors propagate; the caller re-queues the task.
    pub async fn execute(&self, task: StageTask) -> Result<StageReport> {
        let kind = task.current.stage.kind();

        let Some(notification) = self.ledger.get_by_id(task.notification_id).await? else {
            // The row may not be visible yet; retry like any transient failure.
            return match self.retry.resolve(
                kind,
                Classification::Retryable,
                "Notification not found".to_string(),
                task.attempt,
            ) {
                StageOutcome::RetryAfter(delay) => self.retry_later(task, delay).await,
                _ => {
                    tracing::error!(
                        notification_id = %task.notification_id,
                        stage = %kind,
                        attempt = task.attempt,
                        "Notification never appeared, dropping task"
                    );
                    Ok(StageReport::Skipped {
                        reason: "notification not found".to_string(),
                    })
                }
            };
        };

        if notification.status.is_final() {
            tracing::debug!(
                notification_id = %notification.id,
                status = %notification.status,
                stage = %kind,
                "Skipping stage for final notification"
            );
            return Ok(StageReport::Skipped {
                reason: format!("notification is {}", notification.status),
            });
        }

        if !task.current.stage.is_side_stage()
            && notification.status != NotificationStatus::Created
        {
            tracing::warn!(
                notification_id = %notification.id,
                status = %notification.status,
                stage = %kind,
                "Skipping stage, notification already left created"
            );
            return Ok(StageReport::Skipped {
                reason: format!("notification is {}", notification.status),
            });
        }

        let outcome = match &task.current.stage {
            Stage::ResolveIdentifierToInternalProfile => {
                self.resolve_profile(&notification, task.attempt).await?
            }
            Stage::NotifyOnsiteChannel => self.notify_onsite(&notification, task.attempt).await,
            Stage::LookupContactInfo { permission } => {
                self.lookup_contact(&notification, permission.as_ref(), task.attempt)
                    .await?
            }
            Stage::CheckCommunicationPermission { check } => {
                self.check_permission(&notification, check, task.attempt)
                    .await
            }
            Stage::DispatchToProvider { mode } => {
                self.dispatch(&notification, mode, task.current.queue, task.attempt)
                    .await?
            }
        };

        self.consume(task, outcome).await
    }

    async fn consume(&self, task: StageTask, outcome: StageOutcome) -> Result<StageReport> {
        let kind = task.current.stage.kind();

        match outcome {
            StageOutcome::Success => {
                let next =
                    schedule_stages(self.queue.as_ref(), task.notification_id, task.remaining)
                        .await?;
                tracing::debug!(
                    notification_id = %task.notification_id,
                    stage = %kind,
                    next = ?next,
                    "Stage completed"
                );
                Ok(StageReport::Advanced { next })
            }
            StageOutcome::RetryAfter(delay) => self.retry_later(task, delay).await,
            StageOutcome::Deferred(delay) => {
                let notification_id = task.notification_id;
                self.queue
                    .push(QueueName::RateLimitRetry, Task::Stage(task), delay)
                    .await?;
                tracing::debug!(
                    notification_id = %notification_id,
                    delay_ms = delay.as_millis() as u64,
                    "Dispatch deferred by sender rate limit"
                );
                Ok(StageReport::Deferred { delay })
            }
            StageOutcome::Terminal { status, reason } => {
                if status == NotificationStatus::PreferencesDeclined {
                    tracing::info!(
                        notification_id = %task.notification_id,
                        stage = %kind,
                        reason = %reason,
                        "Recipient declined this communication"
                    );
                } else {
                    tracing::warn!(
                        notification_id = %task.notification_id,
                        stage = %kind,
                        status = %status,
                        reason = %reason,
                        "Pipeline ended"
                    );
                }

                let update = self
                    .ledger
                    .apply_status(
                        task.notification_id,
                        StatusChange::new(status).with_reason(reason),
                    )
                    .await?;
                self.callbacks.dispatch_if_terminal(&update, None).await;

                let stored = match &update {
                    StatusUpdate::Applied { notification, .. } => notification.status,
                    StatusUpdate::Ignored { current, .. } => *current,
                };
                Ok(StageReport::Terminated {
                    status: stored,
                    applied: update.is_applied(),
                })
            }
        }
    }

    async fn retry_later(&self, task: StageTask, delay: Duration) -> Result<StageReport> {
        let next = task.next_attempt();
        let attempt = next.attempt;
        tracing::info!(
            notification_id = %task.notification_id,
            stage = %task.current.stage.kind(),
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Retrying stage"
        );
        self.queue
            .push(QueueName::Retry, Task::Stage(next), delay)
            .await?;
        Ok(StageReport::Retrying { attempt, delay })
    }

    fn failure<E: Classify>(&self, kind: StageKind, err: &E, attempt: u32) -> StageOutcome {
        self.retry
            .resolve(kind, err.classify(), err.failure_reason(), attempt)
    }

    async fn resolve_profile(
        &self,
        notification: &Notification,
        attempt: u32,
    ) -> Result<StageOutcome> {
        let Some(identifier) = notification
            .primary_identifier()
            .filter(|i| i.id_type.requires_indirection())
        else {
            if notification.identifier(IdentifierType::ProfileId).is_some() {
                return Ok(StageOutcome::Success);
            }
            return Ok(self.retry.resolve(
                StageKind::ResolveProfile,
                Classification::NonRetryable,
                "No recipient identifier to resolve".to_string(),
                attempt,
            ));
        };

        match self
            .collaborators
            .profiles
            .resolve_profile_id(identifier)
            .await
        {
            Ok(profile_id) => {
                self.ledger
                    .store()
                    .add_identifier(&RecipientIdentifier {
                        notification_id: notification.id,
                        id_type: IdentifierType::ProfileId,
                        id_value: profile_id,
                    })
                    .await?;
                tracing::info!(
                    notification_id = %notification.id,
                    id_type = %identifier.id_type,
                    "Resolved recipient profile"
                );
                Ok(StageOutcome::Success)
            }
            Err(e) => {
                tracing::warn!(
                    notification_id = %notification.id,
                    id_type = %identifier.id_type,
                    error = %e,
                    "Profile lookup failed"
                );
                Ok(self.failure(StageKind::ResolveProfile, &e, attempt))
            }
        }
    }

    async fn lookup_contact(
        &self,
        notification: &Notification,
        permission: Option<&PermissionCheck>,
        attempt: u32,
    ) -> Result<StageOutcome> {
        let Some(profile) = notification.identifier(IdentifierType::ProfileId) else {
            return Ok(self.retry.resolve(
                StageKind::LookupContact,
                Classification::NonRetryable,
                "Recipient has no profile id".to_string(),
                attempt,
            ));
        };

        let info = match self
            .collaborators
            .contacts
            .lookup(
                profile,
                notification.notification_type,
                permission.map(|p| p.permission_key.as_str()),
            )
            .await
        {
            Ok(info) => info,
            Err(e) => {
                if matches!(e, ContactLookupError::NoContactInfo) {
                    tracing::info!(
                        notification_id = %notification.id,
                        channel = %notification.notification_type,
                        "No contact information for recipient"
                    );
                } else {
                    tracing::warn!(
                        notification_id = %notification.id,
                        error = %e,
                        "Contact lookup failed"
                    );
                }
                return Ok(self.failure(StageKind::LookupContact, &e, attempt));
            }
        };

        self.ledger
            .store()
            .set_recipient(notification.id, &info.address)
            .await?;

        if let Some(check) = permission {
            let outcome = match info.permission {
                Some(decision) => self.permission_outcome(StageKind::LookupContact, decision, attempt),
                None => self.no_preference_outcome(
                    notification,
                    StageKind::LookupContact,
                    check,
                    attempt,
                ),
            };
            return Ok(outcome);
        }

        Ok(StageOutcome::Success)
    }

    async fn check_permission(
        &self,
        notification: &Notification,
        check: &PermissionCheck,
        attempt: u32,
    ) -> StageOutcome {
        let Some(profile) = notification.identifier(IdentifierType::ProfileId) else {
            return self.retry.resolve(
                StageKind::CheckPermission,
                Classification::NonRetryable,
                "Recipient has no profile id".to_string(),
                attempt,
            );
        };

        match self
            .collaborators
            .permissions
            .is_allowed(profile, notification.notification_type, &check.permission_key)
            .await
        {
            Ok(decision) => self.permission_outcome(StageKind::CheckPermission, decision, attempt),
            Err(PermissionError::NoPreferenceOnFile) => self.no_preference_outcome(
                notification,
                StageKind::CheckPermission,
                check,
                attempt,
            ),
            Err(e) => {
                tracing::warn!(
                    notification_id = %notification.id,
                    permission_key = %check.permission_key,
                    error = %e,
                    "Permission check failed"
                );
                self.failure(StageKind::CheckPermission, &e, attempt)
            }
        }
    }

    fn permission_outcome(
        &self,
        kind: StageKind,
        decision: PermissionDecision,
        attempt: u32,
    ) -> StageOutcome {
        if decision.allowed {
            return StageOutcome::Success;
        }
        self.retry.resolve(
            kind,
            Classification::PreferencesDeclined,
            decision
                .reason
                .unwrap_or_else(|| "Recipient opted out of this communication".to_string()),
            attempt,
        )
    }

    fn no_preference_outcome(
        &self,
        notification: &Notification,
        kind: StageKind,
        check: &PermissionCheck,
        attempt: u32,
    ) -> StageOutcome {
        if check.default_allow {
            tracing::debug!(
                notification_id = %notification.id,
                permission_key = %check.permission_key,
                "No preference on file, communication item allows by default"
            );
            return StageOutcome::Success;
        }
        self.failure(kind, &PermissionError::NoPreferenceOnFile, attempt)
    }

    async fn dispatch(
        &self,
        notification: &Notification,
        mode: &DispatchMode,
        queue: QueueName,
        attempt: u32,
    ) -> Result<StageOutcome> {
        if notification.recipient.is_none() {
            return Ok(self.retry.resolve(
                StageKind::Dispatch,
                Classification::NonRetryable,
                "No recipient address".to_string(),
                attempt,
            ));
        }

        if let DispatchMode::RateLimited { sender_id } = mode {
            if let Some(limit) = self.config.sender_rate_limit(*sender_id).await? {
                if !self.rate_limiter.try_acquire(&limit).await? {
                    return Ok(StageOutcome::Deferred(limit.retry_after()));
                }
            }
        }

        let provider = self.collaborators.provider_for(queue);
        match provider.send(notification).await {
            Ok(reference) => {
                let update = self
                    .ledger
                    .apply_status(
                        notification.id,
                        StatusChange::new(NotificationStatus::Sending)
                            .with_sent_by(provider.name())
                            .with_reference(reference.clone()),
                    )
                    .await?;
                tracing::info!(
                    notification_id = %notification.id,
                    provider = provider.name(),
                    reference = %reference,
                    applied = update.is_applied(),
                    "Notification handed to provider"
                );
                Ok(StageOutcome::Success)
            }
            Err(e) => {
                tracing::warn!(
                    notification_id = %notification.id,
                    provider = provider.name(),
                    attempt,
                    error = %e,
                    "Provider send failed"
                );
                Ok(self.failure(StageKind::Dispatch, &e, attempt))
            }
        }
    }

    /// Best effort: failures are logged and never end the pipeline.
    async fn notify_onsite(&self, notification: &Notification, attempt: u32) -> StageOutcome {
        let Some(identifier) = notification
            .recipient_identifiers
            .iter()
            .find(|i| i.id_type.supports_onsite())
        else {
            return StageOutcome::Success;
        };

        match self
            .collaborators
            .onsite
            .notify(identifier, notification.template_id)
            .await
        {
            Ok(()) => StageOutcome::Success,
            Err(e) => match self.failure(StageKind::NotifyOnsite, &e, attempt) {
                retry @ StageOutcome::RetryAfter(_) => retry,
                _ => {
                    tracing::warn!(
                        notification_id = %notification.id,
                        error = %e,
                        "Onsite notification failed"
                    );
                    StageOutcome::Success
                }
            },
        }
    }
}
