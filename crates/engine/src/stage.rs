use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use relay_common::types::NotificationStatus;

use crate::queue::QueueName;

/// Permission check carried by a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionCheck {
    pub communication_item_id: Uuid,
    pub permission_key: String,
    /// Treat "no preference on file" as allowed.
    pub default_allow: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DispatchMode {
    Direct,
    RateLimited { sender_id: Uuid },
}

/// One asynchronous step of a delivery pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum Stage {
    ResolveIdentifierToInternalProfile,
    /// Fired alongside the main pipeline; never blocks or ends it.
    NotifyOnsiteChannel,
    LookupContactInfo { permission: Option<PermissionCheck> },
    CheckCommunicationPermission { check: PermissionCheck },
    DispatchToProvider { mode: DispatchMode },
}

impl Stage {
    pub fn kind(&self) -> StageKind {
        match self {
            Stage::ResolveIdentifierToInternalProfile => StageKind::ResolveProfile,
            Stage::NotifyOnsiteChannel => StageKind::NotifyOnsite,
            Stage::LookupContactInfo { .. } => StageKind::LookupContact,
            Stage::CheckCommunicationPermission { .. } => StageKind::CheckPermission,
            Stage::DispatchToProvider { .. } => StageKind::Dispatch,
        }
    }

    pub fn is_side_stage(&self) -> bool {
        matches!(self, Stage::NotifyOnsiteChannel)
    }
}

/// Stage discriminant used for retry accounting and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    ResolveProfile,
    NotifyOnsite,
    LookupContact,
    CheckPermission,
    Dispatch,
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageKind::ResolveProfile => write!(f, "resolve_profile"),
            StageKind::NotifyOnsite => write!(f, "notify_onsite"),
            StageKind::LookupContact => write!(f, "lookup_contact"),
            StageKind::CheckPermission => write!(f, "check_permission"),
            StageKind::Dispatch => write!(f, "dispatch"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedStage {
    pub stage: Stage,
    pub queue: QueueName,
}

/// Unit of work on a stage queue: the stage to run now plus the rest of the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTask {
    pub notification_id: Uuid,
    pub current: PlannedStage,
    pub remaining: Vec<PlannedStage>,
    /// 1-based execution count of `current`.
    pub attempt: u32,
}

impl StageTask {
    pub fn first(notification_id: Uuid, current: PlannedStage, remaining: Vec<PlannedStage>) -> Self {
        Self {
            notification_id,
            current,
            remaining,
            attempt: 1,
        }
    }

    /// The same task scheduled for its next attempt.
    pub fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt.saturating_add(1),
            ..self.clone()
        }
    }
}

/// What running a stage produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Success,
    /// Transient failure: run again after the delay, consuming an attempt.
    RetryAfter(Duration),
    /// Sender throttled: run again after the delay without consuming an attempt.
    Deferred(Duration),
    /// End the pipeline with this status.
    Terminal {
        status: NotificationStatus,
        reason: String,
    },
}
