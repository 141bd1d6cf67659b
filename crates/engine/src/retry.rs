//! Attempt accounting and capped exponential backoff for pipeline stages.

use std::time::Duration;

use relay_common::config::AppConfig;
use relay_common::types::NotificationStatus;

use crate::classifier::Classification;
use crate::stage::{StageKind, StageOutcome};

/// `status_reason` written when a retryable failure runs out of attempts.
pub const RETRIES_EXCEEDED: &str = "Retries exceeded";

/// `attempt` is the number of executions so far, 1-based.
pub fn should_retry(attempt: u32, max_attempts: u32) -> bool {
    attempt < max_attempts
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Backoff {
    /// `base * 2^(attempt-1)`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        // Shifts of 32 or more saturate instead of overflowing.
        let multiplier = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

/// Per-stage maximum attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageAttempts {
    pub resolve_profile: u32,
    pub lookup_contact: u32,
    pub check_permission: u32,
    pub dispatch: u32,
    pub notify_onsite: u32,
}

impl Default for StageAttempts {
    fn default() -> Self {
        Self {
            resolve_profile: 48,
            lookup_contact: 2886,
            check_permission: 5,
            dispatch: 2886,
            notify_onsite: 1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryConfig {
    pub backoff: Backoff,
    pub attempts: StageAttempts,
}

impl From<&AppConfig> for RetryConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            backoff: Backoff {
                base_delay: Duration::from_millis(config.retry_base_delay_ms),
                max_delay: Duration::from_secs(config.retry_max_delay_secs),
            },
            attempts: StageAttempts {
                resolve_profile: config.max_attempts_resolve_profile,
                lookup_contact: config.max_attempts_lookup_contact,
                check_permission: config.max_attempts_check_permission,
                dispatch: config.max_attempts_dispatch,
                notify_onsite: config.max_attempts_notify_onsite,
            },
        }
    }
}

impl RetryConfig {
    pub fn max_attempts(&self, kind: StageKind) -> u32 {
        match kind {
            StageKind::ResolveProfile => self.attempts.resolve_profile,
            StageKind::LookupContact => self.attempts.lookup_contact,
            StageKind::CheckPermission => self.attempts.check_permission,
            StageKind::Dispatch => self.attempts.dispatch,
            StageKind::NotifyOnsite => self.attempts.notify_onsite,
        }
    }

    /// Turn a classified failure into the outcome the executor acts on.
    pub fn resolve(
        &self,
        kind: StageKind,
        classification: Classification,
        reason: String,
        attempt: u32,
    ) -> StageOutcome {
        match classification {
            Classification::Retryable if should_retry(attempt, self.max_attempts(kind)) => {
                StageOutcome::RetryAfter(self.backoff.delay_for_attempt(attempt))
            }
            Classification::Retryable => StageOutcome::Terminal {
                status: NotificationStatus::TechnicalFailure,
                reason: RETRIES_EXCEEDED.to_string(),
            },
            Classification::NonRetryable
            | Classification::Permanent
            | Classification::NoContactInfo => StageOutcome::Terminal {
                status: NotificationStatus::PermanentFailure,
                reason,
            },
            Classification::PreferencesDeclined => StageOutcome::Terminal {
                status: NotificationStatus::PreferencesDeclined,
                reason,
            },
        }
    }
}
