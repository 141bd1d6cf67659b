//! Periodic force-transition of notifications stuck in a transient status.

use std::time::Duration;

use chrono::Utc;

use relay_common::types::NotificationStatus;

use crate::callback::CallbackDispatcher;
use crate::error::Result;
use crate::ledger::{StatusChange, StatusLedger};

/// Rows examined per sweep pass.
const SWEEP_BATCH: i64 = 500;

pub const NEVER_SENT_REASON: &str = "Notification was never sent to the provider";
pub const NO_RECEIPT_REASON: &str = "No delivery receipt received before timeout";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub examined: usize,
    pub technical_failures: usize,
    pub temporary_failures: usize,
    /// Rows that moved on before the sweep got to them.
    pub skipped: usize,
}

#[derive(Clone)]
pub struct TimeoutSweep {
    ledger: StatusLedger,
    callbacks: CallbackDispatcher,
    timeout: Duration,
}

impl TimeoutSweep {
    pub fn new(ledger: StatusLedger, callbacks: CallbackDispatcher, timeout: Duration) -> Self {
        Self {
            ledger,
            callbacks,
            timeout,
        }
    }

    /// The status a stuck notification is moved to, with its reason.
    pub fn target_for(status: NotificationStatus) -> Option<(NotificationStatus, &'static str)> {
        match status {
            NotificationStatus::Created => {
                Some((NotificationStatus::TechnicalFailure, NEVER_SENT_REASON))
            }
            NotificationStatus::Sending | NotificationStatus::Pending => {
                Some((NotificationStatus::TemporaryFailure, NO_RECEIPT_REASON))
            }
            _ => None,
        }
    }

    /// One pass over notifications older than the timeout.
    ///
    /// Every write goes through the ledger, so a row that reached a final
    /// status concurrently is left alone.
    pub async fn run_once(&self) -> Result<SweepSummary> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.timeout).unwrap_or(chrono::Duration::zero());
        let stale = self
            .ledger
            .store()
            .find_stale(
                &[
                    NotificationStatus::Created,
                    NotificationStatus::Sending,
                    NotificationStatus::Pending,
                ],
                cutoff,
                SWEEP_BATCH,
            )
            .await?;

        let mut summary = SweepSummary {
            examined: stale.len(),
            ..Default::default()
        };

        for notification in stale {
            let Some((target, reason)) = Self::target_for(notification.status) else {
                summary.skipped += 1;
                continue;
            };

            let update = match self
                .ledger
                .apply_status(
                    notification.id,
                    StatusChange::new(target).with_reason(reason),
                )
                .await
            {
                Ok(update) => update,
                Err(e) => {
                    tracing::warn!(
                        notification_id = %notification.id,
                        error = %e,
                        "Timeout sweep could not transition notification"
                    );
                    summary.skipped += 1;
                    continue;
                }
            };

            match update.changed().map(|n| n.status) {
                Some(NotificationStatus::TechnicalFailure) => summary.technical_failures += 1,
                Some(NotificationStatus::TemporaryFailure) => summary.temporary_failures += 1,
                _ => summary.skipped += 1,
            }
            self.callbacks.dispatch_if_terminal(&update, None).await;
        }

        if summary.examined > 0 {
            tracing::info!(
                examined = summary.examined,
                technical_failures = summary.technical_failures,
                temporary_failures = summary.temporary_failures,
                skipped = summary.skipped,
                "Timeout sweep finished"
            );
        }
        Ok(summary)
    }
}
