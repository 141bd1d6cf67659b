//! Status ledger: the single choke point for notification status writes.
//!
//! Statuses move forward through a lattice. Transient statuses carry a rank
//! and an update may never move a notification to a lower rank; final
//! statuses are never overwritten. The one rewrite is a permanent failure
//! reported while the notification is `pending`, which is stored as a
//! temporary failure because the carrier may still deliver.
//!
//! Writes are read, decide, compare-and-set. Losing the compare-and-set to a
//! concurrent writer re-reads and re-decides, so two receipts racing for the
//! same row can never both win with stale decisions.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use relay_common::types::{Notification, NotificationStatus};

use crate::error::{EngineError, Result};
use crate::store::NotificationStore;

/// Bound on compare-and-set retries before giving up with `Contention`.
const MAX_CAS_ATTEMPTS: usize = 8;

/// Position of a transient status in the forward order. Final statuses have no rank.
pub fn transient_rank(status: NotificationStatus) -> Option<u8> {
    match status {
        NotificationStatus::Created => Some(0),
        NotificationStatus::Sending | NotificationStatus::PendingVirusCheck => Some(1),
        NotificationStatus::Pending => Some(2),
        NotificationStatus::Sent | NotificationStatus::TemporaryFailure => Some(3),
        _ => None,
    }
}

/// Why an update was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// The notification already reached a final status.
    AlreadyFinal,
    /// The attempted status is behind the current one.
    Regression,
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::AlreadyFinal => write!(f, "already final"),
            Rejection::Regression => write!(f, "regression"),
        }
    }
}

/// Outcome of the pure transition decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Store this status (may differ from the attempted one).
    Apply(NotificationStatus),
    Reject(Rejection),
}

/// Decide whether `attempted` may replace `current`.
pub fn decide(current: NotificationStatus, attempted: NotificationStatus) -> Transition {
    if current.is_final() {
        return Transition::Reject(Rejection::AlreadyFinal);
    }

    if current == NotificationStatus::Pending && attempted == NotificationStatus::PermanentFailure
    {
        return Transition::Apply(NotificationStatus::TemporaryFailure);
    }

    if attempted.is_final() {
        return Transition::Apply(attempted);
    }

    match (transient_rank(current), transient_rank(attempted)) {
        (Some(from), Some(to)) if to >= from => Transition::Apply(attempted),
        _ => Transition::Reject(Rejection::Regression),
    }
}

/// A requested status write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub status: NotificationStatus,
    pub reason: Option<String>,
    pub sent_by: Option<String>,
    pub reference: Option<String>,
}

impl StatusChange {
    pub fn new(status: NotificationStatus) -> Self {
        Self {
            status,
            reason: None,
            sent_by: None,
            reference: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_sent_by(mut self, provider: impl Into<String>) -> Self {
        self.sent_by = Some(provider.into());
        self
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }
}

/// Result of `StatusLedger::apply_status`.
#[derive(Debug, Clone)]
pub enum StatusUpdate {
    Applied {
        previous: NotificationStatus,
        notification: Notification,
    },
    /// Duplicate or late update; nothing was written.
    Ignored {
        current: NotificationStatus,
        attempted: NotificationStatus,
        rejection: Rejection,
    },
}

impl StatusUpdate {
    pub fn is_applied(&self) -> bool {
        matches!(self, StatusUpdate::Applied { .. })
    }

    /// The stored notification when the write was applied and moved the status.
    pub fn changed(&self) -> Option<&Notification> {
        match self {
            StatusUpdate::Applied {
                previous,
                notification,
            } if *previous != notification.status => Some(notification),
            _ => None,
        }
    }
}

/// Authoritative status record for notifications.
#[derive(Clone)]
pub struct StatusLedger {
    store: Arc<dyn NotificationStore>,
}

impl StatusLedger {
    pub fn new(store: Arc<dyn NotificationStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn NotificationStore> {
        &self.store
    }

    /// Apply a status change if the lattice allows it.
    ///
    /// Rejected updates are `Ok(StatusUpdate::Ignored)`, never errors.
    pub async fn apply_status(&self, id: Uuid, change: StatusChange) -> Result<StatusUpdate> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self
                .store
                .get_status(id)
                .await?
                .ok_or(EngineError::NotFound(id))?;

            let target = match decide(current, change.status) {
                Transition::Apply(target) => target,
                Transition::Reject(rejection) => {
                    tracing::warn!(
                        notification_id = %id,
                        current = %current,
                        attempted = %change.status,
                        rejection = %rejection,
                        "Ignoring duplicate or late status update"
                    );
                    return Ok(StatusUpdate::Ignored {
                        current,
                        attempted: change.status,
                        rejection,
                    });
                }
            };

            if let Some(notification) = self
                .store
                .compare_and_set_status(id, current, target, &change, Utc::now())
                .await?
            {
                if target != change.status {
                    tracing::info!(
                        notification_id = %id,
                        attempted = %change.status,
                        stored = %target,
                        "Downgraded status while pending"
                    );
                }
                tracing::info!(
                    notification_id = %id,
                    from = %current,
                    to = %target,
                    "Notification status updated"
                );
                return Ok(StatusUpdate::Applied {
                    previous: current,
                    notification,
                });
            }

            tracing::debug!(
                notification_id = %id,
                expected = %current,
                "Status changed underneath update, re-reading"
            );
        }

        Err(EngineError::Contention(id))
    }

    pub async fn get_by_id(&self, id: Uuid) -> Result<Option<Notification>> {
        self.store.get_by_id(id).await
    }

    pub async fn get_by_reference(&self, reference: &str) -> Result<Option<Notification>> {
        self.store.get_by_reference(reference).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryNotificationStore, test_notification};
    use relay_common::types::ChannelType;

    use NotificationStatus::*;

    const TRANSIENT: [NotificationStatus; 6] = [
        Created,
        Sending,
        PendingVirusCheck,
        Pending,
        Sent,
        TemporaryFailure,
    ];

    const FINAL: [NotificationStatus; 4] = [
        Delivered,
        PermanentFailure,
        TechnicalFailure,
        PreferencesDeclined,
    ];

    #[test]
    fn test_forward_order_accepts_iff_not_behind() {
        for current in TRANSIENT {
            for attempted in TRANSIENT {
                let accepted = matches!(decide(current, attempted), Transition::Apply(_));
                let not_behind = transient_rank(attempted) >= transient_rank(current);
                assert_eq!(
                    accepted, not_behind,
                    "current={} attempted={}",
                    current, attempted
                );
            }
        }
    }

    #[test]
    fn test_final_statuses_reject_everything() {
        for current in FINAL {
            for attempted in NotificationStatus::ALL {
                assert_eq!(
                    decide(current, attempted),
                    Transition::Reject(Rejection::AlreadyFinal)
                );
            }
        }
    }

    #[test]
    fn test_any_transient_accepts_final() {
        for current in TRANSIENT {
            for attempted in FINAL {
                assert!(matches!(decide(current, attempted), Transition::Apply(_)));
            }
        }
    }

    #[test]
    fn test_pending_permanent_failure_downgrades() {
        assert_eq!(
            decide(Pending, PermanentFailure),
            Transition::Apply(TemporaryFailure)
        );
        // Only exactly `pending` downgrades.
        assert_eq!(decide(Sent, PermanentFailure), Transition::Apply(PermanentFailure));
        assert_eq!(
            decide(Sending, PermanentFailure),
            Transition::Apply(PermanentFailure)
        );
    }

    #[tokio::test]
    async fn test_apply_status_moves_forward_and_stamps_sent_at() {
        let store = Arc::new(MemoryNotificationStore::new());
        let n = test_notification(ChannelType::Sms);
        store.insert(&n).await.unwrap();
        let ledger = StatusLedger::new(store.clone());

        let update = ledger
            .apply_status(
                n.id,
                StatusChange::new(Sending)
                    .with_sent_by("twilio")
                    .with_reference("ref-1"),
            )
            .await
            .unwrap();

        let stored = update.changed().unwrap();
        assert_eq!(stored.status, Sending);
        assert_eq!(stored.sent_by.as_deref(), Some("twilio"));
        assert_eq!(stored.reference.as_deref(), Some("ref-1"));
        assert!(stored.sent_at.is_some());

        // sent_by is only written while unset.
        ledger
            .apply_status(n.id, StatusChange::new(Delivered).with_sent_by("other"))
            .await
            .unwrap();
        let stored = ledger.get_by_id(n.id).await.unwrap().unwrap();
        assert_eq!(stored.status, Delivered);
        assert_eq!(stored.sent_by.as_deref(), Some("twilio"));
        assert_eq!(
            ledger.get_by_reference("ref-1").await.unwrap().unwrap().id,
            n.id
        );
    }

    #[tokio::test]
    async fn test_apply_status_ignores_regression_and_final() {
        let store = Arc::new(MemoryNotificationStore::new());
        let n = test_notification(ChannelType::Email);
        store.insert(&n).await.unwrap();
        let ledger = StatusLedger::new(store);

        ledger
            .apply_status(n.id, StatusChange::new(Sent))
            .await
            .unwrap();

        let update = ledger
            .apply_status(n.id, StatusChange::new(Sending))
            .await
            .unwrap();
        assert!(matches!(
            update,
            StatusUpdate::Ignored {
                current: Sent,
                attempted: Sending,
                rejection: Rejection::Regression
            }
        ));

        ledger
            .apply_status(n.id, StatusChange::new(Delivered))
            .await
            .unwrap();
        let update = ledger
            .apply_status(n.id, StatusChange::new(TemporaryFailure))
            .await
            .unwrap();
        assert!(!update.is_applied());
        assert_eq!(ledger.get_by_id(n.id).await.unwrap().unwrap().status, Delivered);
    }

    #[tokio::test]
    async fn test_apply_status_pending_permanent_failure_stores_temporary() {
        let store = Arc::new(MemoryNotificationStore::new());
        let n = test_notification(ChannelType::Sms);
        store.insert(&n).await.unwrap();
        let ledger = StatusLedger::new(store);

        ledger
            .apply_status(n.id, StatusChange::new(Pending))
            .await
            .unwrap();
        let update = ledger
            .apply_status(
                n.id,
                StatusChange::new(PermanentFailure).with_reason("carrier rejected"),
            )
            .await
            .unwrap();

        let stored = update.changed().unwrap();
        assert_eq!(stored.status, TemporaryFailure);
        assert_eq!(stored.status_reason.as_deref(), Some("carrier rejected"));
    }

    #[tokio::test]
    async fn test_apply_status_unknown_notification() {
        let ledger = StatusLedger::new(Arc::new(MemoryNotificationStore::new()));
        let err = ledger
            .apply_status(Uuid::new_v4(), StatusChange::new(Delivered))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_concurrent_receipts_apply_once() {
        let store = Arc::new(MemoryNotificationStore::new());
        let n = test_notification(ChannelType::Sms);
        store.insert(&n).await.unwrap();
        let ledger = StatusLedger::new(store);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = ledger.clone();
                let id = n.id;
                tokio::spawn(async move {
                    ledger
                        .apply_status(id, StatusChange::new(Delivered))
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut changed = 0;
        for handle in handles {
            if handle.await.unwrap().changed().is_some() {
                changed += 1;
            }
        }
        assert_eq!(changed, 1);
    }
}
