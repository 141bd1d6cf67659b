//! Persistence seams for notifications and per-service configuration.
//!
//! The Postgres implementations are what the binaries run against; the
//! in-process equivalents live in [`crate::memory`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use relay_common::types::{
    CallbackEndpoint, CommunicationItem, Notification, NotificationStatus, RecipientIdentifier,
    SenderRateLimit,
};

use crate::error::{EngineError, Result};
use crate::ledger::StatusChange;

/// Storage for notification rows and their recipient identifiers.
#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Persist a new notification together with its identifiers.
    async fn insert(&self, notification: &Notification) -> Result<()>;

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Notification>>;

    async fn get_status(&self, id: Uuid) -> Result<Option<NotificationStatus>>;

    /// Look a notification up by the provider's reference.
    ///
    /// More than one match is an error rather than an arbitrary pick.
    async fn get_by_reference(&self, reference: &str) -> Result<Option<Notification>>;

    /// Write `status` only if the row is still at `expected`.
    ///
    /// Returns the updated row, or `None` when another writer got there first.
    /// `sent_by` is only written when unset; entering `sending` stamps `sent_at`.
    async fn compare_and_set_status(
        &self,
        id: Uuid,
        expected: NotificationStatus,
        status: NotificationStatus,
        change: &StatusChange,
        at: DateTime<Utc>,
    ) -> Result<Option<Notification>>;

    /// Attach (or replace) an identifier of the same type.
    async fn add_identifier(&self, identifier: &RecipientIdentifier) -> Result<()>;

    /// Record the resolved address.
    async fn set_recipient(&self, id: Uuid, recipient: &str) -> Result<()>;

    /// Notifications in one of `statuses` created before `older_than`, oldest first.
    async fn find_stale(
        &self,
        statuses: &[NotificationStatus],
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Notification>>;
}

/// Read-only per-service configuration consumed by the pipeline.
#[async_trait]
pub trait ServiceConfigStore: Send + Sync {
    async fn communication_item(&self, id: Uuid) -> Result<Option<CommunicationItem>>;

    async fn sender_rate_limit(&self, sender_id: Uuid) -> Result<Option<SenderRateLimit>>;

    async fn callback_endpoint(&self, service_id: Uuid) -> Result<Option<CallbackEndpoint>>;
}

/// Postgres-backed notification store.
#[derive(Clone)]
pub struct PgNotificationStore {
    pool: PgPool,
}

impl PgNotificationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn load_identifiers(&self, notification: &mut Notification) -> Result<()> {
        notification.recipient_identifiers = sqlx::query_as::<_, RecipientIdentifier>(
            r#"
            SELECT notification_id, id_type, id_value
            FROM recipient_identifiers
            WHERE notification_id = $1
            ORDER BY id_type
            "#,
        )
        .bind(notification.id)
        .fetch_all(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl NotificationStore for PgNotificationStore {
    async fn insert(&self, notification: &Notification) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO notifications (
                id, service_id, notification_type, status, status_reason, recipient,
                template_id, template_version, communication_item_id, reply_to_text,
                sms_sender_id, key_type, client_reference, reference, sent_by,
                created_at, sent_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            "#,
        )
        .bind(notification.id)
        .bind(notification.service_id)
        .bind(notification.notification_type.to_string())
        .bind(notification.status.to_string())
        .bind(&notification.status_reason)
        .bind(&notification.recipient)
        .bind(notification.template_id)
        .bind(notification.template_version)
        .bind(notification.communication_item_id)
        .bind(&notification.reply_to_text)
        .bind(notification.sms_sender_id)
        .bind(notification.key_type.to_string())
        .bind(&notification.client_reference)
        .bind(&notification.reference)
        .bind(&notification.sent_by)
        .bind(notification.created_at)
        .bind(notification.sent_at)
        .bind(notification.updated_at)
        .execute(&mut *tx)
        .await?;

        for identifier in &notification.recipient_identifiers {
            sqlx::query(
                r#"
                INSERT INTO recipient_identifiers (notification_id, id_type, id_value)
                VALUES ($1, $2, $3)
                "#,
            )
            .bind(notification.id)
            .bind(identifier.id_type.to_string())
            .bind(&identifier.id_value)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Notification>> {
        let notification =
            sqlx::query_as::<_, Notification>("SELECT * FROM notifications WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        match notification {
            Some(mut n) => {
                self.load_identifiers(&mut n).await?;
                Ok(Some(n))
            }
            None => Ok(None),
        }
    }

    async fn get_status(&self, id: Uuid) -> Result<Option<NotificationStatus>> {
        let status: Option<(NotificationStatus,)> =
            sqlx::query_as("SELECT status FROM notifications WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(status.map(|(s,)| s))
    }

    async fn get_by_reference(&self, reference: &str) -> Result<Option<Notification>> {
        let mut rows = sqlx::query_as::<_, Notification>(
            "SELECT * FROM notifications WHERE reference = $1 LIMIT 2",
        )
        .bind(reference)
        .fetch_all(&self.pool)
        .await?;

        if rows.len() > 1 {
            return Err(EngineError::AmbiguousReference(reference.to_string()));
        }

        match rows.pop() {
            Some(mut n) => {
                self.load_identifiers(&mut n).await?;
                Ok(Some(n))
            }
            None => Ok(None),
        }
    }

    async fn compare_and_set_status(
        &self,
        id: Uuid,
        expected: NotificationStatus,
        status: NotificationStatus,
        change: &StatusChange,
        at: DateTime<Utc>,
    ) -> Result<Option<Notification>> {
        let updated = sqlx::query_as::<_, Notification>(
            r#"
            UPDATE notifications
            SET status = $3,
                status_reason = $4,
                sent_by = COALESCE(sent_by, $5),
                reference = COALESCE($6, reference),
                sent_at = CASE WHEN $3 = 'sending' AND sent_at IS NULL THEN $7 ELSE sent_at END,
                updated_at = $7
            WHERE id = $1 AND status = $2
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(expected.to_string())
        .bind(status.to_string())
        .bind(&change.reason)
        .bind(&change.sent_by)
        .bind(&change.reference)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(mut n) => {
                self.load_identifiers(&mut n).await?;
                Ok(Some(n))
            }
            None => Ok(None),
        }
    }

    async fn add_identifier(&self, identifier: &RecipientIdentifier) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO recipient_identifiers (notification_id, id_type, id_value)
            VALUES ($1, $2, $3)
            ON CONFLICT (notification_id, id_type) DO UPDATE SET id_value = EXCLUDED.id_value
            "#,
        )
        .bind(identifier.notification_id)
        .bind(identifier.id_type.to_string())
        .bind(&identifier.id_value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_recipient(&self, id: Uuid, recipient: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE notifications SET recipient = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(recipient)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::NotFound(id));
        }
        Ok(())
    }

    async fn find_stale(
        &self,
        statuses: &[NotificationStatus],
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Notification>> {
        let statuses: Vec<String> = statuses.iter().map(|s| s.to_string()).collect();

        let mut rows = sqlx::query_as::<_, Notification>(
            r#"
            SELECT * FROM notifications
            WHERE status = ANY($1) AND created_at < $2
            ORDER BY created_at ASC
            LIMIT $3
            "#,
        )
        .bind(statuses)
        .bind(older_than)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        for n in rows.iter_mut() {
            self.load_identifiers(n).await?;
        }
        Ok(rows)
    }
}

/// Postgres-backed service configuration.
#[derive(Clone)]
pub struct PgServiceConfigStore {
    pool: PgPool,
}

impl PgServiceConfigStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ServiceConfigStore for PgServiceConfigStore {
    async fn communication_item(&self, id: Uuid) -> Result<Option<CommunicationItem>> {
        let item = sqlx::query_as::<_, CommunicationItem>(
            "SELECT id, name, permission_key, default_allow FROM communication_items WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(item)
    }

    async fn sender_rate_limit(&self, sender_id: Uuid) -> Result<Option<SenderRateLimit>> {
        let limit = sqlx::query_as::<_, SenderRateLimit>(
            r#"
            SELECT sender_id, rate_limit, rate_limit_interval_secs
            FROM sender_rate_limits
            WHERE sender_id = $1
            "#,
        )
        .bind(sender_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(limit)
    }

    async fn callback_endpoint(&self, service_id: Uuid) -> Result<Option<CallbackEndpoint>> {
        let endpoint = sqlx::query_as::<_, CallbackEndpoint>(
            r#"
            SELECT service_id, url, bearer_token, include_provider_payload
            FROM callback_endpoints
            WHERE service_id = $1
            "#,
        )
        .bind(service_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(endpoint)
    }
}
