use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Notification status.
///
/// `Delivered`, `PermanentFailure`, `TechnicalFailure` and
/// `PreferencesDeclined` are final; everything else may still change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum NotificationStatus {
    Created,
    Sending,
    PendingVirusCheck,
    Pending,
    Sent,
    Delivered,
    TemporaryFailure,
    PermanentFailure,
    TechnicalFailure,
    PreferencesDeclined,
}

impl NotificationStatus {
    pub const ALL: [NotificationStatus; 10] = [
        NotificationStatus::Created,
        NotificationStatus::Sending,
        NotificationStatus::PendingVirusCheck,
        NotificationStatus::Pending,
        NotificationStatus::Sent,
        NotificationStatus::Delivered,
        NotificationStatus::TemporaryFailure,
        NotificationStatus::PermanentFailure,
        NotificationStatus::TechnicalFailure,
        NotificationStatus::PreferencesDeclined,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::Created => "created",
            NotificationStatus::Sending => "sending",
            NotificationStatus::PendingVirusCheck => "pending-virus-check",
            NotificationStatus::Pending => "pending",
            NotificationStatus::Sent => "sent",
            NotificationStatus::Delivered => "delivered",
            NotificationStatus::TemporaryFailure => "temporary-failure",
            NotificationStatus::PermanentFailure => "permanent-failure",
            NotificationStatus::TechnicalFailure => "technical-failure",
            NotificationStatus::PreferencesDeclined => "preferences-declined",
        }
    }

    /// A final status is never overwritten.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            NotificationStatus::Delivered
                | NotificationStatus::PermanentFailure
                | NotificationStatus::TechnicalFailure
                | NotificationStatus::PreferencesDeclined
        )
    }

    /// Statuses that end the pipeline's own work and are reported to the
    /// service's callback endpoint.
    pub fn is_terminal(&self) -> bool {
        self.is_final() || *self == NotificationStatus::TemporaryFailure
    }
}

impl std::fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NotificationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NotificationStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown notification status '{}'", s))
    }
}

/// Notification channel type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    Sms,
    Email,
}

impl std::fmt::Display for ChannelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelType::Sms => write!(f, "sms"),
            ChannelType::Email => write!(f, "email"),
        }
    }
}

/// Kind of API key a notification was submitted with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    #[default]
    Normal,
    Team,
    Test,
}

impl std::fmt::Display for KeyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyType::Normal => write!(f, "normal"),
            KeyType::Team => write!(f, "team"),
            KeyType::Test => write!(f, "test"),
        }
    }
}

/// Type of an external recipient identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum IdentifierType {
    /// Internal profile id; contact lookups take it directly.
    ProfileId,
    /// Integration control number from the master person index.
    Icn,
    Edipi,
    BirlsId,
    Pid,
}

impl IdentifierType {
    /// Whether this identifier must first be resolved to an internal profile id.
    pub fn requires_indirection(&self) -> bool {
        !matches!(self, IdentifierType::ProfileId)
    }

    /// Whether recipients addressed by this identifier can receive onsite notifications.
    pub fn supports_onsite(&self) -> bool {
        matches!(self, IdentifierType::Icn)
    }
}

impl std::fmt::Display for IdentifierType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdentifierType::ProfileId => write!(f, "profile_id"),
            IdentifierType::Icn => write!(f, "icn"),
            IdentifierType::Edipi => write!(f, "edipi"),
            IdentifierType::BirlsId => write!(f, "birls_id"),
            IdentifierType::Pid => write!(f, "pid"),
        }
    }
}

/// A typed external identity attached to a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct RecipientIdentifier {
    pub notification_id: Uuid,
    pub id_type: IdentifierType,
    pub id_value: String,
}

/// A notification moving through the delivery pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Notification {
    pub id: Uuid,
    pub service_id: Uuid,
    pub notification_type: ChannelType,
    pub status: NotificationStatus,
    pub status_reason: Option<String>,
    /// Resolved address (phone number or email).
    pub recipient: Option<String>,
    pub template_id: Uuid,
    pub template_version: i32,
    /// Permission mapping declared by the template, if any.
    pub communication_item_id: Option<Uuid>,
    pub reply_to_text: Option<String>,
    pub sms_sender_id: Option<Uuid>,
    pub key_type: KeyType,
    pub client_reference: Option<String>,
    /// Opaque reference returned by the provider on dispatch.
    pub reference: Option<String>,
    pub sent_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    #[sqlx(skip)]
    #[serde(default)]
    pub recipient_identifiers: Vec<RecipientIdentifier>,
}

impl Notification {
    /// A fresh `created` notification with no recipient information.
    pub fn new(service_id: Uuid, notification_type: ChannelType, template_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            service_id,
            notification_type,
            status: NotificationStatus::Created,
            status_reason: None,
            recipient: None,
            template_id,
            template_version: 1,
            communication_item_id: None,
            reply_to_text: None,
            sms_sender_id: None,
            key_type: KeyType::Normal,
            client_reference: None,
            reference: None,
            sent_by: None,
            created_at: Utc::now(),
            sent_at: None,
            updated_at: None,
            recipient_identifiers: Vec::new(),
        }
    }

    pub fn with_recipient(mut self, recipient: impl Into<String>) -> Self {
        self.recipient = Some(recipient.into());
        self
    }

    pub fn with_identifier(mut self, id_type: IdentifierType, id_value: impl Into<String>) -> Self {
        self.recipient_identifiers.retain(|i| i.id_type != id_type);
        self.recipient_identifiers.push(RecipientIdentifier {
            notification_id: self.id,
            id_type,
            id_value: id_value.into(),
        });
        self
    }

    pub fn with_communication_item(mut self, communication_item_id: Uuid) -> Self {
        self.communication_item_id = Some(communication_item_id);
        self
    }

    pub fn with_sms_sender(mut self, sms_sender_id: Uuid) -> Self {
        self.sms_sender_id = Some(sms_sender_id);
        self
    }

    pub fn with_key_type(mut self, key_type: KeyType) -> Self {
        self.key_type = key_type;
        self
    }

    /// Identifier of the given type, if attached.
    pub fn identifier(&self, id_type: IdentifierType) -> Option<&RecipientIdentifier> {
        self.recipient_identifiers
            .iter()
            .find(|identifier| identifier.id_type == id_type)
    }

    /// The identifier that drives pipeline branching: the unresolved external
    /// identifier when there is one, otherwise the internal profile id.
    pub fn primary_identifier(&self) -> Option<&RecipientIdentifier> {
        self.recipient_identifiers
            .iter()
            .find(|identifier| identifier.id_type.requires_indirection())
            .or_else(|| self.identifier(IdentifierType::ProfileId))
    }
}

/// Service-level mapping from a template to a permission-check key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct CommunicationItem {
    pub id: Uuid,
    pub name: String,
    pub permission_key: String,
    /// Send when the recipient has no preference on file.
    pub default_allow: bool,
}

/// Per-sender throughput limit: `rate_limit` messages per `rate_limit_interval_secs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct SenderRateLimit {
    pub sender_id: Uuid,
    pub rate_limit: i32,
    pub rate_limit_interval_secs: i32,
}

impl SenderRateLimit {
    pub fn is_enabled(&self) -> bool {
        self.rate_limit > 0 && self.rate_limit_interval_secs > 0
    }

    /// Delay before a throttled send should be attempted again.
    pub fn retry_after(&self) -> std::time::Duration {
        if !self.is_enabled() {
            return std::time::Duration::ZERO;
        }
        std::time::Duration::from_secs_f64(
            self.rate_limit_interval_secs as f64 / self.rate_limit as f64,
        )
    }
}

/// Webhook a service registered for delivery-status updates.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CallbackEndpoint {
    pub service_id: Uuid,
    pub url: String,
    pub bearer_token: String,
    pub include_provider_payload: bool,
}
