//! External services the pipeline calls out to.
//!
//! Each collaborator is an async trait used as `Arc<dyn _>`. Their error types
//! implement [`crate::classifier::Classify`] so the executor can turn any
//! failure into a stage outcome without knowing which service raised it.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use relay_common::types::{ChannelType, IdentifierType, Notification, RecipientIdentifier};

use crate::queue::QueueName;

/// Transport-level failure shared by every HTTP-backed collaborator.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("malformed response: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Error)]
pub enum ProfileLookupError {
    #[error("no profile found for identifier")]
    NotFound,

    #[error("identifier maps to multiple active profiles")]
    MultipleActive,

    #[error("recipient is deceased")]
    Deceased,

    #[error("incorrect number of identifiers for recipient")]
    IncorrectIdentifierCount,

    #[error("identifier type {0} cannot be resolved")]
    UnsupportedIdentifier(IdentifierType),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, Error)]
pub enum ContactLookupError {
    #[error("no contact information on file")]
    NoContactInfo,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, Error)]
pub enum PermissionError {
    #[error("recipient has no preference on file")]
    NoPreferenceOnFile,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("provider rejected recipient: {0}")]
    InvalidRecipient(String),

    #[error("provider misconfigured: {0}")]
    Misconfigured(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// A recipient's communication-permission answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionDecision {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl PermissionDecision {
    pub fn allowed() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn declined(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// Result of a contact lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactInfo {
    /// Phone number or email address for the requested channel.
    pub address: String,
    /// Present when the lookup carried a permission key and a preference is on file.
    pub permission: Option<PermissionDecision>,
}

#[async_trait]
pub trait ProfileResolver: Send + Sync {
    /// Map an external identifier to the internal profile id.
    async fn resolve_profile_id(
        &self,
        identifier: &RecipientIdentifier,
    ) -> Result<String, ProfileLookupError>;
}

#[async_trait]
pub trait ContactResolver: Send + Sync {
    /// Resolve the channel address for a profile, optionally checking a
    /// permission key in the same call.
    async fn lookup(
        &self,
        profile: &RecipientIdentifier,
        channel: ChannelType,
        permission_key: Option<&str>,
    ) -> Result<ContactInfo, ContactLookupError>;
}

#[async_trait]
pub trait PermissionService: Send + Sync {
    async fn is_allowed(
        &self,
        profile: &RecipientIdentifier,
        channel: ChannelType,
        permission_key: &str,
    ) -> Result<PermissionDecision, PermissionError>;
}

#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Name recorded as `sent_by`.
    fn name(&self) -> &str;

    /// Hand the notification to the provider and return its reference.
    async fn send(&self, notification: &Notification) -> Result<String, ProviderError>;
}

#[async_trait]
pub trait OnsiteNotifier: Send + Sync {
    async fn notify(
        &self,
        identifier: &RecipientIdentifier,
        template_id: Uuid,
    ) -> Result<(), TransportError>;
}

/// Provider used for research-mode, test-key and simulated recipients.
/// Accepts everything and never leaves the process.
#[derive(Debug, Default)]
pub struct SimulatedProvider;

#[async_trait]
impl ProviderClient for SimulatedProvider {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn send(&self, notification: &Notification) -> Result<String, ProviderError> {
        tracing::debug!(notification_id = %notification.id, "Simulated send");
        Ok(format!("simulated-{}", Uuid::new_v4()))
    }
}

/// The full set of collaborators a stage executor calls.
#[derive(Clone)]
pub struct Collaborators {
    pub profiles: Arc<dyn ProfileResolver>,
    pub contacts: Arc<dyn ContactResolver>,
    pub permissions: Arc<dyn PermissionService>,
    pub provider: Arc<dyn ProviderClient>,
    pub onsite: Arc<dyn OnsiteNotifier>,
    pub simulated: Arc<dyn ProviderClient>,
}

impl Collaborators {
    pub fn new(
        profiles: Arc<dyn ProfileResolver>,
        contacts: Arc<dyn ContactResolver>,
        permissions: Arc<dyn PermissionService>,
        provider: Arc<dyn ProviderClient>,
        onsite: Arc<dyn OnsiteNotifier>,
    ) -> Self {
        Self {
            profiles,
            contacts,
            permissions,
            provider,
            onsite,
            simulated: Arc::new(SimulatedProvider),
        }
    }

    /// Provider for tasks dispatched on `queue`.
    pub fn provider_for(&self, queue: QueueName) -> &Arc<dyn ProviderClient> {
        match queue {
            QueueName::ResearchMode => &self.simulated,
            _ => &self.provider,
        }
    }
}
