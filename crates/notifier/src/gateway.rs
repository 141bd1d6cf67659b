//! HTTP client for the delivery gateway.
//!
//! The gateway fronts the identity, contact, permission, onsite and provider
//! services behind one JSON API:
//!
//! | Call                    | Route                    | Success body                  |
//! |-------------------------|--------------------------|-------------------------------|
//! | resolve profile id      | `POST /profiles/resolve` | `{"profile_id"}`              |
//! | contact lookup          | `POST /contacts/lookup`  | `{"address", "permission"?}`  |
//! | permission check        | `POST /permissions/check`| `{"allowed", "reason"?}`      |
//! | provider send           | `POST /messages/{type}`  | `{"reference"}`               |
//! | onsite notification     | `POST /onsite`           | empty                         |
//!
//! Business failures come back as 4xx with `{"code", "message"?}`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use relay_common::types::{ChannelType, IdentifierType, Notification, RecipientIdentifier};
use relay_engine::collaborators::{
    ContactInfo, ContactLookupError, ContactResolver, OnsiteNotifier, PermissionDecision,
    PermissionError, PermissionService, ProfileLookupError, ProfileResolver, ProviderClient,
    ProviderError, TransportError,
};

use crate::{transport_error, truncate_body};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// `sent_by` for messages handed over through the gateway.
pub const GATEWAY_PROVIDER_NAME: &str = "gateway";

#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: String,
    #[serde(default)]
    message: Option<String>,
}

/// A failed gateway call: either a business error code or a transport problem.
#[derive(Debug)]
enum CallError {
    Rejected {
        status: u16,
        code: String,
        message: Option<String>,
    },
    Transport(TransportError),
}

impl CallError {
    fn into_transport(self) -> TransportError {
        match self {
            CallError::Transport(e) => e,
            CallError::Rejected {
                status,
                code,
                message,
            } => TransportError::Http {
                status,
                message: message.unwrap_or(code),
            },
        }
    }
}

#[derive(Serialize)]
struct ResolveRequest<'a> {
    id_type: IdentifierType,
    id_value: &'a str,
}

#[derive(Deserialize)]
struct ResolveResponse {
    profile_id: String,
}

#[derive(Serialize)]
struct LookupRequest<'a> {
    profile_id: &'a str,
    channel: ChannelType,
    #[serde(skip_serializing_if = "Option::is_none")]
    permission_key: Option<&'a str>,
}

#[derive(Deserialize)]
struct PermissionBody {
    allowed: bool,
    #[serde(default)]
    reason: Option<String>,
}

impl From<PermissionBody> for PermissionDecision {
    fn from(body: PermissionBody) -> Self {
        Self {
            allowed: body.allowed,
            reason: body.reason,
        }
    }
}

#[derive(Deserialize)]
struct LookupResponse {
    address: String,
    #[serde(default)]
    permission: Option<PermissionBody>,
}

#[derive(Serialize)]
struct PermissionRequest<'a> {
    profile_id: &'a str,
    channel: ChannelType,
    permission_key: &'a str,
}

#[derive(Serialize)]
struct SendRequest<'a> {
    notification_id: Uuid,
    to: &'a str,
    template_id: Uuid,
    template_version: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_to: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sender_id: Option<Uuid>,
}

#[derive(Deserialize)]
struct SendResponse {
    reference: String,
}

#[derive(Serialize)]
struct OnsiteRequest<'a> {
    id_type: IdentifierType,
    id_value: &'a str,
    template_id: Uuid,
}

/// One client implements every collaborator trait.
#[derive(Clone)]
pub struct GatewayClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl GatewayClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Result<Self, reqwest::Error> {
        Self::with_timeout(base_url, api_key, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("relay/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        })
    }

    async fn call<B, R>(&self, path: &str, body: &B) -> Result<R, CallError>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        self.post(path, body)
            .await?
            .json::<R>()
            .await
            .map_err(|e| CallError::Transport(transport_error(e)))
    }

    /// Like [`call`](Self::call) for routes whose success body is empty or
    /// irrelevant: only the status is checked.
    async fn call_no_body<B>(&self, path: &str, body: &B) -> Result<(), CallError>
    where
        B: Serialize + Sync,
    {
        self.post(path, body).await.map(|_| ())
    }

    /// POST `body` and return the response if its status is a success.
    async fn post<B>(&self, path: &str, body: &B) -> Result<reqwest::Response, CallError>
    where
        B: Serialize + Sync,
    {
        let mut request = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| CallError::Transport(transport_error(e)))?;
        let status = response.status();

        if status.is_success() {
            return Ok(response);
        }

        let text = response.text().await.unwrap_or_default();
        if status.is_client_error()
            && status != StatusCode::TOO_MANY_REQUESTS
            && let Ok(body) = serde_json::from_str::<ErrorBody>(&text)
        {
            return Err(CallError::Rejected {
                status: status.as_u16(),
                code: body.code,
                message: body.message,
            });
        }

        Err(CallError::Transport(TransportError::Http {
            status: status.as_u16(),
            message: truncate_body(text),
        }))
    }
}

#[async_trait]
impl ProfileResolver for GatewayClient {
    async fn resolve_profile_id(
        &self,
        identifier: &RecipientIdentifier,
    ) -> Result<String, ProfileLookupError> {
        let request = ResolveRequest {
            id_type: identifier.id_type,
            id_value: &identifier.id_value,
        };
        match self
            .call::<_, ResolveResponse>("/profiles/resolve", &request)
            .await
        {
            Ok(response) => Ok(response.profile_id),
            Err(CallError::Rejected { code, .. }) if code == "not_found" => {
                Err(ProfileLookupError::NotFound)
            }
            Err(CallError::Rejected { code, .. }) if code == "multiple_active" => {
                Err(ProfileLookupError::MultipleActive)
            }
            Err(CallError::Rejected { code, .. }) if code == "deceased" => {
                Err(ProfileLookupError::Deceased)
            }
            Err(CallError::Rejected { code, .. }) if code == "incorrect_identifier_count" => {
                Err(ProfileLookupError::IncorrectIdentifierCount)
            }
            Err(CallError::Rejected { code, .. }) if code == "unsupported_identifier" => {
                Err(ProfileLookupError::UnsupportedIdentifier(identifier.id_type))
            }
            Err(e) => Err(ProfileLookupError::Transport(e.into_transport())),
        }
    }
}

#[async_trait]
impl ContactResolver for GatewayClient {
    async fn lookup(
        &self,
        profile: &RecipientIdentifier,
        channel: ChannelType,
        permission_key: Option<&str>,
    ) -> Result<ContactInfo, ContactLookupError> {
        let request = LookupRequest {
            profile_id: &profile.id_value,
            channel,
            permission_key,
        };
        match self
            .call::<_, LookupResponse>("/contacts/lookup", &request)
            .await
        {
            Ok(response) => Ok(ContactInfo {
                address: response.address,
                permission: response.permission.map(PermissionDecision::from),
            }),
            Err(CallError::Rejected { code, .. }) if code == "no_contact_info" => {
                Err(ContactLookupError::NoContactInfo)
            }
            Err(e) => Err(ContactLookupError::Transport(e.into_transport())),
        }
    }
}

#[async_trait]
impl PermissionService for GatewayClient {
    async fn is_allowed(
        &self,
        profile: &RecipientIdentifier,
        channel: ChannelType,
        permission_key: &str,
    ) -> Result<PermissionDecision, PermissionError> {
        let request = PermissionRequest {
            profile_id: &profile.id_value,
            channel,
            permission_key,
        };
        match self
            .call::<_, PermissionBody>("/permissions/check", &request)
            .await
        {
            Ok(body) => Ok(body.into()),
            Err(CallError::Rejected { code, .. }) if code == "no_preference" => {
                Err(PermissionError::NoPreferenceOnFile)
            }
            Err(e) => Err(PermissionError::Transport(e.into_transport())),
        }
    }
}

#[async_trait]
impl ProviderClient for GatewayClient {
    fn name(&self) -> &str {
        GATEWAY_PROVIDER_NAME
    }

    async fn send(&self, notification: &Notification) -> Result<String, ProviderError> {
        let to = notification.recipient.as_deref().ok_or_else(|| {
            ProviderError::InvalidRecipient("notification has no recipient".to_string())
        })?;
        let request = SendRequest {
            notification_id: notification.id,
            to,
            template_id: notification.template_id,
            template_version: notification.template_version,
            reply_to: notification.reply_to_text.as_deref(),
            sender_id: notification.sms_sender_id,
        };
        let path = format!("/messages/{}", notification.notification_type);

        match self.call::<_, SendResponse>(&path, &request).await {
            Ok(response) => Ok(response.reference),
            Err(CallError::Rejected { code, message, .. }) if code == "invalid_recipient" => Err(
                ProviderError::InvalidRecipient(message.unwrap_or_else(|| to.to_string())),
            ),
            Err(CallError::Rejected { code, message, .. }) if code == "misconfigured" => {
                Err(ProviderError::Misconfigured(message.unwrap_or(code)))
            }
            Err(e) => Err(ProviderError::Transport(e.into_transport())),
        }
    }
}

#[async_trait]
impl OnsiteNotifier for GatewayClient {
    async fn notify(
        &self,
        identifier: &RecipientIdentifier,
        template_id: Uuid,
    ) -> Result<(), TransportError> {
        let request = OnsiteRequest {
            id_type: identifier.id_type,
            id_value: &identifier.id_value,
            template_id,
        };
        self.call_no_body("/onsite", &request)
            .await
            .map_err(CallError::into_transport)
    }
}
