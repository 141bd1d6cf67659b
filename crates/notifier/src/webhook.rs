//! Callback transport over HTTP.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use relay_common::types::CallbackEndpoint;
use relay_engine::callback::CallbackPayload;
use relay_engine::collaborators::TransportError;

use crate::delivery::CallbackTransport;
use crate::{transport_error, truncate_body};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// POSTs the payload as JSON with the endpoint's bearer token.
#[derive(Clone)]
pub struct HttpCallbackTransport {
    client: Client,
}

impl HttpCallbackTransport {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("relay/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

impl Default for HttpCallbackTransport {
    fn default() -> Self {
        Self {
            client: Client::builder()
                .timeout(DEFAULT_TIMEOUT)
                .build()
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl CallbackTransport for HttpCallbackTransport {
    async fn post(
        &self,
        endpoint: &CallbackEndpoint,
        payload: &CallbackPayload,
    ) -> Result<(), TransportError> {
        let response = self
            .client
            .post(&endpoint.url)
            .bearer_auth(&endpoint.bearer_token)
            .json(payload)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(TransportError::Http {
            status: status.as_u16(),
            message: truncate_body(body),
        })
    }
}
