//! Requester-side view of the Provider transport.

use crate::error::ClientError;
use async_trait::async_trait;
use attest_types::{InitiateRequest, InitiateResponse, ProviderEndpoint};
use serde_json::Value;
use std::time::Duration;

/// The two Provider operations a procedure run needs.
#[async_trait]
pub trait ProviderApi: Send + Sync {
    /// Asks `provider` to start a transaction.
    async fn initiate(
        &self,
        provider: &ProviderEndpoint,
        request: &InitiateRequest,
    ) -> Result<InitiateResponse, ClientError>;

    /// What `provider` currently has staged for `holder`, unvalidated.
    async fn staged(&self, provider: &ProviderEndpoint, holder: &str) -> Result<Value, ClientError>;
}

/// [`ProviderApi`] over HTTP. Initiation uses the query form, with the
/// credentials as one JSON-encoded field.
#[derive(Debug, Clone)]
pub struct HttpProviderGateway {
    http: reqwest::Client,
}

/// Per-request timeout used when none is configured.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

impl HttpProviderGateway {
    /// Fails if the HTTP client cannot be built with the given timeout.
    pub fn new(timeout: Duration) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http })
    }
}

fn url(provider: &ProviderEndpoint, path: &str) -> String {
    format!("{}{}", provider.http_address.trim_end_matches('/'), path)
}

/// Turns a non-success response into `Rejected`, logging the Provider's
/// `{"error": ..}` message.
async fn check(path: &str, response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|json| json["error"].as_str().map(str::to_string))
        .unwrap_or(body);
    tracing::error!(path, status = status.as_u16(), %message, "provider request failed");
    Err(ClientError::Rejected {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl ProviderApi for HttpProviderGateway {
    async fn initiate(
        &self,
        provider: &ProviderEndpoint,
        request: &InitiateRequest,
    ) -> Result<InitiateResponse, ClientError> {
        let query = request.to_query()?;
        let response = self
            .http
            .get(url(provider, "/init"))
            .query(&query)
            .send()
            .await?;
        check("/init", response)
            .await?
            .json()
            .await
            .map_err(|e| ClientError::MalformedResponse(e.to_string()))
    }

    async fn staged(&self, provider: &ProviderEndpoint, holder: &str) -> Result<Value, ClientError> {
        let response = self
            .http
            .get(url(provider, "/data"))
            .query(&[("mid_b64", holder)])
            .send()
            .await?;
        check("/data", response)
            .await?
            .json()
            .await
            .map_err(|e| ClientError::MalformedResponse(e.to_string()))
    }
}
