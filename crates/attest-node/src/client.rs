//! REST client for the attestation node.
//!
//! All attestation operations go through `{base}/attestation?type=...`; the
//! node answers list operations with positional arrays, which are mapped into
//! the named types of `attest-types` here.

use crate::{NodeApi, NodeError, VerificationOutputMap};
use async_trait::async_trait;
use attest_types::{Attestation, AttestationRequest, VerificationOutput, VerificationRequest};
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const ATTESTATION_PATH: &str = "/attestation";

#[derive(Debug, Deserialize)]
struct SuccessResponse {
    #[serde(default)]
    success: bool,
}

/// [`NodeApi`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpNodeClient {
    base_url: String,
    http: reqwest::Client,
}

impl HttpNodeClient {
    /// Creates a client for the node at `base_url` with the default timeout.
    pub fn new(base_url: impl Into<String>) -> Result<Self, NodeError> {
        Self::with_timeout(base_url, DEFAULT_REQUEST_TIMEOUT)
    }

    /// Fails if the HTTP client cannot be built with the given timeout.
    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self, NodeError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T, NodeError> {
        let response = self.http.get(self.url(path)).query(query).send().await?;
        decode(path, response).await
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T, NodeError> {
        let response = self.http.post(self.url(path)).query(query).send().await?;
        decode(path, response).await
    }
}

async fn decode<T: DeserializeOwned>(path: &str, response: reqwest::Response) -> Result<T, NodeError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let message = error_message(&body);
        tracing::error!(path, status = status.as_u16(), %message, "node api error");
        return Err(NodeError::Status {
            path: path.to_string(),
            status: status.as_u16(),
            message,
        });
    }

    response.json::<T>().await.map_err(|e| NodeError::Decode {
        path: path.to_string(),
        reason: e.to_string(),
    })
}

/// Extracts the node's error message from `{"error": {"message": ..}}` or
/// `{"error": ".."}`, falling back to the raw body.
fn error_message(body: &str) -> String {
    match serde_json::from_str::<Value>(body) {
        Ok(json) => match &json["error"] {
            Value::String(s) => s.clone(),
            Value::Object(obj) => obj
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or(body)
                .to_string(),
            _ => body.to_string(),
        },
        Err(_) => body.to_string(),
    }
}

/// Node metadata fields are usually strings but not always.
fn metadata_string(value: Value) -> String {
    match value {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn b64(value: &str) -> String {
    base64::engine::general_purpose::STANDARD.encode(value.as_bytes())
}

#[async_trait]
impl NodeApi for HttpNodeClient {
    async fn list_peers(&self) -> Result<Vec<String>, NodeError> {
        self.get(ATTESTATION_PATH, &[("type", "peers")]).await
    }

    async fn connect_peer(&self, secondary: &str) -> Result<(), NodeError> {
        let path = format!("/dht/peers/{secondary}");
        let _: Value = self.get(&path, &[]).await?;
        Ok(())
    }

    async fn list_verification_requests(&self) -> Result<Vec<VerificationRequest>, NodeError> {
        let rows: Vec<(String, String)> = self
            .get(ATTESTATION_PATH, &[("type", "outstanding_verify")])
            .await?;
        Ok(rows
            .into_iter()
            .map(|(holder, attribute_name)| VerificationRequest {
                holder,
                attribute_name,
            })
            .collect())
    }

    async fn request_verification(
        &self,
        holder: &str,
        attribute_hash: &str,
        value: &str,
        id_format: &str,
    ) -> Result<bool, NodeError> {
        let values = b64(value);
        let metadata = b64("null");
        let response: SuccessResponse = self
            .post(
                ATTESTATION_PATH,
                &[
                    ("type", "verify"),
                    ("mid", holder),
                    ("attribute_hash", attribute_hash),
                    ("attribute_values", &values),
                    ("id_format", id_format),
                    ("id_metadata", &metadata),
                ],
            )
            .await?;
        Ok(response.success)
    }

    async fn allow_verify(&self, verifier: &str, attribute_name: &str) -> Result<bool, NodeError> {
        let response: SuccessResponse = self
            .post(
                ATTESTATION_PATH,
                &[
                    ("type", "allow_verify"),
                    ("mid", verifier),
                    ("attribute_name", attribute_name),
                ],
            )
            .await?;
        Ok(response.success)
    }

    async fn list_verification_outputs(&self) -> Result<VerificationOutputMap, NodeError> {
        let raw: HashMap<String, Vec<(String, f64)>> = self
            .get(ATTESTATION_PATH, &[("type", "verification_output")])
            .await?;
        Ok(raw
            .into_iter()
            .map(|(hash, pairs)| {
                let outputs = pairs
                    .into_iter()
                    .map(|(value_hash, probability)| VerificationOutput {
                        value_hash,
                        probability,
                    })
                    .collect();
                (hash, outputs)
            })
            .collect())
    }

    async fn list_attestation_requests(&self) -> Result<Vec<AttestationRequest>, NodeError> {
        let rows: Vec<(String, String, Value)> = self
            .get(ATTESTATION_PATH, &[("type", "outstanding")])
            .await?;
        Ok(rows
            .into_iter()
            .map(|(holder, attribute_name, metadata)| AttestationRequest {
                holder,
                attribute_name,
                metadata: metadata_string(metadata),
            })
            .collect())
    }

    async fn request_attestation(
        &self,
        attester: &str,
        attribute_name: &str,
        id_format: &str,
    ) -> Result<bool, NodeError> {
        let response: SuccessResponse = self
            .post(
                ATTESTATION_PATH,
                &[
                    ("type", "request"),
                    ("mid", attester),
                    ("attribute_name", attribute_name),
                    ("id_format", id_format),
                ],
            )
            .await?;
        Ok(response.success)
    }

    async fn attest(
        &self,
        holder: &str,
        attribute_name: &str,
        value: &str,
    ) -> Result<Value, NodeError> {
        let encoded = b64(value);
        self.post(
            ATTESTATION_PATH,
            &[
                ("type", "attest"),
                ("mid", holder),
                ("attribute_name", attribute_name),
                ("attribute_value", &encoded),
            ],
        )
        .await
    }

    async fn list_attestations(&self) -> Result<Vec<Attestation>, NodeError> {
        let rows: Vec<(String, String, Value, String)> = self
            .get(ATTESTATION_PATH, &[("type", "attributes")])
            .await?;
        Ok(rows
            .into_iter()
            .map(|(attribute_name, attribute_hash, metadata, signer)| Attestation {
                attribute_name,
                attribute_hash,
                metadata: metadata_string(metadata),
                signer,
            })
            .collect())
    }
}
