//! Request and response shapes of the Provider's HTTP transport.
//!
//! Credential lists cross the query-string form of `/init` as one
//! JSON-encoded field next to the scalar fields; [`InitiateQuery`] is that
//! encoded form and [`InitiateRequest`] the decoded one.

use crate::{Credential, PeerId, TypesError};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Decoded initiate request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitiateRequest {
    pub procedure_id: String,
    pub mid_b64: String,
    pub mid_hex: String,
    #[serde(default)]
    pub credentials: Vec<Credential>,
}

impl InitiateRequest {
    pub fn peer(&self) -> PeerId {
        PeerId::new(self.mid_b64.clone(), self.mid_hex.clone())
    }

    /// Encodes the request for the query-string transport.
    pub fn to_query(&self) -> Result<InitiateQuery, TypesError> {
        let credentials = serde_json::to_string(&self.credentials)
            .map_err(|e| TypesError::MalformedCredentials(e.to_string()))?;
        Ok(InitiateQuery {
            procedure_id: Some(self.procedure_id.clone()),
            mid_b64: Some(self.mid_b64.clone()),
            mid_hex: Some(self.mid_hex.clone()),
            credentials: Some(credentials),
        })
    }
}

/// Query-string form of the initiate request. Every field is optional so
/// that a missing one can be reported as a validation error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitiateQuery {
    pub procedure_id: Option<String>,
    pub mid_b64: Option<String>,
    pub mid_hex: Option<String>,
    pub credentials: Option<String>,
}

impl InitiateQuery {
    /// Names of the required fields that are absent or blank.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let fields = [
            ("procedure_id", &self.procedure_id),
            ("mid_b64", &self.mid_b64),
            ("mid_hex", &self.mid_hex),
            ("credentials", &self.credentials),
        ];
        fields
            .into_iter()
            .filter(|(_, value)| value.as_deref().map_or(true, |v| v.trim().is_empty()))
            .map(|(name, _)| name)
            .collect()
    }

    /// Decodes the credential blob.
    ///
    /// # Errors
    ///
    /// Returns `TypesError::MalformedCredentials` if a field is missing or
    /// the blob is not a JSON array of credentials.
    pub fn decode(self) -> Result<InitiateRequest, TypesError> {
        let missing = self.missing_fields();
        if !missing.is_empty() {
            return Err(TypesError::MalformedCredentials(format!(
                "missing parameters: {}",
                missing.join(", ")
            )));
        }
        let blob = self.credentials.unwrap_or_default();
        let credentials: Vec<Credential> = serde_json::from_str(&blob)
            .map_err(|e| TypesError::MalformedCredentials(e.to_string()))?;

        Ok(InitiateRequest {
            procedure_id: self.procedure_id.unwrap_or_default(),
            mid_b64: self.mid_b64.unwrap_or_default(),
            mid_hex: self.mid_hex.unwrap_or_default(),
            credentials,
        })
    }
}

/// Response body of a successful initiate request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitiateResponse {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<Uuid>,
}

/// Query of the staged-data endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedQuery {
    #[serde(alias = "mid")]
    pub mid_b64: Option<String>,
}
