//! Shared types for the attestation procedure workspace.
//!
//! This crate holds the data model exchanged between the Requester, the
//! Provider and the identity-attestation node: peer identifiers, credentials,
//! attributes, attestations and the request records the node reports.
//! Procedure descriptions live in [`procedure`], the Provider's HTTP request
//! and response shapes in [`transport`].
//!
//! No crate in the workspace defines its own copy of these types. Wire names
//! (`mid_b64`, `attribute_hash`, `signer_mid_64`, ...) are fixed by the
//! attestation node and by the Provider's REST surface, so every struct pins
//! them with `serde` attributes.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub mod procedure;
pub mod transport;

pub use procedure::{AttributeDescription, ClientProcedure, ProcedureDescription, ProviderEndpoint};
pub use transport::{InitiateQuery, InitiateRequest, InitiateResponse, StagedQuery};

/// Correlation key that matches every holder.
pub const WILDCARD: &str = "*";

/// Identity format requested from the node when none is configured.
pub const DEFAULT_ID_FORMAT: &str = "id_metadata";

/// The two equivalent identifiers of a network participant.
///
/// The node addresses peers by the base64-like `primary` form in most
/// operations, and by the hex-like `secondary` form for DHT lookups.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId {
    /// Base64-like identifier.
    #[serde(rename = "mid_b64")]
    pub primary: String,
    /// Hex-like identifier.
    #[serde(rename = "mid_hex")]
    pub secondary: String,
}

impl PeerId {
    pub fn new(primary: impl Into<String>, secondary: impl Into<String>) -> Self {
        Self {
            primary: primary.into(),
            secondary: secondary.into(),
        }
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.primary)
    }
}

/// Proof of possession of a previously attested attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub attribute_name: String,
    /// Hash of the attestation the Requester already holds.
    pub attribute_hash: String,
    /// Claimed plain value, checked by the node against the hash.
    pub attribute_value: String,
}

/// An attribute value produced by a resolver, not yet attested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    pub attribute_name: String,
    pub attribute_value: String,
}

impl Attribute {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            attribute_name: name.into(),
            attribute_value: value.into(),
        }
    }
}

/// An attestation held by a node, as reported by the node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attestation {
    pub attribute_name: String,
    pub attribute_hash: String,
    pub metadata: String,
    /// Primary id of the peer that signed the attestation.
    #[serde(rename = "signer_mid_64")]
    pub signer: String,
}

/// An outstanding request from `holder` to have `attribute_name` attested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationRequest {
    #[serde(rename = "mid_b64")]
    pub holder: String,
    pub attribute_name: String,
    pub metadata: String,
}

/// An outstanding request from `holder` to verify one of our attributes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VerificationRequest {
    #[serde(rename = "mid_b64")]
    pub holder: String,
    pub attribute_name: String,
}

/// One verification result for an attribute hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationOutput {
    pub value_hash: String,
    pub probability: f64,
}

impl VerificationOutput {
    /// Probability above which a verification output counts as a match.
    pub const MATCH_THRESHOLD: f64 = 0.5;

    pub fn is_match(&self) -> bool {
        self.probability > Self::MATCH_THRESHOLD
    }
}

/// Errors raised while validating shared types.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypesError {
    /// A procedure description has no name.
    #[error("procedure name must not be empty")]
    EmptyProcedureName,

    /// Two output attributes of one procedure share a name.
    #[error("duplicate attribute name in procedure {procedure}: {name}")]
    DuplicateAttribute { procedure: String, name: String },

    /// Two requirements of one procedure share a name.
    #[error("duplicate requirement in procedure {procedure}: {name}")]
    DuplicateRequirement { procedure: String, name: String },

    /// The encoded credential blob could not be decoded.
    #[error("malformed credentials field: {0}")]
    MalformedCredentials(String),
}
