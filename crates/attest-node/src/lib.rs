//! Capability surface of the identity-attestation node.
//!
//! The node performs peer discovery and the actual cryptographic attestation
//! and verification. This crate only wraps its operations: [`NodeApi`] is the
//! surface the rest of the workspace consumes, [`HttpNodeClient`] implements
//! it against the node's REST endpoints.
//!
//! There is no retry or caching here. Every failure propagates to the caller
//! as a [`NodeError`].
//!
//! With the `memory` feature, [`memory::MemoryNetwork`] simulates a set of
//! nodes in process, which is what the integration tests of the higher
//! layers run against.

use async_trait::async_trait;
use attest_types::{Attestation, AttestationRequest, VerificationOutput, VerificationRequest};
use std::collections::HashMap;
use thiserror::Error;

pub mod client;
#[cfg(feature = "memory")]
pub mod memory;

pub use client::HttpNodeClient;

/// Verification outputs keyed by attribute hash.
pub type VerificationOutputMap = HashMap<String, Vec<VerificationOutput>>;

/// Errors returned by node operations.
#[derive(Debug, Error)]
pub enum NodeError {
    /// The request never produced a response.
    #[error("node request failed: {0}")]
    Network(#[from] reqwest::Error),

    /// The node answered with a non-success status.
    #[error("node returned {status} for {path}: {message}")]
    Status {
        path: String,
        status: u16,
        message: String,
    },

    /// The node's response did not have the expected shape.
    #[error("unexpected node response for {path}: {reason}")]
    Decode { path: String, reason: String },

    /// The referenced peer is not known to the node.
    #[error("unknown peer: {0}")]
    UnknownPeer(String),

    /// The node refused the operation.
    #[error("node rejected {operation}: {reason}")]
    Rejected { operation: String, reason: String },

    /// The node is not reachable.
    #[error("node unavailable: {0}")]
    Unavailable(String),
}

/// Operations offered by an identity-attestation node.
///
/// Peer arguments are primary ids except for [`NodeApi::connect_peer`],
/// which takes the secondary (hex) id used for DHT lookups.
#[async_trait]
pub trait NodeApi: Send + Sync {
    /// Primary ids of the currently discovered peers.
    async fn list_peers(&self) -> Result<Vec<String>, NodeError>;

    /// Asks the node to look up and connect to a peer.
    async fn connect_peer(&self, secondary: &str) -> Result<(), NodeError>;

    /// Outstanding requests from other peers to verify our attributes.
    async fn list_verification_requests(&self) -> Result<Vec<VerificationRequest>, NodeError>;

    /// Asks `holder` to let us verify that `value` matches `attribute_hash`.
    async fn request_verification(
        &self,
        holder: &str,
        attribute_hash: &str,
        value: &str,
        id_format: &str,
    ) -> Result<bool, NodeError>;

    /// Lets `verifier` verify our attribute `attribute_name`.
    async fn allow_verify(&self, verifier: &str, attribute_name: &str) -> Result<bool, NodeError>;

    /// Results of the verifications we requested, pending and completed.
    async fn list_verification_outputs(&self) -> Result<VerificationOutputMap, NodeError>;

    /// Outstanding requests from other peers to attest an attribute.
    async fn list_attestation_requests(&self) -> Result<Vec<AttestationRequest>, NodeError>;

    /// Asks `attester` to attest `attribute_name` for us.
    async fn request_attestation(
        &self,
        attester: &str,
        attribute_name: &str,
        id_format: &str,
    ) -> Result<bool, NodeError>;

    /// Attests `attribute_name = value` for `holder`.
    async fn attest(
        &self,
        holder: &str,
        attribute_name: &str,
        value: &str,
    ) -> Result<serde_json::Value, NodeError>;

    /// Attestations held by this node.
    async fn list_attestations(&self) -> Result<Vec<Attestation>, NodeError>;
}
