use attest_bridge::BridgeError;
use attest_node::NodeError;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error(transparent)]
    Node(#[from] NodeError),

    /// An action referenced a peer missing from the node's peer list.
    #[error("required peer {0} is not a known connection")]
    UnknownPeer(String),

    /// A verification permit ran out before the matching request arrived.
    #[error("grant for {attribute_name} of {holder} expired at {valid_until}")]
    GrantExpired {
        holder: String,
        attribute_name: String,
        valid_until: DateTime<Utc>,
    },

    /// The caller-imposed bound on verification elapsed.
    #[error("verification of {holder} timed out after {timeout:?}")]
    VerificationTimeout { holder: String, timeout: Duration },
}
