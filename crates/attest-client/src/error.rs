use attest_bridge::BridgeError;
use attest_node::NodeError;
use attest_services::ServiceError;
use attest_types::TypesError;
use thiserror::Error;

/// Errors ending a procedure run.
#[derive(Debug, Error)]
pub enum ClientError {
    /// No attestation is held for a credential the procedure requires.
    #[error("missing hash for attribute {0}, no attestation is held for it")]
    MissingCredential(String),

    #[error("no value supplied for required credential {0}")]
    MissingCredentialValue(String),

    /// The Provider answered with a non-success status.
    #[error("provider rejected the request with {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("provider response malformed: {0}")]
    MalformedResponse(String),

    /// The Provider never staged every desired attribute.
    #[error("provider did not provide {missing:?} after {attempts} attempts")]
    PollExhausted { attempts: u32, missing: Vec<String> },

    #[error("node declined to request attestation of {0}")]
    AttestationDeclined(String),

    #[error("provider request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Node(#[from] NodeError),

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Types(#[from] TypesError),
}
