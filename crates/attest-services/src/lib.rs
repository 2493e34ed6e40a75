//! Attestation services built on the polling bridge.
//!
//! - [`StagedGrantQueue`]: per-holder, per-attribute grants with a deadline.
//! - [`VerifierService`]: verifies a peer's credentials and records when.
//! - [`AttesterService`]: attests staged attributes when their holder asks
//!   (Provider side).
//! - [`VerifieeService`]: lets a peer verify staged attributes when it asks
//!   (Requester side).
//!
//! Both background loops log and continue on failure; they never stop
//! because one request could not be handled.

pub mod attester;
pub mod clock;
pub mod error;
pub mod staged;
pub mod verifiee;
pub mod verifier;

pub use attester::{AttesterService, NonStagedAttestationListener};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::ServiceError;
pub use staged::{StagedGrant, StagedGrantQueue};
pub use verifiee::{NonStagedVerificationHandler, VerificationPermit, VerifieeService};
pub use verifier::{VerificationRecord, VerifierService, VerifyOptions};
