//! Requester side of an attestation procedure.
//!
//! [`ProcedureClient`] proves the required credentials to a Provider, waits
//! for the Provider to stage the resulting attributes and collects their
//! attestations from the node.

pub mod config;
pub mod error;
pub mod gateway;
pub mod procedure;

pub use error::ClientError;
pub use gateway::{HttpProviderGateway, ProviderApi};
pub use procedure::{ClientSettings, ProcedureClient, ProcedureOutcome};
