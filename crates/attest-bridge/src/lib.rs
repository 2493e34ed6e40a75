//! Polling bridge between the attestation node and the services.
//!
//! The node only offers list operations that report what is currently
//! outstanding. [`PollingBridge`] polls them on a fixed interval and hands
//! the results to waiters registered in a [`WaitList`], turning continuous
//! polling into one-shot completions:
//!
//! - connection waiters are keyed by the peer's primary id;
//! - verification waiters by attribute hash;
//! - attestation-request waiters by holder id or [`attest_types::WILDCARD`];
//! - attestation waiters by attribute name.
//!
//! Outstanding verification requests are published as a level-triggered
//! snapshot per tick on a broadcast channel instead, so each subscriber
//! decides per tick whether to act.

pub mod bridge;
pub mod error;
pub mod waitlist;

pub use bridge::{BridgeHandle, PollingBridge, DEFAULT_POLL_INTERVAL};
pub use error::BridgeError;
pub use waitlist::WaitList;
