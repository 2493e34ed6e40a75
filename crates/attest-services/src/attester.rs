//! Attester side: attributes staged for holders, attested when the holder
//! asks for them.

use crate::clock::Clock;
use crate::error::ServiceError;
use crate::staged::{StagedGrant, StagedGrantQueue};
use attest_bridge::PollingBridge;
use attest_types::{Attribute, AttestationRequest, WILDCARD};
use chrono::{DateTime, Utc};
use std::sync::{Arc, RwLock};
use tokio::task::JoinHandle;

/// Called for attestation requests that have no valid staged grant.
pub type NonStagedAttestationListener = Arc<dyn Fn(&AttestationRequest) + Send + Sync>;

pub struct AttesterService {
    bridge: Arc<PollingBridge>,
    queue: StagedGrantQueue<Attribute>,
    listeners: RwLock<Vec<NonStagedAttestationListener>>,
}

impl AttesterService {
    pub fn new(bridge: Arc<PollingBridge>, clock: Arc<dyn Clock>) -> Self {
        Self {
            bridge,
            queue: StagedGrantQueue::new(clock),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Grants `holder` the attestation of `attribute` until `valid_until`.
    pub fn stage_attestation(&self, holder: &str, attribute: Attribute, valid_until: DateTime<Utc>) {
        tracing::debug!(holder, attribute_name = %attribute.attribute_name, %valid_until, "staging attestation");
        let name = attribute.attribute_name.clone();
        self.queue.stage(holder, &name, attribute, valid_until);
    }

    /// The holder's valid staged attestations. Never removes a grant.
    pub fn list_staged_attestations(&self, holder: &str) -> Vec<StagedGrant<Attribute>> {
        self.queue.list_valid(holder)
    }

    pub fn on_non_staged_request<F>(&self, listener: F)
    where
        F: Fn(&AttestationRequest) + Send + Sync + 'static,
    {
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::new(listener));
    }

    /// Spawns the loop that waits for any holder's attestation request,
    /// handles it and waits again. The loop does not end on its own.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            tracing::info!("attester listening for attestation requests");
            loop {
                match service.bridge.await_attestation_request(WILDCARD).await {
                    Ok(request) => {
                        if let Err(e) = service.handle_request(&request).await {
                            tracing::error!(
                                holder = %request.holder,
                                attribute_name = %request.attribute_name,
                                error = %e,
                                "attestation failed"
                            );
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "attestation request listener dropped");
                        tokio::time::sleep(service.bridge.interval()).await;
                    }
                }
            }
        })
    }

    /// Attests the request if a valid grant is staged for it, removing the
    /// grant once the node accepted. Otherwise notifies the non-staged
    /// listeners. Returns whether an attestation was made.
    ///
    /// A failed attest call keeps the grant, so the still-outstanding request
    /// is tried again when it is delivered on a later tick. A grant restaged
    /// for the same attribute while the node was attesting is kept as well.
    pub async fn handle_request(&self, request: &AttestationRequest) -> Result<bool, ServiceError> {
        let Some(grant) = self.queue.consume(&request.holder, &request.attribute_name) else {
            tracing::debug!(
                holder = %request.holder,
                attribute_name = %request.attribute_name,
                "attestation request without staged grant"
            );
            let listeners = self
                .listeners
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .clone();
            for listener in listeners {
                listener(request);
            }
            return Ok(false);
        };

        self.bridge
            .node()
            .attest(
                &request.holder,
                &request.attribute_name,
                &grant.payload.attribute_value,
            )
            .await?;
        // Only the grant that was attested goes; one staged meanwhile stays.
        self.queue
            .remove_if(&request.holder, &request.attribute_name, |current| current == &grant);
        tracing::info!(
            holder = %request.holder,
            attribute_name = %request.attribute_name,
            "attested staged attribute"
        );
        Ok(true)
    }
}
