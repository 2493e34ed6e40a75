//! Verifiee side: permissions for a peer to verify our attributes, granted
//! ahead of the peer's verification request.

use crate::clock::Clock;
use crate::error::ServiceError;
use crate::staged::StagedGrantQueue;
use async_trait::async_trait;
use attest_bridge::PollingBridge;
use attest_types::VerificationRequest;
use chrono::{DateTime, Utc};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Decides on verification requests that have no valid staged grant.
#[async_trait]
pub trait NonStagedVerificationHandler: Send + Sync {
    /// Returns `true` to allow the verification anyway.
    async fn on_request(&self, request: &VerificationRequest) -> bool;
}

type Acceptance = Arc<watch::Sender<bool>>;

/// Resolves once the staged permission was used by the peer.
pub struct VerificationPermit {
    holder: String,
    attribute_name: String,
    valid_until: DateTime<Utc>,
    clock: Arc<dyn Clock>,
    accepted: watch::Receiver<bool>,
}

impl std::fmt::Debug for VerificationPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerificationPermit")
            .field("holder", &self.holder)
            .field("attribute_name", &self.attribute_name)
            .field("valid_until", &self.valid_until)
            .finish_non_exhaustive()
    }
}

impl VerificationPermit {
    pub fn attribute_name(&self) -> &str {
        &self.attribute_name
    }

    pub fn valid_until(&self) -> DateTime<Utc> {
        self.valid_until
    }

    /// Waits until the peer's request was allowed.
    ///
    /// Fails with `GrantExpired` once the validity window has passed, or
    /// when the grant was replaced by a newer one.
    pub async fn accepted(mut self) -> Result<(), ServiceError> {
        if *self.accepted.borrow() {
            return Ok(());
        }

        let remaining = (self.valid_until - self.clock.now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        let accepted = matches!(
            tokio::time::timeout(remaining, self.accepted.wait_for(|accepted| *accepted)).await,
            Ok(Ok(_))
        );
        if accepted {
            return Ok(());
        }
        Err(ServiceError::GrantExpired {
            holder: self.holder,
            attribute_name: self.attribute_name,
            valid_until: self.valid_until,
        })
    }
}

pub struct VerifieeService {
    bridge: Arc<PollingBridge>,
    queue: StagedGrantQueue<Acceptance>,
    handler: RwLock<Option<Arc<dyn NonStagedVerificationHandler>>>,
}

impl VerifieeService {
    pub fn new(bridge: Arc<PollingBridge>, clock: Arc<dyn Clock>) -> Self {
        Self {
            bridge,
            queue: StagedGrantQueue::new(clock),
            handler: RwLock::new(None),
        }
    }

    /// Allows `peer` to verify each of `attribute_names` until
    /// `valid_until`, returning one permit per name in the same order.
    ///
    /// Grants stay staged after they were used and lapse with their deadline.
    pub fn stage_verification(
        &self,
        peer: &str,
        attribute_names: &[String],
        valid_until: DateTime<Utc>,
    ) -> Vec<VerificationPermit> {
        attribute_names
            .iter()
            .map(|name| {
                let (tx, rx) = watch::channel(false);
                self.queue.stage(peer, name, Arc::new(tx), valid_until);
                tracing::debug!(peer, attribute_name = %name, %valid_until, "staged verification");
                VerificationPermit {
                    holder: peer.to_string(),
                    attribute_name: name.clone(),
                    valid_until,
                    clock: self.queue.clock().clone(),
                    accepted: rx,
                }
            })
            .collect()
    }

    /// Replaces the handler for non-staged requests.
    pub fn on_non_staged_request(&self, handler: Arc<dyn NonStagedVerificationHandler>) {
        *self.handler.write().unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    /// Spawns the loop that handles every snapshot of outstanding
    /// verification requests. A request left alone shows up again in the
    /// next snapshot.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let service = Arc::clone(self);
        let mut snapshots = self.bridge.subscribe_verification_requests();
        tokio::spawn(async move {
            tracing::info!("verifiee listening for verification requests");
            loop {
                match snapshots.recv().await {
                    Ok(requests) => {
                        for request in requests.iter() {
                            if let Err(e) = service.handle_request(request).await {
                                tracing::warn!(
                                    peer = %request.holder,
                                    attribute_name = %request.attribute_name,
                                    error = %e,
                                    "verification request not allowed"
                                );
                            }
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "verifiee skipped stale snapshots");
                    }
                    Err(RecvError::Closed) => {
                        tracing::warn!("verification request stream closed");
                        break;
                    }
                }
            }
        })
    }

    /// Allows the request if a valid grant is staged for it, or if the
    /// non-staged handler approves. Returns whether it was allowed.
    pub async fn handle_request(&self, request: &VerificationRequest) -> Result<bool, ServiceError> {
        if let Some(grant) = self.queue.consume(&request.holder, &request.attribute_name) {
            self.allow(request).await?;
            grant.payload.send_replace(true);
            return Ok(true);
        }

        let handler = self
            .handler
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let Some(handler) = handler else {
            return Ok(false);
        };
        if !handler.on_request(request).await {
            return Ok(false);
        }
        self.allow(request).await?;
        Ok(true)
    }

    async fn allow(&self, request: &VerificationRequest) -> Result<(), ServiceError> {
        if !self.bridge.is_known_peer(&request.holder) {
            return Err(ServiceError::UnknownPeer(request.holder.clone()));
        }
        self.bridge
            .node()
            .allow_verify(&request.holder, &request.attribute_name)
            .await?;
        tracing::info!(
            peer = %request.holder,
            attribute_name = %request.attribute_name,
            "allowed verification"
        );
        Ok(())
    }
}
