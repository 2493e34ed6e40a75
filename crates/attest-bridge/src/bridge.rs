//! The polling bridge.

use crate::error::BridgeError;
use crate::waitlist::WaitList;
use attest_node::NodeApi;
use attest_types::{
    Attestation, AttestationRequest, PeerId, VerificationRequest, DEFAULT_ID_FORMAT, WILDCARD,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// Default delay between two ticks.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1000);

/// Capacity of the verification-request snapshot channel. Subscribers that
/// fall further behind skip to the latest snapshot.
const SNAPSHOT_CAPACITY: usize = 16;

/// Turns the node's poll-only list operations into awaitable completions.
///
/// Every tick reads the node's "currently true" lists and dispatches them to
/// the waiters registered by key. Nothing is removed from the node by the
/// bridge, so an outstanding request is reported again on every tick until
/// something else consumes it.
pub struct PollingBridge {
    node: Arc<dyn NodeApi>,
    interval: Duration,
    peers: RwLock<Vec<String>>,
    connections: WaitList<()>,
    verifications: WaitList<bool>,
    attestation_requests: WaitList<AttestationRequest>,
    attestations: WaitList<Attestation>,
    verification_requests: broadcast::Sender<Arc<Vec<VerificationRequest>>>,
    ticks: AtomicUsize,
}

/// Handle to a running bridge loop.
#[derive(Debug)]
pub struct BridgeHandle {
    task: JoinHandle<()>,
}

impl BridgeHandle {
    /// Stops the loop. Pending waiters stay registered and are completed if
    /// the bridge is ticked again.
    pub fn stop(&self) {
        self.task.abort();
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl PollingBridge {
    pub fn new(node: Arc<dyn NodeApi>) -> Self {
        Self::with_interval(node, DEFAULT_POLL_INTERVAL)
    }

    pub fn with_interval(node: Arc<dyn NodeApi>, interval: Duration) -> Self {
        let (verification_requests, _) = broadcast::channel(SNAPSHOT_CAPACITY);
        Self {
            node,
            interval,
            peers: RwLock::new(Vec::new()),
            connections: WaitList::new(),
            verifications: WaitList::new(),
            attestation_requests: WaitList::new(),
            attestations: WaitList::new(),
            verification_requests,
            ticks: AtomicUsize::new(0),
        }
    }

    pub fn node(&self) -> &Arc<dyn NodeApi> {
        &self.node
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Spawns the tick loop.
    pub fn start(self: &Arc<Self>) -> BridgeHandle {
        let bridge = Arc::clone(self);
        tracing::info!(interval_ms = bridge.interval.as_millis() as u64, "starting polling bridge");

        let task = tokio::spawn(async move {
            loop {
                sleep(bridge.interval).await;
                bridge.tick().await;
            }
        });
        BridgeHandle { task }
    }

    /// Runs one polling round.
    ///
    /// Peers are refreshed first so that connection waiters and the known
    /// peer list are current for the rest of the round. A failed poll is
    /// logged and retried on the next tick.
    pub async fn tick(&self) {
        let tick = self.ticks.fetch_add(1, Ordering::Relaxed);

        self.poll_peers().await;
        tokio::join!(
            self.poll_attestation_requests(tick),
            self.poll_verification_outputs(),
            self.poll_verification_requests(),
            self.poll_attestations(),
        );
    }

    /// Primary ids from the last successful peer poll.
    pub fn known_peers(&self) -> Vec<String> {
        self.peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn is_known_peer(&self, primary: &str) -> bool {
        self.peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|p| p == primary)
    }

    /// Resolves once `peer` is in the node's peer list.
    ///
    /// Returns immediately if the last poll already listed it; otherwise asks
    /// the node to connect and waits for a later tick to list the peer.
    pub async fn await_connection(&self, peer: &PeerId) -> Result<(), BridgeError> {
        if self.is_known_peer(&peer.primary) {
            return Ok(());
        }

        tracing::info!(peer = %peer.primary, secondary = %peer.secondary, "connecting to peer");
        let rx = self.connections.register(&peer.primary);
        self.node.connect_peer(&peer.secondary).await?;
        rx.await.map_err(|_| BridgeError::Closed)
    }

    /// Requests verification of `value` against `attribute_hash` from
    /// `peer` and waits for the outcome.
    ///
    /// Resolves `true` once a poll shows a first output above the match
    /// threshold for the hash, and `false` right away if the node declines
    /// the request. There is no timeout here.
    pub async fn await_verification(
        &self,
        peer: &PeerId,
        attribute_hash: &str,
        value: &str,
    ) -> Result<bool, BridgeError> {
        self.await_connection(peer).await?;

        let rx = self.verifications.register(attribute_hash);
        tracing::info!(peer = %peer.primary, attribute_hash, "requesting verification");
        let accepted = self
            .node
            .request_verification(&peer.primary, attribute_hash, value, DEFAULT_ID_FORMAT)
            .await?;
        if !accepted {
            tracing::warn!(peer = %peer.primary, attribute_hash, "verification request declined");
            return Ok(false);
        }

        let verified = rx.await.map_err(|_| BridgeError::Closed)?;
        tracing::info!(peer = %peer.primary, attribute_hash, verified, "verification received");
        Ok(verified)
    }

    /// Waits for the next tick listing an outstanding attestation request
    /// from `key`, or from any holder if `key` is [`WILDCARD`].
    ///
    /// A request that stays outstanding is delivered again on later ticks,
    /// so a caller that keeps listening must register again.
    pub async fn await_attestation_request(
        &self,
        key: &str,
    ) -> Result<AttestationRequest, BridgeError> {
        let rx = self.attestation_requests.register(key);
        rx.await.map_err(|_| BridgeError::Closed)
    }

    /// Waits for a tick that lists an attestation held by this node with
    /// the given attribute name.
    pub async fn await_attestation(&self, attribute_name: &str) -> Result<Attestation, BridgeError> {
        let rx = self.attestations.register(attribute_name);
        rx.await.map_err(|_| BridgeError::Closed)
    }

    /// Snapshots of the outstanding verification requests, one per tick.
    pub fn subscribe_verification_requests(
        &self,
    ) -> broadcast::Receiver<Arc<Vec<VerificationRequest>>> {
        self.verification_requests.subscribe()
    }

    async fn poll_peers(&self) {
        let peers = match self.node.list_peers().await {
            Ok(peers) => peers,
            Err(e) => {
                tracing::warn!(error = %e, "failed to poll peers");
                return;
            }
        };

        for peer in &peers {
            if self.connections.dispatch(peer, ()) > 0 {
                tracing::info!(peer = %peer, "peer connected");
            }
        }
        *self.peers.write().unwrap_or_else(|e| e.into_inner()) = peers;
    }

    async fn poll_attestation_requests(&self, tick: usize) {
        let requests = match self.node.list_attestation_requests().await {
            Ok(requests) => requests,
            Err(e) => {
                tracing::warn!(error = %e, "failed to poll attestation requests");
                return;
            }
        };
        if requests.is_empty() {
            return;
        }

        // Wildcard waiters drain on the first request they see. Rotating the
        // start point gives every outstanding request a turn, so one request
        // nobody consumes cannot hide the ones behind it.
        let start = tick % requests.len();
        for request in requests[start..].iter().chain(&requests[..start]) {
            self.attestation_requests
                .dispatch(&request.holder, request.clone());
            self.attestation_requests.dispatch(WILDCARD, request.clone());
        }
    }

    async fn poll_verification_outputs(&self) {
        let outputs = match self.node.list_verification_outputs().await {
            Ok(outputs) => outputs,
            Err(e) => {
                tracing::warn!(error = %e, "failed to poll verification outputs");
                return;
            }
        };

        for (attribute_hash, values) in outputs {
            // Only the first output per hash counts.
            if values.first().is_some_and(|output| output.is_match()) {
                self.verifications.dispatch(&attribute_hash, true);
            }
        }
    }

    async fn poll_verification_requests(&self) {
        if self.verification_requests.receiver_count() == 0 {
            return;
        }
        match self.node.list_verification_requests().await {
            Ok(requests) => {
                let _ = self.verification_requests.send(Arc::new(requests));
            }
            Err(e) => tracing::warn!(error = %e, "failed to poll verification requests"),
        }
    }

    async fn poll_attestations(&self) {
        if self.attestations.is_empty() {
            return;
        }
        match self.node.list_attestations().await {
            Ok(attestations) => {
                for attestation in attestations {
                    let name = attestation.attribute_name.clone();
                    self.attestations.dispatch(&name, attestation);
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to poll attestations"),
        }
    }
}
