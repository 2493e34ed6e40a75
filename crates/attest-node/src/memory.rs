//! In-process simulation of a network of attestation nodes.
//!
//! Each [`MemoryNode`] implements [`NodeApi`] over state shared through its
//! [`MemoryNetwork`], so a Provider and a Requester can run a complete
//! procedure without a real node. The simulation keeps the level-triggered
//! behaviour of the real node: outstanding requests stay listed until they
//! are answered, verification outputs and attestations stay listed forever.
//!
//! Attribute hashes are `base64(sha256(value))`; a verification output has
//! probability `1.0` when the claimed value hashes to the attested hash and
//! `0.0` otherwise.

use crate::{NodeApi, NodeError, VerificationOutputMap};
use async_trait::async_trait;
use attest_types::{
    Attestation, AttestationRequest, PeerId, VerificationOutput, VerificationRequest,
};
use base64::Engine;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

/// Hash used for attested values.
pub fn attribute_hash(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(digest)
}

#[derive(Debug)]
struct PendingVerification {
    holder: String,
    attribute_hash: String,
    value: String,
}

#[derive(Debug)]
struct NodeState {
    peer: PeerId,
    online: bool,
    peers: BTreeSet<String>,
    attestation_requests: Vec<AttestationRequest>,
    verification_requests: Vec<VerificationRequest>,
    pending_verifications: Vec<PendingVerification>,
    verification_outputs: BTreeMap<String, Vec<VerificationOutput>>,
    attestations: Vec<Attestation>,
    calls: HashMap<&'static str, usize>,
}

#[derive(Debug, Default)]
struct NetworkState {
    nodes: HashMap<String, NodeState>,
}

impl NetworkState {
    fn node(&self, primary: &str) -> Result<&NodeState, NodeError> {
        self.nodes
            .get(primary)
            .ok_or_else(|| NodeError::UnknownPeer(primary.to_string()))
    }

    fn node_mut(&mut self, primary: &str) -> Result<&mut NodeState, NodeError> {
        self.nodes
            .get_mut(primary)
            .ok_or_else(|| NodeError::UnknownPeer(primary.to_string()))
    }
}

/// A set of simulated nodes that can see each other.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node whose ids are derived from `name`.
    pub fn add_node(&self, name: &str) -> MemoryNode {
        let digest = Sha256::digest(name.as_bytes());
        let primary = base64::engine::general_purpose::STANDARD.encode(&digest[..20]);
        let secondary = hex::encode(&digest[..20]);
        let peer = PeerId::new(primary, secondary);

        lock(&self.state).nodes.insert(
            peer.primary.clone(),
            NodeState {
                peer: peer.clone(),
                online: true,
                peers: BTreeSet::new(),
                attestation_requests: Vec::new(),
                verification_requests: Vec::new(),
                pending_verifications: Vec::new(),
                verification_outputs: BTreeMap::new(),
                attestations: Vec::new(),
                calls: HashMap::new(),
            },
        );

        MemoryNode {
            peer,
            network: self.state.clone(),
        }
    }
}

/// One simulated node.
#[derive(Debug, Clone)]
pub struct MemoryNode {
    peer: PeerId,
    network: Arc<Mutex<NetworkState>>,
}

fn lock(state: &Mutex<NetworkState>) -> MutexGuard<'_, NetworkState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemoryNode {
    pub fn peer_id(&self) -> &PeerId {
        &self.peer
    }

    /// Takes the node offline (every call fails) or back online.
    pub fn set_online(&self, online: bool) {
        if let Ok(node) = lock(&self.network).node_mut(&self.peer.primary) {
            node.online = online;
        }
    }

    /// Number of calls made to `operation` (e.g. `"attest"`), including
    /// failed ones.
    pub fn call_count(&self, operation: &str) -> usize {
        lock(&self.network)
            .node(&self.peer.primary)
            .map(|node| node.calls.get(operation).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Makes this node and `other` discover each other.
    pub fn discover(&self, other: &MemoryNode) {
        let mut state = lock(&self.network);
        if let Ok(node) = state.node_mut(&self.peer.primary) {
            node.peers.insert(other.peer.primary.clone());
        }
        if let Ok(node) = state.node_mut(&other.peer.primary) {
            node.peers.insert(self.peer.primary.clone());
        }
    }

    /// Gives `holder` an attestation of `name = value` signed by this node,
    /// bypassing the request/attest exchange.
    pub fn issue_attestation(&self, holder: &MemoryNode, name: &str, value: &str) -> Attestation {
        let attestation = Attestation {
            attribute_name: name.to_string(),
            attribute_hash: attribute_hash(value),
            metadata: String::new(),
            signer: self.peer.primary.clone(),
        };
        if let Ok(node) = lock(&self.network).node_mut(&holder.peer.primary) {
            node.attestations.push(attestation.clone());
        }
        attestation
    }

    /// Locks the network, records the call and fails if this node is offline.
    fn enter(&self, operation: &'static str) -> Result<MutexGuard<'_, NetworkState>, NodeError> {
        let mut state = lock(&self.network);
        let node = state.node_mut(&self.peer.primary)?;
        *node.calls.entry(operation).or_insert(0) += 1;
        if !node.online {
            return Err(NodeError::Unavailable(format!(
                "{} is offline",
                self.peer.primary
            )));
        }
        Ok(state)
    }
}

#[async_trait]
impl NodeApi for MemoryNode {
    async fn list_peers(&self) -> Result<Vec<String>, NodeError> {
        let state = self.enter("list_peers")?;
        Ok(state.node(&self.peer.primary)?.peers.iter().cloned().collect())
    }

    async fn connect_peer(&self, secondary: &str) -> Result<(), NodeError> {
        let mut state = self.enter("connect_peer")?;
        let target = state
            .nodes
            .values()
            .find(|n| n.peer.secondary == secondary)
            .map(|n| n.peer.primary.clone())
            .ok_or_else(|| NodeError::UnknownPeer(secondary.to_string()))?;

        state.node_mut(&self.peer.primary)?.peers.insert(target.clone());
        state.node_mut(&target)?.peers.insert(self.peer.primary.clone());
        Ok(())
    }

    async fn list_verification_requests(&self) -> Result<Vec<VerificationRequest>, NodeError> {
        let state = self.enter("list_verification_requests")?;
        Ok(state.node(&self.peer.primary)?.verification_requests.clone())
    }

    async fn request_verification(
        &self,
        holder: &str,
        attribute_hash: &str,
        value: &str,
        _id_format: &str,
    ) -> Result<bool, NodeError> {
        let mut state = self.enter("request_verification")?;
        if !state.node(&self.peer.primary)?.peers.contains(holder) {
            return Err(NodeError::UnknownPeer(holder.to_string()));
        }

        let holder_node = state.node_mut(holder)?;
        let Some(attribute_name) = holder_node
            .attestations
            .iter()
            .find(|a| a.attribute_hash == attribute_hash)
            .map(|a| a.attribute_name.clone())
        else {
            return Ok(false);
        };

        let request = VerificationRequest {
            holder: self.peer.primary.clone(),
            attribute_name,
        };
        if !holder_node.verification_requests.contains(&request) {
            holder_node.verification_requests.push(request);
        }

        state
            .node_mut(&self.peer.primary)?
            .pending_verifications
            .push(PendingVerification {
                holder: holder.to_string(),
                attribute_hash: attribute_hash.to_string(),
                value: value.to_string(),
            });
        Ok(true)
    }

    async fn allow_verify(&self, verifier: &str, attribute_name: &str) -> Result<bool, NodeError> {
        let mut state = self.enter("allow_verify")?;
        let me = state.node_mut(&self.peer.primary)?;
        let before = me.verification_requests.len();
        me.verification_requests
            .retain(|r| !(r.holder == verifier && r.attribute_name == attribute_name));
        if me.verification_requests.len() == before {
            return Ok(false);
        }

        let hashes: BTreeSet<String> = me
            .attestations
            .iter()
            .filter(|a| a.attribute_name == attribute_name)
            .map(|a| a.attribute_hash.clone())
            .collect();

        let verifier_node = state.node_mut(verifier)?;
        let holder = self.peer.primary.clone();
        let (answered, pending): (Vec<_>, Vec<_>) = verifier_node
            .pending_verifications
            .drain(..)
            .partition(|p| p.holder == holder && hashes.contains(&p.attribute_hash));
        verifier_node.pending_verifications = pending;

        for request in answered {
            let value_hash = attribute_hash(&request.value);
            let probability = if value_hash == request.attribute_hash {
                1.0
            } else {
                0.0
            };
            verifier_node
                .verification_outputs
                .entry(request.attribute_hash)
                .or_default()
                .push(VerificationOutput {
                    value_hash,
                    probability,
                });
        }
        Ok(true)
    }

    async fn list_verification_outputs(&self) -> Result<VerificationOutputMap, NodeError> {
        let state = self.enter("list_verification_outputs")?;
        Ok(state
            .node(&self.peer.primary)?
            .verification_outputs
            .iter()
            .map(|(hash, outputs)| (hash.clone(), outputs.clone()))
            .collect())
    }

    async fn list_attestation_requests(&self) -> Result<Vec<AttestationRequest>, NodeError> {
        let state = self.enter("list_attestation_requests")?;
        Ok(state.node(&self.peer.primary)?.attestation_requests.clone())
    }

    async fn request_attestation(
        &self,
        attester: &str,
        attribute_name: &str,
        id_format: &str,
    ) -> Result<bool, NodeError> {
        let mut state = self.enter("request_attestation")?;
        let metadata = serde_json::json!({ "id_format": id_format }).to_string();
        let request = AttestationRequest {
            holder: self.peer.primary.clone(),
            attribute_name: attribute_name.to_string(),
            metadata,
        };

        let attester_node = state.node_mut(attester)?;
        if !attester_node.attestation_requests.iter().any(|r| {
            r.holder == request.holder && r.attribute_name == request.attribute_name
        }) {
            attester_node.attestation_requests.push(request);
        }
        Ok(true)
    }

    async fn attest(
        &self,
        holder: &str,
        attribute_name: &str,
        value: &str,
    ) -> Result<serde_json::Value, NodeError> {
        let mut state = self.enter("attest")?;
        let me = state.node_mut(&self.peer.primary)?;
        let position = me
            .attestation_requests
            .iter()
            .position(|r| r.holder == holder && r.attribute_name == attribute_name)
            .ok_or_else(|| NodeError::Rejected {
                operation: "attest".to_string(),
                reason: format!("no outstanding request for {attribute_name} from {holder}"),
            })?;
        let request = me.attestation_requests.remove(position);
        let signer = me.peer.primary.clone();

        state.node_mut(holder)?.attestations.push(Attestation {
            attribute_name: attribute_name.to_string(),
            attribute_hash: attribute_hash(value),
            metadata: request.metadata,
            signer,
        });
        Ok(serde_json::json!({ "success": true }))
    }

    async fn list_attestations(&self) -> Result<Vec<Attestation>, NodeError> {
        let state = self.enter("list_attestations")?;
        Ok(state.node(&self.peer.primary)?.attestations.clone())
    }
}
