//! Tests for the polling bridge against the simulated node network.
//!
//! These tests verify:
//! - connection waiters resolve immediately for known peers and on a later
//!   tick for new ones
//! - verification resolves true on a matching output and false when declined
//! - outstanding attestation requests are redelivered on every tick
//! - a failed poll does not stop the loop
//! - verification-request snapshots are only polled for subscribers

use attest_bridge::{BridgeError, PollingBridge};
use attest_node::memory::{MemoryNetwork, MemoryNode};
use attest_node::{NodeApi, NodeError};
use attest_types::WILDCARD;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn bridge_for(node: &MemoryNode) -> Arc<PollingBridge> {
    Arc::new(PollingBridge::with_interval(
        Arc::new(node.clone()),
        Duration::from_millis(10),
    ))
}

#[tokio::test]
async fn known_peer_connects_without_node_call() {
    let network = MemoryNetwork::new();
    let provider = network.add_node("provider");
    let requester = network.add_node("requester");
    provider.discover(&requester);

    let bridge = bridge_for(&provider);
    bridge.tick().await;
    assert!(bridge.is_known_peer(&requester.peer_id().primary));

    bridge
        .await_connection(requester.peer_id())
        .await
        .expect("known peer");
    assert_eq!(provider.call_count("connect_peer"), 0);
}

#[tokio::test]
async fn new_peer_resolves_on_later_tick() {
    let network = MemoryNetwork::new();
    let provider = network.add_node("provider");
    let requester = network.add_node("requester");

    let bridge = bridge_for(&provider);
    let handle = bridge.start();

    timeout(WAIT, bridge.await_connection(requester.peer_id()))
        .await
        .expect("connection within timeout")
        .expect("connect should succeed");
    assert_eq!(provider.call_count("connect_peer"), 1);
    assert_eq!(bridge.known_peers(), vec![requester.peer_id().primary.clone()]);
    handle.stop();
}

#[tokio::test]
async fn connect_failure_propagates_to_caller() {
    let network = MemoryNetwork::new();
    let provider = network.add_node("provider");
    let stranger = attest_types::PeerId::new("c3RyYW5nZXI=", "00aa");

    let bridge = bridge_for(&provider);
    let err = bridge.await_connection(&stranger).await.unwrap_err();
    assert!(matches!(err, BridgeError::Node(NodeError::UnknownPeer(_))));
}

#[tokio::test]
async fn verification_resolves_after_holder_allows() {
    let network = MemoryNetwork::new();
    let provider = network.add_node("provider");
    let requester = network.add_node("requester");
    let attestation = provider.issue_attestation(&requester, "att0", "att0val");

    let bridge = bridge_for(&provider);
    let handle = bridge.start();

    let waiter = {
        let bridge = bridge.clone();
        let peer = requester.peer_id().clone();
        let hash = attestation.attribute_hash.clone();
        tokio::spawn(async move { bridge.await_verification(&peer, &hash, "att0val").await })
    };

    // play the holder's side by hand
    let verifier = provider.peer_id().primary.clone();
    timeout(WAIT, async {
        loop {
            let outstanding = requester.list_verification_requests().await.unwrap();
            if outstanding.iter().any(|r| r.holder == verifier) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("verification request should reach the holder");
    requester.allow_verify(&verifier, "att0").await.unwrap();

    let verified = timeout(WAIT, waiter)
        .await
        .expect("verification within timeout")
        .expect("task should not panic")
        .expect("verification should not fail");
    assert!(verified);
    handle.stop();
}

#[tokio::test]
async fn declined_verification_resolves_false() {
    let network = MemoryNetwork::new();
    let provider = network.add_node("provider");
    let requester = network.add_node("requester");
    provider.discover(&requester);

    let bridge = bridge_for(&provider);
    bridge.tick().await;

    let verified = bridge
        .await_verification(requester.peer_id(), "dW5rbm93bg==", "value")
        .await
        .expect("declined is not an error");
    assert!(!verified);
}

#[tokio::test]
async fn attestation_request_is_redelivered_each_tick() {
    let network = MemoryNetwork::new();
    let provider = network.add_node("provider");
    let requester = network.add_node("requester");
    requester
        .request_attestation(&provider.peer_id().primary, "att0", "id_metadata")
        .await
        .unwrap();

    let bridge = bridge_for(&provider);
    for _ in 0..3 {
        let holder_waiter = bridge.await_attestation_request(&requester.peer_id().primary);
        let wildcard_waiter = bridge.await_attestation_request(WILDCARD);
        let (by_holder, by_wildcard, ()) =
            tokio::join!(holder_waiter, wildcard_waiter, async {
                tokio::task::yield_now().await;
                bridge.tick().await;
            });
        assert_eq!(by_holder.unwrap().attribute_name, "att0");
        assert_eq!(by_wildcard.unwrap().holder, requester.peer_id().primary);
    }
}

#[tokio::test]
async fn failed_tick_does_not_stop_the_loop() {
    let network = MemoryNetwork::new();
    let provider = network.add_node("provider");
    let requester = network.add_node("requester");
    provider.discover(&requester);
    provider.set_online(false);

    let bridge = bridge_for(&provider);
    let handle = bridge.start();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(handle.is_running());
    assert!(bridge.known_peers().is_empty());

    provider.set_online(true);
    timeout(WAIT, async {
        while !bridge.is_known_peer(&requester.peer_id().primary) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("peers should be polled again once the node is back");
    handle.stop();
}

#[tokio::test]
async fn verification_requests_polled_only_for_subscribers() {
    let network = MemoryNetwork::new();
    let provider = network.add_node("provider");
    let requester = network.add_node("requester");
    provider.discover(&requester);
    let attestation = provider.issue_attestation(&requester, "att0", "att0val");
    provider
        .request_verification(
            &requester.peer_id().primary,
            &attestation.attribute_hash,
            "att0val",
            "id_metadata",
        )
        .await
        .unwrap();

    let bridge = bridge_for(&requester);
    bridge.tick().await;
    assert_eq!(requester.call_count("list_verification_requests"), 0);

    let mut snapshots = bridge.subscribe_verification_requests();
    bridge.tick().await;
    bridge.tick().await;
    for _ in 0..2 {
        let snapshot = snapshots.recv().await.expect("snapshot per tick");
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].attribute_name, "att0");
    }
}

#[tokio::test]
async fn attestation_waiter_matches_by_name() {
    let network = MemoryNetwork::new();
    let provider = network.add_node("provider");
    let requester = network.add_node("requester");

    let bridge = bridge_for(&requester);
    bridge.tick().await;
    assert_eq!(requester.call_count("list_attestations"), 0);

    let waiter = bridge.await_attestation("att1");
    let (attestation, ()) = tokio::join!(waiter, async {
        provider.issue_attestation(&requester, "att0", "att0val");
        bridge.tick().await;
        provider.issue_attestation(&requester, "att1", "att1val");
        bridge.tick().await;
    });
    let attestation = attestation.expect("attestation");
    assert_eq!(attestation.attribute_name, "att1");
    assert_eq!(attestation.signer, provider.peer_id().primary);
}
