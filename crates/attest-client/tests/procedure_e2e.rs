//! End-to-end procedure runs: a Provider served over HTTP and a Requester,
//! both on a simulated node network.
//!
//! These tests verify:
//! - a procedure without requirements yields its data and an attestation
//!   signed by the Provider
//! - a procedure requiring a credential verifies it first, using an
//!   attestation obtained from an earlier run
//! - the Provider's validation error reaches the caller and nothing is staged
//! - a Provider that never stages the attributes exhausts the poll bound

use attest_bridge::{BridgeHandle, PollingBridge};
use attest_client::{gateway, ClientError, ClientSettings, HttpProviderGateway, ProcedureClient};
use attest_node::memory::{MemoryNetwork, MemoryNode};
use attest_node::NodeApi;
use attest_server::procedure::{ProcedureConfig, ProcedureRegistry, StaticResolver};
use attest_server::transaction::EngineSettings;
use attest_server::{Provider, ProviderHandle};
use attest_services::{SystemClock, VerifieeService};
use attest_types::{
    Attribute, AttributeDescription, ClientProcedure, ProcedureDescription, ProviderEndpoint,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

const TICK: Duration = Duration::from_millis(10);
const RUN_LIMIT: Duration = Duration::from_secs(10);

fn description(name: &str, requirements: &[&str], attributes: &[&str]) -> ProcedureDescription {
    ProcedureDescription {
        procedure_name: name.to_string(),
        requirements: requirements.iter().map(|s| s.to_string()).collect(),
        attributes: attributes.iter().map(|s| AttributeDescription::new(*s)).collect(),
    }
}

fn registry() -> ProcedureRegistry {
    let mut registry = ProcedureRegistry::new();
    let procedures = [
        (description("p0", &[], &["att0"]), vec![Attribute::new("att0", "att0val")]),
        (description("p1", &["att0"], &["att1"]), vec![Attribute::new("att1", "att1val")]),
        (description("p_never", &[], &["att9"]), vec![]),
    ];
    for (desc, values) in procedures {
        registry
            .insert(ProcedureConfig::new(desc, Arc::new(StaticResolver::new(values))))
            .expect("valid procedure");
    }
    registry
}

/// A running Provider and Requester; background tasks stop on drop.
struct World {
    provider_node: MemoryNode,
    requester_node: MemoryNode,
    endpoint: ProviderEndpoint,
    client: ProcedureClient,
    provider: Provider,
    provider_handle: ProviderHandle,
    requester_bridge: BridgeHandle,
    verifiee: JoinHandle<()>,
    server: JoinHandle<()>,
}

impl Drop for World {
    fn drop(&mut self) {
        self.provider_handle.stop();
        self.requester_bridge.stop();
        self.verifiee.abort();
        self.server.abort();
    }
}

async fn world(max_poll_attempts: u32) -> World {
    let network = MemoryNetwork::new();
    let provider_node = network.add_node("provider");
    let requester_node = network.add_node("requester");

    let provider = Provider::new(
        Arc::new(provider_node.clone()),
        registry(),
        Arc::new(SystemClock),
        TICK,
        EngineSettings {
            verification_timeout: Some(Duration::from_secs(5)),
            ..EngineSettings::default()
        },
    );
    let provider_handle = provider.start();

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let router = provider.router();
    let server = tokio::spawn(async move {
        axum::serve(listener, router).await.expect("serve");
    });

    let bridge = Arc::new(PollingBridge::with_interval(
        Arc::new(requester_node.clone()),
        TICK,
    ));
    let verifiee = Arc::new(VerifieeService::new(bridge.clone(), Arc::new(SystemClock)));
    let client = ProcedureClient::new(
        requester_node.peer_id().clone(),
        bridge.clone(),
        verifiee.clone(),
        Arc::new(HttpProviderGateway::new(gateway::DEFAULT_TIMEOUT).expect("gateway")),
        Arc::new(SystemClock),
        ClientSettings {
            max_poll_attempts,
            poll_interval: Duration::from_millis(20),
            verification_window: Duration::from_secs(5),
        },
    );

    World {
        endpoint: ProviderEndpoint {
            http_address: format!("http://{addr}"),
            peer: provider_node.peer_id().primary.clone(),
        },
        requester_bridge: bridge.start(),
        verifiee: verifiee.start(),
        provider_node,
        requester_node,
        client,
        provider,
        provider_handle,
        server,
    }
}

impl World {
    fn procedure(&self, desc: ProcedureDescription) -> ClientProcedure {
        ClientProcedure {
            provider: self.endpoint.clone(),
            desc,
        }
    }
}

#[tokio::test]
async fn unconditional_procedure_yields_attested_data() {
    let w = world(200).await;
    let procedure = w.procedure(description("p0", &[], &["att0"]));

    let outcome = tokio::time::timeout(RUN_LIMIT, w.client.execute(&procedure, &HashMap::new()))
        .await
        .expect("run finishes")
        .expect("run succeeds");

    assert_eq!(outcome.data, vec![Attribute::new("att0", "att0val")]);
    assert_eq!(outcome.attestations.len(), 1);
    assert_eq!(outcome.attestations[0].attribute_name, "att0");
    assert_eq!(outcome.attestations[0].signer, w.provider_node.peer_id().primary);
    assert_eq!(w.provider_node.call_count("request_verification"), 0);
}

#[tokio::test]
async fn credential_from_earlier_run_is_verified() {
    let w = world(200).await;
    let p0 = w.procedure(description("p0", &[], &["att0"]));
    let p1 = w.procedure(description("p1", &["att0"], &["att1"]));

    tokio::time::timeout(RUN_LIMIT, w.client.execute(&p0, &HashMap::new()))
        .await
        .expect("p0 finishes")
        .expect("p0 succeeds");
    let held = w.requester_node.list_attestations().await.expect("attestations");
    assert!(held.iter().any(|a| a.attribute_name == "att0"));

    let values = HashMap::from([("att0".to_string(), "att0val".to_string())]);
    let outcome = tokio::time::timeout(RUN_LIMIT, w.client.execute(&p1, &values))
        .await
        .expect("p1 finishes")
        .expect("p1 succeeds");

    assert_eq!(outcome.data, vec![Attribute::new("att1", "att1val")]);
    assert_eq!(outcome.attestations[0].attribute_name, "att1");
    assert_eq!(w.provider_node.call_count("request_verification"), 1);
    // a snapshot taken before the allow may deliver the request once more
    assert!(w.requester_node.call_count("allow_verify") >= 1);

    let records = w.provider.verifier.records(&w.requester_node.peer_id().primary);
    assert_eq!(records.len(), 1);
    assert!(records[0].verified_at.is_some());
}

#[tokio::test]
async fn provider_validation_error_reaches_caller() {
    let w = world(200).await;
    // the Provider's p1 requires att0; this description claims it requires nothing
    let procedure = w.procedure(description("p1", &[], &["att1"]));

    let err = w
        .client
        .execute(&procedure, &HashMap::new())
        .await
        .unwrap_err();
    match err {
        ClientError::Rejected { status, message } => {
            assert_eq!(status, 400);
            assert_eq!(message, "wrong number of credentials: expected 1, got 0");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(w
        .provider
        .engine
        .get_queued_attributes(&w.requester_node.peer_id().primary)
        .is_empty());
    assert!(w.provider.engine.is_empty());
}

#[tokio::test]
async fn unstaged_attributes_exhaust_the_poll_bound() {
    let w = world(5).await;
    let procedure = w.procedure(description("p_never", &[], &["att9"]));

    let err = tokio::time::timeout(RUN_LIMIT, w.client.execute(&procedure, &HashMap::new()))
        .await
        .expect("run ends without hanging")
        .unwrap_err();
    assert!(matches!(
        err,
        ClientError::PollExhausted { attempts: 5, ref missing } if missing == &vec!["att9".to_string()]
    ));
    assert_eq!(w.requester_node.call_count("request_attestation"), 0);
}
