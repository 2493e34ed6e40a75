//! Runs an attestation procedure against a Provider, start to finish.

use crate::error::ClientError;
use crate::gateway::ProviderApi;
use attest_bridge::PollingBridge;
use attest_node::NodeApi;
use attest_services::{Clock, VerifieeService};
use attest_types::{Attestation, Attribute, ClientProcedure, Credential, InitiateRequest, PeerId};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct ClientSettings {
    /// How many times to ask the Provider for staged attributes.
    pub max_poll_attempts: u32,
    pub poll_interval: Duration,
    /// How long the Provider may verify our credentials.
    pub verification_window: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            max_poll_attempts: 20,
            poll_interval: Duration::from_millis(1000),
            verification_window: Duration::from_millis(10_000),
        }
    }
}

/// Result of a successful run: the values the Provider staged and the
/// attestations received for them, both in declaration order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcedureOutcome {
    pub data: Vec<Attribute>,
    pub attestations: Vec<Attestation>,
}

pub struct ProcedureClient {
    me: PeerId,
    bridge: Arc<PollingBridge>,
    verifiee: Arc<VerifieeService>,
    provider_api: Arc<dyn ProviderApi>,
    clock: Arc<dyn Clock>,
    settings: ClientSettings,
}

impl ProcedureClient {
    pub fn new(
        me: PeerId,
        bridge: Arc<PollingBridge>,
        verifiee: Arc<VerifieeService>,
        provider_api: Arc<dyn ProviderApi>,
        clock: Arc<dyn Clock>,
        settings: ClientSettings,
    ) -> Self {
        Self {
            me,
            bridge,
            verifiee,
            provider_api,
            clock,
            settings,
        }
    }

    pub fn settings(&self) -> ClientSettings {
        self.settings
    }

    /// Runs `procedure`. `values` holds the plain value of every credential
    /// the procedure requires.
    ///
    /// Steps run strictly one after the other. The bridge and the verifiee
    /// loop must be running.
    pub async fn execute(
        &self,
        procedure: &ClientProcedure,
        values: &HashMap<String, String>,
    ) -> Result<ProcedureOutcome, ClientError> {
        let desc = &procedure.desc;
        tracing::info!(procedure = %desc.procedure_name, requirements = ?desc.requirements, "starting procedure");

        let credentials = self.fetch_credentials(&desc.requirements, values).await?;

        let request = InitiateRequest {
            procedure_id: desc.procedure_name.clone(),
            mid_b64: self.me.primary.clone(),
            mid_hex: self.me.secondary.clone(),
            credentials,
        };
        let response = self
            .provider_api
            .initiate(&procedure.provider, &request)
            .await?;
        tracing::info!(
            procedure = %desc.procedure_name,
            transaction_id = ?response.transaction_id,
            message = %response.message,
            "transaction initiated"
        );

        if desc.requires_verification() {
            self.allow_verification(procedure).await;
        }

        let data = self.poll_staged(procedure).await?;
        tracing::info!(procedure = %desc.procedure_name, count = data.len(), "staged data received");

        let attestations = self.request_attestations(procedure).await?;
        tracing::info!(procedure = %desc.procedure_name, "procedure complete");

        Ok(ProcedureOutcome { data, attestations })
    }

    /// Pairs each required name with the hash of a held attestation and the
    /// supplied value. Values are checked before the node is asked.
    async fn fetch_credentials(
        &self,
        requirements: &[String],
        values: &HashMap<String, String>,
    ) -> Result<Vec<Credential>, ClientError> {
        if requirements.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(name) = requirements.iter().find(|name| !values.contains_key(*name)) {
            return Err(ClientError::MissingCredentialValue(name.clone()));
        }

        let held = self.bridge.node().list_attestations().await?;
        requirements
            .iter()
            .map(|name| -> Result<Credential, ClientError> {
                let attestation = held
                    .iter()
                    .find(|a| &a.attribute_name == name)
                    .ok_or_else(|| ClientError::MissingCredential(name.clone()))?;
                Ok(Credential {
                    attribute_name: name.clone(),
                    attribute_hash: attestation.attribute_hash.clone(),
                    attribute_value: values[name].clone(),
                })
            })
            .collect()
    }

    /// Lets the Provider verify every required credential for the
    /// verification window and waits until it did or the window closed.
    ///
    /// A closed window is not fatal. Whether the Provider staged anything is
    /// decided by polling.
    async fn allow_verification(&self, procedure: &ClientProcedure) {
        let window = chrono::Duration::from_std(self.settings.verification_window)
            .unwrap_or_else(|_| chrono::Duration::seconds(10));
        let valid_until = self.clock.now() + window;
        let permits = self.verifiee.stage_verification(
            &procedure.provider.peer,
            &procedure.desc.requirements,
            valid_until,
        );
        for permit in permits {
            let name = permit.attribute_name().to_string();
            match permit.accepted().await {
                Ok(()) => tracing::debug!(attribute_name = %name, "credential verified by provider"),
                Err(e) => tracing::warn!(attribute_name = %name, error = %e, "provider did not verify credential in time"),
            }
        }
    }

    /// Polls the Provider until it lists every desired attribute in one
    /// response. A failed request counts as an attempt; a malformed response
    /// ends the run.
    async fn poll_staged(&self, procedure: &ClientProcedure) -> Result<Vec<Attribute>, ClientError> {
        let desired: Vec<&str> = procedure.desc.attribute_names().collect();
        let mut missing: Vec<String> = desired.iter().map(|s| s.to_string()).collect();

        for attempt in 1..=self.settings.max_poll_attempts {
            match self
                .provider_api
                .staged(&procedure.provider, &self.me.primary)
                .await
            {
                Ok(response) => {
                    let staged = parse_staged(response)?;
                    match select_desired(&desired, &staged) {
                        Ok(data) => return Ok(data),
                        Err(still_missing) => missing = still_missing,
                    }
                }
                Err(ClientError::MalformedResponse(reason)) => {
                    return Err(ClientError::MalformedResponse(reason));
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "polling staged data failed");
                }
            }

            tracing::debug!(attempt, missing = ?missing, "desired attributes not staged yet");
            if attempt < self.settings.max_poll_attempts {
                tokio::time::sleep(self.settings.poll_interval).await;
            }
        }

        Err(ClientError::PollExhausted {
            attempts: self.settings.max_poll_attempts,
            missing,
        })
    }

    /// Requests and awaits each attestation in turn.
    async fn request_attestations(
        &self,
        procedure: &ClientProcedure,
    ) -> Result<Vec<Attestation>, ClientError> {
        let node = self.bridge.node();
        let mut attestations = Vec::with_capacity(procedure.desc.attributes.len());
        for attribute in &procedure.desc.attributes {
            tracing::info!(attribute_name = %attribute.name, "requesting attestation");
            let accepted = node
                .request_attestation(&procedure.provider.peer, &attribute.name, &attribute.id_format)
                .await?;
            if !accepted {
                return Err(ClientError::AttestationDeclined(attribute.name.clone()));
            }
            let attestation = self.bridge.await_attestation(&attribute.name).await?;
            tracing::info!(attribute_name = %attribute.name, signer = %attestation.signer, "attestation received");
            attestations.push(attestation);
        }
        Ok(attestations)
    }
}

/// Validates the Provider's staged-data response: an array whose items
/// all carry string `attribute_name` and `attribute_value` fields.
fn parse_staged(response: Value) -> Result<Vec<Attribute>, ClientError> {
    let Value::Array(items) = response else {
        return Err(ClientError::MalformedResponse(
            "expected an array of attributes".to_string(),
        ));
    };
    items
        .iter()
        .enumerate()
        .map(|(i, item)| -> Result<Attribute, ClientError> {
            let field = |key: &str| {
                item.get(key).and_then(Value::as_str).ok_or_else(|| {
                    ClientError::MalformedResponse(format!("item {i} has no string {key}"))
                })
            };
            Ok(Attribute::new(field("attribute_name")?, field("attribute_value")?))
        })
        .collect()
}

/// The desired attributes in declaration order, or the names still missing.
fn select_desired(desired: &[&str], staged: &[Attribute]) -> Result<Vec<Attribute>, Vec<String>> {
    let mut found = Vec::with_capacity(desired.len());
    let mut missing = Vec::new();
    for name in desired {
        match staged.iter().find(|a| a.attribute_name == *name) {
            Some(attribute) => found.push(attribute.clone()),
            None => missing.push(name.to_string()),
        }
    }
    if missing.is_empty() {
        Ok(found)
    } else {
        Err(missing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use attest_node::memory::{MemoryNetwork, MemoryNode};
    use attest_services::SystemClock;
    use attest_types::{AttributeDescription, InitiateResponse, ProcedureDescription, ProviderEndpoint};
    use serde_json::json;
    use std::sync::Mutex;

    /// Answers `staged` from a script, repeating the last entry.
    struct ScriptedProvider {
        staged: Mutex<Vec<Result<Value, ClientError>>>,
        initiated: Mutex<Vec<InitiateRequest>>,
    }

    impl ScriptedProvider {
        fn new(staged: Vec<Result<Value, ClientError>>) -> Self {
            Self {
                staged: Mutex::new(staged),
                initiated: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ProviderApi for ScriptedProvider {
        async fn initiate(
            &self,
            _provider: &ProviderEndpoint,
            request: &InitiateRequest,
        ) -> Result<InitiateResponse, ClientError> {
            self.initiated.lock().unwrap().push(request.clone());
            Ok(InitiateResponse {
                message: "ok".to_string(),
                transaction_id: None,
            })
        }

        async fn staged(&self, _provider: &ProviderEndpoint, _holder: &str) -> Result<Value, ClientError> {
            let mut script = self.staged.lock().unwrap();
            if script.len() > 1 {
                script.remove(0)
            } else {
                match &script[0] {
                    Ok(value) => Ok(value.clone()),
                    Err(_) => Err(ClientError::MalformedResponse("scripted".to_string())),
                }
            }
        }
    }

    fn procedure(requirements: &[&str], attributes: &[&str]) -> ClientProcedure {
        ClientProcedure {
            provider: ProviderEndpoint {
                http_address: "http://provider.invalid".to_string(),
                peer: "provider".to_string(),
            },
            desc: ProcedureDescription {
                procedure_name: "p".to_string(),
                requirements: requirements.iter().map(|s| s.to_string()).collect(),
                attributes: attributes.iter().map(|s| AttributeDescription::new(*s)).collect(),
            },
        }
    }

    fn client(node: &MemoryNode, provider: Arc<ScriptedProvider>) -> ProcedureClient {
        let bridge = Arc::new(PollingBridge::new(Arc::new(node.clone())));
        let verifiee = Arc::new(VerifieeService::new(bridge.clone(), Arc::new(SystemClock)));
        ProcedureClient::new(
            node.peer_id().clone(),
            bridge,
            verifiee,
            provider,
            Arc::new(SystemClock),
            ClientSettings {
                max_poll_attempts: 3,
                poll_interval: Duration::from_millis(1),
                verification_window: Duration::from_millis(50),
            },
        )
    }

    #[test]
    fn staged_response_must_carry_names_and_values() {
        assert!(parse_staged(json!([{ "attribute_name": "a", "attribute_value": "1" }])).is_ok());
        assert!(matches!(
            parse_staged(json!([{ "attribute_name": "a" }])),
            Err(ClientError::MalformedResponse(_))
        ));
        assert!(matches!(
            parse_staged(json!({ "attribute_name": "a", "attribute_value": "1" })),
            Err(ClientError::MalformedResponse(_))
        ));
        assert!(matches!(
            parse_staged(json!([{ "attribute_name": "a", "attribute_value": 1 }])),
            Err(ClientError::MalformedResponse(_))
        ));
    }

    #[test]
    fn desired_attributes_follow_declaration_order() {
        let staged = vec![
            Attribute::new("b", "2"),
            Attribute::new("other", "x"),
            Attribute::new("a", "1"),
        ];
        assert_eq!(
            select_desired(&["a", "b"], &staged),
            Ok(vec![Attribute::new("a", "1"), Attribute::new("b", "2")])
        );
        assert_eq!(select_desired(&["a", "c"], &staged), Err(vec!["c".to_string()]));
    }

    #[tokio::test]
    async fn partial_responses_are_retried_until_exhausted() {
        let node = MemoryNetwork::new().add_node("requester");
        let provider = Arc::new(ScriptedProvider::new(vec![
            Err(ClientError::Rejected {
                status: 503,
                message: "busy".to_string(),
            }),
            Ok(json!([{ "attribute_name": "a", "attribute_value": "1" }])),
        ]));
        let client = client(&node, provider);

        let err = client
            .execute(&procedure(&[], &["a", "b"]), &HashMap::new())
            .await
            .unwrap_err();
        match err {
            ClientError::PollExhausted { attempts, missing } => {
                assert_eq!(attempts, 3);
                assert_eq!(missing, vec!["b"]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(node.call_count("request_attestation"), 0);
    }

    #[tokio::test]
    async fn malformed_response_ends_the_run() {
        let node = MemoryNetwork::new().add_node("requester");
        let provider = Arc::new(ScriptedProvider::new(vec![
            Ok(json!([{ "attribute_name": "a" }])),
            Ok(json!([{ "attribute_name": "a", "attribute_value": "1" }])),
        ]));
        let client = client(&node, provider.clone());

        let err = client
            .execute(&procedure(&[], &["a"]), &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::MalformedResponse(_)));
        // the valid second response was never fetched
        assert_eq!(provider.staged.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_value_fails_before_any_call() {
        let node = MemoryNetwork::new().add_node("requester");
        let provider = Arc::new(ScriptedProvider::new(vec![Ok(json!([]))]));
        let client = client(&node, provider.clone());

        let err = client
            .execute(&procedure(&["bsn"], &["kvknr"]), &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::MissingCredentialValue(name) if name == "bsn"));
        assert_eq!(node.call_count("list_attestations"), 0);
        assert!(provider.initiated.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn credential_without_attestation_is_rejected() {
        let node = MemoryNetwork::new().add_node("requester");
        let provider = Arc::new(ScriptedProvider::new(vec![Ok(json!([]))]));
        let client = client(&node, provider.clone());
        let values = HashMap::from([("bsn".to_string(), "bsn1".to_string())]);

        let err = client
            .execute(&procedure(&["bsn"], &["kvknr"]), &values)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::MissingCredential(name) if name == "bsn"));
        assert!(provider.initiated.lock().unwrap().is_empty());
    }
}
