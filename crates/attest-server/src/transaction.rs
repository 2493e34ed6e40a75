//! Provider-side transactions: verify the holder's credentials, resolve the
//! procedure's attributes and stage them for attestation.
//!
//! A transaction moves through
//! `created -> verifying -> verified | rejected -> staged | failed -> done`.
//! Procedures without requirements skip `verifying`. `rejected` and `failed`
//! are terminal and leave nothing staged. A `staged` transaction becomes
//! `done` once its holder has collected every attestation or the grants
//! expired.

use crate::procedure::ProcedureConfig;
use attest_services::{AttesterService, Clock, VerifierService, VerifyOptions};
use attest_types::{Attribute, Credential, PeerId};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionState {
    Created,
    Verifying,
    Verified,
    Rejected,
    Staged,
    Failed,
    Done,
}

impl TransactionState {
    /// Nothing further happens to a transaction in this state.
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Rejected | Self::Failed | Self::Done)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TransactionRecord {
    pub id: Uuid,
    pub procedure_id: String,
    #[serde(rename = "mid_b64")]
    pub holder: String,
    pub state: TransactionState,
    pub verified: bool,
    pub completed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Names of the attributes staged for the holder.
    pub attributes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub staged_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    /// How long resolved attributes stay staged.
    pub attestation_timeout: Duration,
    /// Bound on verifying the holder's credentials.
    pub verification_timeout: Option<std::time::Duration>,
    /// Reuse verifications younger than this.
    pub verification_max_age: Option<Duration>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            attestation_timeout: Duration::seconds(60),
            verification_timeout: None,
            verification_max_age: None,
        }
    }
}

pub struct TransactionEngine {
    verifier: Arc<VerifierService>,
    attester: Arc<AttesterService>,
    clock: Arc<dyn Clock>,
    settings: EngineSettings,
    transactions: RwLock<HashMap<Uuid, TransactionRecord>>,
}

impl TransactionEngine {
    pub fn new(
        verifier: Arc<VerifierService>,
        attester: Arc<AttesterService>,
        clock: Arc<dyn Clock>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            verifier,
            attester,
            clock,
            settings,
            transactions: RwLock::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> EngineSettings {
        self.settings
    }

    /// Records a new transaction and runs it in the background.
    pub fn execute(
        self: &Arc<Self>,
        procedure: ProcedureConfig,
        credentials: Vec<Credential>,
        peer: PeerId,
    ) -> Uuid {
        let id = self.create(&procedure, &peer);
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.run(id, &procedure, &credentials, &peer).await;
        });
        id
    }

    fn create(&self, procedure: &ProcedureConfig, peer: &PeerId) -> Uuid {
        let id = Uuid::new_v4();
        let now = self.clock.now();
        let record = TransactionRecord {
            id,
            procedure_id: procedure.desc.procedure_name.clone(),
            holder: peer.primary.clone(),
            state: TransactionState::Created,
            verified: false,
            completed: false,
            created_at: now,
            updated_at: now,
            error: None,
            attributes: Vec::new(),
            staged_until: None,
        };
        self.write().insert(id, record);
        tracing::info!(
            transaction_id = %id,
            procedure_id = %procedure.desc.procedure_name,
            holder = %peer.primary,
            "transaction created"
        );
        id
    }

    /// Runs transaction `id` to its first terminal or staged state and
    /// returns that state.
    pub async fn run(
        &self,
        id: Uuid,
        procedure: &ProcedureConfig,
        credentials: &[Credential],
        peer: &PeerId,
    ) -> TransactionState {
        if procedure.desc.requires_verification() {
            self.update(id, |r| r.state = TransactionState::Verifying);
            let options = VerifyOptions {
                max_age: self.settings.verification_max_age,
                timeout: self.settings.verification_timeout,
            };
            let failure = match self.verifier.verify(peer, credentials, options).await {
                Ok(true) => None,
                Ok(false) => Some("credentials did not verify".to_string()),
                Err(e) => Some(e.to_string()),
            };
            if let Some(reason) = failure {
                tracing::warn!(transaction_id = %id, holder = %peer.primary, reason = %reason, "verification failed");
                return self.finish(id, TransactionState::Rejected, Some(reason));
            }
        }
        self.update(id, |r| {
            r.state = TransactionState::Verified;
            r.verified = true;
        });

        let attributes = match procedure.resolver.resolve(credentials).await {
            Ok(attributes) => attributes,
            Err(e) => {
                tracing::error!(transaction_id = %id, error = %e, "resolving attributes failed");
                return self.finish(id, TransactionState::Failed, Some(e.to_string()));
            }
        };

        let valid_until = self
            .clock
            .now()
            .checked_add_signed(self.settings.attestation_timeout)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let names: Vec<String> = attributes.iter().map(|a| a.attribute_name.clone()).collect();
        for attribute in attributes {
            self.attester
                .stage_attestation(&peer.primary, attribute, valid_until);
        }
        tracing::info!(
            transaction_id = %id,
            holder = %peer.primary,
            attributes = ?names,
            %valid_until,
            "attributes staged"
        );
        self.update(id, |r| {
            r.state = TransactionState::Staged;
            r.completed = true;
            r.attributes = names;
            r.staged_until = Some(valid_until);
        });
        TransactionState::Staged
    }

    fn finish(&self, id: Uuid, state: TransactionState, error: Option<String>) -> TransactionState {
        self.update(id, |r| {
            r.state = state;
            r.completed = true;
            r.error = error;
        });
        state
    }

    /// The holder's valid staged attributes, without their deadlines.
    pub fn get_queued_attributes(&self, holder: &str) -> Vec<Attribute> {
        self.attester
            .list_staged_attestations(holder)
            .into_iter()
            .map(|grant| grant.payload)
            .collect()
    }

    /// Current record of transaction `id`.
    pub fn transaction(&self, id: Uuid) -> Option<TransactionRecord> {
        let mut transactions = self.write();
        let record = transactions.get_mut(&id)?;
        self.settle(record);
        Some(record.clone())
    }

    /// Drops finished transactions last updated more than `retention` ago,
    /// and verification records older than both `retention` and the reuse
    /// age. Returns how many transactions were dropped.
    pub fn prune_finished(&self, retention: Duration) -> usize {
        let Some(cutoff) = self.clock.now().checked_sub_signed(retention) else {
            return 0;
        };
        let pruned = {
            let mut transactions = self.write();
            let before = transactions.len();
            transactions.retain(|_, record| {
                self.settle(record);
                !(record.state.is_finished() && record.updated_at < cutoff)
            });
            before - transactions.len()
        };

        // Records stay as long as they may still be reused.
        let record_cutoff = match self.settings.verification_max_age {
            Some(max_age) if max_age > retention => self.clock.now().checked_sub_signed(max_age),
            _ => Some(cutoff),
        };
        if let Some(record_cutoff) = record_cutoff {
            let records = self.verifier.prune_records(record_cutoff);
            if records > 0 {
                tracing::debug!(count = records, "pruned verification records");
            }
        }
        pruned
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Marks a staged transaction done once none of its attributes are
    /// still staged for the holder.
    fn settle(&self, record: &mut TransactionRecord) {
        if record.state != TransactionState::Staged {
            return;
        }
        let staged = self.attester.list_staged_attestations(&record.holder);
        let outstanding = record.attributes.iter().any(|name| {
            staged
                .iter()
                .any(|grant| &grant.attribute_name == name && Some(grant.valid_until) == record.staged_until)
        });
        if !outstanding {
            record.state = TransactionState::Done;
            record.updated_at = self.clock.now();
            tracing::debug!(transaction_id = %record.id, "transaction done");
        }
    }

    fn update(&self, id: Uuid, f: impl FnOnce(&mut TransactionRecord)) {
        if let Some(record) = self.write().get_mut(&id) {
            f(record);
            record.updated_at = self.clock.now();
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<Uuid, TransactionRecord>> {
        self.transactions.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<Uuid, TransactionRecord>> {
        self.transactions.write().unwrap_or_else(|e| e.into_inner())
    }
}
