//! Verifier side: checks a peer's credentials through the bridge and keeps a
//! timestamped record of every verification it requested.

use crate::clock::Clock;
use crate::error::ServiceError;
use attest_bridge::PollingBridge;
use attest_types::{Credential, PeerId};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct VerificationRecord {
    pub credential: Credential,
    pub requested_at: DateTime<Utc>,
    pub verified_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct VerifyOptions {
    /// Accept an earlier successful verification of the same hash for this
    /// peer if it is younger than this.
    pub max_age: Option<chrono::Duration>,
    /// Bound on the whole verification; unbounded when `None`.
    pub timeout: Option<Duration>,
}

impl VerificationRecord {
    /// When the record last changed.
    pub fn touched_at(&self) -> DateTime<Utc> {
        self.verified_at.unwrap_or(self.requested_at)
    }
}

/// Records per holder, each tagged with the id its verification updates.
type RecordMap = HashMap<String, Vec<(u64, VerificationRecord)>>;

pub struct VerifierService {
    bridge: Arc<PollingBridge>,
    clock: Arc<dyn Clock>,
    records: Mutex<RecordMap>,
    next_id: AtomicU64,
}

impl VerifierService {
    pub fn new(bridge: Arc<PollingBridge>, clock: Arc<dyn Clock>) -> Self {
        Self {
            bridge,
            clock,
            records: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RecordMap> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Verifies every credential of `peer` concurrently.
    ///
    /// Returns `true` only if all of them verify. The caller cannot tell
    /// which credential failed. Without `options.timeout` this waits as long
    /// as the bridge does.
    pub async fn verify(
        &self,
        peer: &PeerId,
        credentials: &[Credential],
        options: VerifyOptions,
    ) -> Result<bool, ServiceError> {
        let checks = join_all(
            credentials
                .iter()
                .map(|credential| self.verify_single(peer, credential, options.max_age)),
        );

        let results = match options.timeout {
            Some(timeout) => tokio::time::timeout(timeout, checks).await.map_err(|_| {
                ServiceError::VerificationTimeout {
                    holder: peer.primary.clone(),
                    timeout,
                }
            })?,
            None => checks.await,
        };

        let mut all_verified = true;
        for result in results {
            all_verified &= result?;
        }
        Ok(all_verified)
    }

    async fn verify_single(
        &self,
        peer: &PeerId,
        credential: &Credential,
        max_age: Option<chrono::Duration>,
    ) -> Result<bool, ServiceError> {
        if let Some(max_age) = max_age {
            if self.is_verified(&peer.primary, credential, max_age) {
                tracing::debug!(
                    peer = %peer.primary,
                    attribute_name = %credential.attribute_name,
                    "reusing recent verification"
                );
                return Ok(true);
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().entry(peer.primary.clone()).or_default().push((
            id,
            VerificationRecord {
                credential: credential.clone(),
                requested_at: self.clock.now(),
                verified_at: None,
            },
        ));

        let verified = self
            .bridge
            .await_verification(peer, &credential.attribute_hash, &credential.attribute_value)
            .await?;
        tracing::info!(
            peer = %peer.primary,
            attribute_name = %credential.attribute_name,
            verified,
            "verification finished"
        );

        if verified {
            let now = self.clock.now();
            if let Some((_, record)) = self
                .lock()
                .get_mut(&peer.primary)
                .and_then(|list| list.iter_mut().find(|(record_id, _)| *record_id == id))
            {
                record.verified_at = Some(now);
            }
        }
        Ok(verified)
    }

    /// Whether `credential` was verified for `holder` less than `max_age` ago.
    pub fn is_verified(&self, holder: &str, credential: &Credential, max_age: chrono::Duration) -> bool {
        let Some(min_time) = self.clock.now().checked_sub_signed(max_age) else {
            return false;
        };
        self.lock().get(holder).is_some_and(|list| {
            list.iter().any(|(_, record)| {
                record.credential.attribute_hash == credential.attribute_hash
                    && record.verified_at.is_some_and(|at| at > min_time)
            })
        })
    }

    /// Every verification requested for `holder`, oldest first.
    pub fn records(&self, holder: &str) -> Vec<VerificationRecord> {
        self.lock()
            .get(holder)
            .map(|list| list.iter().map(|(_, record)| record.clone()).collect())
            .unwrap_or_default()
    }

    /// Drops records last touched before `cutoff`, and holders left without
    /// records. Returns how many records were dropped. A verification still
    /// in flight whose record is dropped finishes without a record.
    pub fn prune_records(&self, cutoff: DateTime<Utc>) -> usize {
        let mut records = self.lock();
        let mut pruned = 0;
        records.retain(|_, list| {
            let before = list.len();
            list.retain(|(_, record)| record.touched_at() >= cutoff);
            pruned += before - list.len();
            !list.is_empty()
        });
        pruned
    }
}
