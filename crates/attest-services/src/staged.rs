//! Time-bounded grants keyed by holder and attribute name.
//!
//! A grant authorizes one holder to receive one payload until a deadline.
//! There is at most one grant per `(holder, attribute_name)`; staging again
//! replaces it. Expiry is checked lazily whenever a holder's grants are read,
//! so an expired grant may stay in memory until the next read for that
//! holder but is never returned.
//!
//! State is sharded per holder: the outer map is only locked to find,
//! create or drop a holder's shard, and every operation on grants locks just
//! that shard. Operations on different holders never contend. A shard left
//! empty by a read or a removal is dropped.

use crate::clock::Clock;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

#[derive(Debug, Clone, PartialEq)]
pub struct StagedGrant<T> {
    pub holder: String,
    pub attribute_name: String,
    pub payload: T,
    pub valid_until: DateTime<Utc>,
}

impl<T> StagedGrant<T> {
    /// A grant is valid up to and including its deadline.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.valid_until >= now
    }
}

type Shard<T> = Arc<Mutex<BTreeMap<String, StagedGrant<T>>>>;

pub struct StagedGrantQueue<T> {
    clock: Arc<dyn Clock>,
    holders: RwLock<HashMap<String, Shard<T>>>,
}

fn lock_shard<T>(shard: &Shard<T>) -> MutexGuard<'_, BTreeMap<String, StagedGrant<T>>> {
    shard.lock().unwrap_or_else(|e| e.into_inner())
}

impl<T: Clone> StagedGrantQueue<T> {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            holders: RwLock::new(HashMap::new()),
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn shard(&self, holder: &str) -> Option<Shard<T>> {
        self.holders
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(holder)
            .cloned()
    }

    /// Stages `payload` for `(holder, attribute_name)`, returning the grant
    /// it replaced, if any.
    pub fn stage(
        &self,
        holder: &str,
        attribute_name: &str,
        payload: T,
        valid_until: DateTime<Utc>,
    ) -> Option<StagedGrant<T>> {
        let grant = StagedGrant {
            holder: holder.to_string(),
            attribute_name: attribute_name.to_string(),
            payload,
            valid_until,
        };
        // The outer lock is held while inserting so an empty shard cannot
        // be dropped between lookup and insert.
        {
            let holders = self.holders.read().unwrap_or_else(|e| e.into_inner());
            if let Some(shard) = holders.get(holder) {
                return lock_shard(shard).insert(attribute_name.to_string(), grant);
            }
        }
        let mut holders = self.holders.write().unwrap_or_else(|e| e.into_inner());
        let shard = holders.entry(holder.to_string()).or_default();
        let replaced = lock_shard(shard).insert(attribute_name.to_string(), grant);
        replaced
    }

    /// Drops the holder's expired grants and returns the remaining ones,
    /// ordered by attribute name.
    pub fn list_valid(&self, holder: &str) -> Vec<StagedGrant<T>> {
        let Some(shard) = self.shard(holder) else {
            return Vec::new();
        };
        let now = self.clock.now();
        let valid: Vec<_> = {
            let mut grants = lock_shard(&shard);
            grants.retain(|_, grant| grant.is_valid_at(now));
            grants.values().cloned().collect()
        };
        if valid.is_empty() {
            self.drop_if_empty(holder, &shard);
        }
        valid
    }

    /// The valid grant for `(holder, attribute_name)`, left in place.
    pub fn consume(&self, holder: &str, attribute_name: &str) -> Option<StagedGrant<T>> {
        let shard = self.shard(holder)?;
        let now = self.clock.now();
        let mut grants = lock_shard(&shard);
        grants.retain(|_, grant| grant.is_valid_at(now));
        grants.get(attribute_name).cloned()
    }

    /// Removes the grant for `(holder, attribute_name)` whether or not it
    /// is still valid.
    pub fn remove(&self, holder: &str, attribute_name: &str) -> Option<StagedGrant<T>> {
        self.remove_if(holder, attribute_name, |_| true)
    }

    /// Removes the grant for `(holder, attribute_name)` only if `matches`
    /// accepts the grant currently staged there. A grant staged after the
    /// caller read the old one is left alone.
    pub fn remove_if<F>(&self, holder: &str, attribute_name: &str, matches: F) -> Option<StagedGrant<T>>
    where
        F: FnOnce(&StagedGrant<T>) -> bool,
    {
        let shard = self.shard(holder)?;
        let removed = {
            let mut grants = lock_shard(&shard);
            if grants.get(attribute_name).is_some_and(matches) {
                grants.remove(attribute_name)
            } else {
                None
            }
        };
        self.drop_if_empty(holder, &shard);
        removed
    }

    /// Forgets the holder's shard once it holds no grants. Rechecked under
    /// the write lock, which `stage` excludes while it inserts.
    fn drop_if_empty(&self, holder: &str, shard: &Shard<T>) {
        if !lock_shard(shard).is_empty() {
            return;
        }
        let mut holders = self.holders.write().unwrap_or_else(|e| e.into_inner());
        let still_empty = holders
            .get(holder)
            .is_some_and(|current| Arc::ptr_eq(current, shard) && lock_shard(current).is_empty());
        if still_empty {
            holders.remove(holder);
        }
    }

    /// Holders that currently have a shard, valid grants or not.
    pub fn holders(&self) -> Vec<String> {
        self.holders
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }
}
