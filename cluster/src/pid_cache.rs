// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Pid cache
//!
//! The `pid_cache` module provides the process-local cache mapping resolved
//! identities to physical activation addresses. It is the hot path for
//! repeated routing: a valid entry short-circuits the whole placement
//! machinery. Entries are populated and invalidated exclusively by the
//! identity lookup.
//!

use crate::{activation::ActivatedPid, identity::ClusterIdentity};

use tracing::debug;

use std::{collections::HashMap, sync::RwLock};

/// Identity to activation-address cache with generation gating.
#[derive(Default)]
pub struct PidCache {
    entries: RwLock<HashMap<ClusterIdentity, ActivatedPid>>,
}

impl PidCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached pid for an identity, if any.
    pub fn get(&self, identity: &ClusterIdentity) -> Option<ActivatedPid> {
        self.entries
            .read()
            .ok()
            .and_then(|entries| entries.get(identity).cloned())
    }

    /// Inserts a resolved pid unless a newer generation is already cached.
    ///
    /// Returns whether the entry was stored. Refusing older generations
    /// keeps a slow resolution from clobbering the address of a later
    /// re-activation.
    pub fn insert(&self, identity: &ClusterIdentity, pid: ActivatedPid) -> bool {
        let Ok(mut entries) = self.entries.write() else {
            return false;
        };
        if let Some(existing) = entries.get(identity) {
            if existing.generation > pid.generation {
                debug!(
                    "Ignoring stale pid for {} (generation {} < {}).",
                    identity, pid.generation, existing.generation
                );
                return false;
            }
        }
        entries.insert(identity.clone(), pid);
        true
    }

    /// Evicts one identity. Returns the evicted pid, if any.
    pub fn evict(&self, identity: &ClusterIdentity) -> Option<ActivatedPid> {
        let Ok(mut entries) = self.entries.write() else {
            return None;
        };
        let evicted = entries.remove(identity);
        if evicted.is_some() {
            debug!("Evicted cached pid for {}.", identity);
        }
        evicted
    }

    /// Evicts every entry hosted by the given member. Returns the affected
    /// identities so placement records can be dropped alongside.
    pub fn evict_member(&self, address: &str) -> Vec<ClusterIdentity> {
        let Ok(mut entries) = self.entries.write() else {
            return Vec::new();
        };
        let affected: Vec<ClusterIdentity> = entries
            .iter()
            .filter(|(_, pid)| pid.address == address)
            .map(|(identity, _)| identity.clone())
            .collect();
        for identity in &affected {
            entries.remove(identity);
        }
        if !affected.is_empty() {
            debug!(
                "Evicted {} cached pids hosted by departed member {}.",
                affected.len(),
                address
            );
        }
        affected
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.entries.read().map(|entries| entries.len()).unwrap_or(0)
    }

    /// True when the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
