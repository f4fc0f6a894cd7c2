// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Identity lookup
//!
//! The `lookup` module resolves a logical identity to the physical address
//! of its activation. The fast path is a pid cache hit and never suspends.
//! On a miss, concurrent resolvers for the same identity coalesce on a single
//! pending entry: exactly one ensure-activated request is in flight per
//! identity from this member, no matter how many callers are waiting, and
//! every waiter observes the same outcome for a given attempt.
//!
//! Each waiter applies its own deadline. A waiter timing out fails alone;
//! the attempt keeps running for the others.
//!

use crate::{
    Error,
    activation::{ActivatedPid, ActivationHost},
    gossip::TopologyEvent,
    identity::ClusterIdentity,
    member::MembershipHandle,
    pid_cache::PidCache,
    strategy::{MemberStrategy, MemberStrategyBuilder},
    transport::ClusterTransport,
};

use tokio::{
    sync::{broadcast, Mutex as AsyncMutex},
    time::Instant,
};

use tracing::{debug, warn};

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

/// Where an identity was last placed, and under which activation generation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PlacementRecord {
    /// Owning member address.
    pub owner: String,
    /// Activation generation returned by the owner.
    pub generation: u64,
}

type ResolveOutcome = Result<ActivatedPid, Error>;

/// Resolves identities to activation addresses, deduplicating concurrent
/// resolution requests.
#[derive(Clone)]
pub struct IdentityLookup {
    inner: Arc<LookupInner>,
}

struct LookupInner {
    local_address: String,
    actor_request_timeout: Duration,
    transport: Arc<dyn ClusterTransport>,
    host: Arc<dyn ActivationHost>,
    membership: MembershipHandle,
    default_strategy: MemberStrategyBuilder,
    strategies: Mutex<HashMap<String, Arc<dyn MemberStrategy>>>,
    pid_cache: PidCache,
    placements: Mutex<HashMap<ClusterIdentity, PlacementRecord>>,
    pending: AsyncMutex<HashMap<ClusterIdentity, broadcast::Sender<ResolveOutcome>>>,
}

impl IdentityLookup {
    /// Creates a lookup for the given member.
    pub fn new(
        local_address: &str,
        actor_request_timeout: Duration,
        transport: Arc<dyn ClusterTransport>,
        host: Arc<dyn ActivationHost>,
        membership: MembershipHandle,
        default_strategy: MemberStrategyBuilder,
    ) -> Self {
        Self {
            inner: Arc::new(LookupInner {
                local_address: local_address.to_owned(),
                actor_request_timeout,
                transport,
                host,
                membership,
                default_strategy,
                strategies: Mutex::new(HashMap::new()),
                pid_cache: PidCache::new(),
                placements: Mutex::new(HashMap::new()),
                pending: AsyncMutex::new(HashMap::new()),
            }),
        }
    }

    /// Pins a strategy for one kind, overriding the default builder.
    pub fn register_strategy(
        &self,
        kind: &str,
        strategy: Arc<dyn MemberStrategy>,
    ) {
        if let Ok(mut strategies) = self.inner.strategies.lock() {
            strategies.insert(kind.to_owned(), strategy);
        }
    }

    /// Resolves an identity to its activation address.
    ///
    /// # Errors
    ///
    /// Returns `Error::Timeout` when the caller's deadline elapses,
    /// `Error::NotAvailable` when no alive member advertises the kind, and
    /// the owner's failure kind otherwise.
    pub async fn resolve(
        &self,
        identity: &ClusterIdentity,
        deadline: Instant,
    ) -> Result<ActivatedPid, Error> {
        if let Some(pid) = self.inner.pid_cache.get(identity) {
            return Ok(pid);
        }

        let mut waiter = {
            let mut pending = self.inner.pending.lock().await;
            // The cache may have been filled while we waited for the lock.
            if let Some(pid) = self.inner.pid_cache.get(identity) {
                return Ok(pid);
            }
            match pending.get(identity) {
                Some(in_flight) => in_flight.subscribe(),
                None => {
                    let (outcome_tx, outcome_rx) = broadcast::channel(1);
                    pending.insert(identity.clone(), outcome_tx);
                    let inner = self.inner.clone();
                    let identity = identity.clone();
                    tokio::spawn(async move {
                        inner.run_placement(identity).await;
                    });
                    outcome_rx
                }
            }
        };

        match tokio::time::timeout_at(deadline, waiter.recv()).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => {
                // The placement task never drops the sender before
                // publishing, so a closed channel means it panicked.
                Err(Error::Unreachable(self.inner.local_address.clone()))
            }
            Err(_) => Err(Error::Timeout),
        }
    }

    /// The cached pid for an identity, if still valid.
    pub fn cached(&self, identity: &ClusterIdentity) -> Option<ActivatedPid> {
        self.inner.pid_cache.get(identity)
    }

    /// The last known placement for an identity.
    pub fn placement(
        &self,
        identity: &ClusterIdentity,
    ) -> Option<PlacementRecord> {
        self.inner
            .placements
            .lock()
            .ok()
            .and_then(|placements| placements.get(identity).cloned())
    }

    /// Evicts one identity after a delivery attempt proved its address
    /// wrong. The next resolve re-triggers placement.
    pub fn evict(&self, identity: &ClusterIdentity) {
        self.inner.pid_cache.evict(identity);
        if let Ok(mut placements) = self.inner.placements.lock() {
            placements.remove(identity);
        }
    }

    /// Evicts everything owned by a member that left or became unreachable.
    pub fn evict_member(&self, address: &str) {
        let affected = self.inner.pid_cache.evict_member(address);
        if let Ok(mut placements) = self.inner.placements.lock() {
            placements.retain(|_, record| record.owner != address);
        }
        if !affected.is_empty() {
            debug!(
                "Dropped {} placements after {} departed.",
                affected.len(),
                address
            );
        }
    }

    /// Applies a topology event: placements owned by departed or
    /// unreachable members are dropped immediately.
    pub fn handle_topology(&self, event: &TopologyEvent) {
        for address in
            event.departed.iter().chain(event.unreachable.iter())
        {
            self.evict_member(address);
        }
    }
}

impl LookupInner {
    /// Drives one placement attempt and publishes its outcome to every
    /// waiter. Runs detached from any caller so a caller timing out cannot
    /// cancel the attempt for the rest.
    async fn run_placement(self: Arc<Self>, identity: ClusterIdentity) {
        let outcome = self.attempt_placement(&identity).await;
        match &outcome {
            Ok(pid) => {
                if let Ok(mut placements) = self.placements.lock() {
                    placements.insert(
                        identity.clone(),
                        PlacementRecord {
                            owner: pid.address.clone(),
                            generation: pid.generation,
                        },
                    );
                }
                self.pid_cache.insert(&identity, pid.clone());
                debug!("Resolved {} to {} at {}.", identity, pid.id, pid.address);
            }
            Err(e) => {
                warn!("Placement of {} failed: {}", identity, e);
            }
        }

        let sender = {
            let mut pending = self.pending.lock().await;
            pending.remove(&identity)
        };
        // Waiters subscribed under the pending lock, before the entry was
        // removed, so this send reaches all of them.
        if let Some(sender) = sender {
            let _ = sender.send(outcome);
        }
    }

    async fn attempt_placement(
        &self,
        identity: &ClusterIdentity,
    ) -> Result<ActivatedPid, Error> {
        let view = self.membership.current();
        let strategy = self.strategy_for(identity.kind());
        let owner = strategy
            .select_owner(identity, &view)
            .ok_or_else(|| Error::NotAvailable(identity.kind().to_owned()))?;

        let activation = async {
            if owner == self.local_address {
                self.host.ensure_activated(identity).await
            } else {
                self.transport
                    .ensure_activated(&owner, identity)
                    .await
                    .map_err(Error::from)
            }
        };
        match tokio::time::timeout(self.actor_request_timeout, activation)
            .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout),
        }
    }

    fn strategy_for(&self, kind: &str) -> Arc<dyn MemberStrategy> {
        if let Ok(mut strategies) = self.strategies.lock() {
            if let Some(strategy) = strategies.get(kind) {
                return strategy.clone();
            }
            let strategy = (self.default_strategy)(kind);
            strategies.insert(kind.to_owned(), strategy.clone());
            return strategy;
        }
        (self.default_strategy)(kind)
    }
}
