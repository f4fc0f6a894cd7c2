// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! Identity lookup tests: activation coalescing, waiter deadlines and
//! cache invalidation, exercised against a pinned membership view.

use cluster::{
    ActivatedPid, ActivationHost, ClusterIdentity, ClusterTransport, Envelope,
    Error, GossipSnapshot, IdentityLookup, Member, MemberStatus,
    MembershipHandle, MembershipView, SimpleMemberStrategy, TopologyEvent,
    TransportError,
};

use async_trait::async_trait;

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::time::Instant;

const LOCAL: &str = "m1:5020";

/// Activation host that counts ensure-activated calls and can be slowed
/// down or made to fail a number of times.
struct ScriptedHost {
    calls: AtomicU64,
    delay: Duration,
    failures: AtomicU64,
}

impl ScriptedHost {
    fn new() -> Self {
        Self {
            calls: AtomicU64::new(0),
            delay: Duration::ZERO,
            failures: AtomicU64::new(0),
        }
    }

    fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::new()
        }
    }

    fn failing_first(failures: u64) -> Self {
        let host = Self::new();
        host.failures.store(failures, Ordering::SeqCst);
        host
    }

    fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ActivationHost for ScriptedHost {
    async fn ensure_activated(
        &self,
        identity: &ClusterIdentity,
    ) -> Result<ActivatedPid, Error> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.failures.load(Ordering::SeqCst) >= call {
            return Err(Error::Refused("scripted failure".to_owned()));
        }
        Ok(ActivatedPid {
            address: LOCAL.to_owned(),
            id: format!("{identity}#{call}"),
            generation: call,
        })
    }
}

/// Transport that must never be used: the pinned view owns everything
/// locally.
struct UnusedTransport;

#[async_trait]
impl ClusterTransport for UnusedTransport {
    async fn gossip_exchange(
        &self,
        target: &str,
        _delta: GossipSnapshot,
    ) -> Result<GossipSnapshot, TransportError> {
        Err(TransportError::Unreachable(target.to_owned()))
    }

    async fn ensure_activated(
        &self,
        target: &str,
        _identity: &ClusterIdentity,
    ) -> Result<ActivatedPid, TransportError> {
        Err(TransportError::Unreachable(target.to_owned()))
    }

    async fn send_request(
        &self,
        target: &ActivatedPid,
        _envelope: Envelope,
    ) -> Result<Vec<u8>, TransportError> {
        Err(TransportError::Unreachable(target.address.clone()))
    }
}

fn single_member_view() -> MembershipHandle {
    MembershipHandle::fixed(MembershipView::new(vec![Member {
        address: LOCAL.to_owned(),
        kinds: vec!["order".to_owned()],
        status: MemberStatus::Alive,
    }]))
}

fn lookup_over(host: Arc<ScriptedHost>) -> IdentityLookup {
    IdentityLookup::new(
        LOCAL,
        Duration::from_secs(2),
        Arc::new(UnusedTransport),
        host,
        single_member_view(),
        Arc::new(|_kind| Arc::new(SimpleMemberStrategy)),
    )
}

fn far_deadline() -> Instant {
    Instant::now() + Duration::from_secs(5)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_resolvers_trigger_one_activation() {
    let host = Arc::new(ScriptedHost::with_delay(Duration::from_millis(50)));
    let lookup = lookup_over(host.clone());
    let identity = ClusterIdentity::new("order", "42").unwrap();

    let resolvers: Vec<_> = (0..16)
        .map(|_| {
            let lookup = lookup.clone();
            let identity = identity.clone();
            tokio::spawn(async move {
                lookup.resolve(&identity, far_deadline()).await
            })
        })
        .collect();

    let mut addresses = Vec::new();
    for resolver in resolvers {
        let pid = resolver.await.unwrap().unwrap();
        addresses.push(pid.id);
    }

    // Every caller observed the same outcome of the single attempt.
    assert_eq!(host.calls(), 1);
    assert!(addresses.iter().all(|id| id == &addresses[0]));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_waiter_deadlines_are_independent() {
    let host = Arc::new(ScriptedHost::with_delay(Duration::from_millis(150)));
    let lookup = lookup_over(host.clone());
    let identity = ClusterIdentity::new("order", "42").unwrap();

    let impatient = {
        let lookup = lookup.clone();
        let identity = identity.clone();
        tokio::spawn(async move {
            lookup
                .resolve(&identity, Instant::now() + Duration::from_millis(30))
                .await
        })
    };
    let patient = {
        let lookup = lookup.clone();
        let identity = identity.clone();
        tokio::spawn(async move {
            lookup.resolve(&identity, far_deadline()).await
        })
    };

    // The impatient caller fails alone; the attempt keeps running and the
    // patient caller still receives the result.
    assert_eq!(impatient.await.unwrap(), Err(Error::Timeout));
    assert!(patient.await.unwrap().is_ok());
    assert_eq!(host.calls(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_second_resolve_hits_the_cache() {
    let host = Arc::new(ScriptedHost::new());
    let lookup = lookup_over(host.clone());
    let identity = ClusterIdentity::new("order", "42").unwrap();

    let first = lookup.resolve(&identity, far_deadline()).await.unwrap();
    let second = lookup.resolve(&identity, far_deadline()).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(host.calls(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failed_attempt_fails_everyone_once_then_retries_fresh() {
    let host = Arc::new(ScriptedHost::failing_first(1));
    let lookup = lookup_over(host.clone());
    let identity = ClusterIdentity::new("order", "42").unwrap();

    let outcome = lookup.resolve(&identity, far_deadline()).await;
    assert!(matches!(outcome, Err(Error::Refused(_))));
    assert!(lookup.cached(&identity).is_none());

    // The pending entry is gone; a new resolve starts a fresh attempt.
    let outcome = lookup.resolve(&identity, far_deadline()).await;
    assert!(outcome.is_ok());
    assert_eq!(host.calls(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_kind_is_not_available() {
    let lookup = lookup_over(Arc::new(ScriptedHost::new()));
    let identity = ClusterIdentity::new("user", "u1").unwrap();

    let outcome = lookup.resolve(&identity, far_deadline()).await;
    assert_eq!(outcome, Err(Error::NotAvailable("user".to_owned())));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_topology_departure_evicts_placements() {
    let host = Arc::new(ScriptedHost::new());
    let lookup = lookup_over(host.clone());
    let identity = ClusterIdentity::new("order", "42").unwrap();

    lookup.resolve(&identity, far_deadline()).await.unwrap();
    assert!(lookup.cached(&identity).is_some());
    assert_eq!(lookup.placement(&identity).unwrap().owner, LOCAL);

    lookup.handle_topology(&TopologyEvent {
        view: Arc::new(MembershipView::new(Vec::new())),
        joined: Vec::new(),
        departed: vec![LOCAL.to_owned()],
        unreachable: Vec::new(),
        recovered: Vec::new(),
    });

    assert!(lookup.cached(&identity).is_none());
    assert!(lookup.placement(&identity).is_none());

    // The next resolve re-triggers placement instead of serving the stale
    // address.
    lookup.resolve(&identity, far_deadline()).await.unwrap();
    assert_eq!(host.calls(), 2);
}
