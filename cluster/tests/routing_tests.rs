// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! End-to-end routing tests: placement, transparent migration, request
//! deduplication and stale-cache recovery across a small cluster.

use cluster::{
    Cluster, ClusterConfig, ClusterIdentity, ClusterKind, Error,
    InProcessNetwork, RequestHandler,
};

use async_trait::async_trait;

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

/// Echoes the payload prefixed with the hosting member's address and counts
/// how many requests actually reached an activation.
struct TaggingHandler {
    address: String,
    deliveries: Arc<AtomicU64>,
}

#[async_trait]
impl RequestHandler for TaggingHandler {
    async fn on_request(
        &self,
        _identity: &ClusterIdentity,
        payload: &[u8],
    ) -> Result<Vec<u8>, Error> {
        self.deliveries.fetch_add(1, Ordering::SeqCst);
        let mut response = self.address.clone().into_bytes();
        response.push(b'|');
        response.extend_from_slice(payload);
        Ok(response)
    }
}

struct Harness {
    network: InProcessNetwork,
    deliveries: Arc<AtomicU64>,
}

impl Harness {
    fn new() -> Self {
        Self {
            network: InProcessNetwork::new(),
            deliveries: Arc::new(AtomicU64::new(0)),
        }
    }

    async fn start_member(&self, address: &str, seeds: &[&str]) -> Cluster {
        let handler = Arc::new(TaggingHandler {
            address: address.to_owned(),
            deliveries: self.deliveries.clone(),
        });
        let config = ClusterConfig::new("routing-test")
            .with_gossip_interval(Duration::from_millis(30))
            .with_gossip_request_timeout(Duration::from_millis(200))
            .with_actor_request_timeout(Duration::from_secs(2))
            .with_kind(ClusterKind::new("order", handler));
        let cluster = Cluster::new(
            config,
            address,
            self.network.transport_for(address),
        )
        .unwrap();
        self.network.register(address, Arc::new(cluster.clone()));
        let seeds: Vec<String> =
            seeds.iter().map(|s| (*s).to_owned()).collect();
        cluster.start(&seeds).await.unwrap();
        cluster
    }

    fn delivery_count(&self) -> u64 {
        self.deliveries.load(Ordering::SeqCst)
    }
}

async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn wait_for_alive(cluster: &Cluster, count: usize) {
    assert!(
        wait_until(Duration::from_secs(5), || {
            cluster.membership().alive_members().len() == count
        })
        .await,
        "membership never converged"
    );
}

fn response_host(response: &[u8]) -> String {
    let split = response.iter().position(|b| *b == b'|').unwrap();
    String::from_utf8(response[..split].to_vec()).unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_request_reaches_the_selected_owner() {
    let harness = Harness::new();
    let m1 = harness.start_member("m1:6020", &[]).await;
    let m2 = harness.start_member("m2:6020", &["m1:6020"]).await;
    wait_for_alive(&m1, 2).await;
    wait_for_alive(&m2, 2).await;

    let identity = ClusterIdentity::new("order", "42").unwrap();
    let response = m1
        .context()
        .request(&identity, b"total?".to_vec(), 1)
        .await
        .unwrap();

    // The responder is whichever member the strategy selected, and both
    // routing members agree with it.
    let owner = m1.lookup().placement(&identity).unwrap().owner;
    assert_eq!(response_host(&response), owner);

    let response = m2
        .context()
        .request(&identity, b"total?".to_vec(), 2)
        .await
        .unwrap();
    assert_eq!(response_host(&response), owner);

    m1.shutdown().await;
    m2.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_migration_is_transparent_to_callers() {
    let harness = Harness::new();
    let m1 = harness.start_member("m1:6021", &[]).await;
    let m2 = harness.start_member("m2:6021", &["m1:6021"]).await;
    let m3 = harness.start_member("m3:6021", &["m1:6021"]).await;
    for member in [&m1, &m2, &m3] {
        wait_for_alive(member, 3).await;
    }

    let identity = ClusterIdentity::new("order", "42").unwrap();
    let members = [m1, m2, m3];

    // Route once from a member that will survive, so its cache holds the
    // first owner's address.
    let owner_address = {
        let probe = &members[0];
        probe
            .context()
            .request(&identity, b"probe".to_vec(), 1)
            .await
            .unwrap();
        probe.lookup().placement(&identity).unwrap().owner
    };
    let caller = members
        .iter()
        .find(|m| m.local_address() != owner_address)
        .unwrap();
    caller
        .context()
        .request(&identity, b"before".to_vec(), 2)
        .await
        .unwrap();

    let owner = members
        .iter()
        .find(|m| m.local_address() == owner_address)
        .unwrap();
    owner.shutdown().await;
    assert!(
        wait_until(Duration::from_secs(5), || {
            !caller
                .membership()
                .alive_members()
                .iter()
                .any(|m| m.address == owner_address)
        })
        .await,
        "caller never noticed the owner leaving"
    );

    // Same identity, fresh correlation id: the caller sees a plain success
    // while the identity lands on a new owner underneath.
    let response = caller
        .context()
        .request(&identity, b"after".to_vec(), 3)
        .await
        .unwrap();
    let new_owner = response_host(&response);
    assert_ne!(new_owner, owner_address);
    assert_eq!(
        caller.lookup().placement(&identity).unwrap().owner,
        new_owner
    );

    for member in members {
        member.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_duplicate_correlation_ids_deliver_once() {
    let harness = Harness::new();
    let m1 = harness.start_member("m1:6022", &[]).await;
    wait_for_alive(&m1, 1).await;

    let identity = ClusterIdentity::new("order", "7").unwrap();
    let first = m1
        .context()
        .request(&identity, b"charge".to_vec(), 99)
        .await
        .unwrap();
    assert_eq!(harness.delivery_count(), 1);

    // A client-side retry inside the window returns the recorded outcome
    // without touching the activation again.
    let retried = m1
        .context()
        .request(&identity, b"charge".to_vec(), 99)
        .await
        .unwrap();
    assert_eq!(first, retried);
    assert_eq!(harness.delivery_count(), 1);

    // A different correlation id is a new logical request.
    m1.context()
        .request(&identity, b"charge".to_vec(), 100)
        .await
        .unwrap();
    assert_eq!(harness.delivery_count(), 2);

    m1.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_disabled_deduplication_delivers_every_request() {
    let harness = Harness::new();
    let handler = Arc::new(TaggingHandler {
        address: "m1:6023".to_owned(),
        deliveries: harness.deliveries.clone(),
    });
    let config = ClusterConfig::new("routing-test")
        .with_gossip_interval(Duration::from_millis(30))
        .with_request_deduplication(false)
        .with_kind(ClusterKind::new("order", handler));
    let m1 = Cluster::new(
        config,
        "m1:6023",
        harness.network.transport_for("m1:6023"),
    )
    .unwrap();
    harness.network.register("m1:6023", Arc::new(m1.clone()));
    m1.start(&[]).await.unwrap();

    let identity = ClusterIdentity::new("order", "7").unwrap();
    m1.context()
        .request(&identity, b"charge".to_vec(), 99)
        .await
        .unwrap();
    m1.context()
        .request(&identity, b"charge".to_vec(), 99)
        .await
        .unwrap();
    assert_eq!(harness.delivery_count(), 2);

    m1.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stale_cache_recovers_through_one_retry() {
    let harness = Harness::new();
    let m1 = harness.start_member("m1:6024", &[]).await;
    let m2 = harness.start_member("m2:6024", &["m1:6024"]).await;
    wait_for_alive(&m1, 2).await;
    wait_for_alive(&m2, 2).await;

    let identity = ClusterIdentity::new("order", "42").unwrap();
    m1.context()
        .request(&identity, b"first".to_vec(), 1)
        .await
        .unwrap();
    let placed = m1.lookup().placement(&identity).unwrap();
    assert_eq!(placed.generation, 1);

    // Passivate the activation behind the cache's back. The next delivery
    // hits a dead pid, evicts, re-resolves and lands on the fresh
    // activation generation.
    let owner = [&m1, &m2]
        .into_iter()
        .find(|m| m.local_address() == placed.owner)
        .unwrap();
    assert!(owner.host().deactivate(&identity));

    let response = m1
        .context()
        .request(&identity, b"second".to_vec(), 2)
        .await
        .unwrap();
    assert_eq!(response_host(&response), placed.owner);
    assert_eq!(m1.lookup().placement(&identity).unwrap().generation, 2);

    m1.shutdown().await;
    m2.shutdown().await;
}
