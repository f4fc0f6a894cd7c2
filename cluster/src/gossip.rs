// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Gossip engine
//!
//! The `gossip` module provides the periodic fanout exchange that converges
//! cluster membership without a coordinator. Each round the engine bumps the
//! local heartbeat, picks a bounded random subset of peers, exchanges gossip
//! deltas with each of them concurrently, merges what came back, runs the
//! member status machine and publishes a fresh [`MembershipView`] snapshot.
//!
//! A failed exchange with one peer never blocks or fails the round: it only
//! withholds that peer's contribution for the cycle. A member that cannot
//! reach anyone keeps gossiping to itself, degraded but alive, until
//! connectivity returns.
//!

use crate::{
    config::ClusterConfig,
    gossip_state::{
        GossipSnapshot, GossipState, KeyChange, HEARTBEAT_KEY, MEMBER_KEY,
    },
    member::{Member, MemberRecord, MembershipHandle, MemberStatus, MembershipView},
    retry::RetryStrategy,
    transport::ClusterTransport,
};

use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;

use tracing::{debug, error, warn};

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

/// Capacity of the topology event channel. Slow subscribers that lag behind
/// simply re-read the latest view.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Emitted after any gossip round that changed the topology.
#[derive(Clone, Debug)]
pub struct TopologyEvent {
    /// The freshly published view.
    pub view: Arc<MembershipView>,
    /// Members newly discovered or promoted to Alive.
    pub joined: Vec<String>,
    /// Members that announced Leaving or were marked Left. Placements owned
    /// by these members must be dropped.
    pub departed: Vec<String>,
    /// Members that stopped gossiping within the unreachability timeout.
    /// Placements owned by these members must be dropped.
    pub unreachable: Vec<String>,
    /// Previously unreachable members whose activity resumed.
    pub recovered: Vec<String>,
}

impl TopologyEvent {
    fn is_empty(&self) -> bool {
        self.joined.is_empty()
            && self.departed.is_empty()
            && self.unreachable.is_empty()
            && self.recovered.is_empty()
    }
}

/// Drives gossip dissemination and owns the membership view.
#[derive(Clone)]
pub struct GossipEngine {
    inner: Arc<GossipInner>,
}

struct GossipInner {
    local_address: String,
    kinds: Vec<String>,
    interval: Duration,
    fanout: usize,
    request_timeout: Duration,
    unreachable_after: Duration,
    transport: Arc<dyn ClusterTransport>,
    state: Mutex<EngineState>,
    membership: MembershipHandle,
    events: broadcast::Sender<TopologyEvent>,
    rng: std::sync::Mutex<u64>,
}

struct EngineState {
    gossip: GossipState,
    statuses: HashMap<String, MemberStatus>,
    activity: HashMap<String, Instant>,
    heartbeat: u64,
    self_status: MemberStatus,
    last_hash: u64,
}

impl GossipEngine {
    /// Creates an engine for the given member.
    ///
    /// `kinds` is what the member advertises through its gossip record: the
    /// hosted kinds for a member, empty for a client.
    pub fn new(
        config: &ClusterConfig,
        local_address: &str,
        kinds: Vec<String>,
        transport: Arc<dyn ClusterTransport>,
    ) -> Self {
        let mut gossip = GossipState::new(local_address);
        write_member_record(&mut gossip, &kinds, MemberStatus::Joining);

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let seed = crate::strategy::fnv1a(&[local_address.as_bytes()])
            | 1; // xorshift state must never be zero
        Self {
            inner: Arc::new(GossipInner {
                local_address: local_address.to_owned(),
                kinds,
                interval: config.gossip_interval(),
                fanout: config.gossip_fanout(),
                request_timeout: config.gossip_request_timeout(),
                unreachable_after: config.unreachable_timeout(),
                transport,
                state: Mutex::new(EngineState {
                    gossip,
                    statuses: HashMap::new(),
                    activity: HashMap::new(),
                    heartbeat: 0,
                    self_status: MemberStatus::Joining,
                    last_hash: 0,
                }),
                membership: MembershipHandle::empty(),
                events,
                rng: std::sync::Mutex::new(seed),
            }),
        }
    }

    /// Read handle over the latest published membership view.
    pub fn membership(&self) -> MembershipHandle {
        self.inner.membership.clone()
    }

    /// Subscribes to topology change events.
    pub fn subscribe(&self) -> broadcast::Receiver<TopologyEvent> {
        self.inner.events.subscribe()
    }

    /// Registers the seed peers and publishes the initial view.
    ///
    /// A member started without seeds is a cluster of one: it turns Alive
    /// immediately instead of waiting for a gossip round that cannot happen.
    pub async fn bootstrap(&self, seeds: &[String]) {
        let mut state = self.inner.state.lock().await;
        let now = Instant::now();
        for seed in seeds {
            if seed != &self.inner.local_address {
                state.statuses.insert(seed.clone(), MemberStatus::Joining);
                state.activity.insert(seed.clone(), now);
            }
        }
        if seeds.is_empty() {
            self.become_alive(&mut state);
        }
        self.sweep_and_publish(&mut state);
    }

    /// Runs immediate gossip rounds until the member turns Alive or the
    /// retry strategy is exhausted.
    ///
    /// Exhaustion is not fatal: the member stays up and keeps gossiping on
    /// its regular interval, alone, until a peer becomes reachable.
    pub async fn join(
        &self,
        mut retry: Box<dyn RetryStrategy>,
        token: &CancellationToken,
    ) {
        let mut attempts = 0;
        loop {
            if token.is_cancelled() {
                return;
            }
            self.round().await;
            if self.is_alive().await {
                debug!("Joined the cluster as {}.", self.inner.local_address);
                return;
            }
            attempts += 1;
            if attempts >= retry.max_retries() {
                break;
            }
            if let Some(delay) = retry.next_backoff() {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        warn!(
            "No peer reachable while joining; {} gossips alone until \
             connectivity returns.",
            self.inner.local_address
        );
        let mut state = self.inner.state.lock().await;
        self.become_alive(&mut state);
        self.sweep_and_publish(&mut state);
    }

    /// Periodic gossip loop. Runs until the token is cancelled.
    pub async fn run(self, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.inner.interval);
        ticker.set_missed_tick_behavior(
            tokio::time::MissedTickBehavior::Delay,
        );
        debug!("Gossip loop for {} started.", self.inner.local_address);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(
                        "Gossip loop for {} stopped.",
                        self.inner.local_address
                    );
                    return;
                }
                _ = ticker.tick() => {
                    self.round().await;
                }
            }
        }
    }

    /// One gossip round: heartbeat, fanout exchange, merge, status sweep.
    pub async fn round(&self) {
        let outgoing = {
            let mut state = self.inner.state.lock().await;
            state.heartbeat += 1;
            match bincode::serialize(&state.heartbeat) {
                Ok(bytes) => {
                    state.gossip.set_key(HEARTBEAT_KEY, bytes);
                }
                Err(e) => error!("Could not encode heartbeat: {}", e),
            }
            let targets = self.select_targets(&state);
            targets
                .into_iter()
                .map(|target| {
                    let delta = state.gossip.delta_for(&target);
                    (target, delta)
                })
                .collect::<Vec<_>>()
        };

        if outgoing.is_empty() {
            let mut state = self.inner.state.lock().await;
            self.sweep_and_publish(&mut state);
            return;
        }

        let exchanges = outgoing.into_iter().map(|(peer, delta)| {
            let transport = self.inner.transport.clone();
            let request_timeout = self.inner.request_timeout;
            async move {
                let result = tokio::time::timeout(
                    request_timeout,
                    transport.gossip_exchange(&peer, delta.clone()),
                )
                .await;
                (peer, delta, result)
            }
        });
        let results = futures::future::join_all(exchanges).await;

        let mut state = self.inner.state.lock().await;
        let mut any_success = false;
        for (peer, delta, result) in results {
            match result {
                Ok(Ok(response)) => {
                    any_success = true;
                    state.gossip.commit_delta(&peer, &delta);
                    let changes = state.gossip.merge(&response);
                    note_activity(&mut state, &peer, &changes);
                }
                Ok(Err(e)) => {
                    debug!("Gossip exchange with {} failed: {}", peer, e);
                }
                Err(_) => {
                    debug!("Gossip exchange with {} timed out.", peer);
                }
            }
        }
        if any_success && state.self_status == MemberStatus::Joining {
            self.become_alive(&mut state);
        }
        self.sweep_and_publish(&mut state);
    }

    /// Answers an exchange initiated by a peer: merge its delta, reply with
    /// our full snapshot. Responding with the full state keeps the protocol
    /// safe when a response is lost in flight.
    pub async fn handle_exchange(
        &self,
        from: &str,
        delta: GossipSnapshot,
    ) -> GossipSnapshot {
        let mut state = self.inner.state.lock().await;
        let changes = state.gossip.merge(&delta);
        note_activity(&mut state, from, &changes);
        if state.self_status == MemberStatus::Joining {
            self.become_alive(&mut state);
        }
        self.sweep_and_publish(&mut state);
        state.gossip.snapshot()
    }

    /// Announces a graceful shutdown to the alive peers.
    ///
    /// Best effort: the announcement is pushed to every alive peer once so
    /// they evict this member promptly instead of waiting for the
    /// unreachability timeout. Failures are ignored; the timeout path still
    /// covers them.
    pub async fn announce_leaving(&self) {
        let outgoing = {
            let mut state = self.inner.state.lock().await;
            state.self_status = MemberStatus::Leaving;
            write_member_record(
                &mut state.gossip,
                &self.inner.kinds,
                MemberStatus::Leaving,
            );
            let peers: Vec<String> = state
                .statuses
                .iter()
                .filter(|(_, status)| status.can_host())
                .map(|(address, _)| address.clone())
                .collect();
            peers
                .into_iter()
                .map(|peer| (peer.clone(), state.gossip.delta_for(&peer)))
                .collect::<Vec<_>>()
        };

        let farewells = outgoing.into_iter().map(|(peer, delta)| {
            let transport = self.inner.transport.clone();
            let request_timeout = self.inner.request_timeout;
            async move {
                let _ = tokio::time::timeout(
                    request_timeout,
                    transport.gossip_exchange(&peer, delta),
                )
                .await;
            }
        });
        futures::future::join_all(farewells).await;
        debug!("{} announced Leaving.", self.inner.local_address);
    }

    async fn is_alive(&self) -> bool {
        self.inner.state.lock().await.self_status == MemberStatus::Alive
    }

    fn become_alive(&self, state: &mut EngineState) {
        state.self_status = MemberStatus::Alive;
        write_member_record(
            &mut state.gossip,
            &self.inner.kinds,
            MemberStatus::Alive,
        );
        debug!("{} is now Alive.", self.inner.local_address);
    }

    /// Picks the fanout targets: a random subset of the alive peers, with
    /// leftover slots filled from joining and unreachable peers so bootstrap
    /// can proceed and partitions can heal.
    fn select_targets(&self, state: &EngineState) -> Vec<String> {
        let mut alive: Vec<String> = Vec::new();
        let mut fallback: Vec<String> = Vec::new();
        for (address, status) in &state.statuses {
            match status {
                MemberStatus::Alive => alive.push(address.clone()),
                MemberStatus::Joining | MemberStatus::Unreachable => {
                    fallback.push(address.clone())
                }
                _ => {}
            }
        }
        self.shuffle(&mut alive);
        self.shuffle(&mut fallback);

        let mut targets: Vec<String> =
            alive.into_iter().take(self.inner.fanout).collect();
        if targets.len() < self.inner.fanout {
            let free = self.inner.fanout - targets.len();
            targets.extend(fallback.into_iter().take(free));
        }
        targets
    }

    fn shuffle(&self, items: &mut [String]) {
        if items.len() < 2 {
            return;
        }
        for i in 0..items.len() - 1 {
            let j = i + (self.next_rand() as usize) % (items.len() - i);
            items.swap(i, j);
        }
    }

    fn next_rand(&self) -> u64 {
        let Ok(mut rng) = self.inner.rng.lock() else {
            return 1;
        };
        let mut x = *rng;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        *rng = x;
        x
    }

    /// Runs the status machine over every known row, rebuilds the view and
    /// emits a topology event when something changed.
    fn sweep_and_publish(&self, state: &mut EngineState) {
        let now = Instant::now();
        let mut joined = Vec::new();
        let mut departed = Vec::new();
        let mut unreachable = Vec::new();
        let mut recovered = Vec::new();

        let mut addresses: Vec<String> = state.gossip.members();
        for address in state.statuses.keys() {
            if !addresses.contains(address) {
                addresses.push(address.clone());
            }
        }

        for address in addresses {
            if address == self.inner.local_address {
                continue;
            }
            let record = read_member_record(&state.gossip, &address);
            let claim = record.as_ref().map(|r| r.claim);

            let current = match state.statuses.get(&address).copied() {
                Some(status) => status,
                None => {
                    // Newly discovered through a merge.
                    state.activity.entry(address.clone()).or_insert(now);
                    state
                        .statuses
                        .insert(address.clone(), MemberStatus::Joining);
                    MemberStatus::Joining
                }
            };

            // Claimed transitions first: a graceful announcement beats any
            // local judgement.
            let mut status = current;
            match claim {
                Some(MemberStatus::Left) => status = MemberStatus::Left,
                Some(MemberStatus::Leaving)
                    if status != MemberStatus::Left =>
                {
                    status = MemberStatus::Leaving;
                }
                Some(MemberStatus::Alive)
                    if status == MemberStatus::Joining =>
                {
                    status = MemberStatus::Alive;
                    joined.push(address.clone());
                }
                _ => {}
            }

            // Local reachability judgement.
            let last_activity =
                state.activity.get(&address).copied().unwrap_or(now);
            let idle = now.saturating_duration_since(last_activity);
            match status {
                MemberStatus::Alive
                    if idle > self.inner.unreachable_after =>
                {
                    status = MemberStatus::Unreachable;
                    unreachable.push(address.clone());
                }
                MemberStatus::Unreachable
                    if idle <= self.inner.unreachable_after =>
                {
                    status = MemberStatus::Alive;
                    recovered.push(address.clone());
                }
                MemberStatus::Leaving
                    if idle > self.inner.unreachable_after =>
                {
                    status = MemberStatus::Left;
                }
                _ => {}
            }

            if status != current && status.is_departed() {
                departed.push(address.clone());
            }

            if status == MemberStatus::Left {
                // Terminal: forget the member entirely. A restart comes back
                // as a brand new row.
                state.gossip.drop_member(&address);
                state.statuses.remove(&address);
                state.activity.remove(&address);
            } else {
                state.statuses.insert(address.clone(), status);
            }
        }

        let mut members = vec![Member {
            address: self.inner.local_address.clone(),
            kinds: self.inner.kinds.clone(),
            status: state.self_status,
        }];
        for (address, status) in &state.statuses {
            let kinds = read_member_record(&state.gossip, address)
                .map(|record| record.kinds)
                .unwrap_or_default();
            members.push(Member {
                address: address.clone(),
                kinds,
                status: *status,
            });
        }
        let view = Arc::new(MembershipView::new(members));
        let hash = view.topology_hash();
        let changed = hash != state.last_hash;
        state.last_hash = hash;
        self.inner.membership.publish(view.clone());

        let event = TopologyEvent {
            view,
            joined,
            departed,
            unreachable,
            recovered,
        };
        if changed && !event.is_empty() {
            debug!(
                "Topology changed: +{:?} -{:?} ?{:?} ~{:?}",
                event.joined, event.departed, event.unreachable,
                event.recovered
            );
            let _ = self.inner.events.send(event);
        }
    }
}

fn note_activity(state: &mut EngineState, peer: &str, changes: &[KeyChange]) {
    let now = Instant::now();
    state.activity.insert(peer.to_owned(), now);
    for change in changes {
        state.activity.insert(change.member.clone(), now);
    }
}

fn write_member_record(
    gossip: &mut GossipState,
    kinds: &[String],
    claim: MemberStatus,
) {
    let record = MemberRecord {
        kinds: kinds.to_vec(),
        claim,
    };
    match bincode::serialize(&record) {
        Ok(bytes) => {
            gossip.set_key(MEMBER_KEY, bytes);
        }
        Err(e) => error!("Could not encode member record: {}", e),
    }
}

fn read_member_record(
    gossip: &GossipState,
    address: &str,
) -> Option<MemberRecord> {
    gossip
        .get(address, MEMBER_KEY)
        .and_then(|value| bincode::deserialize(&value.value).ok())
}
