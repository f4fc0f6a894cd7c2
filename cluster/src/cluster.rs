// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Cluster instance
//!
//! The `cluster` module provides the `Cluster` type, the explicit instance
//! object tying configuration, gossip, identity lookup and request routing
//! together with a defined start/stop lifecycle. Nothing in the crate is
//! ambient global state: several independent clusters can coexist in one
//! process, which is also how the integration tests run whole topologies.
//!

use crate::{
    Error,
    activation::{ActivatedPid, ActivationHost, KindRegistry},
    config::{ClusterConfig, StartMode},
    context::ClusterContext,
    gossip::{GossipEngine, TopologyEvent},
    gossip_state::GossipSnapshot,
    identity::ClusterIdentity,
    lookup::IdentityLookup,
    member::MembershipView,
    transport::{ClusterTransport, Envelope, InboundEndpoint, TransportError},
};

use async_trait::async_trait;

use tokio::{sync::broadcast, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use tracing::{debug, error};

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};

/// One cluster participation: a member hosting activations, or a client
/// that only gossips and routes.
#[derive(Clone)]
pub struct Cluster {
    inner: Arc<ClusterCore>,
}

struct ClusterCore {
    config: ClusterConfig,
    local_address: String,
    host: Arc<KindRegistry>,
    gossip: GossipEngine,
    lookup: IdentityLookup,
    context: ClusterContext,
    token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl Cluster {
    /// Builds a cluster instance around a transport.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` when the configuration fails validation.
    pub fn new(
        config: ClusterConfig,
        local_address: &str,
        transport: Arc<dyn ClusterTransport>,
    ) -> Result<Self, Error> {
        config.validate()?;

        let host = Arc::new(KindRegistry::new(local_address));
        let advertised = match config.start_mode() {
            StartMode::Member => {
                for kind in config.kinds() {
                    host.register(kind);
                }
                host.kind_names()
            }
            // A client gossips so its view converges, but hosts nothing and
            // advertises nothing.
            StartMode::Client => Vec::new(),
        };

        let gossip = GossipEngine::new(
            &config,
            local_address,
            advertised,
            transport.clone(),
        );
        let lookup = IdentityLookup::new(
            local_address,
            config.actor_request_timeout(),
            transport.clone(),
            host.clone(),
            gossip.membership(),
            config.member_strategy_builder(),
        );
        for kind in config.kinds() {
            if let Some(builder) = &kind.strategy_builder {
                lookup.register_strategy(&kind.name, builder(&kind.name));
            }
        }

        let dedup_window = config
            .request_deduplication()
            .then(|| config.request_deduplication_window());
        let context = ClusterContext::new(
            local_address,
            lookup.clone(),
            transport,
            host.clone(),
            config.actor_request_timeout(),
            dedup_window,
            config.request_log_throttle_period(),
            config.max_events_in_request_log_throttle_period(),
        );

        Ok(Self {
            inner: Arc::new(ClusterCore {
                config,
                local_address: local_address.to_owned(),
                host,
                gossip,
                lookup,
                context,
                token: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
            }),
        })
    }

    /// Starts gossiping and serving requests.
    ///
    /// With seeds, the call returns once the member joined the cluster or
    /// exhausted its join retries and fell back to gossiping alone. Without
    /// seeds the member forms a cluster of one.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the cluster was already started.
    pub async fn start(&self, seeds: &[String]) -> Result<(), Error> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(Error::Config("cluster already started".to_owned()));
        }
        debug!(
            "Starting cluster '{}' at {} as {:?}.",
            self.inner.config.cluster_name(),
            self.inner.local_address,
            self.inner.config.start_mode()
        );

        self.inner.gossip.bootstrap(seeds).await;

        // Topology events drive cache invalidation: placements owned by a
        // departed or unreachable member are dropped the moment the view
        // changes, not when a delivery fails.
        let lookup = self.inner.lookup.clone();
        let mut events = self.inner.gossip.subscribe();
        let eviction_token = self.inner.token.clone();
        let eviction = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = eviction_token.cancelled() => return,
                    event = events.recv() => match event {
                        Ok(event) => lookup.handle_topology(&event),
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            error!(
                                "Topology subscriber lagged by {} events.",
                                missed
                            );
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    }
                }
            }
        });
        let gossip_loop = tokio::spawn(
            self.inner.gossip.clone().run(self.inner.token.clone()),
        );
        if let Ok(mut tasks) = self.inner.tasks.lock() {
            tasks.push(eviction);
            tasks.push(gossip_loop);
        }

        if !seeds.is_empty() {
            let retry = (self.inner.config.join_retry_factory())();
            self.inner.gossip.join(retry, &self.inner.token).await;
        }
        Ok(())
    }

    /// Gracefully leaves the cluster.
    ///
    /// The member announces Leaving to its peers first, so they evict it
    /// promptly instead of waiting for the unreachability timeout, then
    /// stops its background tasks.
    pub async fn shutdown(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Stopping cluster member {}...", self.inner.local_address);
        self.inner.gossip.announce_leaving().await;
        self.inner.token.cancel();
        let tasks = self
            .inner
            .tasks
            .lock()
            .map(|mut tasks| tasks.drain(..).collect::<Vec<_>>())
            .unwrap_or_default();
        for task in tasks {
            let _ = task.await;
        }
        debug!("Cluster member {} stopped.", self.inner.local_address);
    }

    /// This member's advertised address.
    pub fn local_address(&self) -> &str {
        &self.inner.local_address
    }

    /// The request-routing façade.
    pub fn context(&self) -> &ClusterContext {
        &self.inner.context
    }

    /// The identity lookup of this instance.
    pub fn lookup(&self) -> &IdentityLookup {
        &self.inner.lookup
    }

    /// The local activation host.
    pub fn host(&self) -> &Arc<KindRegistry> {
        &self.inner.host
    }

    /// The latest converged membership view.
    pub fn membership(&self) -> Arc<MembershipView> {
        self.inner.gossip.membership().current()
    }

    /// Subscribes to topology change events.
    pub fn subscribe_topology(&self) -> broadcast::Receiver<TopologyEvent> {
        self.inner.gossip.subscribe()
    }
}

#[async_trait]
impl InboundEndpoint for Cluster {
    async fn handle_gossip(
        &self,
        from: &str,
        delta: GossipSnapshot,
    ) -> Result<GossipSnapshot, TransportError> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(TransportError::Unreachable(
                self.inner.local_address.clone(),
            ));
        }
        Ok(self.inner.gossip.handle_exchange(from, delta).await)
    }

    async fn handle_ensure_activated(
        &self,
        identity: &ClusterIdentity,
    ) -> Result<ActivatedPid, TransportError> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(TransportError::Refused(
                "member is shutting down".to_owned(),
            ));
        }
        self.inner
            .host
            .ensure_activated(identity)
            .await
            .map_err(to_transport_error)
    }

    async fn handle_request(
        &self,
        target: &ActivatedPid,
        envelope: Envelope,
    ) -> Result<Vec<u8>, TransportError> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(TransportError::Unreachable(
                self.inner.local_address.clone(),
            ));
        }
        self.inner
            .host
            .dispatch(target, &envelope.identity, &envelope.payload)
            .await
            .map_err(to_transport_error)
    }
}

fn to_transport_error(error: Error) -> TransportError {
    match error {
        Error::Stale(_) => TransportError::NotHosted,
        Error::Refused(reason) => TransportError::Refused(reason),
        Error::Timeout => TransportError::Timeout,
        other => TransportError::Refused(other.to_string()),
    }
}
