// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # In-process network
//!
//! The `local` module wires several cluster instances living in one process
//! together behind the [`ClusterTransport`] boundary. Members can be
//! disconnected and reconnected at will, which makes partitions, churn and
//! migration scenarios reproducible without sockets.
//!

use crate::{
    activation::ActivatedPid,
    gossip_state::GossipSnapshot,
    identity::ClusterIdentity,
    transport::{ClusterTransport, Envelope, InboundEndpoint, TransportError},
};

use async_trait::async_trait;

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

/// Registry connecting in-process members to each other.
#[derive(Clone, Default)]
pub struct InProcessNetwork {
    inner: Arc<NetworkInner>,
}

#[derive(Default)]
struct NetworkInner {
    endpoints: RwLock<HashMap<String, EndpointSlot>>,
}

struct EndpointSlot {
    endpoint: Arc<dyn InboundEndpoint>,
    connected: bool,
}

impl InProcessNetwork {
    /// Creates an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the outbound transport for a member address.
    pub fn transport_for(&self, address: &str) -> Arc<dyn ClusterTransport> {
        Arc::new(LocalTransport {
            network: self.inner.clone(),
            local_address: address.to_owned(),
        })
    }

    /// Registers the inbound endpoint of a member. Must happen before peers
    /// try to reach it.
    pub fn register(&self, address: &str, endpoint: Arc<dyn InboundEndpoint>) {
        if let Ok(mut endpoints) = self.inner.endpoints.write() {
            endpoints.insert(
                address.to_owned(),
                EndpointSlot {
                    endpoint,
                    connected: true,
                },
            );
        }
    }

    /// Removes a member from the network entirely.
    pub fn deregister(&self, address: &str) {
        if let Ok(mut endpoints) = self.inner.endpoints.write() {
            endpoints.remove(address);
        }
    }

    /// Cuts a member off: every call from or to it fails as unreachable.
    pub fn disconnect(&self, address: &str) {
        self.set_connected(address, false);
    }

    /// Reconnects a previously disconnected member.
    pub fn connect(&self, address: &str) {
        self.set_connected(address, true);
    }

    fn set_connected(&self, address: &str, connected: bool) {
        if let Ok(mut endpoints) = self.inner.endpoints.write() {
            if let Some(slot) = endpoints.get_mut(address) {
                slot.connected = connected;
            }
        }
    }
}

struct LocalTransport {
    network: Arc<NetworkInner>,
    local_address: String,
}

impl LocalTransport {
    fn route(
        &self,
        target: &str,
    ) -> Result<Arc<dyn InboundEndpoint>, TransportError> {
        let endpoints = self
            .network
            .endpoints
            .read()
            .map_err(|_| TransportError::Unreachable(target.to_owned()))?;

        let local_connected = endpoints
            .get(&self.local_address)
            .map(|slot| slot.connected)
            .unwrap_or(true);
        if !local_connected {
            return Err(TransportError::Unreachable(target.to_owned()));
        }

        match endpoints.get(target) {
            Some(slot) if slot.connected => Ok(slot.endpoint.clone()),
            _ => Err(TransportError::Unreachable(target.to_owned())),
        }
    }
}

#[async_trait]
impl ClusterTransport for LocalTransport {
    async fn gossip_exchange(
        &self,
        target: &str,
        delta: GossipSnapshot,
    ) -> Result<GossipSnapshot, TransportError> {
        let endpoint = self.route(target)?;
        endpoint.handle_gossip(&self.local_address, delta).await
    }

    async fn ensure_activated(
        &self,
        target: &str,
        identity: &ClusterIdentity,
    ) -> Result<ActivatedPid, TransportError> {
        let endpoint = self.route(target)?;
        endpoint.handle_ensure_activated(identity).await
    }

    async fn send_request(
        &self,
        target: &ActivatedPid,
        envelope: Envelope,
    ) -> Result<Vec<u8>, TransportError> {
        let endpoint = self.route(&target.address)?;
        endpoint.handle_request(target, envelope).await
    }
}
