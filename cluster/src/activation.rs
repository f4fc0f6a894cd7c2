// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Activation host
//!
//! The `activation` module provides the boundary to the local actor runtime:
//! registering the kinds a member can host and ensuring an activation exists
//! for an identity. Ensure-activated is idempotent while the identity stays
//! hosted, which is the property the whole placement protocol leans on when
//! two members briefly disagree about ownership.
//!

use crate::{Error, identity::ClusterIdentity, strategy::MemberStrategyBuilder};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use tracing::debug;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock},
};

/// Physical address of one live activation.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ActivatedPid {
    /// Address of the hosting member.
    pub address: String,
    /// Process-local activation id, unique per activation generation.
    pub id: String,
    /// Bumped every time the identity is re-activated. Used to discard
    /// stale cached addresses, never to arbitrate ownership.
    pub generation: u64,
}

/// Application hook invoked for every request delivered to an activation.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Handles a request payload and produces the response payload.
    async fn on_request(
        &self,
        identity: &ClusterIdentity,
        payload: &[u8],
    ) -> Result<Vec<u8>, Error>;
}

/// A kind registration: the kind name, its request handler and an optional
/// per-kind strategy override.
#[derive(Clone)]
pub struct ClusterKind {
    /// Kind name advertised through gossip.
    pub name: String,
    /// Handler for requests addressed to activations of this kind.
    pub handler: Arc<dyn RequestHandler>,
    /// Strategy override; `None` falls back to the configured default.
    pub strategy_builder: Option<MemberStrategyBuilder>,
}

impl ClusterKind {
    /// Creates a kind registration with the default strategy.
    pub fn new(name: &str, handler: Arc<dyn RequestHandler>) -> Self {
        Self {
            name: name.to_owned(),
            handler,
            strategy_builder: None,
        }
    }

    /// Overrides the member strategy for this kind only.
    pub fn with_strategy_builder(mut self, builder: MemberStrategyBuilder) -> Self {
        self.strategy_builder = Some(builder);
        self
    }
}

/// Boundary to the member-local activation machinery.
#[async_trait]
pub trait ActivationHost: Send + Sync {
    /// Returns the pid hosting the identity, activating it first if needed.
    ///
    /// # Errors
    ///
    /// Returns `Error::Refused` when this member cannot host the identity.
    async fn ensure_activated(
        &self,
        identity: &ClusterIdentity,
    ) -> Result<ActivatedPid, Error>;
}

/// Per-member registry of hosted kinds and live activations.
pub struct KindRegistry {
    local_address: String,
    handlers: RwLock<HashMap<String, Arc<dyn RequestHandler>>>,
    state: Mutex<RegistryState>,
}

#[derive(Default)]
struct RegistryState {
    activations: HashMap<ClusterIdentity, ActivatedPid>,
    generations: HashMap<ClusterIdentity, u64>,
}

impl KindRegistry {
    /// Creates an empty registry for the given member address.
    pub fn new(local_address: &str) -> Self {
        Self {
            local_address: local_address.to_owned(),
            handlers: RwLock::new(HashMap::new()),
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// Registers a kind. Later registrations replace earlier ones.
    pub fn register(&self, kind: &ClusterKind) {
        if let Ok(mut handlers) = self.handlers.write() {
            handlers.insert(kind.name.clone(), kind.handler.clone());
        }
    }

    /// Kind names this member advertises.
    pub fn kind_names(&self) -> Vec<String> {
        self.handlers
            .read()
            .map(|handlers| {
                let mut names: Vec<String> =
                    handlers.keys().cloned().collect();
                names.sort();
                names
            })
            .unwrap_or_default()
    }

    /// True while the identity has a live activation here.
    pub fn is_hosted(&self, identity: &ClusterIdentity) -> bool {
        self.state
            .lock()
            .map(|state| state.activations.contains_key(identity))
            .unwrap_or(false)
    }

    /// Number of live activations.
    pub fn active_count(&self) -> usize {
        self.state
            .lock()
            .map(|state| state.activations.len())
            .unwrap_or(0)
    }

    /// Drops the activation for an identity, if any.
    ///
    /// The generation counter survives, so a later re-activation hands out
    /// a pid that supersedes every previously cached address.
    pub fn deactivate(&self, identity: &ClusterIdentity) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        let dropped = state.activations.remove(identity).is_some();
        if dropped {
            debug!("Deactivated {}.", identity);
        }
        dropped
    }

    /// Delivers a request to a hosted activation.
    ///
    /// # Errors
    ///
    /// Returns `Error::Stale` when the identity is not hosted here or the
    /// addressed pid belongs to an older activation generation, and
    /// `Error::Refused` when the kind is unknown to this member.
    pub async fn dispatch(
        &self,
        target: &ActivatedPid,
        identity: &ClusterIdentity,
        payload: &[u8],
    ) -> Result<Vec<u8>, Error> {
        let handler = self
            .handlers
            .read()
            .ok()
            .and_then(|handlers| handlers.get(identity.kind()).cloned())
            .ok_or_else(|| {
                Error::Refused(format!("kind {} not hosted", identity.kind()))
            })?;

        {
            let state = self
                .state
                .lock()
                .map_err(|_| Error::Refused("registry poisoned".to_owned()))?;
            match state.activations.get(identity) {
                Some(current) if current.id == target.id => {}
                _ => return Err(Error::Stale(identity.to_string())),
            }
        }

        handler.on_request(identity, payload).await
    }
}

#[async_trait]
impl ActivationHost for KindRegistry {
    async fn ensure_activated(
        &self,
        identity: &ClusterIdentity,
    ) -> Result<ActivatedPid, Error> {
        let hosts_kind = self
            .handlers
            .read()
            .map(|handlers| handlers.contains_key(identity.kind()))
            .unwrap_or(false);
        if !hosts_kind {
            return Err(Error::Refused(format!(
                "kind {} not hosted",
                identity.kind()
            )));
        }

        let mut state = self
            .state
            .lock()
            .map_err(|_| Error::Refused("registry poisoned".to_owned()))?;

        if let Some(existing) = state.activations.get(identity) {
            return Ok(existing.clone());
        }

        let generation =
            state.generations.get(identity).copied().unwrap_or(0) + 1;
        state.generations.insert(identity.clone(), generation);
        let pid = ActivatedPid {
            address: self.local_address.clone(),
            id: format!("{}#{}", identity, generation),
            generation,
        };
        state.activations.insert(identity.clone(), pid.clone());
        debug!("Activated {} as {}.", identity, pid.id);
        Ok(pid)
    }
}
