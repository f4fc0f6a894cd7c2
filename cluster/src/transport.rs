// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Transport boundary
//!
//! The `transport` module defines the contracts between the cluster core and
//! whatever carries bytes between members. Framing, connection management and
//! RPC stubs live behind [`ClusterTransport`]; the receiving side of the same
//! calls is [`InboundEndpoint`]. Every call is at-most-once: retries are the
//! caller's responsibility, never the transport's.
//!

use crate::{
    Error,
    activation::ActivatedPid,
    gossip_state::GossipSnapshot,
    identity::ClusterIdentity,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;

/// Transport-level failure kinds.
#[derive(Clone, Debug, Eq, PartialEq, ThisError)]
pub enum TransportError {
    /// The peer did not answer at all.
    #[error("Peer {0} is unreachable.")]
    Unreachable(String),
    /// The peer did not answer within the per-request timeout.
    #[error("Request timed out.")]
    Timeout,
    /// The peer answered with a rejection.
    #[error("Request refused: {0}")]
    Refused(String),
    /// The peer answered but no longer hosts the addressed activation.
    #[error("Activation is not hosted by the peer.")]
    NotHosted,
}

impl From<TransportError> for Error {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::Unreachable(peer) => Error::Unreachable(peer),
            TransportError::Timeout => Error::Timeout,
            TransportError::Refused(reason) => Error::Refused(reason),
            TransportError::NotHosted => {
                Error::Stale("activation moved".to_owned())
            }
        }
    }
}

/// Message envelope delivered to a virtual actor.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Logical addressee.
    pub identity: ClusterIdentity,
    /// Correlation id used by request deduplication.
    pub correlation_id: u64,
    /// Application payload, opaque to the cluster core.
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Encodes the envelope for transports that carry raw bytes.
    ///
    /// # Errors
    ///
    /// Returns `Error::Codec` if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        bincode::serialize(self).map_err(|e| Error::Codec(e.to_string()))
    }

    /// Decodes an envelope previously produced by [`Envelope::encode`].
    ///
    /// # Errors
    ///
    /// Returns `Error::Codec` if the bytes do not form an envelope.
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        bincode::deserialize(bytes).map_err(|e| Error::Codec(e.to_string()))
    }
}

/// Outbound half of the member-to-member contract.
#[async_trait]
pub trait ClusterTransport: Send + Sync {
    /// Exchanges gossip with a peer: delivers our delta, returns the peer's
    /// current snapshot.
    async fn gossip_exchange(
        &self,
        target: &str,
        delta: GossipSnapshot,
    ) -> Result<GossipSnapshot, TransportError>;

    /// Asks the owning member to activate (or confirm) an identity.
    ///
    /// Idempotent on the receiving side: if the target already hosts an
    /// instance for the identity it returns the existing address.
    async fn ensure_activated(
        &self,
        target: &str,
        identity: &ClusterIdentity,
    ) -> Result<ActivatedPid, TransportError>;

    /// Delivers a request envelope to an activated pid and returns the
    /// response payload.
    async fn send_request(
        &self,
        target: &ActivatedPid,
        envelope: Envelope,
    ) -> Result<Vec<u8>, TransportError>;
}

/// Inbound half: what a member exposes to its peers.
///
/// A real remote layer deserializes frames and calls these; the in-process
/// network calls them directly.
#[async_trait]
pub trait InboundEndpoint: Send + Sync {
    /// Answers a gossip exchange initiated by `from`.
    async fn handle_gossip(
        &self,
        from: &str,
        delta: GossipSnapshot,
    ) -> Result<GossipSnapshot, TransportError>;

    /// Handles an ensure-activated request for a locally ownable identity.
    async fn handle_ensure_activated(
        &self,
        identity: &ClusterIdentity,
    ) -> Result<ActivatedPid, TransportError>;

    /// Handles a request addressed to a locally hosted activation.
    async fn handle_request(
        &self,
        target: &ActivatedPid,
        envelope: Envelope,
    ) -> Result<Vec<u8>, TransportError>;
}
