// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Hive Cluster
//!
//! A virtual-actor cluster runtime: a process joins a cluster, advertises
//! the actor kinds it can host, and the runtime locates or activates the
//! instance behind a stable logical identity (kind + id) anywhere in the
//! cluster, routing requests to it regardless of which member hosts it.
//!
//! ## Architecture
//!
//! Two subsystems carry the weight:
//!
//! - **Membership gossip**: every member keeps a per-member key/value table
//!   with monotonic per-key sequence numbers. On a fixed interval it
//!   exchanges deltas with a random fanout of peers and merges what comes
//!   back under a last-sequence-wins rule. The merge is commutative,
//!   associative and idempotent, so the cluster converges regardless of
//!   exchange order, in roughly `O(log N)` rounds. The converged
//!   [`MembershipView`] is rebuilt atomically per round and published
//!   through a cheap read handle.
//!
//! - **Identity placement**: a [`MemberStrategy`] deterministically selects
//!   the owner for an identity from the current view. The first request for
//!   an unresolved identity triggers an idempotent ensure-activated call to
//!   the owner; concurrent resolvers coalesce on a single in-flight attempt
//!   and all observe the same outcome. Resolved addresses live in a
//!   process-local pid cache that topology changes and failed deliveries
//!   invalidate.
//!
//! There is no coordinator and no consensus: the design tolerates a short
//! window where two members believe they own the same identity and relies
//! on the owner's locally idempotent activation to converge.
//!
//! ## Getting started
//!
//! ```ignore
//! use cluster::{
//!     Cluster, ClusterConfig, ClusterIdentity, ClusterKind,
//!     InProcessNetwork,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), cluster::Error> {
//!     let network = InProcessNetwork::new();
//!     let config = ClusterConfig::new("orders")
//!         .with_kind(ClusterKind::new("order", Arc::new(OrderHandler)));
//!
//!     let member = Cluster::new(
//!         config,
//!         "127.0.0.1:4020",
//!         network.transport_for("127.0.0.1:4020"),
//!     )?;
//!     network.register("127.0.0.1:4020", Arc::new(member.clone()));
//!     member.start(&[]).await?;
//!
//!     let identity = ClusterIdentity::new("order", "42")?;
//!     let reply = member
//!         .context()
//!         .request(&identity, b"total?".to_vec(), 1)
//!         .await?;
//!
//!     member.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! Production deployments implement [`ClusterTransport`] and
//! [`InboundEndpoint`] over their remoting layer; [`InProcessNetwork`] wires
//! several instances inside one process and is what the integration tests
//! and local tooling build on.
//!

mod activation;
mod cluster;
mod config;
mod context;
mod error;
mod gossip;
mod gossip_state;
mod identity;
mod local;
mod lookup;
mod member;
mod pid_cache;
mod retry;
mod strategy;
mod transport;

/// Physical address of one live activation, including its generation.
pub use activation::ActivatedPid;

/// Boundary to the member-local activation machinery.
pub use activation::ActivationHost;

/// A kind registration: name, request handler, optional strategy override.
pub use activation::ClusterKind;

/// Per-member registry of hosted kinds and live activations.
pub use activation::KindRegistry;

/// Application hook handling requests delivered to an activation.
pub use activation::RequestHandler;

/// One cluster participation with start/stop lifecycle.
pub use cluster::Cluster;

/// Configuration of a cluster instance and its recognized options.
pub use config::ClusterConfig;

/// Member or client participation.
pub use config::StartMode;

/// Request-routing façade with deduplication and migration handling.
pub use context::ClusterContext;

/// Error taxonomy of the cluster runtime.
pub use error::Error;

/// Gossip engine driving membership convergence.
pub use gossip::GossipEngine;

/// Topology change notification.
pub use gossip::TopologyEvent;

/// Wire-format snapshot of gossip entries.
pub use gossip_state::GossipSnapshot;

/// Per-member sequenced key/value store exchanged through gossip.
pub use gossip_state::GossipState;

/// A (member, key) pair that changed during a merge.
pub use gossip_state::KeyChange;

/// A gossiped value with its sequence number and timestamp.
pub use gossip_state::VersionedValue;

/// Logical identity of a virtual actor.
pub use identity::ClusterIdentity;

/// In-process network wiring several clusters together, partitionable.
pub use local::InProcessNetwork;

/// Identity resolution with pending-request coalescing.
pub use lookup::IdentityLookup;

/// Last known placement of an identity.
pub use lookup::PlacementRecord;

/// Immutable snapshot of one cluster member.
pub use member::Member;

/// Self-description a member publishes through gossip.
pub use member::MemberRecord;

/// Member lifecycle status.
pub use member::MemberStatus;

/// Read handle over the latest membership view.
pub use member::MembershipHandle;

/// Converged membership mapping as seen locally.
pub use member::MembershipView;

/// Identity to activation-address cache.
pub use pid_cache::PidCache;

/// Exponential backoff retry strategy.
pub use retry::ExponentialBackoffStrategy;

/// Fixed interval retry strategy.
pub use retry::FixedIntervalStrategy;

/// Immediate retry strategy.
pub use retry::NoIntervalStrategy;

/// Trait for pluggable retry policies.
pub use retry::RetryStrategy;

/// Factory producing fresh retry strategies.
pub use retry::RetryStrategyFactory;

/// Trait deciding which member owns an identity.
pub use strategy::MemberStrategy;

/// Builder invoked once per registered kind.
pub use strategy::MemberStrategyBuilder;

/// Rendezvous (highest-random-weight) owner selection.
pub use strategy::RendezvousMemberStrategy;

/// Hash-modulo owner selection.
pub use strategy::SimpleMemberStrategy;

/// Outbound member-to-member contract.
pub use transport::ClusterTransport;

/// Request envelope delivered to a virtual actor.
pub use transport::Envelope;

/// Inbound half of the transport boundary.
pub use transport::InboundEndpoint;

/// Transport-level failure kinds.
pub use transport::TransportError;
