

//! Core library for the Hive framework.
//! Provides the building blocks for virtual-actor clustering: gossip-based
//! membership, deterministic identity placement, activation caching and
//! request routing. It is designed to be modular, so transports and member
//! strategies can be swapped without touching the core.

pub use cluster::{
    ActivatedPid, ActivationHost, Cluster, ClusterConfig, ClusterContext,
    ClusterIdentity, ClusterKind, ClusterTransport, Envelope,
    Error as ClusterError, ExponentialBackoffStrategy, FixedIntervalStrategy,
    GossipEngine, GossipSnapshot, IdentityLookup, InProcessNetwork,
    InboundEndpoint, KindRegistry, Member, MemberStatus, MemberStrategy,
    MembershipView, NoIntervalStrategy, PidCache, PlacementRecord,
    RendezvousMemberStrategy, RequestHandler, RetryStrategy,
    SimpleMemberStrategy, StartMode, TopologyEvent, TransportError,
};
