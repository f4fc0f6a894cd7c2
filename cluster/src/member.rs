// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Cluster members
//!
//! The `member` module provides the member state machine data and the
//! converged `MembershipView`. The view is rebuilt atomically by the gossip
//! engine once per round; every other component only ever reads a published
//! snapshot, never a partially merged one.
//!

use serde::{Deserialize, Serialize};

use std::{
    collections::BTreeMap,
    sync::{Arc, RwLock},
};

/// Lifecycle status of a cluster member as seen locally.
///
/// Transitions: `Joining → Alive → (Leaving | Unreachable) → Left`, where
/// `Unreachable` returns to `Alive` if activity resumes and `Left` is
/// terminal.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize,
)]
pub enum MemberStatus {
    /// Announced itself but no gossip round has completed yet.
    Joining,
    /// Reachable and eligible to host activations.
    Alive,
    /// Announced a graceful shutdown; no longer eligible for placement.
    Leaving,
    /// No gossip activity within the unreachability timeout.
    Unreachable,
    /// Gone for good. Terminal.
    Left,
}

impl MemberStatus {
    /// True when the member may own activations.
    pub fn can_host(&self) -> bool {
        matches!(self, MemberStatus::Alive)
    }

    /// True when the member should be dropped from placement and caches.
    pub fn is_departed(&self) -> bool {
        matches!(self, MemberStatus::Leaving | MemberStatus::Left)
    }
}

/// Immutable snapshot of one cluster member.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Member {
    /// Advertised `host:port` address, the member's cluster-wide key.
    pub address: String,
    /// Actor kinds this member can host.
    pub kinds: Vec<String>,
    /// Status as seen by the local member.
    pub status: MemberStatus,
}

/// Self-description a member publishes through gossip.
///
/// The claim carries graceful transitions (`Alive`, `Leaving`); observed
/// states such as `Unreachable` are always a local judgement and never
/// gossiped.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct MemberRecord {
    /// Kinds advertised by the member.
    pub kinds: Vec<String>,
    /// Status the member claims for itself.
    pub claim: MemberStatus,
}

/// Converged membership mapping as seen by the local member.
///
/// Views are value objects: the gossip engine builds a fresh one per round
/// and publishes it through [`MembershipHandle`], so readers always observe
/// a self-consistent topology.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MembershipView {
    members: BTreeMap<String, Member>,
}

impl MembershipView {
    /// Builds a view from a list of members.
    pub fn new(members: Vec<Member>) -> Self {
        Self {
            members: members
                .into_iter()
                .map(|member| (member.address.clone(), member))
                .collect(),
        }
    }

    /// Looks up a member by address.
    pub fn member(&self, address: &str) -> Option<&Member> {
        self.members.get(address)
    }

    /// True if the address is part of the view.
    pub fn contains(&self, address: &str) -> bool {
        self.members.contains_key(address)
    }

    /// All members, ordered by address.
    pub fn members(&self) -> impl Iterator<Item = &Member> {
        self.members.values()
    }

    /// Members currently eligible to host activations, ordered by address.
    pub fn alive_members(&self) -> Vec<&Member> {
        self.members
            .values()
            .filter(|member| member.status.can_host())
            .collect()
    }

    /// Alive members advertising the given kind, ordered by address.
    ///
    /// The ordering matters: deterministic owner selection relies on every
    /// member enumerating the same candidates in the same order for the
    /// same view.
    pub fn members_with_kind(&self, kind: &str) -> Vec<&Member> {
        self.members
            .values()
            .filter(|member| {
                member.status.can_host()
                    && member.kinds.iter().any(|k| k == kind)
            })
            .collect()
    }

    /// Number of members in the view, any status.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// True when the view holds no members at all.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Order-insensitive digest of addresses and statuses.
    ///
    /// Used to suppress topology events for rounds that merged data without
    /// changing the topology.
    pub fn topology_hash(&self) -> u64 {
        let mut hash = 0xcbf29ce484222325u64;
        for member in self.members.values() {
            for byte in member.address.as_bytes() {
                hash ^= u64::from(*byte);
                hash = hash.wrapping_mul(0x100000001b3);
            }
            hash ^= member.status as u64 + 1;
            hash = hash.wrapping_mul(0x100000001b3);
        }
        hash
    }
}

/// Shared read handle over the latest published [`MembershipView`].
///
/// Cloning the handle is cheap; `current` returns the latest complete
/// snapshot without blocking writers for longer than an `Arc` swap.
#[derive(Clone)]
pub struct MembershipHandle {
    inner: Arc<RwLock<Arc<MembershipView>>>,
}

impl MembershipHandle {
    /// Creates a handle starting from an empty view.
    pub fn empty() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(MembershipView::default()))),
        }
    }

    /// Creates a handle pinned to the given view. Useful for tests and for
    /// components exercised outside a running gossip engine.
    pub fn fixed(view: MembershipView) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(view))),
        }
    }

    /// Returns the latest published snapshot.
    pub fn current(&self) -> Arc<MembershipView> {
        self.inner
            .read()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    /// Publishes a new snapshot atomically.
    pub(crate) fn publish(&self, view: Arc<MembershipView>) {
        if let Ok(mut guard) = self.inner.write() {
            *guard = view;
        }
    }
}

impl Default for MembershipHandle {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    fn member(address: &str, kinds: &[&str], status: MemberStatus) -> Member {
        Member {
            address: address.to_owned(),
            kinds: kinds.iter().map(|k| (*k).to_owned()).collect(),
            status,
        }
    }

    #[test]
    fn test_members_with_kind_filters_status_and_kind() {
        let view = MembershipView::new(vec![
            member("m1:1000", &["order"], MemberStatus::Alive),
            member("m2:1000", &["order", "user"], MemberStatus::Alive),
            member("m3:1000", &["order"], MemberStatus::Unreachable),
            member("m4:1000", &["user"], MemberStatus::Alive),
        ]);

        let owners: Vec<_> = view
            .members_with_kind("order")
            .iter()
            .map(|m| m.address.clone())
            .collect();
        assert_eq!(owners, vec!["m1:1000", "m2:1000"]);
    }

    #[test]
    fn test_candidates_are_ordered_by_address() {
        let view = MembershipView::new(vec![
            member("m9:1000", &["order"], MemberStatus::Alive),
            member("m1:1000", &["order"], MemberStatus::Alive),
        ]);
        let owners: Vec<_> = view
            .members_with_kind("order")
            .iter()
            .map(|m| m.address.clone())
            .collect();
        assert_eq!(owners, vec!["m1:1000", "m9:1000"]);
    }

    #[test]
    fn test_topology_hash_tracks_status_changes() {
        let before = MembershipView::new(vec![member(
            "m1:1000",
            &["order"],
            MemberStatus::Alive,
        )]);
        let after = MembershipView::new(vec![member(
            "m1:1000",
            &["order"],
            MemberStatus::Unreachable,
        )]);
        assert_ne!(before.topology_hash(), after.topology_hash());
    }

    #[test]
    fn test_handle_publishes_atomically() {
        let handle = MembershipHandle::empty();
        assert!(handle.current().is_empty());

        let view = MembershipView::new(vec![member(
            "m1:1000",
            &["order"],
            MemberStatus::Alive,
        )]);
        handle.publish(Arc::new(view.clone()));
        assert_eq!(*handle.current(), view);
    }
}
