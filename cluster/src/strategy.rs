// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Member strategies
//!
//! The `strategy` module provides owner selection for a logical identity.
//! A strategy is a pure function of the identity plus the membership view:
//! two members holding the same view select the same owner, which is what
//! lets placement proceed without a coordinator.
//!
//! Strategies are chosen per kind at registration time through the
//! configuration's strategy builder, so kinds with different affinity needs
//! can mix freely inside one cluster.
//!

use crate::{identity::ClusterIdentity, member::MembershipView};

use std::sync::Arc;

/// Selects the owning member for an identity, given the current view.
pub trait MemberStrategy: Send + Sync {
    /// Returns the address of the owner, or `None` when no alive member
    /// advertises the identity's kind.
    fn select_owner(
        &self,
        identity: &ClusterIdentity,
        view: &MembershipView,
    ) -> Option<String>;
}

/// Builder invoked once per registered kind.
pub type MemberStrategyBuilder =
    Arc<dyn Fn(&str) -> Arc<dyn MemberStrategy> + Send + Sync>;

/// Hash-modulo selection over the ordered candidate list.
///
/// Cheap and uniform, but offers no affinity: any membership change may
/// reshuffle every identity of the kind.
#[derive(Debug, Default)]
pub struct SimpleMemberStrategy;

impl MemberStrategy for SimpleMemberStrategy {
    fn select_owner(
        &self,
        identity: &ClusterIdentity,
        view: &MembershipView,
    ) -> Option<String> {
        let candidates = view.members_with_kind(identity.kind());
        if candidates.is_empty() {
            return None;
        }
        let hash = fnv1a(&[identity.kind().as_bytes(), identity.id().as_bytes()]);
        let index = (hash % candidates.len() as u64) as usize;
        Some(candidates[index].address.clone())
    }
}

/// Rendezvous (highest-random-weight) selection.
///
/// Each candidate is scored against the identity and the highest score wins,
/// so when membership changes only the identities owned by the affected
/// members move.
#[derive(Debug, Default)]
pub struct RendezvousMemberStrategy;

impl RendezvousMemberStrategy {
    fn score(address: &str, identity: &ClusterIdentity) -> u64 {
        fnv1a(&[
            identity.kind().as_bytes(),
            identity.id().as_bytes(),
            address.as_bytes(),
        ])
    }
}

impl MemberStrategy for RendezvousMemberStrategy {
    fn select_owner(
        &self,
        identity: &ClusterIdentity,
        view: &MembershipView,
    ) -> Option<String> {
        view.members_with_kind(identity.kind())
            .into_iter()
            .max_by_key(|member| Self::score(&member.address, identity))
            .map(|member| member.address.clone())
    }
}

/// FNV-1a over the concatenated parts, with an extra mixing shift.
pub(crate) fn fnv1a(parts: &[&[u8]]) -> u64 {
    let mut hash = 0xcbf29ce484222325u64;
    for part in parts {
        for byte in *part {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x100000001b3);
            hash ^= hash >> 32;
        }
    }
    hash
}
