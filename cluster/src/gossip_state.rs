// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Gossip state
//!
//! The `gossip_state` module provides the per-member key/value table that
//! gossip disseminates. Every (member, key) pair carries a monotonically
//! increasing sequence number; merging applies a last-sequence-wins rule per
//! key, which makes the merge associative, commutative and idempotent, so
//! the order in which exchanges arrive cannot affect convergence.
//!

use serde::{Deserialize, Serialize};

use std::{
    collections::BTreeMap,
    time::{SystemTime, UNIX_EPOCH},
};

/// Key under which each member publishes its heartbeat counter.
pub const HEARTBEAT_KEY: &str = "cluster:heartbeat";

/// Key under which each member publishes its [`MemberRecord`].
///
/// [`MemberRecord`]: crate::member::MemberRecord
pub const MEMBER_KEY: &str = "cluster:member";

/// A value with its per-(member, key) sequence number and wall-clock stamp.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct VersionedValue {
    /// Opaque payload. Well-known keys use bincode-encoded records.
    pub value: Vec<u8>,
    /// Monotonic per-(member, key) sequence. The merge tie-breaker.
    pub sequence: u64,
    /// Milliseconds since the epoch at the originating member. Informational
    /// only; never used to decide a merge.
    pub timestamp_ms: u64,
}

/// Wire-format snapshot of gossip entries, full or delta.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct GossipSnapshot {
    /// member address -> key -> versioned value.
    pub entries: BTreeMap<String, BTreeMap<String, VersionedValue>>,
}

impl GossipSnapshot {
    /// True when the snapshot carries no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.values().all(|keys| keys.is_empty())
    }
}

/// A (member, key) pair whose value actually changed during a merge.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KeyChange {
    /// Member the key belongs to.
    pub member: String,
    /// The key that changed.
    pub key: String,
}

/// Local gossip store: the authoritative row for this member plus the
/// best-known rows for every other member, and per-peer watermarks so
/// repeated exchanges with the same peer only carry what is new to it.
#[derive(Debug)]
pub struct GossipState {
    local_address: String,
    entries: BTreeMap<String, BTreeMap<String, VersionedValue>>,
    watermarks: BTreeMap<String, BTreeMap<String, BTreeMap<String, u64>>>,
}

impl GossipState {
    /// Creates an empty store owned by the given member address.
    pub fn new(local_address: &str) -> Self {
        Self {
            local_address: local_address.to_owned(),
            entries: BTreeMap::new(),
            watermarks: BTreeMap::new(),
        }
    }

    /// The member this store is authoritative for.
    pub fn local_address(&self) -> &str {
        &self.local_address
    }

    /// Sets a key on the local member's row, bumping its sequence number.
    ///
    /// Returns the new sequence number.
    pub fn set_key(&mut self, key: &str, value: Vec<u8>) -> u64 {
        let row = self.entries.entry(self.local_address.clone()).or_default();
        let sequence = row.get(key).map(|v| v.sequence).unwrap_or(0) + 1;
        row.insert(
            key.to_owned(),
            VersionedValue {
                value,
                sequence,
                timestamp_ms: now_ms(),
            },
        );
        sequence
    }

    /// Reads a key from any member's row.
    pub fn get(&self, member: &str, key: &str) -> Option<&VersionedValue> {
        self.entries.get(member).and_then(|row| row.get(key))
    }

    /// Member addresses with at least one known key, local member included.
    pub fn members(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Merges a remote snapshot, key by key, last sequence wins.
    ///
    /// Incoming updates with a sequence number at or below the locally held
    /// one are discarded. The local member's own row is never overwritten:
    /// this store is the only writer for it, and a stale copy of it echoed
    /// back by a peer must not regress local sequences.
    ///
    /// Returns only the keys that actually changed, so callers can suppress
    /// redundant downstream events.
    pub fn merge(&mut self, remote: &GossipSnapshot) -> Vec<KeyChange> {
        let mut changes = Vec::new();
        for (member, keys) in &remote.entries {
            if member == &self.local_address {
                continue;
            }
            let row = self.entries.entry(member.clone()).or_default();
            for (key, incoming) in keys {
                let known = row.get(key).map(|v| v.sequence).unwrap_or(0);
                if incoming.sequence <= known {
                    continue;
                }
                row.insert(key.clone(), incoming.clone());
                changes.push(KeyChange {
                    member: member.clone(),
                    key: key.clone(),
                });
            }
        }
        changes
    }

    /// Full copy of every known row.
    pub fn snapshot(&self) -> GossipSnapshot {
        GossipSnapshot {
            entries: self.entries.clone(),
        }
    }

    /// Entries the given peer has not acknowledged yet.
    pub fn delta_for(&self, peer: &str) -> GossipSnapshot {
        let acked = self.watermarks.get(peer);
        let mut entries: BTreeMap<String, BTreeMap<String, VersionedValue>> =
            BTreeMap::new();
        for (member, keys) in &self.entries {
            for (key, value) in keys {
                let seen = acked
                    .and_then(|members| members.get(member))
                    .and_then(|row| row.get(key))
                    .copied()
                    .unwrap_or(0);
                if value.sequence > seen {
                    entries
                        .entry(member.clone())
                        .or_default()
                        .insert(key.clone(), value.clone());
                }
            }
        }
        GossipSnapshot { entries }
    }

    /// Records that the peer received the given delta.
    ///
    /// Only called after a successful exchange: a failed peer keeps its old
    /// watermark and receives the withheld entries on the next round.
    pub fn commit_delta(&mut self, peer: &str, delta: &GossipSnapshot) {
        let acked = self.watermarks.entry(peer.to_owned()).or_default();
        for (member, keys) in &delta.entries {
            let row = acked.entry(member.clone()).or_default();
            for (key, value) in keys {
                let seen = row.entry(key.clone()).or_insert(0);
                if value.sequence > *seen {
                    *seen = value.sequence;
                }
            }
        }
    }

    /// Drops every trace of a member that left the cluster.
    ///
    /// A member that later restarts begins a fresh row; its new heartbeat
    /// sequences win merges, so no tombstones are needed.
    pub fn drop_member(&mut self, member: &str) {
        self.entries.remove(member);
        self.watermarks.remove(member);
        for members in self.watermarks.values_mut() {
            members.remove(member);
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
