// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Cluster identity
//!
//! The `identity` module provides the `ClusterIdentity` type, the stable
//! logical name of a virtual actor. An identity is a (kind, id) pair that is
//! independent of whichever member currently hosts the instance.
//!

use crate::Error;

use serde::{Deserialize, Serialize};

use std::fmt;

/// Logical identity of a virtual actor.
///
/// Identities are immutable once created and globally unique per logical
/// actor. Two members holding the same membership view will route a given
/// identity to the same owner.
#[derive(
    Clone, Debug, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ClusterIdentity {
    kind: String,
    id: String,
}

impl ClusterIdentity {
    /// Creates a new identity from a kind and an id.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidIdentity` if either part is empty.
    pub fn new(kind: &str, id: &str) -> Result<Self, Error> {
        if kind.is_empty() {
            return Err(Error::InvalidIdentity("empty kind".to_owned()));
        }
        if id.is_empty() {
            return Err(Error::InvalidIdentity("empty id".to_owned()));
        }
        Ok(Self {
            kind: kind.to_owned(),
            id: id.to_owned(),
        })
    }

    /// The actor kind this identity belongs to.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// The per-kind unique id.
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for ClusterIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn test_identity_parts() {
        let identity = ClusterIdentity::new("order", "42").unwrap();
        assert_eq!(identity.kind(), "order");
        assert_eq!(identity.id(), "42");
        assert_eq!(identity.to_string(), "order/42");
    }

    #[test]
    fn test_identity_rejects_empty_parts() {
        assert!(ClusterIdentity::new("", "42").is_err());
        assert!(ClusterIdentity::new("order", "").is_err());
    }

    #[test]
    fn test_identity_equality_is_structural() {
        let a = ClusterIdentity::new("order", "42").unwrap();
        let b = ClusterIdentity::new("order", "42").unwrap();
        let c = ClusterIdentity::new("order", "43").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
