// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Errors module
//!

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for the cluster runtime.
///
/// Callers can split the taxonomy with [`Error::is_retryable`]: `Unreachable`,
/// `Timeout` and `Stale` mean "try again later", while `NotAvailable`,
/// `Refused` and the configuration errors will not succeed without an
/// operator change.
#[derive(Clone, Debug, Error, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// The target member did not respond at the transport level.
    #[error("Member {0} is unreachable.")]
    Unreachable(String),
    /// A deadline elapsed at a suspension point.
    #[error("Deadline exceeded.")]
    Timeout,
    /// No alive member advertises the requested kind.
    #[error("No member available for kind {0}.")]
    NotAvailable(String),
    /// The owning member rejected the activation.
    #[error("Activation refused: {0}")]
    Refused(String),
    /// A cached address was proven wrong by a delivery attempt.
    #[error("Cached address for {0} is stale.")]
    Stale(String),
    /// An identity part was empty or malformed.
    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),
    /// The configuration failed validation.
    #[error("Invalid configuration: {0}")]
    Config(String),
    /// The cluster instance is stopping and no longer serves requests.
    #[error("Cluster is shutting down.")]
    ShuttingDown,
    /// A payload could not be encoded or decoded.
    #[error("Codec error: {0}")]
    Codec(String),
}

impl Error {
    /// True for failures that a caller may reasonably retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Unreachable(_) | Error::Timeout | Error::Stale(_)
        )
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn test_retryable_split() {
        assert!(Error::Unreachable("m1:0".to_owned()).is_retryable());
        assert!(Error::Timeout.is_retryable());
        assert!(Error::Stale("order/42".to_owned()).is_retryable());
        assert!(!Error::NotAvailable("order".to_owned()).is_retryable());
        assert!(!Error::Refused("capacity".to_owned()).is_retryable());
        assert!(!Error::Config("no name".to_owned()).is_retryable());
    }
}
