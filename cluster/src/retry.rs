// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Retry strategies
//!
//! Backoff policies for cluster operations that are worth repeating, such as
//! the initial join exchange against the seed peers. A strategy bounds the
//! number of attempts and yields the wait before each retry.
//!

use std::{
    fmt::Debug,
    sync::{Arc, Mutex},
    time::Duration,
};

use backoff::backoff::Backoff as InnerBackoff;

/// Trait to define a retry strategy. Implement it to plug a custom policy
/// into the join loop.
pub trait RetryStrategy: Debug + Send + Sync {
    /// Maximum number of attempts before giving up.
    fn max_retries(&self) -> usize;
    /// Wait duration before the next attempt. `None` retries immediately.
    fn next_backoff(&mut self) -> Option<Duration>;
}

/// Factory producing a fresh strategy per use, so state such as exponential
/// growth starts over for every join.
pub type RetryStrategyFactory =
    Arc<dyn Fn() -> Box<dyn RetryStrategy> + Send + Sync>;

/// Retries immediately, without waiting.
#[derive(Debug, Default)]
pub struct NoIntervalStrategy {
    max_retries: usize,
}

impl NoIntervalStrategy {
    pub fn new(max_retries: usize) -> Self {
        NoIntervalStrategy { max_retries }
    }
}

impl RetryStrategy for NoIntervalStrategy {
    fn max_retries(&self) -> usize {
        self.max_retries
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        None
    }
}

/// Retries with a fixed wait period between attempts.
#[derive(Debug, Default)]
pub struct FixedIntervalStrategy {
    /// Maximum number of attempts before giving up.
    max_retries: usize,
    /// Wait duration before retrying.
    duration: Duration,
}

impl FixedIntervalStrategy {
    pub fn new(max_retries: usize, duration: Duration) -> Self {
        FixedIntervalStrategy {
            max_retries,
            duration,
        }
    }
}

impl RetryStrategy for FixedIntervalStrategy {
    fn max_retries(&self) -> usize {
        self.max_retries
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        Some(self.duration)
    }
}

/// Retries with an exponential backoff wait period between attempts.
#[derive(Debug, Default)]
pub struct ExponentialBackoffStrategy {
    /// Maximum number of attempts before giving up.
    max_retries: usize,
    /// Inner exponential backoff state.
    inner: Arc<Mutex<backoff::ExponentialBackoff>>,
}

impl ExponentialBackoffStrategy {
    pub fn new(max_retries: usize) -> Self {
        ExponentialBackoffStrategy {
            max_retries,
            inner: Arc::new(Mutex::new(backoff::ExponentialBackoff::default())),
        }
    }
}

impl RetryStrategy for ExponentialBackoffStrategy {
    fn max_retries(&self) -> usize {
        self.max_retries
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        self.inner.lock().ok().and_then(|mut eb| eb.next_backoff())
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn test_no_interval_strategy() {
        let mut strategy = NoIntervalStrategy::new(3);
        assert_eq!(strategy.max_retries(), 3);
        assert_eq!(strategy.next_backoff(), None);
    }

    #[test]
    fn test_fixed_interval_strategy() {
        let mut strategy =
            FixedIntervalStrategy::new(3, Duration::from_secs(1));
        assert_eq!(strategy.max_retries(), 3);
        assert_eq!(strategy.next_backoff(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_exponential_backoff_strategy() {
        let mut strategy = ExponentialBackoffStrategy::new(3);
        assert_eq!(strategy.max_retries(), 3);
        assert!(strategy.next_backoff().is_some());
    }
}
