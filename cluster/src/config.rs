// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Cluster configuration
//!
//! The `config` module provides the `ClusterConfig` type with every
//! recognized option and its default. Options are set through `with_*`
//! methods and validated once, when the cluster instance is created.
//!

use crate::{
    Error,
    activation::ClusterKind,
    retry::{ExponentialBackoffStrategy, RetryStrategyFactory},
    strategy::{MemberStrategyBuilder, SimpleMemberStrategy},
};

use std::{sync::Arc, time::Duration};

/// How the process participates in the cluster.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StartMode {
    /// Hosts activations for its registered kinds.
    Member,
    /// Gossips and routes but hosts nothing.
    Client,
}

/// Configuration of one cluster instance.
#[derive(Clone)]
pub struct ClusterConfig {
    cluster_name: String,
    gossip_interval: Duration,
    gossip_fanout: usize,
    gossip_request_timeout: Duration,
    actor_request_timeout: Duration,
    request_log_throttle_period: Duration,
    max_events_in_request_log_throttle_period: usize,
    request_deduplication: bool,
    request_deduplication_window: Duration,
    pub_sub_batch_size: usize,
    unreachable_timeout: Option<Duration>,
    member_strategy_builder: MemberStrategyBuilder,
    join_retry_factory: RetryStrategyFactory,
    kinds: Vec<ClusterKind>,
    start_mode: StartMode,
}

impl ClusterConfig {
    /// Creates a configuration with the given cluster name and the default
    /// for every other option.
    pub fn new(cluster_name: &str) -> Self {
        Self {
            cluster_name: cluster_name.to_owned(),
            gossip_interval: Duration::from_millis(300),
            gossip_fanout: 3,
            gossip_request_timeout: Duration::from_millis(500),
            actor_request_timeout: Duration::from_secs(5),
            request_log_throttle_period: Duration::from_secs(2),
            max_events_in_request_log_throttle_period: 3,
            request_deduplication: true,
            request_deduplication_window: Duration::from_secs(30),
            pub_sub_batch_size: 2000,
            unreachable_timeout: None,
            member_strategy_builder: Arc::new(|_kind| {
                Arc::new(SimpleMemberStrategy)
            }),
            join_retry_factory: Arc::new(|| {
                Box::new(ExponentialBackoffStrategy::new(8))
            }),
            kinds: Vec::new(),
            start_mode: StartMode::Member,
        }
    }

    /// Checks the configuration for values that cannot work.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` describing the first offending option.
    pub fn validate(&self) -> Result<(), Error> {
        if self.cluster_name.is_empty() {
            return Err(Error::Config("cluster name is required".to_owned()));
        }
        if self.gossip_fanout == 0 {
            return Err(Error::Config(
                "gossip fanout must be at least 1".to_owned(),
            ));
        }
        if self.gossip_interval.is_zero() {
            return Err(Error::Config(
                "gossip interval must be positive".to_owned(),
            ));
        }
        Ok(())
    }

    /// Cluster name.
    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    /// Pause between gossip rounds. Default 300 ms.
    pub fn gossip_interval(&self) -> Duration {
        self.gossip_interval
    }

    /// Peers contacted per round. Default 3.
    pub fn gossip_fanout(&self) -> usize {
        self.gossip_fanout
    }

    /// Per-peer exchange timeout, independent of the round interval.
    /// Default 500 ms.
    pub fn gossip_request_timeout(&self) -> Duration {
        self.gossip_request_timeout
    }

    /// Budget for one activation or delivery attempt. Default 5 s.
    pub fn actor_request_timeout(&self) -> Duration {
        self.actor_request_timeout
    }

    /// Window of the failed-request log throttle. Default 2 s.
    pub fn request_log_throttle_period(&self) -> Duration {
        self.request_log_throttle_period
    }

    /// Failed requests logged per throttle window. Default 3.
    pub fn max_events_in_request_log_throttle_period(&self) -> usize {
        self.max_events_in_request_log_throttle_period
    }

    /// Whether identical requests inside the window collapse. Default true.
    pub fn request_deduplication(&self) -> bool {
        self.request_deduplication
    }

    /// Size of the request deduplication window. Default 30 s.
    pub fn request_deduplication_window(&self) -> Duration {
        self.request_deduplication_window
    }

    /// Batch size used by pub-sub delivery. Default 2000.
    pub fn pub_sub_batch_size(&self) -> usize {
        self.pub_sub_batch_size
    }

    /// Idle time after which a member is considered unreachable.
    /// Defaults to ten gossip intervals.
    pub fn unreachable_timeout(&self) -> Duration {
        self.unreachable_timeout
            .unwrap_or_else(|| self.gossip_interval * 10)
    }

    /// Default strategy builder for kinds without an override.
    pub fn member_strategy_builder(&self) -> MemberStrategyBuilder {
        self.member_strategy_builder.clone()
    }

    /// Retry policy factory for the join loop.
    pub fn join_retry_factory(&self) -> RetryStrategyFactory {
        self.join_retry_factory.clone()
    }

    /// Registered kinds.
    pub fn kinds(&self) -> &[ClusterKind] {
        &self.kinds
    }

    /// Member or client participation.
    pub fn start_mode(&self) -> StartMode {
        self.start_mode
    }

    /// Sets the gossip round interval.
    pub fn with_gossip_interval(mut self, interval: Duration) -> Self {
        self.gossip_interval = interval;
        self
    }

    /// Sets the number of peers contacted per round.
    pub fn with_gossip_fanout(mut self, fanout: usize) -> Self {
        self.gossip_fanout = fanout;
        self
    }

    /// Sets the per-peer exchange timeout.
    pub fn with_gossip_request_timeout(mut self, timeout: Duration) -> Self {
        self.gossip_request_timeout = timeout;
        self
    }

    /// Sets the budget for one activation or delivery attempt.
    pub fn with_actor_request_timeout(mut self, timeout: Duration) -> Self {
        self.actor_request_timeout = timeout;
        self
    }

    /// Sets the failed-request log throttle window.
    pub fn with_request_log_throttle_period(mut self, period: Duration) -> Self {
        self.request_log_throttle_period = period;
        self
    }

    /// Sets how many failed requests are logged per throttle window.
    pub fn with_max_events_in_request_log_throttle_period(
        mut self,
        max: usize,
    ) -> Self {
        self.max_events_in_request_log_throttle_period = max;
        self
    }

    /// Enables or disables request deduplication.
    pub fn with_request_deduplication(mut self, enabled: bool) -> Self {
        self.request_deduplication = enabled;
        self
    }

    /// Sets the request deduplication window.
    pub fn with_request_deduplication_window(
        mut self,
        window: Duration,
    ) -> Self {
        self.request_deduplication_window = window;
        self
    }

    /// Sets the pub-sub batch size.
    pub fn with_pub_sub_batch_size(mut self, batch_size: usize) -> Self {
        self.pub_sub_batch_size = batch_size;
        self
    }

    /// Overrides the unreachability timeout.
    pub fn with_unreachable_timeout(mut self, timeout: Duration) -> Self {
        self.unreachable_timeout = Some(timeout);
        self
    }

    /// Sets the default member strategy builder.
    pub fn with_member_strategy_builder(
        mut self,
        builder: MemberStrategyBuilder,
    ) -> Self {
        self.member_strategy_builder = builder;
        self
    }

    /// Sets the join retry policy factory.
    pub fn with_join_retry_factory(
        mut self,
        factory: RetryStrategyFactory,
    ) -> Self {
        self.join_retry_factory = factory;
        self
    }

    /// Registers a kind this process can host.
    pub fn with_kind(mut self, kind: ClusterKind) -> Self {
        self.kinds.push(kind);
        self
    }

    /// Starts the process as a hosting member.
    pub fn with_start_as_member(mut self) -> Self {
        self.start_mode = StartMode::Member;
        self
    }

    /// Starts the process as a non-hosting client.
    pub fn with_start_as_client(mut self) -> Self {
        self.start_mode = StartMode::Client;
        self
    }
}
