// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Cluster context
//!
//! The `context` module provides the request-routing façade. A request names
//! a logical identity; the context resolves it through the identity lookup,
//! delivers the payload through the transport, and absorbs one ownership
//! migration per request: if delivery proves the cached address wrong, the
//! entry is evicted and resolution retried exactly once before the failure
//! surfaces. Client-side retries carrying the same correlation id inside the
//! deduplication window collapse into a single delivery.
//!

use crate::{
    Error,
    activation::{ActivatedPid, KindRegistry},
    identity::ClusterIdentity,
    lookup::IdentityLookup,
    transport::{ClusterTransport, Envelope},
};

use tokio::{
    sync::{broadcast, Mutex as AsyncMutex},
    time::Instant,
};

use tracing::warn;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant as StdInstant},
};

type DeliveryOutcome = Result<Vec<u8>, Error>;

/// Routes requests to virtual actors anywhere in the cluster.
#[derive(Clone)]
pub struct ClusterContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    local_address: String,
    lookup: IdentityLookup,
    transport: Arc<dyn ClusterTransport>,
    host: Arc<KindRegistry>,
    actor_request_timeout: Duration,
    dedup: Option<Deduplicator>,
    throttle: RequestLogThrottle,
}

impl ClusterContext {
    /// Creates a context over the given lookup and transport.
    pub fn new(
        local_address: &str,
        lookup: IdentityLookup,
        transport: Arc<dyn ClusterTransport>,
        host: Arc<KindRegistry>,
        actor_request_timeout: Duration,
        dedup_window: Option<Duration>,
        throttle_period: Duration,
        throttle_max_events: usize,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                local_address: local_address.to_owned(),
                lookup,
                transport,
                host,
                actor_request_timeout,
                dedup: dedup_window.map(Deduplicator::new),
                throttle: RequestLogThrottle::new(
                    throttle_period,
                    throttle_max_events,
                ),
            }),
        }
    }

    /// Sends a request with the default actor request timeout as deadline.
    ///
    /// # Errors
    ///
    /// Returns one of the failure kinds described in [`Error`].
    pub async fn request(
        &self,
        identity: &ClusterIdentity,
        payload: Vec<u8>,
        correlation_id: u64,
    ) -> DeliveryOutcome {
        let deadline = Instant::now() + self.inner.actor_request_timeout;
        self.request_with_deadline(identity, payload, correlation_id, deadline)
            .await
    }

    /// Sends a request that must complete before the given deadline.
    ///
    /// # Errors
    ///
    /// Returns `Error::Timeout` when the deadline elapses at any suspension
    /// point, or the terminal failure kind of the delivery.
    pub async fn request_with_deadline(
        &self,
        identity: &ClusterIdentity,
        payload: Vec<u8>,
        correlation_id: u64,
        deadline: Instant,
    ) -> DeliveryOutcome {
        let Some(dedup) = &self.inner.dedup else {
            return self
                .deliver(identity, payload, correlation_id, deadline)
                .await;
        };

        match dedup.begin(identity, correlation_id).await {
            DedupRole::Replay(outcome) => outcome,
            DedupRole::Join(mut waiter) => {
                match tokio::time::timeout_at(deadline, waiter.recv()).await {
                    Ok(Ok(outcome)) => outcome,
                    Ok(Err(_)) => Err(Error::Timeout),
                    Err(_) => Err(Error::Timeout),
                }
            }
            DedupRole::Deliver => {
                let outcome = self
                    .deliver(identity, payload, correlation_id, deadline)
                    .await;
                dedup
                    .complete(identity, correlation_id, outcome.clone())
                    .await;
                outcome
            }
        }
    }

    async fn deliver(
        &self,
        identity: &ClusterIdentity,
        payload: Vec<u8>,
        correlation_id: u64,
        deadline: Instant,
    ) -> DeliveryOutcome {
        let pid = self.inner.lookup.resolve(identity, deadline).await?;
        match self
            .send_to(&pid, identity, payload.clone(), correlation_id, deadline)
            .await
        {
            Ok(response) => Ok(response),
            Err(error)
                if matches!(
                    error,
                    Error::Stale(_) | Error::Unreachable(_)
                ) =>
            {
                // The cached owner no longer hosts the identity, or stopped
                // answering. Evict and re-resolve exactly once; a migrated
                // identity lands on its new owner transparently.
                self.inner.lookup.evict(identity);
                if self.inner.throttle.allow() {
                    warn!(
                        "Delivery of {} to {} failed ({}); re-resolving.",
                        identity, pid.address, error
                    );
                }
                let pid = self.inner.lookup.resolve(identity, deadline).await?;
                self.send_to(&pid, identity, payload, correlation_id, deadline)
                    .await
            }
            Err(error) => {
                if self.inner.throttle.allow() {
                    warn!("Request to {} failed: {}", identity, error);
                }
                Err(error)
            }
        }
    }

    async fn send_to(
        &self,
        pid: &ActivatedPid,
        identity: &ClusterIdentity,
        payload: Vec<u8>,
        correlation_id: u64,
        deadline: Instant,
    ) -> DeliveryOutcome {
        if pid.address == self.inner.local_address {
            return match tokio::time::timeout_at(
                deadline,
                self.inner.host.dispatch(pid, identity, &payload),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout),
            };
        }
        let envelope = Envelope {
            identity: identity.clone(),
            correlation_id,
            payload,
        };
        match tokio::time::timeout_at(
            deadline,
            self.inner.transport.send_request(pid, envelope),
        )
        .await
        {
            Ok(result) => result.map_err(Error::from),
            Err(_) => Err(Error::Timeout),
        }
    }
}

enum DedupRole {
    /// First observation of this (identity, correlation id): deliver it.
    Deliver,
    /// The original delivery is still in flight: await its outcome.
    Join(broadcast::Receiver<DeliveryOutcome>),
    /// The original delivery completed inside the window: reuse its outcome.
    Replay(DeliveryOutcome),
}

enum DedupSlot {
    InFlight(broadcast::Sender<DeliveryOutcome>),
    Done {
        at: StdInstant,
        outcome: DeliveryOutcome,
    },
}

/// Collapses retries of the same logical request inside a time window.
struct Deduplicator {
    window: Duration,
    slots: AsyncMutex<HashMap<(ClusterIdentity, u64), DedupSlot>>,
}

impl Deduplicator {
    fn new(window: Duration) -> Self {
        Self {
            window,
            slots: AsyncMutex::new(HashMap::new()),
        }
    }

    async fn begin(
        &self,
        identity: &ClusterIdentity,
        correlation_id: u64,
    ) -> DedupRole {
        let mut slots = self.slots.lock().await;
        // Lazy pruning keeps the table bounded without a sweeper task.
        slots.retain(|_, slot| match slot {
            DedupSlot::InFlight(_) => true,
            DedupSlot::Done { at, .. } => at.elapsed() <= self.window,
        });

        let key = (identity.clone(), correlation_id);
        match slots.get(&key) {
            Some(DedupSlot::InFlight(sender)) => {
                DedupRole::Join(sender.subscribe())
            }
            Some(DedupSlot::Done { outcome, .. }) => {
                DedupRole::Replay(outcome.clone())
            }
            None => {
                let (sender, _) = broadcast::channel(1);
                slots.insert(key, DedupSlot::InFlight(sender));
                DedupRole::Deliver
            }
        }
    }

    async fn complete(
        &self,
        identity: &ClusterIdentity,
        correlation_id: u64,
        outcome: DeliveryOutcome,
    ) {
        let mut slots = self.slots.lock().await;
        let key = (identity.clone(), correlation_id);
        let previous = slots.insert(
            key,
            DedupSlot::Done {
                at: StdInstant::now(),
                outcome: outcome.clone(),
            },
        );
        drop(slots);
        if let Some(DedupSlot::InFlight(sender)) = previous {
            let _ = sender.send(outcome);
        }
    }
}

/// Limits failed-request log noise to a bounded number of events per period.
struct RequestLogThrottle {
    period: Duration,
    max_events: usize,
    state: Mutex<ThrottleState>,
}

struct ThrottleState {
    window_start: StdInstant,
    events: usize,
    suppressed: usize,
}

impl RequestLogThrottle {
    fn new(period: Duration, max_events: usize) -> Self {
        Self {
            period,
            max_events,
            state: Mutex::new(ThrottleState {
                window_start: StdInstant::now(),
                events: 0,
                suppressed: 0,
            }),
        }
    }

    /// True when the caller may emit a log event in the current window.
    fn allow(&self) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return true;
        };
        if state.window_start.elapsed() > self.period {
            if state.suppressed > 0 {
                warn!(
                    "Suppressed {} failed-request log events in the last \
                     throttle period.",
                    state.suppressed
                );
            }
            state.window_start = StdInstant::now();
            state.events = 0;
            state.suppressed = 0;
        }
        if state.events < self.max_events {
            state.events += 1;
            true
        } else {
            state.suppressed += 1;
            false
        }
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn test_throttle_caps_events_per_period() {
        let throttle =
            RequestLogThrottle::new(Duration::from_secs(60), 3);
        assert!(throttle.allow());
        assert!(throttle.allow());
        assert!(throttle.allow());
        assert!(!throttle.allow());
        assert!(!throttle.allow());
    }

    #[test]
    fn test_throttle_resets_after_period() {
        let throttle =
            RequestLogThrottle::new(Duration::from_millis(10), 1);
        assert!(throttle.allow());
        assert!(!throttle.allow());
        std::thread::sleep(Duration::from_millis(20));
        assert!(throttle.allow());
    }

    #[tokio::test]
    async fn test_dedup_replays_completed_outcome() {
        let dedup = Deduplicator::new(Duration::from_secs(30));
        let identity = ClusterIdentity::new("order", "42").unwrap();

        assert!(matches!(
            dedup.begin(&identity, 7).await,
            DedupRole::Deliver
        ));
        dedup.complete(&identity, 7, Ok(b"done".to_vec())).await;

        match dedup.begin(&identity, 7).await {
            DedupRole::Replay(outcome) => {
                assert_eq!(outcome.unwrap(), b"done".to_vec());
            }
            _ => panic!("expected a replay"),
        }

        // A different correlation id is a different logical request.
        assert!(matches!(
            dedup.begin(&identity, 8).await,
            DedupRole::Deliver
        ));
    }

    #[tokio::test]
    async fn test_dedup_expires_after_window() {
        let dedup = Deduplicator::new(Duration::from_millis(10));
        let identity = ClusterIdentity::new("order", "42").unwrap();

        assert!(matches!(
            dedup.begin(&identity, 7).await,
            DedupRole::Deliver
        ));
        dedup.complete(&identity, 7, Ok(Vec::new())).await;
        tokio::time::sleep(Duration::from_millis(25)).await;

        assert!(matches!(
            dedup.begin(&identity, 7).await,
            DedupRole::Deliver
        ));
    }

    #[tokio::test]
    async fn test_dedup_joins_in_flight_delivery() {
        let dedup = Arc::new(Deduplicator::new(Duration::from_secs(30)));
        let identity = ClusterIdentity::new("order", "42").unwrap();

        assert!(matches!(
            dedup.begin(&identity, 7).await,
            DedupRole::Deliver
        ));
        let DedupRole::Join(mut waiter) = dedup.begin(&identity, 7).await
        else {
            panic!("expected to join the in-flight delivery");
        };

        let publisher = dedup.clone();
        let publisher_identity = identity.clone();
        tokio::spawn(async move {
            publisher
                .complete(&publisher_identity, 7, Ok(b"done".to_vec()))
                .await;
        });

        let outcome = waiter.recv().await.unwrap();
        assert_eq!(outcome.unwrap(), b"done".to_vec());
    }
}
