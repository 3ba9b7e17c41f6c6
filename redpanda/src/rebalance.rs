//! Partition ownership across consumer group rebalances.
//!
//! Every assigned partition gets a [`PartitionLease`] shared by its worker and
//! the consumer context. When the group revokes a partition, the context
//! revokes the lease and waits for the worker's in-flight message before
//! librdkafka releases the partition. The worker drops whatever is still
//! queued, so a partition is never processed by two workers at once.
//!
//! The lease also carries the per-partition queue depth. The consumer task
//! pauses a partition whose worker falls `buffer_size` messages behind and the
//! worker resumes it once half the backlog is gone, so one slow partition
//! does not hold up the others.

use rdkafka::client::ClientContext;
use rdkafka::consumer::{ConsumerContext, Rebalance};
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::Notify;

/// Longest a revocation waits for an in-flight message.
pub(crate) const REVOKE_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Topic and partition of an assignment.
pub(crate) type PartitionKey = (String, i32);

#[derive(Debug, Default)]
struct LeaseState {
    revoked: bool,
    in_flight: bool,
    queued: usize,
    paused: bool,
}

/// Ownership of one partition by one worker.
#[derive(Debug, Default)]
pub(crate) struct PartitionLease {
    state: Mutex<LeaseState>,
    idle: Condvar,
    revoked: Notify,
}

impl PartitionLease {
    fn state(&self) -> MutexGuard<'_, LeaseState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark a message as in flight. Returns `false` once the lease is revoked.
    pub(crate) fn begin(&self) -> bool {
        let mut state = self.state();
        if state.revoked {
            return false;
        }
        state.in_flight = true;
        true
    }

    /// The in-flight message reached a terminal state or was abandoned.
    pub(crate) fn finish(&self) {
        self.state().in_flight = false;
        self.idle.notify_all();
    }

    pub(crate) fn is_revoked(&self) -> bool {
        self.state().revoked
    }

    fn revoke(&self) {
        self.state().revoked = true;
        self.revoked.notify_waiters();
    }

    /// Resolves once the lease is revoked.
    pub(crate) async fn revoked(&self) {
        let notified = self.revoked.notified();
        if self.is_revoked() {
            return;
        }
        notified.await;
    }

    /// Block until no message is in flight. Returns `false` on timeout.
    fn wait_idle(&self, timeout: Duration) -> bool {
        let state = self.state();
        let (_state, result) = self
            .idle
            .wait_timeout_while(state, timeout, |s| s.in_flight)
            .unwrap_or_else(PoisonError::into_inner);
        !result.timed_out()
    }

    /// Count a message handed to the worker; runs `pause` when the backlog
    /// reaches `limit`.
    pub(crate) fn enqueued(&self, limit: usize, pause: impl FnOnce()) {
        let mut state = self.state();
        state.queued += 1;
        if !state.paused && state.queued >= limit {
            state.paused = true;
            pause();
        }
    }

    /// Count a message taken by the worker; runs `resume` when a paused
    /// backlog has drained to half of `limit`.
    pub(crate) fn dequeued(&self, limit: usize, resume: impl FnOnce()) {
        let mut state = self.state();
        state.queued = state.queued.saturating_sub(1);
        if state.paused && state.queued <= limit / 2 {
            state.paused = false;
            resume();
        }
    }
}

/// Leases of the partitions currently assigned to one consumer.
#[derive(Debug, Default)]
pub(crate) struct PartitionLeases {
    leases: Mutex<HashMap<PartitionKey, Arc<PartitionLease>>>,
}

impl PartitionLeases {
    fn leases(&self) -> MutexGuard<'_, HashMap<PartitionKey, Arc<PartitionLease>>> {
        self.leases.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a fresh lease for a newly seen assignment.
    pub(crate) fn acquire(&self, topic: &str, partition: i32) -> Arc<PartitionLease> {
        let lease = Arc::new(PartitionLease::default());
        self.leases()
            .insert((topic.to_string(), partition), Arc::clone(&lease));
        lease
    }

    /// Revoke and forget the leases of `partitions`.
    fn revoke(&self, partitions: impl IntoIterator<Item = PartitionKey>) -> Vec<(PartitionKey, Arc<PartitionLease>)> {
        let mut leases = self.leases();
        partitions
            .into_iter()
            .filter_map(|key| leases.remove(&key).map(|lease| (key, lease)))
            .inspect(|(_, lease)| lease.revoke())
            .collect()
    }

    /// Revoke `partitions` and wait for their in-flight messages.
    pub(crate) fn revoke_and_drain(&self, partitions: impl IntoIterator<Item = PartitionKey>, timeout: Duration) {
        let revoked = self.revoke(partitions);
        if revoked.is_empty() {
            return;
        }

        let drain = || {
            for ((topic, partition), lease) in &revoked {
                if lease.wait_idle(timeout) {
                    tracing::debug!(topic = %topic, partition, "Revoked partition drained");
                } else {
                    tracing::warn!(
                        topic = %topic,
                        partition,
                        "In-flight message still running after revocation"
                    );
                }
            }
        };

        match Handle::try_current().map(|handle| handle.runtime_flavor()) {
            // The in-flight handler runs on this thread, so it cannot finish while we wait
            Ok(RuntimeFlavor::CurrentThread) => tracing::warn!(
                partitions = revoked.len(),
                "Cannot wait for in-flight messages on a current-thread runtime"
            ),
            Ok(_) => tokio::task::block_in_place(drain),
            Err(_) => drain(),
        }
    }
}

/// Consumer context that drains revoked partitions before they are released.
pub(crate) struct RebalanceContext {
    leases: Arc<PartitionLeases>,
}

impl RebalanceContext {
    pub(crate) const fn new(leases: Arc<PartitionLeases>) -> Self {
        Self { leases }
    }
}

impl ClientContext for RebalanceContext {}

impl ConsumerContext for RebalanceContext {
    fn pre_rebalance(&self, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Revoke(partitions) => {
                tracing::info!(partitions = partitions.count(), "Partitions revoked");
                let keys = partitions
                    .elements()
                    .iter()
                    .map(|elem| (elem.topic().to_string(), elem.partition()))
                    .collect::<Vec<_>>();
                self.leases.revoke_and_drain(keys, REVOKE_DRAIN_TIMEOUT);
            },
            Rebalance::Assign(partitions) => {
                tracing::info!(partitions = partitions.count(), "Partitions assigned");
            },
            Rebalance::Error(e) => tracing::warn!(error = %e, "Rebalance error"),
        }
    }
}
