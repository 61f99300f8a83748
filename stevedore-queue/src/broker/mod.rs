//! Durable storage and delivery substrate behind the job queues.
//!
//! A [`Broker`] owns every piece of queue state; processes share nothing
//! else. Two implementations ship with the crate:
//!
//! - [`RedisBroker`] - sorted sets and Lua scripts on a shared Redis server
//! - [`MemoryBroker`] - process-local, for tests and single-process runs

mod memory;
mod redis;

pub use self::memory::MemoryBroker;
pub use self::redis::{RedisBroker, RedisBrokerConfig};

use crate::error::QueueResult;
use crate::job::{Job, JobId, JobState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Completed job records kept per queue by default.
pub const DEFAULT_COMPLETED_RETENTION: usize = 10;

/// Dead-lettered job records kept per queue by default.
pub const DEFAULT_DEAD_RETENTION: usize = 5;

/// Per-state job counts of one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    /// Leasable now
    pub waiting: usize,
    /// Currently leased
    pub active: usize,
    /// Completed since the queue was created
    pub completed: usize,
    /// Failed attempts waiting out their backoff
    pub failed: usize,
    /// Dead-lettered since the queue was created
    pub dead: usize,
}

/// Substrate contract the job queue relies on.
///
/// Leasing must be atomic: a job is held by at most one lease at a time,
/// across every process sharing the broker. Each lease carries the token
/// set by [`Job::start_attempt`]. Settling and extending compare it with the
/// lease on record and change nothing when it no longer matches, so an
/// attempt that lost its lease cannot overwrite the attempt that took over.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Persist a new job. It becomes leasable at `job.available_at`.
    async fn push(&self, queue: &str, job: &Job) -> QueueResult<JobId>;

    /// Pop the next ready job and hold it until `now + lease_for`.
    ///
    /// Ready means lowest priority value first, then arrival order. The
    /// returned job already has the new attempt counted and is `Active`.
    async fn lease(&self, queue: &str, lease_for: Duration) -> QueueResult<Option<Job>>;

    /// Push the lease deadline to `now + lease_for`.
    ///
    /// Returns `false` when `job` no longer holds its lease.
    async fn extend_lease(&self, queue: &str, job: &Job, lease_for: Duration) -> QueueResult<bool>;

    /// Release a lease on a completed job and record it in the history.
    ///
    /// Returns `false`, changing nothing, when `job` no longer holds its lease.
    async fn ack(&self, queue: &str, job: &Job) -> QueueResult<bool>;

    /// Release a lease and keep the job hidden until `not_before`.
    ///
    /// Returns `false`, changing nothing, when `job` no longer holds its lease.
    async fn schedule_visibility(
        &self,
        queue: &str,
        job: &Job,
        not_before: DateTime<Utc>,
    ) -> QueueResult<bool>;

    /// Release a lease on a dead-lettered job and record it in the history.
    ///
    /// Returns `false`, changing nothing, when `job` no longer holds its lease.
    async fn bury(&self, queue: &str, job: &Job) -> QueueResult<bool>;

    /// Leased jobs whose deadline has passed, with their lease tokens.
    ///
    /// The leases stay on record until settled, so concurrent reclaimers
    /// race through the same compare-and-settle as the slot that held them.
    async fn expired_leases(&self, queue: &str) -> QueueResult<Vec<Job>>;

    /// Fetch a job record.
    async fn get(&self, queue: &str, id: JobId) -> QueueResult<Option<Job>>;

    /// List up to `limit` jobs in the given state.
    async fn list(&self, queue: &str, state: JobState, limit: usize) -> QueueResult<Vec<Job>>;

    /// List up to `limit` waiting jobs, last in lease order first.
    ///
    /// Among jobs of equal priority the most recently pushed comes first.
    async fn list_newest(&self, queue: &str, limit: usize) -> QueueResult<Vec<Job>>;

    /// Count jobs per state.
    async fn counts(&self, queue: &str) -> QueueResult<QueueCounts>;

    /// Check that the substrate is reachable.
    async fn ping(&self) -> QueueResult<()>;
}

/// `now + delay`, clamped instead of overflowing.
pub(crate) fn deadline_after(delay: Duration) -> DateTime<Utc> {
    let now = Utc::now();
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline_after() {
        let before = Utc::now();
        let deadline = deadline_after(Duration::from_secs(2));
        assert!(deadline >= before + chrono::Duration::seconds(2));
    }

    #[test]
    fn test_deadline_after_saturates() {
        assert_eq!(
            deadline_after(Duration::from_millis(u64::MAX)),
            DateTime::<Utc>::MAX_UTC
        );
    }
}
