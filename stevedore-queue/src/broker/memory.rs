//! In-process broker.

use super::{Broker, DEFAULT_COMPLETED_RETENTION, DEFAULT_DEAD_RETENTION, QueueCounts, deadline_after};
use crate::error::{QueueError, QueueResult};
use crate::job::{Job, JobId, JobState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
struct Lease {
    token: Option<Uuid>,
    deadline: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct QueueState {
    jobs: HashMap<JobId, Job>,
    arrival: HashMap<JobId, u64>,
    waiting: BTreeSet<(i32, u64, JobId)>,
    delayed: BTreeSet<(DateTime<Utc>, JobId)>,
    active: HashMap<JobId, Lease>,
    completed: VecDeque<JobId>,
    dead: VecDeque<JobId>,
    completed_total: usize,
    dead_total: usize,
    sequence: u64,
}

impl QueueState {
    fn make_waiting(&mut self, job: &mut Job) {
        job.readmit();
        let seq = match self.arrival.get(&job.id) {
            Some(seq) => *seq,
            None => {
                self.sequence += 1;
                self.arrival.insert(job.id, self.sequence);
                self.sequence
            }
        };
        self.waiting.insert((job.priority, seq, job.id));
    }

    fn promote_due(&mut self, now: DateTime<Utc>) {
        while let Some(&(visible_at, id)) = self.delayed.first() {
            if visible_at > now {
                break;
            }
            self.delayed.pop_first();
            if let Some(mut job) = self.jobs.remove(&id) {
                self.make_waiting(&mut job);
                self.jobs.insert(id, job);
            }
        }
    }

    fn holds_lease(&self, job: &Job) -> bool {
        job.lease_token.is_some()
            && self
                .active
                .get(&job.id)
                .is_some_and(|lease| lease.token == job.lease_token)
    }

    /// Drop the lease if `job` still holds it.
    fn release(&mut self, job: &Job) -> bool {
        if !self.holds_lease(job) {
            return false;
        }
        self.active.remove(&job.id);
        true
    }

    fn forget(&mut self, id: &JobId) {
        self.jobs.remove(id);
        self.arrival.remove(id);
    }
}

/// Broker keeping every queue in process memory.
///
/// Leases are atomic because every operation holds the same mutex. State
/// does not survive the process, so this broker suits tests and
/// single-instance runs.
#[derive(Debug)]
pub struct MemoryBroker {
    queues: Mutex<HashMap<String, QueueState>>,
    completed_retention: usize,
    dead_retention: usize,
    unavailable: AtomicBool,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            completed_retention: DEFAULT_COMPLETED_RETENTION,
            dead_retention: DEFAULT_DEAD_RETENTION,
            unavailable: AtomicBool::new(false),
        }
    }

    /// Set how many completed and dead-lettered records are kept.
    pub fn with_retention(mut self, completed: usize, dead: usize) -> Self {
        self.completed_retention = completed;
        self.dead_retention = dead;
        self
    }

    /// Make every operation fail as if the substrate were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> QueueResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(QueueError::BrokerUnavailable(
                "memory broker marked unavailable".to_string(),
            ));
        }
        Ok(())
    }

    fn with_queue<T>(&self, queue: &str, f: impl FnOnce(&mut QueueState) -> T) -> QueueResult<T> {
        self.check_available()?;
        let mut queues = self.queues.lock();
        let state = queues.entry(queue.to_string()).or_default();
        Ok(f(state))
    }
}

fn trim_history(state: &mut QueueState, which: JobState, keep: usize) {
    loop {
        let history = match which {
            JobState::Completed => &mut state.completed,
            _ => &mut state.dead,
        };
        if history.len() <= keep {
            break;
        }
        if let Some(id) = history.pop_front() {
            state.forget(&id);
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn push(&self, queue: &str, job: &Job) -> QueueResult<JobId> {
        self.with_queue(queue, |state| {
            let mut job = job.clone();
            if job.available_at <= Utc::now() {
                state.make_waiting(&mut job);
            } else {
                state.delayed.insert((job.available_at, job.id));
            }
            let id = job.id;
            state.jobs.insert(id, job);
            id
        })
    }

    async fn lease(&self, queue: &str, lease_for: Duration) -> QueueResult<Option<Job>> {
        let deadline = deadline_after(lease_for);
        self.with_queue(queue, |state| {
            state.promote_due(Utc::now());

            while let Some((_, _, id)) = state.waiting.pop_first() {
                let Some(job) = state.jobs.get_mut(&id) else {
                    continue;
                };
                job.start_attempt();
                let lease = Lease {
                    token: job.lease_token,
                    deadline,
                };
                let leased = job.clone();
                state.active.insert(id, lease);
                return Some(leased);
            }
            None
        })
    }

    async fn extend_lease(&self, queue: &str, job: &Job, lease_for: Duration) -> QueueResult<bool> {
        let deadline = deadline_after(lease_for);
        self.with_queue(queue, |state| {
            if !state.holds_lease(job) {
                return false;
            }
            if let Some(lease) = state.active.get_mut(&job.id) {
                lease.deadline = deadline;
            }
            true
        })
    }

    async fn ack(&self, queue: &str, job: &Job) -> QueueResult<bool> {
        let keep = self.completed_retention;
        self.with_queue(queue, |state| {
            if !state.release(job) {
                return false;
            }
            state.jobs.insert(job.id, job.clone());
            state.completed.push_back(job.id);
            state.completed_total += 1;
            trim_history(state, JobState::Completed, keep);
            true
        })
    }

    async fn schedule_visibility(
        &self,
        queue: &str,
        job: &Job,
        not_before: DateTime<Utc>,
    ) -> QueueResult<bool> {
        self.with_queue(queue, |state| {
            if !state.release(job) {
                return false;
            }
            let mut job = job.clone();
            job.available_at = not_before;
            state.delayed.insert((not_before, job.id));
            state.jobs.insert(job.id, job);
            true
        })
    }

    async fn bury(&self, queue: &str, job: &Job) -> QueueResult<bool> {
        let keep = self.dead_retention;
        self.with_queue(queue, |state| {
            if !state.release(job) {
                return false;
            }
            state.jobs.insert(job.id, job.clone());
            state.dead.push_back(job.id);
            state.dead_total += 1;
            trim_history(state, JobState::InDeadLetter, keep);
            true
        })
    }

    async fn expired_leases(&self, queue: &str) -> QueueResult<Vec<Job>> {
        self.with_queue(queue, |state| {
            let now = Utc::now();
            state
                .active
                .iter()
                .filter(|(_, lease)| lease.deadline <= now)
                .filter_map(|(id, _)| state.jobs.get(id).cloned())
                .collect()
        })
    }

    async fn get(&self, queue: &str, id: JobId) -> QueueResult<Option<Job>> {
        self.with_queue(queue, |state| state.jobs.get(&id).cloned())
    }

    async fn list(&self, queue: &str, state: JobState, limit: usize) -> QueueResult<Vec<Job>> {
        self.with_queue(queue, |q| {
            q.promote_due(Utc::now());
            let ids: Vec<JobId> = match state {
                JobState::Waiting => q.waiting.iter().map(|(_, _, id)| *id).collect(),
                JobState::Failed => q.delayed.iter().map(|(_, id)| *id).collect(),
                JobState::Active => q.active.keys().copied().collect(),
                JobState::Completed => q.completed.iter().rev().copied().collect(),
                JobState::InDeadLetter => q.dead.iter().rev().copied().collect(),
            };
            ids.iter()
                .filter_map(|id| q.jobs.get(id).cloned())
                .take(limit)
                .collect()
        })
    }

    async fn list_newest(&self, queue: &str, limit: usize) -> QueueResult<Vec<Job>> {
        self.with_queue(queue, |q| {
            q.promote_due(Utc::now());
            q.waiting
                .iter()
                .rev()
                .filter_map(|(_, _, id)| q.jobs.get(id).cloned())
                .take(limit)
                .collect()
        })
    }

    async fn counts(&self, queue: &str) -> QueueResult<QueueCounts> {
        self.with_queue(queue, |state| {
            state.promote_due(Utc::now());
            QueueCounts {
                waiting: state.waiting.len(),
                active: state.active.len(),
                completed: state.completed_total,
                failed: state.delayed.len(),
                dead: state.dead_total,
            }
        })
    }

    async fn ping(&self) -> QueueResult<()> {
        self.check_available()
    }
}
