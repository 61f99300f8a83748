//! Job queue service.

use crate::backoff::BackoffPolicy;
use crate::broker::{Broker, deadline_after};
use crate::dead_letter::DeadLetterRecord;
use crate::error::{QueueError, QueueResult};
use crate::job::{DEFAULT_MAX_ATTEMPTS, Job, JobData, JobId, JobState};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Outcome of a handler run: the job result or the failure.
pub type HandlerResult = QueueResult<JobData>;

/// Queue configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Main queue name
    pub name: String,

    /// Dead-letter queue name
    pub dead_letter_name: String,

    /// Payload fields that must be present and non-empty
    pub required_fields: Vec<String>,

    /// Attempts allowed when the enqueue does not say
    pub default_max_attempts: u32,

    /// Backoff used when the enqueue does not say
    pub default_backoff: BackoffPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "dummy-jobs".to_string(),
            dead_letter_name: "dead-letter-queue".to_string(),
            required_fields: Vec::new(),
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
            default_backoff: BackoffPolicy::default(),
        }
    }
}

impl QueueConfig {
    /// Create a configuration for the named queue.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Set the dead-letter queue name.
    pub fn with_dead_letter_name(mut self, name: impl Into<String>) -> Self {
        self.dead_letter_name = name.into();
        self
    }

    /// Require a payload field.
    pub fn require_field(mut self, field: impl Into<String>) -> Self {
        self.required_fields.push(field.into());
        self
    }

    /// Set the default attempt limit.
    pub fn with_default_max_attempts(mut self, max_attempts: u32) -> Self {
        self.default_max_attempts = max_attempts;
        self
    }

    /// Set the default backoff.
    pub fn with_default_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.default_backoff = backoff;
        self
    }
}

/// Per-job overrides accepted at enqueue.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnqueueOptions {
    /// Attempt limit (must be at least 1)
    pub max_attempts: Option<u32>,

    /// Lower values are leased first
    pub priority: Option<i32>,

    /// Backoff between attempts
    pub backoff: Option<BackoffPolicy>,

    /// Keep the job hidden for this long after enqueue
    pub delay: Option<Duration>,
}

impl EnqueueOptions {
    /// Set the attempt limit.
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Set the priority.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Set the backoff.
    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Delay the first attempt.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// Snapshot of queue counts, as served by the stats endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    /// Jobs ready to lease
    pub waiting_count: usize,
    /// Jobs currently leased
    pub active_count: usize,
    /// Jobs completed
    pub completed_count: usize,
    /// Failed jobs waiting out their backoff
    pub failed_count: usize,
    /// Records in the dead-letter queue
    pub dead_letter_count: usize,
}

/// What happened to a job once its attempt was settled.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    /// Handler succeeded
    Completed {
        /// The completed job
        job: Job,
        /// Handler output
        result: JobData,
    },
    /// Handler failed with attempts left
    Retrying {
        /// The failed job
        job: Job,
        /// Failure message
        error: String,
        /// Wait before the job is leasable again
        delay: Duration,
    },
    /// Handler failed on the last attempt
    DeadLettered {
        /// The exhausted job
        job: Job,
        /// Failure message
        error: String,
        /// Id of the dead-letter record, if it was written
        record_id: Option<JobId>,
    },
}

impl JobOutcome {
    /// The job the outcome is about.
    pub fn job(&self) -> &Job {
        match self {
            JobOutcome::Completed { job, .. }
            | JobOutcome::Retrying { job, .. }
            | JobOutcome::DeadLettered { job, .. } => job,
        }
    }
}

/// Job queue over a shared broker.
///
/// Cloning is cheap; every clone talks to the same broker.
#[derive(Clone)]
pub struct JobQueue {
    broker: Arc<dyn Broker>,
    config: Arc<QueueConfig>,
}

impl JobQueue {
    /// Create a queue over the given broker.
    pub fn new(broker: Arc<dyn Broker>, config: QueueConfig) -> Self {
        info!(queue = %config.name, dead_letter = %config.dead_letter_name, "Job queue ready");
        Self {
            broker,
            config: Arc::new(config),
        }
    }

    /// Queue configuration.
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Broker backing the queue.
    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Main queue name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Validate and persist a new job.
    pub async fn enqueue(
        &self,
        name: impl Into<String>,
        payload: JobData,
        options: EnqueueOptions,
    ) -> QueueResult<Job> {
        self.validate_payload(&payload)?;

        let max_attempts = options
            .max_attempts
            .unwrap_or(self.config.default_max_attempts);
        if max_attempts == 0 {
            return Err(QueueError::Validation(
                "maxAttempts must be at least 1".to_string(),
            ));
        }

        let mut job = Job::new(&self.config.name, name, payload)
            .with_max_attempts(max_attempts)
            .with_priority(options.priority.unwrap_or(0))
            .with_backoff(options.backoff.unwrap_or(self.config.default_backoff));
        if let Some(delay) = options.delay {
            job.available_at = deadline_after(delay);
        }

        match self.broker.push(&self.config.name, &job).await {
            Ok(_) => {
                info!(queue = %self.config.name, job_id = %job.id, "Job added to queue");
                Ok(job)
            }
            Err(e) => {
                error!(queue = %self.config.name, error = %e, "Failed to add job to queue");
                Err(unavailable(e))
            }
        }
    }

    fn validate_payload(&self, payload: &JobData) -> QueueResult<()> {
        let Some(object) = payload.as_object() else {
            return Err(QueueError::Validation(
                "payload must be a JSON object".to_string(),
            ));
        };
        if object.is_empty() {
            return Err(QueueError::Validation("payload must not be empty".to_string()));
        }

        for field in &self.config.required_fields {
            let present = match object.get(field) {
                None | Some(JobData::Null) => false,
                Some(JobData::String(s)) => !s.trim().is_empty(),
                Some(_) => true,
            };
            if !present {
                return Err(QueueError::Validation(format!("{field} is required")));
            }
        }
        Ok(())
    }

    /// Counts across the main queue and the dead-letter queue.
    pub async fn stats(&self) -> QueueResult<QueueStats> {
        let fetch = async {
            let main = self.broker.counts(&self.config.name).await?;
            let dead = self.broker.counts(&self.config.dead_letter_name).await?;
            Ok::<_, QueueError>(QueueStats {
                waiting_count: main.waiting,
                active_count: main.active,
                completed_count: main.completed,
                failed_count: main.failed,
                dead_letter_count: dead.waiting,
            })
        };

        fetch.await.map_err(|e| {
            error!(queue = %self.config.name, error = %e, "Failed to get queue stats");
            unavailable(e)
        })
    }

    /// Write a dead-letter record for an exhausted job.
    ///
    /// Failures are logged and swallowed; the write is never retried.
    pub async fn move_to_dead_letter(&self, job: &Job, error: &str) -> Option<JobId> {
        let record = DeadLetterRecord::from_job(job, error);
        let result = match record.into_job(&self.config.dead_letter_name) {
            Ok(record_job) => self.broker.push(&self.config.dead_letter_name, &record_job).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(record_id) => {
                info!(job_id = %job.id, record_id = %record_id, "Job moved to Dead Letter Queue");
                Some(record_id)
            }
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Failed to move job to DLQ");
                None
            }
        }
    }

    /// Lease the next ready job, if any.
    pub async fn lease(&self, lease_for: Duration) -> QueueResult<Option<Job>> {
        self.broker.lease(&self.config.name, lease_for).await
    }

    /// Keep a running attempt's lease alive. Returns `false` once it is lost.
    pub async fn extend_lease(&self, job: &Job, lease_for: Duration) -> QueueResult<bool> {
        self.broker
            .extend_lease(&self.config.name, job, lease_for)
            .await
    }

    /// Record the result of an attempt and decide the job's next state.
    ///
    /// Fails with [`QueueError::LeaseLost`], recording nothing, when the
    /// attempt's lease expired and was taken over.
    pub async fn settle(&self, mut job: Job, result: HandlerResult) -> QueueResult<JobOutcome> {
        match result {
            Ok(output) => {
                job.complete(output.clone());
                if !self.broker.ack(&self.config.name, &job).await? {
                    return Err(QueueError::LeaseLost(job.id));
                }
                debug!(job_id = %job.id, attempts = job.attempts_made, "Job completed");
                Ok(JobOutcome::Completed { job, result: output })
            }
            Err(err) => {
                let message = err.failure_message();
                self.fail(job, message).await
            }
        }
    }

    async fn fail(&self, mut job: Job, message: String) -> QueueResult<JobOutcome> {
        job.fail(message.clone());

        if job.state == JobState::InDeadLetter {
            // Only the attempt that buries the job writes its record.
            if !self.broker.bury(&self.config.name, &job).await? {
                return Err(QueueError::LeaseLost(job.id));
            }
            error!(
                job_id = %job.id,
                attempts = job.attempts_made,
                error = %message,
                "Job failed after final attempt"
            );
            let record_id = self.move_to_dead_letter(&job, &message).await;
            return Ok(JobOutcome::DeadLettered {
                job,
                error: message,
                record_id,
            });
        }

        let delay = job.backoff_delay();
        let not_before = deadline_after(delay);
        if !self
            .broker
            .schedule_visibility(&self.config.name, &job, not_before)
            .await?
        {
            return Err(QueueError::LeaseLost(job.id));
        }
        warn!(
            job_id = %job.id,
            attempts = job.attempts_made,
            max_attempts = job.max_attempts,
            retry_in_ms = delay.as_millis() as u64,
            error = %message,
            "Job failed, retry scheduled"
        );
        job.available_at = not_before;
        Ok(JobOutcome::Retrying {
            job,
            error: message,
            delay,
        })
    }

    /// Re-offer jobs whose lease expired. Returns how many were reclaimed.
    ///
    /// Exhausted jobs are dead-lettered instead. A lease settled by its
    /// holder or another reclaimer in the meantime is skipped.
    pub async fn reclaim_expired_leases(&self) -> QueueResult<usize> {
        let expired = self.broker.expired_leases(&self.config.name).await?;
        let mut reclaimed = 0;

        for mut job in expired {
            let settled = if job.can_retry() {
                job.readmit();
                let held = self
                    .broker
                    .schedule_visibility(&self.config.name, &job, chrono::Utc::now())
                    .await?;
                if held {
                    warn!(job_id = %job.id, attempts = job.attempts_made, "Lease expired, job re-offered");
                }
                held
            } else {
                match self.fail(job, "lease expired".to_string()).await {
                    Ok(_) => true,
                    Err(QueueError::LeaseLost(_)) => false,
                    Err(e) => return Err(e),
                }
            };
            if settled {
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    /// Newest dead-letter records first.
    pub async fn dead_letters(&self, limit: usize) -> QueueResult<Vec<DeadLetterRecord>> {
        let jobs = self
            .broker
            .list_newest(&self.config.dead_letter_name, limit)
            .await
            .map_err(unavailable)?;
        jobs.iter().map(DeadLetterRecord::from_dead_letter_job).collect()
    }

    /// Fetch a job from the main queue.
    pub async fn get(&self, id: JobId) -> QueueResult<Option<Job>> {
        self.broker.get(&self.config.name, id).await
    }

    /// List main-queue jobs in a state.
    pub async fn jobs(&self, state: JobState, limit: usize) -> QueueResult<Vec<Job>> {
        self.broker.list(&self.config.name, state, limit).await
    }
}

fn unavailable(err: QueueError) -> QueueError {
    match err {
        QueueError::Broker(message) => QueueError::BrokerUnavailable(message),
        other => other,
    }
}
