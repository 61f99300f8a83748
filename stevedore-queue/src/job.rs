//! Job definition and state management.

use crate::backoff::BackoffPolicy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Job unique identifier.
pub type JobId = Uuid;

/// Job payload. Always a JSON object once accepted by the queue.
pub type JobData = serde_json::Value;

/// Default number of attempts before a job is dead-lettered.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Job state.
///
/// ```text
/// Waiting -> Active -> Completed
///              |
///              +-> Failed -> Waiting      (attempts left, after backoff)
///              +-> InDeadLetter           (attempts exhausted)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    /// Ready to be leased
    Waiting,
    /// Leased by a worker slot
    Active,
    /// Handler succeeded
    Completed,
    /// Last attempt failed; waiting out its backoff before re-admission
    Failed,
    /// Attempts exhausted and moved to the dead-letter queue
    InDeadLetter,
}

impl JobState {
    /// Whether the job has left the main queue for good.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::InDeadLetter)
    }

    /// Lowercase name, used in broker keys and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::InDeadLetter => "dead",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A job to be processed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job identifier
    pub id: JobId,

    /// Job name
    pub name: String,

    /// Queue name
    pub queue: String,

    /// Job payload data
    pub payload: JobData,

    /// Lower values are leased first
    pub priority: i32,

    /// Current state
    pub state: JobState,

    /// Number of attempts started so far
    pub attempts_made: u32,

    /// Maximum number of attempts
    pub max_attempts: u32,

    /// Backoff applied between attempts
    pub backoff: BackoffPolicy,

    /// Error message of the last failed attempt
    pub last_error: Option<String>,

    /// Handler output of the successful attempt
    pub result: Option<JobData>,

    /// When the job was created
    pub created_at: DateTime<Utc>,

    /// When the last attempt started
    pub last_attempt_at: Option<DateTime<Utc>>,

    /// Earliest time the job may be leased
    pub available_at: DateTime<Utc>,

    /// When the job completed or was dead-lettered
    pub finished_at: Option<DateTime<Utc>>,

    /// Identifies the lease held by the current attempt
    #[serde(default)]
    pub lease_token: Option<Uuid>,
}

impl Job {
    /// Create a new job.
    pub fn new(queue: impl Into<String>, name: impl Into<String>, payload: JobData) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            queue: queue.into(),
            payload,
            priority: 0,
            state: JobState::Waiting,
            attempts_made: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: BackoffPolicy::default(),
            last_error: None,
            result: None,
            created_at: now,
            last_attempt_at: None,
            available_at: now,
            finished_at: None,
            lease_token: None,
        }
    }

    /// Set job priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set max attempts.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the backoff policy.
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Check if the job is ready to be leased.
    pub fn is_ready(&self) -> bool {
        self.state == JobState::Waiting && Utc::now() >= self.available_at
    }

    /// Check if another attempt is allowed.
    pub fn can_retry(&self) -> bool {
        self.attempts_made < self.max_attempts
    }

    /// Mark job as leased, count the attempt and issue a new lease token.
    ///
    /// The counter never passes `max_attempts`; an exhausted job is never
    /// offered for lease in the first place.
    pub fn start_attempt(&mut self) {
        if self.can_retry() {
            self.attempts_made += 1;
        }
        self.lease_token = Some(Uuid::new_v4());
        self.state = JobState::Active;
        self.last_attempt_at = Some(Utc::now());
    }

    /// Mark job as completed.
    pub fn complete(&mut self, result: JobData) {
        self.state = JobState::Completed;
        self.result = Some(result);
        self.finished_at = Some(Utc::now());
    }

    /// Record a failed attempt.
    ///
    /// Moves to `Failed` while attempts remain, otherwise to `InDeadLetter`.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.last_error = Some(error.into());
        if self.can_retry() {
            self.state = JobState::Failed;
        } else {
            self.state = JobState::InDeadLetter;
            self.finished_at = Some(Utc::now());
        }
    }

    /// Delay before the next attempt, per the job's backoff policy.
    pub fn backoff_delay(&self) -> std::time::Duration {
        self.backoff.delay_for(self.attempts_made)
    }

    /// Make a failed job leasable again.
    pub fn readmit(&mut self) {
        if matches!(self.state, JobState::Failed | JobState::Active) {
            self.state = JobState::Waiting;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_job_creation() {
        let job = Job::new("dummy-jobs", "process-dummy-data", serde_json::json!({"message": "hi"}));

        assert_eq!(job.queue, "dummy-jobs");
        assert_eq!(job.name, "process-dummy-data");
        assert_eq!(job.attempts_made, 0);
        assert_eq!(job.max_attempts, 3);
        assert_eq!(job.priority, 0);
        assert_eq!(job.state, JobState::Waiting);
        assert!(job.is_ready());
    }

    #[test]
    fn test_job_builder() {
        let job = Job::new("q", "task", serde_json::json!({}))
            .with_priority(-2)
            .with_max_attempts(5)
            .with_backoff(BackoffPolicy::fixed(Duration::from_millis(10)));

        assert_eq!(job.priority, -2);
        assert_eq!(job.max_attempts, 5);
        assert_eq!(job.backoff_delay(), Duration::from_millis(10));
    }

    #[test]
    fn test_job_retry_logic() {
        let mut job = Job::new("q", "task", serde_json::json!({}));

        job.start_attempt();
        job.fail("Error 1");
        assert_eq!(job.state, JobState::Failed);
        assert!(job.can_retry());

        job.readmit();
        job.start_attempt();
        job.fail("Error 2");
        assert_eq!(job.state, JobState::Failed);

        job.readmit();
        job.start_attempt();
        job.fail("Error 3");
        assert_eq!(job.state, JobState::InDeadLetter);
        assert!(!job.can_retry());
        assert_eq!(job.last_error.as_deref(), Some("Error 3"));
        assert!(job.finished_at.is_some());
    }

    #[test]
    fn test_attempts_never_exceed_max() {
        let mut job = Job::new("q", "task", serde_json::json!({})).with_max_attempts(2);

        for _ in 0..5 {
            job.start_attempt();
            assert!(job.attempts_made <= job.max_attempts);
        }
        assert_eq!(job.attempts_made, 2);
    }

    #[test]
    fn test_backoff_delay_follows_attempts() {
        let mut job = Job::new("q", "task", serde_json::json!({}));

        job.attempts_made = 1;
        assert_eq!(job.backoff_delay(), Duration::from_millis(2000));

        job.attempts_made = 2;
        assert_eq!(job.backoff_delay(), Duration::from_millis(4000));

        job.attempts_made = 3;
        assert_eq!(job.backoff_delay(), Duration::from_millis(8000));
    }

    #[test]
    fn test_job_status_transitions() {
        let mut job = Job::new("q", "task", serde_json::json!({}));

        job.start_attempt();
        assert_eq!(job.state, JobState::Active);
        assert!(job.last_attempt_at.is_some());
        assert!(!job.is_ready());

        job.complete(serde_json::json!({"ok": true}));
        assert_eq!(job.state, JobState::Completed);
        assert!(job.state.is_terminal());
        assert_eq!(job.result, Some(serde_json::json!({"ok": true})));
    }

    #[test]
    fn test_each_attempt_gets_new_lease_token() {
        let mut job = Job::new("q", "task", serde_json::json!({}));
        assert!(job.lease_token.is_none());

        job.start_attempt();
        let first = job.lease_token;
        job.fail("boom");
        job.readmit();
        job.start_attempt();

        assert!(first.is_some());
        assert!(job.lease_token.is_some());
        assert_ne!(job.lease_token, first);
    }

    #[test]
    fn test_readmit_only_from_failed_or_active() {
        let mut job = Job::new("q", "task", serde_json::json!({}));
        job.start_attempt();
        job.complete(serde_json::json!(null));
        job.readmit();
        assert_eq!(job.state, JobState::Completed);
    }

    #[test]
    fn test_job_not_ready_before_available_at() {
        let mut job = Job::new("q", "task", serde_json::json!({}));
        job.available_at = Utc::now() + chrono::Duration::hours(1);
        assert!(!job.is_ready());
    }

    #[test]
    fn test_job_id_uniqueness() {
        let job1 = Job::new("q", "task", serde_json::json!({}));
        let job2 = Job::new("q", "task", serde_json::json!({}));

        assert_ne!(job1.id, job2.id);
    }

    #[test]
    fn test_state_names() {
        assert_eq!(JobState::InDeadLetter.to_string(), "dead");
        assert_eq!(JobState::Waiting.as_str(), "waiting");
        assert!(!JobState::Failed.is_terminal());
    }

    #[test]
    fn test_job_json_round_trip() {
        let job = Job::new("q", "task", serde_json::json!({"message": "hello"}));
        let json = serde_json::to_string(&job).unwrap();
        let back: Job = serde_json::from_str(&json).unwrap();
        assert_eq!(back, job);
    }
}
