//! Dead-letter records.

use crate::error::{QueueError, QueueResult};
use crate::job::{Job, JobData, JobId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reason code attached to every dead-lettered job.
pub const MAX_RETRIES_EXCEEDED: &str = "max retries exceeded";

/// Name under which records are stored in the dead-letter queue.
pub const DEAD_LETTER_JOB_NAME: &str = "failed-job";

/// A job that exhausted its attempts, as kept in the dead-letter queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterRecord {
    /// Id of the job in the main queue
    pub job_id: JobId,

    /// Name of the job in the main queue
    pub job_name: String,

    /// Payload the job was enqueued with
    pub original_payload: JobData,

    /// Attempts made before giving up
    pub attempts_made: u32,

    /// Last error message
    pub error: String,

    /// Reason code plus the last error
    pub failure_reason: String,

    /// When the record was written
    pub moved_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    /// Build a record from an exhausted job.
    pub fn from_job(job: &Job, error: &str) -> Self {
        Self {
            job_id: job.id,
            job_name: job.name.clone(),
            original_payload: job.payload.clone(),
            attempts_made: job.attempts_made,
            error: error.to_string(),
            failure_reason: format!("{MAX_RETRIES_EXCEEDED}: {error}"),
            moved_at: Utc::now(),
        }
    }

    /// Wrap the record in a job for the dead-letter queue.
    pub fn into_job(self, dead_letter_queue: &str) -> QueueResult<Job> {
        let payload =
            serde_json::to_value(&self).map_err(|e| QueueError::Serialization(e.to_string()))?;
        Ok(Job::new(dead_letter_queue, DEAD_LETTER_JOB_NAME, payload).with_max_attempts(1))
    }

    /// Read a record back out of a dead-letter queue job.
    pub fn from_dead_letter_job(job: &Job) -> QueueResult<Self> {
        serde_json::from_value(job.payload.clone())
            .map_err(|e| QueueError::Deserialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_from_job() {
        let mut job = Job::new("dummy-jobs", "process-dummy-data", serde_json::json!({"message": "x"}));
        job.attempts_made = 3;

        let record = DeadLetterRecord::from_job(&job, "Simulated job failure");

        assert_eq!(record.job_id, job.id);
        assert_eq!(record.original_payload, serde_json::json!({"message": "x"}));
        assert_eq!(record.attempts_made, 3);
        assert_eq!(record.error, "Simulated job failure");
        assert!(record.failure_reason.contains(MAX_RETRIES_EXCEEDED));
        assert!(record.failure_reason.contains("Simulated job failure"));
    }

    #[test]
    fn test_record_survives_dead_letter_job() {
        let job = Job::new("dummy-jobs", "task", serde_json::json!({"message": "y"}));
        let record = DeadLetterRecord::from_job(&job, "boom");

        let dlq_job = record.clone().into_job("dead-letter-queue").unwrap();
        assert_eq!(dlq_job.queue, "dead-letter-queue");
        assert_eq!(dlq_job.name, DEAD_LETTER_JOB_NAME);
        assert_eq!(dlq_job.payload["originalPayload"]["message"], "y");

        let back = DeadLetterRecord::from_dead_letter_job(&dlq_job).unwrap();
        assert_eq!(back, record);
    }
}
