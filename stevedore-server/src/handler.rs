//! Demo job handler.

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use std::time::Duration;
use stevedore_config::HandlerSettings;
use stevedore_queue::{HandlerResult, Job, JobHandler, QueueError};
use tracing::info;

/// Error message of every simulated failure.
pub const SIMULATED_FAILURE: &str = "Simulated job failure";

/// Simulates work on `process-dummy-data` jobs.
///
/// Each attempt sleeps for `processing_delay`, then fails when the payload
/// sets `shouldFail` or with probability `failure_rate`. Otherwise it returns
/// `{processedMessage, processedAt, workerPID}`.
#[derive(Debug, Clone)]
pub struct DemoJobHandler {
    processing_delay: Duration,
    failure_rate: f64,
}

impl DemoJobHandler {
    /// Create a handler. `failure_rate` is clamped to `0.0..=1.0`; NaN means never.
    pub fn new(processing_delay: Duration, failure_rate: f64) -> Self {
        Self {
            processing_delay,
            failure_rate: if failure_rate.is_nan() {
                0.0
            } else {
                failure_rate.clamp(0.0, 1.0)
            },
        }
    }

    /// Create a handler from the `handler` config section.
    pub fn from_settings(settings: &HandlerSettings) -> Self {
        Self::new(
            Duration::from_millis(settings.processing_delay_ms),
            settings.failure_rate,
        )
    }

    fn should_fail(&self, job: &Job) -> bool {
        let forced = job
            .payload
            .get("shouldFail")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        forced || (self.failure_rate > 0.0 && rand::rng().random_bool(self.failure_rate))
    }
}

#[async_trait]
impl JobHandler for DemoJobHandler {
    async fn execute(&self, job: &Job) -> HandlerResult {
        info!(job_id = %job.id, data = %job.payload, "Processing job");

        if !self.processing_delay.is_zero() {
            tokio::time::sleep(self.processing_delay).await;
        }

        if self.should_fail(job) {
            return Err(QueueError::failed(SIMULATED_FAILURE));
        }

        let message = job
            .payload
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or_default();

        Ok(serde_json::json!({
            "processedMessage": format!("Processed: {message}"),
            "processedAt": Utc::now().to_rfc3339(),
            "workerPID": std::process::id(),
        }))
    }
}
