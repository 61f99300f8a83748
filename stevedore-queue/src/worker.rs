//! Worker pool for processing jobs.

use crate::error::{QueueError, QueueResult};
use crate::job::Job;
use crate::queue::{HandlerResult, JobOutcome, JobQueue};
use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Capacity of the outcome channel. Outcomes are dropped while it is full.
pub const OUTCOME_BUFFER: usize = 1024;

/// Executes the work behind a job.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    /// Run one attempt. An `Err` counts as a failed attempt.
    async fn execute(&self, job: &Job) -> HandlerResult;
}

/// Handler built from an async closure. See [`handler_fn`].
pub struct FnHandler<F>(F);

/// Wrap an async closure as a [`JobHandler`].
///
/// ```
/// use stevedore_queue::{handler_fn, QueueError};
///
/// let handler = handler_fn(|job| async move {
///     match job.payload.get("message") {
///         Some(message) => Ok(serde_json::json!({ "echo": message })),
///         None => Err(QueueError::failed("no message")),
///     }
/// });
/// # let _ = handler;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn execute(&self, job: &Job) -> HandlerResult {
        (self.0)(job.clone()).await
    }
}

/// Worker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of concurrent jobs to process
    pub concurrency: usize,

    /// Idle wait between empty polls, and the lease reclaim period
    #[serde(with = "millis")]
    pub poll_interval: Duration,

    /// Visibility timeout of a lease
    #[serde(with = "millis")]
    pub lease_timeout: Duration,

    /// Per-attempt handler timeout (none by default)
    #[serde(with = "opt_millis")]
    pub job_timeout: Option<Duration>,

    /// Wait before leasing again after a broker error
    #[serde(with = "millis")]
    pub broker_retry_delay: Duration,

    /// Whether to log every job at info level
    pub log_execution: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            poll_interval: Duration::from_secs(1),
            lease_timeout: Duration::from_secs(300),
            job_timeout: None,
            broker_retry_delay: Duration::from_millis(500),
            log_execution: true,
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod opt_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
    }
}

/// Pool of slot tasks leasing and executing jobs from one queue.
///
/// Each slot runs one job at a time, so at most `concurrency` jobs are
/// active per pool.
pub struct WorkerPool {
    queue: JobQueue,
    handler: Arc<dyn JobHandler>,
    config: WorkerConfig,
    shutdown: Option<watch::Sender<bool>>,
    handles: Vec<JoinHandle<()>>,
    outcome_tx: mpsc::Sender<JobOutcome>,
    outcome_rx: Option<mpsc::Receiver<JobOutcome>>,
}

impl WorkerPool {
    /// Create a pool with default configuration.
    pub fn new(queue: JobQueue, handler: impl JobHandler) -> Self {
        Self::with_config(queue, handler, WorkerConfig::default())
    }

    /// Create a pool with custom configuration.
    pub fn with_config(queue: JobQueue, handler: impl JobHandler, config: WorkerConfig) -> Self {
        let (outcome_tx, outcome_rx) = mpsc::channel(OUTCOME_BUFFER);
        Self {
            queue,
            handler: Arc::new(handler),
            config,
            shutdown: None,
            handles: Vec::new(),
            outcome_tx,
            outcome_rx: Some(outcome_rx),
        }
    }

    /// Pool configuration.
    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Take the receiving end of the outcome channel.
    ///
    /// Returns `None` once taken.
    pub fn outcomes(&mut self) -> Option<mpsc::Receiver<JobOutcome>> {
        self.outcome_rx.take()
    }

    /// Check if the pool is running.
    pub fn is_running(&self) -> bool {
        self.shutdown.is_some()
    }

    /// Spawn the slot tasks and the lease reclaimer.
    pub fn start(&mut self) -> QueueResult<()> {
        if self.is_running() {
            return Err(QueueError::WorkerAlreadyRunning);
        }
        if self.config.concurrency == 0 {
            return Err(QueueError::Config("concurrency must be at least 1".to_string()));
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!(
            queue = %self.queue.name(),
            concurrency = self.config.concurrency,
            pid = std::process::id(),
            "Worker pool started"
        );

        for slot in 0..self.config.concurrency {
            let slot = Slot {
                index: slot,
                queue: self.queue.clone(),
                handler: self.handler.clone(),
                config: self.config.clone(),
                shutdown: shutdown_rx.clone(),
                outcomes: self.outcome_tx.clone(),
            };
            self.handles.push(tokio::spawn(slot.run()));
        }

        self.handles.push(tokio::spawn(reclaim_loop(
            self.queue.clone(),
            self.config.poll_interval,
            shutdown_rx,
        )));

        self.shutdown = Some(shutdown_tx);
        Ok(())
    }

    /// Stop leasing, wait up to `drain` for in-flight jobs, abort the rest.
    ///
    /// Aborted jobs keep their lease until it expires and is reclaimed.
    pub async fn stop(&mut self, drain: Duration) -> QueueResult<()> {
        let Some(shutdown) = self.shutdown.take() else {
            return Err(QueueError::WorkerNotRunning);
        };
        let _ = shutdown.send(true);
        info!(queue = %self.queue.name(), "Worker shutting down...");

        let handles: Vec<JoinHandle<()>> = self.handles.drain(..).collect();
        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();

        if tokio::time::timeout(drain, futures::future::join_all(handles))
            .await
            .is_err()
        {
            warn!(
                queue = %self.queue.name(),
                drain_ms = drain.as_millis() as u64,
                "Drain window elapsed, aborting in-flight jobs"
            );
            for abort in aborts {
                abort.abort();
            }
        }

        info!(queue = %self.queue.name(), "Worker pool stopped");
        Ok(())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
    }
}

struct Slot {
    index: usize,
    queue: JobQueue,
    handler: Arc<dyn JobHandler>,
    config: WorkerConfig,
    shutdown: watch::Receiver<bool>,
    outcomes: mpsc::Sender<JobOutcome>,
}

impl Slot {
    async fn run(mut self) {
        debug!(slot = self.index, "Worker slot started");

        while !*self.shutdown.borrow() {
            let job = match self.queue.lease(self.config.lease_timeout).await {
                Ok(Some(job)) => job,
                Ok(None) => {
                    if idle(&mut self.shutdown, self.config.poll_interval).await {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    warn!(slot = self.index, error = %e, "Failed to lease job");
                    if idle(&mut self.shutdown, self.config.broker_retry_delay).await {
                        break;
                    }
                    continue;
                }
            };

            self.process(job).await;
        }

        debug!(slot = self.index, "Worker slot stopped");
    }

    async fn process(&self, job: Job) {
        let job_id = job.id;
        if self.config.log_execution {
            info!(
                slot = self.index,
                job_id = %job_id,
                attempt = job.attempts_made,
                payload = %job.payload,
                "Processing job"
            );
        }

        let result = {
            let attempt = execute(self.handler.as_ref(), &job, self.config.job_timeout);
            let heartbeat = keep_alive(&self.queue, &job, self.config.lease_timeout);
            tokio::pin!(attempt, heartbeat);
            tokio::select! {
                result = &mut attempt => result,
                () = &mut heartbeat => attempt.await,
            }
        };

        match self.queue.settle(job, result).await {
            Ok(outcome) => {
                self.log_outcome(&outcome);
                if let Err(e) = self.outcomes.try_send(outcome) {
                    debug!(job_id = %job_id, error = %e, "Outcome not delivered");
                }
            }
            Err(QueueError::LeaseLost(_)) => {
                warn!(
                    slot = self.index,
                    job_id = %job_id,
                    "Lease was taken over, outcome dropped"
                );
            }
            Err(e) => {
                error!(
                    slot = self.index,
                    job_id = %job_id,
                    error = %e,
                    "Failed to settle job, lease left to expire"
                );
            }
        }
    }

    fn log_outcome(&self, outcome: &JobOutcome) {
        match outcome {
            JobOutcome::Completed { job, result } => {
                if self.config.log_execution {
                    info!(job_id = %job.id, result = %result, "Job completed successfully");
                }
            }
            JobOutcome::Retrying { job, error, .. } => {
                error!(job_id = %job.id, attempts = job.attempts_made, error = %error, "Job failed");
            }
            JobOutcome::DeadLettered { job, error, .. } => {
                error!(
                    job_id = %job.id,
                    attempts = job.attempts_made,
                    error = %error,
                    "Job failed after {} attempts",
                    job.attempts_made
                );
            }
        }
    }
}

/// Wait for `period` or shutdown. Returns `true` on shutdown.
async fn idle(shutdown: &mut watch::Receiver<bool>, period: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(period) => false,
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}

/// Extend the lease every third of its timeout. Returns once it is lost.
async fn keep_alive(queue: &JobQueue, job: &Job, lease_for: Duration) {
    let period = (lease_for / 3).max(Duration::from_millis(1));
    loop {
        tokio::time::sleep(period).await;
        match queue.extend_lease(job, lease_for).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(job_id = %job.id, "Lease lost while the job was running");
                return;
            }
            Err(e) => debug!(job_id = %job.id, error = %e, "Lease extension failed"),
        }
    }
}

async fn execute(handler: &dyn JobHandler, job: &Job, timeout: Option<Duration>) -> HandlerResult {
    let attempt = AssertUnwindSafe(handler.execute(job)).catch_unwind();

    let caught = match timeout {
        Some(limit) => match tokio::time::timeout(limit, attempt).await {
            Ok(caught) => caught,
            Err(_) => return Err(QueueError::Timeout),
        },
        None => attempt.await,
    };

    caught.unwrap_or_else(|panic| Err(QueueError::failed(panic_message(panic.as_ref()))))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("handler panicked: {detail}")
}

async fn reclaim_loop(queue: JobQueue, period: Duration, mut shutdown: watch::Receiver<bool>) {
    loop {
        if idle(&mut shutdown, period).await {
            break;
        }
        match queue.reclaim_expired_leases().await {
            Ok(0) => {}
            Ok(count) => warn!(queue = %queue.name(), count, "Reclaimed expired leases"),
            Err(e) => debug!(queue = %queue.name(), error = %e, "Lease reclaim failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::queue::{EnqueueOptions, QueueConfig};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_config() -> WorkerConfig {
        WorkerConfig {
            concurrency: 2,
            poll_interval: Duration::from_millis(10),
            log_execution: false,
            ..WorkerConfig::default()
        }
    }

    fn queue() -> JobQueue {
        JobQueue::new(Arc::new(MemoryBroker::new()), QueueConfig::default())
    }

    #[test]
    fn test_worker_config_defaults() {
        let config = WorkerConfig::default();
        assert_eq!(config.concurrency, 5);
        assert_eq!(config.lease_timeout, Duration::from_secs(300));
        assert!(config.job_timeout.is_none());
        assert!(config.log_execution);
    }

    #[test]
    fn test_worker_config_deserializes_millis() {
        let config: WorkerConfig =
            serde_json::from_value(json!({"concurrency": 8, "job_timeout": 1500}))
                .unwrap();
        assert_eq!(config.concurrency, 8);
        assert_eq!(config.job_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(config.poll_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "handler panicked: boom");

        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "handler panicked: owned");
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let mut pool = WorkerPool::with_config(
            queue(),
            handler_fn(|_job| async { Ok(json!({})) }),
            fast_config(),
        );

        pool.start().unwrap();
        assert!(matches!(pool.start(), Err(QueueError::WorkerAlreadyRunning)));
        pool.stop(Duration::from_secs(1)).await.unwrap();
        assert!(matches!(
            pool.stop(Duration::from_secs(1)).await,
            Err(QueueError::WorkerNotRunning)
        ));
    }

    #[tokio::test]
    async fn test_pool_processes_job() {
        let queue = queue();
        let mut pool = WorkerPool::with_config(
            queue.clone(),
            handler_fn(|job| async move { Ok(json!({"echo": job.payload["message"]})) }),
            fast_config(),
        );
        let mut outcomes = pool.outcomes().unwrap();
        assert!(pool.outcomes().is_none());

        queue
            .enqueue("task", json!({"message": "hi"}), EnqueueOptions::default())
            .await
            .unwrap();
        pool.start().unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(5), outcomes.recv())
            .await
            .unwrap()
            .unwrap();
        match outcome {
            JobOutcome::Completed { result, .. } => assert_eq!(result, json!({"echo": "hi"})),
            other => panic!("unexpected outcome: {other:?}"),
        }

        pool.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_panicking_handler_is_a_failure() {
        let queue = queue();
        let mut pool = WorkerPool::with_config(
            queue.clone(),
            handler_fn(|_job| async move {
                if true {
                    panic!("kaboom");
                }
                Ok(json!({}))
            }),
            fast_config(),
        );
        let mut outcomes = pool.outcomes().unwrap();

        queue
            .enqueue("task", json!({"message": "m"}), EnqueueOptions::default().max_attempts(1))
            .await
            .unwrap();
        pool.start().unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(5), outcomes.recv())
            .await
            .unwrap()
            .unwrap();
        match outcome {
            JobOutcome::DeadLettered { error, .. } => {
                assert_eq!(error, "handler panicked: kaboom")
            }
            other => panic!("unexpected outcome: {other:?}"),
        }

        pool.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_job_timeout() {
        let queue = queue();
        let config = WorkerConfig {
            job_timeout: Some(Duration::from_millis(20)),
            ..fast_config()
        };
        let mut pool = WorkerPool::with_config(
            queue.clone(),
            handler_fn(|_job| async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(json!({}))
            }),
            config,
        );
        let mut outcomes = pool.outcomes().unwrap();

        queue
            .enqueue("task", json!({"message": "m"}), EnqueueOptions::default().max_attempts(1))
            .await
            .unwrap();
        pool.start().unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(5), outcomes.recv())
            .await
            .unwrap()
            .unwrap();
        match outcome {
            JobOutcome::DeadLettered { error, .. } => assert_eq!(error, "Operation timeout"),
            other => panic!("unexpected outcome: {other:?}"),
        }

        pool.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_aborts_after_drain_window() {
        let queue = queue();
        let mut pool = WorkerPool::with_config(
            queue.clone(),
            handler_fn(|_job| async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(json!({}))
            }),
            fast_config(),
        );

        queue
            .enqueue("task", json!({"message": "m"}), EnqueueOptions::default())
            .await
            .unwrap();
        pool.start().unwrap();

        while queue.stats().await.unwrap().active_count == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let started = std::time::Instant::now();
        pool.stop(Duration::from_millis(50)).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!pool.is_running());
        assert_eq!(queue.stats().await.unwrap().active_count, 1);
    }

    #[tokio::test]
    async fn test_long_job_keeps_its_lease() {
        let queue = queue();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let handler = {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            handler_fn(move |_job| {
                let in_flight = in_flight.clone();
                let peak = peak.clone();
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(json!({}))
                }
            })
        };
        let config = WorkerConfig {
            lease_timeout: Duration::from_millis(50),
            ..fast_config()
        };
        let mut pool = WorkerPool::with_config(queue.clone(), handler, config);

        queue
            .enqueue("task", json!({"message": "slow"}), EnqueueOptions::default())
            .await
            .unwrap();
        pool.start().unwrap();
        tokio::time::sleep(Duration::from_millis(800)).await;
        pool.stop(Duration::from_secs(1)).await.unwrap();

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.completed_count, 1);
        assert_eq!(stats.dead_letter_count, 0);
        assert_eq!(stats.waiting_count + stats.active_count + stats.failed_count, 0);
    }
}
