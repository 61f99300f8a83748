//! Job lifecycle engine for Stevedore.
//!
//! Provides:
//! - 📦 Durable queues behind a pluggable [`Broker`] (Redis or in-memory)
//! - 🔄 Automatic retries with exponential backoff
//! - ⭐ Integer job priorities
//! - 💀 Dead letter queue
//! - 👷 Worker pools with bounded concurrency and lease reclaim
//!
//! ## Job Creation
//!
//! ```
//! use stevedore_queue::{Job, JobState};
//! use serde_json::json;
//!
//! let job = Job::new("dummy-jobs", "process-dummy-data", json!({"message": "hello"}));
//!
//! assert_eq!(job.queue, "dummy-jobs");
//! assert_eq!(job.state, JobState::Waiting);
//! assert_eq!(job.max_attempts, 3);
//! ```
//!
//! ## Complete Example
//!
//! ```no_run
//! use stevedore_queue::prelude::*;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), QueueError> {
//!     let broker = RedisBroker::connect("redis://localhost:6379").await?;
//!     let queue = JobQueue::new(Arc::new(broker), QueueConfig::default());
//!
//!     queue
//!         .enqueue(
//!             "process-dummy-data",
//!             serde_json::json!({"message": "hello"}),
//!             EnqueueOptions::default(),
//!         )
//!         .await?;
//!
//!     let mut pool = WorkerPool::new(
//!         queue,
//!         handler_fn(|job| async move { Ok(job.payload.clone()) }),
//!     );
//!     pool.start()?;
//!
//!     tokio::signal::ctrl_c().await.ok();
//!     pool.stop(Duration::from_secs(10)).await?;
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod broker;
pub mod dead_letter;
pub mod error;
pub mod job;
pub mod queue;
pub mod worker;

pub use backoff::{BackoffKind, BackoffPolicy, next_delay};
pub use broker::{Broker, MemoryBroker, QueueCounts, RedisBroker, RedisBrokerConfig};
pub use dead_letter::DeadLetterRecord;
pub use error::{QueueError, QueueResult};
pub use job::{Job, JobData, JobId, JobState};
pub use queue::{EnqueueOptions, HandlerResult, JobOutcome, JobQueue, QueueConfig, QueueStats};
pub use worker::{JobHandler, WorkerConfig, WorkerPool, handler_fn};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::backoff::BackoffPolicy;
    pub use crate::broker::{Broker, MemoryBroker, RedisBroker};
    pub use crate::error::{QueueError, QueueResult};
    pub use crate::job::{Job, JobData, JobId, JobState};
    pub use crate::queue::{EnqueueOptions, HandlerResult, JobOutcome, JobQueue, QueueConfig};
    pub use crate::worker::{JobHandler, WorkerConfig, WorkerPool, handler_fn};
}
