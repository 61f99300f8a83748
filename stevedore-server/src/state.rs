//! Shared request state.

use std::time::Instant;
use stevedore_queue::JobQueue;

/// Name given to every job submitted over HTTP.
pub const JOB_NAME: &str = "process-dummy-data";

/// Maximum number of records returned by the dead-letter listing.
pub const DEAD_LETTER_LIMIT: usize = 50;

/// State shared by every connection of one instance.
#[derive(Clone)]
pub struct AppState {
    /// Queue the routes enqueue to and report on
    pub queue: JobQueue,
    /// Process id, reported by `/health` and job results
    pub pid: u32,
    started: Instant,
}

impl AppState {
    /// Wrap `queue`, starting the uptime clock now.
    pub fn new(queue: JobQueue) -> Self {
        Self {
            queue,
            pid: std::process::id(),
            started: Instant::now(),
        }
    }

    /// Seconds since the instance started.
    pub fn uptime(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }
}
