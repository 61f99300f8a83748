//! Redis-backed broker.
//!
//! Per queue, under `{prefix}:{queue}:`:
//!
//! - `job:{id}` - job record as JSON
//! - `waiting` - sorted set, score = priority
//! - `delayed` - sorted set, score = visible-at (ms)
//! - `active` - sorted set, score = lease deadline (ms)
//! - `leases` - hash of job id to the token of the lease holding it
//! - `completed`, `dead` - bounded lists of recent ids
//! - `completed-count`, `dead-count` - lifetime counters
//!
//! Set members are `{priority}|{created_ns}|{id}`, so members sharing a
//! priority score sort by arrival.

use super::{Broker, DEFAULT_COMPLETED_RETENTION, DEFAULT_DEAD_RETENTION, QueueCounts, deadline_after};
use crate::error::{QueueError, QueueResult};
use crate::job::{Job, JobId, JobState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{AsyncCommands, Client, Script, aio::ConnectionManager};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Promote due delayed members, then move the head of `waiting` to `active`.
const LEASE_SCRIPT: &str = r"
local now = tonumber(ARGV[1])
local due = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', now)
for _, member in ipairs(due) do
  redis.call('ZREM', KEYS[2], member)
  local priority = tonumber(string.match(member, '^(-?%d+)|'))
  redis.call('ZADD', KEYS[1], priority, member)
end
local popped = redis.call('ZPOPMIN', KEYS[1])
if #popped == 0 then
  return false
end
redis.call('ZADD', KEYS[3], ARGV[2], popped[1])
return popped[1]
";

/// Release a lease only if the caller still holds it, then file the job.
///
/// With a fifth key the id is pushed onto the history list `KEYS[4]` and the
/// counter bumped; without one the member goes to the sorted set `KEYS[4]`.
const SETTLE_SCRIPT: &str = r"
if redis.call('HGET', KEYS[2], ARGV[1]) ~= ARGV[2] then
  return 0
end
redis.call('ZREM', KEYS[1], ARGV[3])
redis.call('HDEL', KEYS[2], ARGV[1])
redis.call('SET', KEYS[3], ARGV[4])
if KEYS[5] then
  redis.call('LPUSH', KEYS[4], ARGV[1])
  redis.call('INCR', KEYS[5])
else
  redis.call('ZADD', KEYS[4], ARGV[5], ARGV[3])
end
return 1
";

/// Move a held lease's deadline.
const EXTEND_SCRIPT: &str = r"
if redis.call('HGET', KEYS[2], ARGV[1]) ~= ARGV[2] then
  return 0
end
redis.call('ZADD', KEYS[1], 'XX', ARGV[4], ARGV[3])
return 1
";

/// Redis broker configuration.
#[derive(Debug, Clone)]
pub struct RedisBrokerConfig {
    /// Redis connection URL
    pub url: String,

    /// Prefix for every key
    pub key_prefix: String,

    /// Completed records kept per queue
    pub completed_retention: usize,

    /// Dead-lettered records kept per queue
    pub dead_retention: usize,
}

impl Default for RedisBrokerConfig {
    fn default() -> Self {
        Self::new("redis://127.0.0.1:6379")
    }
}

impl RedisBrokerConfig {
    /// Create a configuration for the given URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            key_prefix: "stevedore".to_string(),
            completed_retention: DEFAULT_COMPLETED_RETENTION,
            dead_retention: DEFAULT_DEAD_RETENTION,
        }
    }

    /// Build the URL from host, port and optional password.
    pub fn from_parts(host: &str, port: u16, password: Option<&str>) -> Self {
        let url = match password.filter(|p| !p.is_empty()) {
            Some(password) => format!("redis://:{password}@{host}:{port}"),
            None => format!("redis://{host}:{port}"),
        };
        Self::new(url)
    }

    /// Set the key prefix.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Set how many completed and dead-lettered records are kept.
    pub fn with_retention(mut self, completed: usize, dead: usize) -> Self {
        self.completed_retention = completed;
        self.dead_retention = dead;
        self
    }

    fn key(&self, queue: &str, suffix: &str) -> String {
        format!("{}:{}:{}", self.key_prefix, queue, suffix)
    }

    fn job_key(&self, queue: &str, id: JobId) -> String {
        self.key(queue, &format!("job:{id}"))
    }
}

fn member(job: &Job) -> String {
    let created = job.created_at.timestamp_nanos_opt().unwrap_or(i64::MAX);
    format!("{}|{:020}|{}", job.priority, created, job.id)
}

fn member_id(member: &str) -> Option<JobId> {
    member.rsplit('|').next().and_then(|id| id.parse().ok())
}

/// Last history index to keep, or `None` when nothing is retained.
fn history_stop(keep: usize) -> Option<isize> {
    keep.checked_sub(1).map(|last| last as isize)
}

/// Broker storing queues on a Redis server shared by every process.
#[derive(Clone)]
pub struct RedisBroker {
    connection: ConnectionManager,
    config: RedisBrokerConfig,
    lease_script: Script,
    settle_script: Script,
    extend_script: Script,
}

impl RedisBroker {
    /// Connect with default settings.
    pub async fn connect(url: impl Into<String>) -> QueueResult<Self> {
        Self::with_config(RedisBrokerConfig::new(url)).await
    }

    /// Connect with a custom configuration.
    pub async fn with_config(config: RedisBrokerConfig) -> QueueResult<Self> {
        debug!(prefix = %config.key_prefix, "Connecting Redis broker");

        let client = Client::open(config.url.as_str()).map_err(|e| QueueError::Config(e.to_string()))?;
        let connection = ConnectionManager::new(client).await?;

        info!(prefix = %config.key_prefix, "Redis broker ready");
        Ok(Self {
            connection,
            config,
            lease_script: Script::new(LEASE_SCRIPT),
            settle_script: Script::new(SETTLE_SCRIPT),
            extend_script: Script::new(EXTEND_SCRIPT),
        })
    }

    /// Configuration in use.
    pub fn config(&self) -> &RedisBrokerConfig {
        &self.config
    }

    async fn load(&self, queue: &str, id: JobId) -> QueueResult<Option<Job>> {
        let mut conn = self.connection.clone();
        let json: Option<String> = conn.get(self.config.job_key(queue, id)).await?;
        json.map(|json| {
            serde_json::from_str(&json).map_err(|e| QueueError::Deserialization(e.to_string()))
        })
        .transpose()
    }

    /// Compare-and-settle a lease. `counter` selects history or sorted set.
    async fn settle(
        &self,
        queue: &str,
        job: &Job,
        target: &str,
        counter: Option<&str>,
        score: i64,
    ) -> QueueResult<bool> {
        let Some(token) = job.lease_token else {
            return Ok(false);
        };
        let json = serde_json::to_string(job).map_err(|e| QueueError::Serialization(e.to_string()))?;

        let mut invocation = self.settle_script.prepare_invoke();
        invocation
            .key(self.config.key(queue, "active"))
            .key(self.config.key(queue, "leases"))
            .key(self.config.job_key(queue, job.id))
            .key(self.config.key(queue, target));
        if let Some(counter) = counter {
            invocation.key(self.config.key(queue, counter));
        }
        invocation
            .arg(job.id.to_string())
            .arg(token.to_string())
            .arg(member(job))
            .arg(json)
            .arg(score);

        let mut conn = self.connection.clone();
        let held: i32 = invocation.invoke_async(&mut conn).await?;
        if held == 0 {
            debug!(queue, job_id = %job.id, "Settle dropped, lease no longer held");
        }
        Ok(held == 1)
    }

    /// Settle into a bounded history list, then evict what falls off it.
    async fn finish(
        &self,
        queue: &str,
        job: &Job,
        history: &str,
        counter: &str,
        keep: usize,
    ) -> QueueResult<bool> {
        if !self.settle(queue, job, history, Some(counter), 0).await? {
            return Ok(false);
        }

        let history_key = self.config.key(queue, history);
        let mut conn = self.connection.clone();
        let evicted: Vec<String> = conn.lrange(&history_key, keep as isize, -1).await?;
        if evicted.is_empty() {
            return Ok(true);
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        match history_stop(keep) {
            Some(stop) => pipe.ltrim(&history_key, 0, stop).ignore(),
            None => pipe.del(&history_key).ignore(),
        };
        for id in evicted.iter().filter_map(|id| id.parse::<JobId>().ok()) {
            pipe.del(self.config.job_key(queue, id)).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(true)
    }

    async fn load_members(&self, queue: &str, members: Vec<String>) -> QueueResult<Vec<Job>> {
        let mut jobs = Vec::with_capacity(members.len());
        for member in members {
            let Some(id) = member_id(&member) else {
                warn!(queue, member = %member, "Skipping malformed queue member");
                continue;
            };
            if let Some(job) = self.load(queue, id).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn push(&self, queue: &str, job: &Job) -> QueueResult<JobId> {
        let json = serde_json::to_string(job).map_err(|e| QueueError::Serialization(e.to_string()))?;
        let mut conn = self.connection.clone();
        let mut pipe = redis::pipe();
        pipe.atomic().set(self.config.job_key(queue, job.id), json).ignore();

        if job.available_at <= Utc::now() {
            pipe.zadd(self.config.key(queue, "waiting"), member(job), job.priority)
                .ignore();
        } else {
            pipe.zadd(
                self.config.key(queue, "delayed"),
                member(job),
                job.available_at.timestamp_millis(),
            )
            .ignore();
        }

        let _: () = pipe.query_async(&mut conn).await?;
        Ok(job.id)
    }

    async fn lease(&self, queue: &str, lease_for: Duration) -> QueueResult<Option<Job>> {
        let mut conn = self.connection.clone();
        let leased: Option<String> = self
            .lease_script
            .key(self.config.key(queue, "waiting"))
            .key(self.config.key(queue, "delayed"))
            .key(self.config.key(queue, "active"))
            .arg(Utc::now().timestamp_millis())
            .arg(deadline_after(lease_for).timestamp_millis())
            .invoke_async(&mut conn)
            .await?;

        let Some(member) = leased else {
            return Ok(None);
        };
        let id = member_id(&member)
            .ok_or_else(|| QueueError::Broker(format!("malformed queue member: {member}")))?;

        let Some(mut job) = self.load(queue, id).await? else {
            warn!(queue, job_id = %id, "Leased member has no job record");
            let _: () = conn.zrem(self.config.key(queue, "active"), &member).await?;
            return Ok(None);
        };

        job.start_attempt();
        let json = serde_json::to_string(&job).map_err(|e| QueueError::Serialization(e.to_string()))?;
        let token = job.lease_token.map(|t| t.to_string()).unwrap_or_default();
        let _: () = redis::pipe()
            .atomic()
            .set(self.config.job_key(queue, id), json)
            .ignore()
            .hset(self.config.key(queue, "leases"), id.to_string(), token)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(Some(job))
    }

    async fn extend_lease(&self, queue: &str, job: &Job, lease_for: Duration) -> QueueResult<bool> {
        let Some(token) = job.lease_token else {
            return Ok(false);
        };
        let mut conn = self.connection.clone();
        let held: i32 = self
            .extend_script
            .key(self.config.key(queue, "active"))
            .key(self.config.key(queue, "leases"))
            .arg(job.id.to_string())
            .arg(token.to_string())
            .arg(member(job))
            .arg(deadline_after(lease_for).timestamp_millis())
            .invoke_async(&mut conn)
            .await?;
        Ok(held == 1)
    }

    async fn ack(&self, queue: &str, job: &Job) -> QueueResult<bool> {
        self.finish(queue, job, "completed", "completed-count", self.config.completed_retention)
            .await
    }

    async fn schedule_visibility(
        &self,
        queue: &str,
        job: &Job,
        not_before: DateTime<Utc>,
    ) -> QueueResult<bool> {
        let mut job = job.clone();
        job.available_at = not_before;
        self.settle(queue, &job, "delayed", None, not_before.timestamp_millis())
            .await
    }

    async fn bury(&self, queue: &str, job: &Job) -> QueueResult<bool> {
        self.finish(queue, job, "dead", "dead-count", self.config.dead_retention)
            .await
    }

    async fn expired_leases(&self, queue: &str) -> QueueResult<Vec<Job>> {
        let mut conn = self.connection.clone();
        let expired: Vec<String> = conn
            .zrangebyscore(
                self.config.key(queue, "active"),
                "-inf",
                Utc::now().timestamp_millis(),
            )
            .await?;

        self.load_members(queue, expired).await
    }

    async fn get(&self, queue: &str, id: JobId) -> QueueResult<Option<Job>> {
        self.load(queue, id).await
    }

    async fn list(&self, queue: &str, state: JobState, limit: usize) -> QueueResult<Vec<Job>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let stop = limit as isize - 1;
        let mut conn = self.connection.clone();

        let ids: Vec<String> = match state {
            JobState::Waiting => conn.zrange(self.config.key(queue, "waiting"), 0, stop).await?,
            JobState::Failed => conn.zrange(self.config.key(queue, "delayed"), 0, stop).await?,
            JobState::Active => conn.zrange(self.config.key(queue, "active"), 0, stop).await?,
            JobState::Completed => conn.lrange(self.config.key(queue, "completed"), 0, stop).await?,
            JobState::InDeadLetter => conn.lrange(self.config.key(queue, "dead"), 0, stop).await?,
        };

        let mut jobs = self.load_members(queue, ids).await?;
        if state == JobState::Waiting {
            // Promoted jobs keep their failed record until the next lease.
            jobs.iter_mut().for_each(Job::readmit);
        }
        Ok(jobs)
    }

    async fn list_newest(&self, queue: &str, limit: usize) -> QueueResult<Vec<Job>> {
        let Some(stop) = history_stop(limit) else {
            return Ok(Vec::new());
        };
        let mut conn = self.connection.clone();
        let ids: Vec<String> = conn.zrevrange(self.config.key(queue, "waiting"), 0, stop).await?;

        let mut jobs = self.load_members(queue, ids).await?;
        jobs.iter_mut().for_each(Job::readmit);
        Ok(jobs)
    }

    async fn counts(&self, queue: &str) -> QueueResult<QueueCounts> {
        let mut conn = self.connection.clone();
        let (waiting, active, failed, completed, dead): (usize, usize, usize, Option<usize>, Option<usize>) =
            redis::pipe()
                .zcard(self.config.key(queue, "waiting"))
                .zcard(self.config.key(queue, "active"))
                .zcard(self.config.key(queue, "delayed"))
                .get(self.config.key(queue, "completed-count"))
                .get(self.config.key(queue, "dead-count"))
                .query_async(&mut conn)
                .await?;

        Ok(QueueCounts {
            waiting,
            active,
            completed: completed.unwrap_or(0),
            failed,
            dead: dead.unwrap_or(0),
        })
    }

    async fn ping(&self) -> QueueResult<()> {
        let mut conn = self.connection.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = RedisBrokerConfig::default();
        assert_eq!(config.url, "redis://127.0.0.1:6379");
        assert_eq!(config.key_prefix, "stevedore");
        assert_eq!(config.completed_retention, 10);
        assert_eq!(config.dead_retention, 5);
    }

    #[test]
    fn test_config_from_parts() {
        let plain = RedisBrokerConfig::from_parts("redis", 6380, None);
        assert_eq!(plain.url, "redis://redis:6380");

        let secured = RedisBrokerConfig::from_parts("localhost", 6379, Some("s3cret"));
        assert_eq!(secured.url, "redis://:s3cret@localhost:6379");

        let empty = RedisBrokerConfig::from_parts("localhost", 6379, Some(""));
        assert_eq!(empty.url, "redis://localhost:6379");
    }

    #[test]
    fn test_key_layout() {
        let config = RedisBrokerConfig::default().with_key_prefix("app");
        assert_eq!(config.key("dummy-jobs", "waiting"), "app:dummy-jobs:waiting");
        assert!(config.job_key("q", JobId::nil()).starts_with("app:q:job:"));
    }

    #[test]
    fn test_member_ordering_within_priority() {
        let first = Job::new("q", "a", serde_json::json!({}));
        let mut second = Job::new("q", "b", serde_json::json!({}));
        second.created_at = first.created_at + chrono::Duration::milliseconds(1);

        assert!(member(&first) < member(&second));
        assert_eq!(member_id(&member(&first)), Some(first.id));
    }

    #[test]
    fn test_history_stop() {
        assert_eq!(history_stop(0), None);
        assert_eq!(history_stop(1), Some(0));
        assert_eq!(history_stop(10), Some(9));
    }

    #[test]
    fn test_member_with_negative_priority() {
        let job = Job::new("q", "a", serde_json::json!({})).with_priority(-3);
        let m = member(&job);
        assert!(m.starts_with("-3|"));
        assert_eq!(member_id(&m), Some(job.id));
        assert_eq!(member_id("garbage"), None);
    }
}
