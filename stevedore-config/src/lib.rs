//! Configuration for Stevedore.
//!
//! [`AppConfig`] is assembled from these layers, each overriding the last:
//!
//! 1. compiled defaults
//! 2. a TOML or JSON file (`--config` or `STEVEDORE_CONFIG`)
//! 3. a `.env` file in the working directory
//! 4. `PORT`, `LOG_DIR`, `NODE_ENV`, `REDIS_HOST`, `REDIS_PORT`, `REDIS_PASSWORD`
//! 5. `STEVEDORE_<SECTION>__<KEY>` variables, e.g. `STEVEDORE_WORKER__CONCURRENCY=8`
//!
//! ```
//! use stevedore_config::{AppConfig, EnvLoader};
//!
//! let env = EnvLoader::from_vars(None, [("PORT", "8080")]);
//! let config = AppConfig::load_with(None, &env).unwrap();
//! assert_eq!(config.server.port, 8080);
//! ```

pub mod env;
pub mod error;
pub mod loader;
pub mod validation;

pub use env::EnvLoader;
pub use error::{ConfigError, Result};
pub use loader::{ConfigLoader, FileFormat, merge};
pub use validation::{ConfigValidator, Validate};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use stevedore_log::{LogConfig, LogFormat, LogLevel};
use stevedore_queue::{BackoffPolicy, QueueConfig, RedisBrokerConfig, WorkerConfig};

/// Prefix of override variables.
pub const ENV_PREFIX: &str = "STEVEDORE";

/// Variable naming the configuration file.
pub const CONFIG_PATH_VAR: &str = "STEVEDORE_CONFIG";

/// HTTP listener settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Window given to in-flight jobs when an instance shuts down
    pub drain_timeout_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            drain_timeout_ms: 5000,
        }
    }
}

impl ServerSettings {
    /// `host:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// Redis connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisSettings {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub key_prefix: String,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            password: None,
            key_prefix: "stevedore".to_string(),
        }
    }
}

/// Which broker backs the queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    /// Shared Redis server
    #[default]
    Redis,
    /// Process-local, state lost on exit
    Memory,
}

/// Queue settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub broker: BrokerKind,
    pub name: String,
    pub dead_letter_name: String,
    pub max_attempts: u32,
    pub backoff_delay_ms: u64,
    pub backoff_jitter: f64,
    pub completed_retention: usize,
    pub dead_retention: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        let queue = QueueConfig::default();
        Self {
            broker: BrokerKind::Redis,
            name: queue.name,
            dead_letter_name: queue.dead_letter_name,
            max_attempts: queue.default_max_attempts,
            backoff_delay_ms: queue.default_backoff.delay_ms,
            backoff_jitter: 0.0,
            completed_retention: 10,
            dead_retention: 5,
        }
    }
}

/// Demo job handler settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandlerSettings {
    /// Simulated work per job
    pub processing_delay_ms: u64,
    /// Probability in `[0, 1]` that a job fails on its own
    pub failure_rate: f64,
}

impl Default for HandlerSettings {
    fn default() -> Self {
        Self {
            processing_delay_ms: 2000,
            failure_rate: 0.0,
        }
    }
}

/// Process supervisor settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSettings {
    /// Instances to run; 0 means one per CPU core
    pub workers: usize,
    pub restart_delay_ms: u64,
    pub shutdown_timeout_ms: u64,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            workers: 0,
            restart_delay_ms: 0,
            shutdown_timeout_ms: 10_000,
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Unset means `info` in production, `debug` otherwise
    pub level: Option<LogLevel>,
    pub format: LogFormat,
    pub console: bool,
    /// Unset disables file output
    pub directory: Option<PathBuf>,
    pub max_files: usize,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: None,
            format: LogFormat::Json,
            console: true,
            directory: Some(PathBuf::from("logs")),
            max_files: stevedore_log::DEFAULT_MAX_FILES,
        }
    }
}

/// Complete application configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub environment: String,
    pub server: ServerSettings,
    pub redis: RedisSettings,
    pub queue: QueueSettings,
    pub worker: WorkerConfig,
    pub handler: HandlerSettings,
    pub supervisor: SupervisorSettings,
    pub logging: LoggingSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            environment: "development".to_string(),
            server: ServerSettings::default(),
            redis: RedisSettings::default(),
            queue: QueueSettings::default(),
            worker: WorkerConfig::default(),
            handler: HandlerSettings::default(),
            supervisor: SupervisorSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl AppConfig {
    /// Load from every layer, reading `.env` and the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        // A missing .env is normal.
        dotenvy::dotenv().ok();
        let env = EnvLoader::new(Some(ENV_PREFIX.to_string()));
        Self::load_with(path, &env)
    }

    /// Load using the given environment snapshot.
    pub fn load_with(path: Option<&Path>, env: &EnvLoader) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| env.raw(CONFIG_PATH_VAR).map(PathBuf::from));

        let file = match path {
            Some(path) => Some(ConfigLoader::auto(&path)?.load_file(&path)?),
            None => None,
        };

        Self::resolve(file, env)
    }

    /// Layer a parsed file and environment over the defaults, then validate.
    pub fn resolve(file: Option<Value>, env: &EnvLoader) -> Result<Self> {
        let mut value = serde_json::to_value(Self::default())
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        if let Some(file) = file {
            merge(&mut value, file);
        }
        apply_service_env(&mut value, env)?;
        apply_overrides(&mut value, env)?;

        let config: Self =
            serde_json::from_value(value).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Whether the instance runs in production mode.
    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    /// Logging configuration for this environment.
    pub fn log_config(&self) -> LogConfig {
        let mut config = LogConfig::for_environment(&self.environment)
            .format(self.logging.format)
            .console(self.logging.console)
            .max_files(self.logging.max_files);
        if let Some(level) = self.logging.level {
            config = config.level(level);
        }
        config.directory = self.logging.directory.clone();
        config
    }

    /// Main queue configuration.
    pub fn queue_config(&self) -> QueueConfig {
        let backoff = BackoffPolicy::exponential(Duration::from_millis(self.queue.backoff_delay_ms))
            .with_jitter(self.queue.backoff_jitter);
        QueueConfig::new(&self.queue.name)
            .with_dead_letter_name(&self.queue.dead_letter_name)
            .with_default_max_attempts(self.queue.max_attempts)
            .with_default_backoff(backoff)
    }

    /// Redis broker configuration.
    pub fn redis_broker_config(&self) -> RedisBrokerConfig {
        RedisBrokerConfig::from_parts(
            &self.redis.host,
            self.redis.port,
            self.redis.password.as_deref(),
        )
        .with_key_prefix(&self.redis.key_prefix)
        .with_retention(self.queue.completed_retention, self.queue.dead_retention)
    }

    /// Instances the supervisor runs: the configured count or one per core.
    pub fn worker_count(&self) -> usize {
        if self.supervisor.workers > 0 {
            return self.supervisor.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

impl Validate for AppConfig {
    fn validate(&self) -> Result<()> {
        ConfigValidator::is_port(self.server.port, "server.port")?;
        ConfigValidator::is_port(self.redis.port, "redis.port")?;
        ConfigValidator::not_empty(&self.queue.name, "queue.name")?;
        ConfigValidator::not_empty(&self.queue.dead_letter_name, "queue.dead_letter_name")?;
        if self.queue.name == self.queue.dead_letter_name {
            return Err(ConfigError::ValidationError(
                "queue.dead_letter_name must differ from queue.name".to_string(),
            ));
        }
        ConfigValidator::positive(self.queue.max_attempts as u64, "queue.max_attempts")?;
        ConfigValidator::positive(self.queue.completed_retention as u64, "queue.completed_retention")?;
        ConfigValidator::positive(self.queue.dead_retention as u64, "queue.dead_retention")?;
        ConfigValidator::positive(self.worker.concurrency as u64, "worker.concurrency")?;
        ConfigValidator::in_range(self.handler.failure_rate, 0.0, 1.0, "handler.failure_rate")?;
        ConfigValidator::in_range(self.queue.backoff_jitter, 0.0, 1.0, "queue.backoff_jitter")?;
        Ok(())
    }
}

fn set_path(root: &mut Value, path: &[&str], new: Value) {
    let mut node = root;
    for segment in path {
        if !node.is_object() {
            *node = Value::Object(serde_json::Map::new());
        }
        let Value::Object(map) = node else {
            return;
        };
        node = map.entry(segment.to_string()).or_insert(Value::Null);
    }
    *node = new;
}

fn get_path<'a>(root: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(root, |node, segment| node.get(*segment))
}

fn parse_port(name: &str, raw: &str) -> Result<Value> {
    raw.trim()
        .parse::<u16>()
        .map(Value::from)
        .map_err(|e| ConfigError::InvalidValue {
            key: name.to_string(),
            message: e.to_string(),
        })
}

/// The variables the service has always honoured.
fn apply_service_env(value: &mut Value, env: &EnvLoader) -> Result<()> {
    if let Some(port) = env.raw("PORT") {
        set_path(value, &["server", "port"], parse_port("PORT", port)?);
    }
    if let Some(dir) = env.raw("LOG_DIR") {
        set_path(value, &["logging", "directory"], Value::from(dir));
    }
    if let Some(environment) = env.raw("NODE_ENV") {
        set_path(value, &["environment"], Value::from(environment));
    }
    if let Some(host) = env.raw("REDIS_HOST") {
        set_path(value, &["redis", "host"], Value::from(host));
    }
    if let Some(port) = env.raw("REDIS_PORT") {
        set_path(value, &["redis", "port"], parse_port("REDIS_PORT", port)?);
    }
    if let Some(password) = env.raw("REDIS_PASSWORD") {
        set_path(value, &["redis", "password"], Value::from(password));
    }
    Ok(())
}

/// `STEVEDORE_<SECTION>__<KEY>` overrides.
///
/// A value replacing a string stays a string; anything else is read as
/// JSON first, so numbers and booleans keep their type.
fn apply_overrides(value: &mut Value, env: &EnvLoader) -> Result<()> {
    let mut overrides: Vec<(String, String)> = env.load()?.into_iter().collect();
    overrides.sort();

    for (key, raw) in overrides {
        if key != "environment" && !key.contains("__") {
            continue;
        }
        let path: Vec<&str> = key.split("__").collect();
        let keep_string = matches!(get_path(value, &path), Some(Value::String(_)));
        let new = if keep_string {
            Value::String(raw)
        } else {
            serde_json::from_str(&raw).unwrap_or(Value::String(raw))
        };
        set_path(value, &path, new);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn env(vars: &[(&str, &str)]) -> EnvLoader {
        EnvLoader::from_vars(Some(ENV_PREFIX.to_string()), vars.iter().copied())
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::resolve(None, &env(&[])).unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.redis.host, "localhost");
        assert_eq!(config.redis.port, 6379);
        assert_eq!(config.queue.name, "dummy-jobs");
        assert_eq!(config.worker.concurrency, 5);
        assert_eq!(config.handler.failure_rate, 0.0);
        assert_eq!(config.logging.directory, Some(PathBuf::from("logs")));
    }

    #[test]
    fn test_service_env_vars() {
        let config = AppConfig::resolve(
            None,
            &env(&[
                ("PORT", "8080"),
                ("LOG_DIR", "/var/log/stevedore"),
                ("NODE_ENV", "production"),
                ("REDIS_HOST", "redis"),
                ("REDIS_PORT", "6380"),
                ("REDIS_PASSWORD", "12345"),
            ]),
        )
        .unwrap();

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.logging.directory, Some(PathBuf::from("/var/log/stevedore")));
        assert!(config.is_production());
        assert_eq!(config.redis.host, "redis");
        assert_eq!(config.redis.port, 6380);
        assert_eq!(config.redis.password.as_deref(), Some("12345"));
        assert_eq!(config.redis_broker_config().url, "redis://:12345@redis:6380");
    }

    #[test]
    fn test_invalid_port() {
        let err = AppConfig::resolve(None, &env(&[("PORT", "http")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_prefixed_overrides_win() {
        let file = json!({"worker": {"concurrency": 2}, "server": {"port": 9000}});
        let config = AppConfig::resolve(
            Some(file),
            &env(&[
                ("PORT", "8080"),
                ("STEVEDORE_SERVER__PORT", "7000"),
                ("STEVEDORE_WORKER__CONCURRENCY", "8"),
                ("STEVEDORE_WORKER__JOB_TIMEOUT", "1500"),
                ("STEVEDORE_QUEUE__BROKER", "memory"),
                ("STEVEDORE_SERVER__HOST", "127.0.0.1"),
            ]),
        )
        .unwrap();

        assert_eq!(config.server.port, 7000);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.worker.concurrency, 8);
        assert_eq!(config.worker.job_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(config.queue.broker, BrokerKind::Memory);
    }

    #[test]
    fn test_file_layer() {
        let file = json!({"handler": {"failure_rate": 0.1}, "supervisor": {"workers": 3}});
        let config = AppConfig::resolve(Some(file), &env(&[])).unwrap();
        assert_eq!(config.handler.failure_rate, 0.1);
        assert_eq!(config.worker_count(), 3);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        for file in [
            json!({"worker": {"concurrency": 0}}),
            json!({"queue": {"max_attempts": 0}}),
            json!({"queue": {"completed_retention": 0}}),
            json!({"queue": {"dead_retention": 0}}),
            json!({"handler": {"failure_rate": 1.5}}),
            json!({"queue": {"name": ""}}),
            json!({"queue": {"dead_letter_name": "dummy-jobs"}}),
            json!({"server": {"port": 0}}),
        ] {
            let err = AppConfig::resolve(Some(file.clone()), &env(&[])).unwrap_err();
            assert!(matches!(err, ConfigError::ValidationError(_)), "{file}");
        }
    }

    #[test]
    fn test_log_config_follows_environment() {
        let mut config = AppConfig::default();
        assert_eq!(config.log_config().level, LogLevel::Debug);

        config.environment = "production".to_string();
        assert_eq!(config.log_config().level, LogLevel::Info);

        config.logging.level = Some(LogLevel::Warn);
        assert_eq!(config.log_config().level, LogLevel::Warn);
        assert_eq!(config.log_config().directory, Some(PathBuf::from("logs")));
    }

    #[test]
    fn test_queue_config_conversion() {
        let mut config = AppConfig::default();
        config.queue.backoff_delay_ms = 500;
        config.queue.max_attempts = 4;

        let queue = config.queue_config();
        assert_eq!(queue.name, "dummy-jobs");
        assert_eq!(queue.dead_letter_name, "dead-letter-queue");
        assert_eq!(queue.default_max_attempts, 4);
        assert_eq!(queue.default_backoff.delay_for(2), Duration::from_millis(1000));
    }

    #[test]
    fn test_worker_count_auto() {
        let config = AppConfig::default();
        assert!(config.worker_count() >= 1);
    }
}
