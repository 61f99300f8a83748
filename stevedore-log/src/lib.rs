//! Logging for Stevedore.
//!
//! Installs a `tracing` subscriber writing to stdout and, optionally, to
//! daily-rotated files. JSON is the default format on both outputs.
//!
//! # Examples
//!
//! ```no_run
//! use stevedore_log::*;
//!
//! let _guard = LogConfig::for_environment("production")
//!     .directory("logs")
//!     .init();
//!
//! info!(pid = std::process::id(), "Server started");
//! ```
//!
//! `RUST_LOG` takes precedence over the configured level when set.

use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;
use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub use tracing::{debug, error, info, trace, warn};

/// Rotated log files kept on disk by default.
pub const DEFAULT_MAX_FILES: usize = 14;

/// Errors raised while installing the subscriber.
#[derive(Debug, Error)]
pub enum LogError {
    /// The log directory or rolling appender could not be created
    #[error("Failed to set up log file: {0}")]
    Appender(String),

    /// A global subscriber is already installed
    #[error("Logging already initialized: {0}")]
    AlreadyInitialized(String),
}

/// Log level for filtering messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Most verbose - shows all logs
    Trace,
    /// Debug information for development
    Debug,
    /// General information about application flow
    Info,
    /// Warning messages for potential issues
    Warn,
    /// Error messages for failures
    Error,
}

impl LogLevel {
    /// Convert to string for EnvFilter
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    /// `info` in production, `debug` everywhere else.
    pub fn for_environment(environment: &str) -> Self {
        if environment.eq_ignore_ascii_case("production") {
            LogLevel::Info
        } else {
            LogLevel::Debug
        }
    }
}

/// Output format for log messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON format (default) - structured, machine-readable
    Json,
    /// Pretty format - multi-line, for development
    Pretty,
    /// Compact format - minimal output
    Compact,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level filter
    pub level: LogLevel,
    /// Output format of both outputs
    pub format: LogFormat,
    /// Write to stdout
    pub console: bool,
    /// Directory of the daily-rotated files; `None` disables file output
    pub directory: Option<PathBuf>,
    /// File name prefix, files are named `<prefix>.<date>.log`
    pub file_prefix: String,
    /// Rotated files kept on disk
    pub max_files: usize,
    /// Include target (module path)
    pub targets: bool,
    /// Enable ANSI colors on the console (ignored for JSON)
    pub colors: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Json,
            console: true,
            directory: None,
            file_prefix: "stevedore".to_string(),
            max_files: DEFAULT_MAX_FILES,
            targets: true,
            colors: false,
        }
    }
}

/// Keeps the background writers alive. Logs are flushed when dropped.
#[derive(Default)]
#[must_use = "dropping the guard stops log output"]
pub struct LogGuard {
    guards: Vec<WorkerGuard>,
}

impl LogGuard {
    /// Number of active writers.
    pub fn writers(&self) -> usize {
        self.guards.len()
    }
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

impl LogConfig {
    /// Create a logging configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults with the level picked from the environment name.
    pub fn for_environment(environment: &str) -> Self {
        Self::default().level(LogLevel::for_environment(environment))
    }

    /// Set log level
    pub fn level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    /// Set output format
    pub fn format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Enable or disable stdout output
    pub fn console(mut self, enable: bool) -> Self {
        self.console = enable;
        self
    }

    /// Write daily-rotated files into `directory`
    pub fn directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.directory = Some(directory.into());
        self
    }

    /// Set the file name prefix
    pub fn file_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.file_prefix = prefix.into();
        self
    }

    /// Set how many rotated files are kept
    pub fn max_files(mut self, max_files: usize) -> Self {
        self.max_files = max_files;
        self
    }

    /// Filter built from `RUST_LOG`, or from the configured level.
    pub fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(self.level.as_str()))
    }

    /// Daily-rotating appender for the configured directory.
    pub fn file_appender(&self) -> Result<Option<RollingFileAppender>, LogError> {
        let Some(directory) = &self.directory else {
            return Ok(None);
        };
        std::fs::create_dir_all(directory).map_err(|e| LogError::Appender(e.to_string()))?;

        RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix(&self.file_prefix)
            .filename_suffix("log")
            .max_log_files(self.max_files.max(1))
            .build(directory)
            .map(Some)
            .map_err(|e| LogError::Appender(e.to_string()))
    }

    /// Install the global subscriber.
    ///
    /// On failure the error is printed to stderr and an empty guard is
    /// returned, so the process keeps running without logs.
    pub fn init(self) -> LogGuard {
        self.try_init().unwrap_or_else(|e| {
            eprintln!("stevedore-log: {e}");
            LogGuard::default()
        })
    }

    /// Install the global subscriber, reporting any failure.
    pub fn try_init(self) -> Result<LogGuard, LogError> {
        let mut guards = Vec::new();
        let mut layers: Vec<BoxedLayer> = Vec::new();

        if self.console {
            let (writer, guard) = tracing_appender::non_blocking(io::stdout());
            layers.push(self.layer(writer, self.colors));
            guards.push(guard);
        }

        if let Some(appender) = self.file_appender()? {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            layers.push(self.layer(writer, false));
            guards.push(guard);
        }

        tracing_subscriber::registry()
            .with(layers)
            .with(self.env_filter())
            .try_init()
            .map_err(|e| LogError::AlreadyInitialized(e.to_string()))?;

        Ok(LogGuard { guards })
    }

    fn layer<W>(&self, writer: W, ansi: bool) -> BoxedLayer
    where
        W: for<'a> fmt::MakeWriter<'a> + Send + Sync + 'static,
    {
        let layer = fmt::layer().with_writer(writer).with_target(self.targets);
        match self.format {
            LogFormat::Json => layer.json().with_ansi(false).boxed(),
            LogFormat::Pretty => layer.pretty().with_ansi(ansi).boxed(),
            LogFormat::Compact => layer.compact().with_ansi(ansi).boxed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_string() {
        assert_eq!(LogLevel::Trace.as_str(), "trace");
        assert_eq!(LogLevel::Debug.as_str(), "debug");
        assert_eq!(LogLevel::Info.as_str(), "info");
        assert_eq!(LogLevel::Warn.as_str(), "warn");
        assert_eq!(LogLevel::Error.as_str(), "error");
    }

    #[test]
    fn test_level_for_environment() {
        assert_eq!(LogLevel::for_environment("production"), LogLevel::Info);
        assert_eq!(LogLevel::for_environment("PRODUCTION"), LogLevel::Info);
        assert_eq!(LogLevel::for_environment("development"), LogLevel::Debug);
        assert_eq!(LogLevel::for_environment(""), LogLevel::Debug);
    }

    #[test]
    fn test_default_config() {
        let config = LogConfig::default();
        assert_eq!(config.level, LogLevel::Info);
        assert_eq!(config.format, LogFormat::Json);
        assert!(config.console);
        assert!(config.directory.is_none());
        assert_eq!(config.max_files, 14);
        assert_eq!(config.file_prefix, "stevedore");
    }

    #[test]
    fn test_config_builder() {
        let config = LogConfig::for_environment("development")
            .format(LogFormat::Pretty)
            .console(false)
            .directory("/tmp/logs")
            .max_files(3);

        assert_eq!(config.level, LogLevel::Debug);
        assert_eq!(config.format, LogFormat::Pretty);
        assert!(!config.console);
        assert_eq!(config.directory, Some(PathBuf::from("/tmp/logs")));
        assert_eq!(config.max_files, 3);
    }

    #[test]
    fn test_config_deserializes_partial() {
        let config: LogConfig =
            serde_json::from_str(r#"{"level": "warn", "format": "compact"}"#).unwrap();
        assert_eq!(config.level, LogLevel::Warn);
        assert_eq!(config.format, LogFormat::Compact);
        assert!(config.console);
    }

    #[test]
    fn test_file_appender_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("nested").join("logs");

        let config = LogConfig::default().directory(&logs);
        assert!(config.file_appender().unwrap().is_some());
        assert!(logs.is_dir());
    }

    #[test]
    fn test_no_directory_no_appender() {
        assert!(LogConfig::default().file_appender().unwrap().is_none());
    }
}
