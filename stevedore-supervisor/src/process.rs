//! Worker process command and exit records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use tokio::process::Command;

/// How to start one worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// Program to run
    pub binary_path: PathBuf,
    /// Command line arguments
    pub args: Vec<String>,
    /// Extra environment variables
    pub env_vars: HashMap<String, String>,
    /// Working directory
    pub working_dir: Option<PathBuf>,
}

impl ProcessConfig {
    /// Create a process configuration
    pub fn new(binary_path: impl Into<PathBuf>) -> Self {
        Self {
            binary_path: binary_path.into(),
            args: Vec::new(),
            env_vars: HashMap::new(),
            working_dir: None,
        }
    }

    /// Re-run the current executable with the given arguments.
    pub fn current_exe<I, S>(args: I) -> std::io::Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut config = Self::new(std::env::current_exe()?);
        config.args = args.into_iter().map(Into::into).collect();
        Ok(config)
    }

    /// Add a command line argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add an environment variable
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.insert(key.into(), value.into());
        self
    }

    /// Set the working directory
    pub fn working_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(path.into());
        self
    }

    pub(crate) fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary_path);
        cmd.args(&self.args)
            .envs(&self.env_vars)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        // Own process group: terminal signals reach only the supervisor,
        // which forwards SIGTERM itself.
        #[cfg(unix)]
        cmd.process_group(0);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

/// A worker process that exited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildExit {
    /// Slot the process occupied
    pub slot: usize,
    /// Process id
    pub pid: u32,
    /// Exit code, if it exited normally
    pub code: Option<i32>,
    /// Terminating signal number, if it was killed
    pub signal: Option<i32>,
    /// When the exit was observed
    pub at: DateTime<Utc>,
}

impl ChildExit {
    pub(crate) fn new(slot: usize, pid: u32, status: Option<ExitStatus>) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.and_then(|s| s.signal())
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            slot,
            pid,
            code: status.and_then(|s| s.code()),
            signal,
            at: Utc::now(),
        }
    }

    /// Whether the process exited with status 0.
    pub fn is_clean(&self) -> bool {
        self.code == Some(0)
    }
}

impl std::fmt::Display for ChildExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => f.write_str("unknown status"),
        }
    }
}
