//! Worker process supervision.

use crate::error::{Result, SupervisorError};
use crate::listener::{LISTEN_FD_VAR, WORKER_SLOT_VAR};
use crate::process::{ChildExit, ProcessConfig};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::TcpListener;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Supervisor configuration.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Number of worker processes to keep alive
    pub workers: usize,
    /// Pause before replacing a crashed worker
    pub restart_delay: Duration,
    /// How long workers get to exit after SIGTERM before SIGKILL
    pub shutdown_timeout: Duration,
    /// Worker command
    pub command: ProcessConfig,
}

impl SupervisorConfig {
    /// Run `workers` copies of `command`, restarting immediately and
    /// allowing 10 seconds for shutdown.
    pub fn new(workers: usize, command: ProcessConfig) -> Self {
        Self {
            workers,
            restart_delay: Duration::ZERO,
            shutdown_timeout: Duration::from_secs(10),
            command,
        }
    }

    /// Wait this long before replacing a worker that exited.
    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    /// Grace period between SIGTERM and SIGKILL on shutdown.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Summary of a finished supervision run.
#[derive(Debug, Clone, Default)]
pub struct SupervisorReport {
    /// Processes started, restarts included
    pub spawned: usize,
    /// Processes started to replace a crashed one
    pub restarts: usize,
    /// Every exit observed, in order
    pub exits: Vec<ChildExit>,
}

struct Shared {
    shutdown: watch::Sender<bool>,
    restarts: AtomicUsize,
    pids: Mutex<HashMap<usize, u32>>,
}

/// Cloneable control handle for a running [`Supervisor`].
#[derive(Clone)]
pub struct SupervisorHandle {
    shared: Arc<Shared>,
}

impl SupervisorHandle {
    /// Ask the supervisor to stop its workers and return.
    pub fn shutdown(&self) {
        self.shared.shutdown.send_replace(true);
    }

    /// Whether shutdown has been requested.
    pub fn is_shutting_down(&self) -> bool {
        *self.shared.shutdown.borrow()
    }

    /// Number of crash restarts so far.
    pub fn restarts(&self) -> usize {
        self.shared.restarts.load(Ordering::SeqCst)
    }

    /// Live worker pids, ordered by slot.
    pub fn pids(&self) -> Vec<u32> {
        let pids = self.shared.pids.lock();
        let mut slots: Vec<_> = pids.iter().map(|(slot, pid)| (*slot, *pid)).collect();
        slots.sort_unstable();
        slots.into_iter().map(|(_, pid)| pid).collect()
    }
}

/// Keeps a fixed number of worker processes running.
///
/// A worker that exits while the supervisor is not shutting down is replaced
/// in the same slot. On shutdown every worker receives SIGTERM, and any still
/// alive after [`SupervisorConfig::shutdown_timeout`] receives SIGKILL.
pub struct Supervisor {
    config: SupervisorConfig,
    listener: Option<TcpListener>,
    shared: Arc<Shared>,
}

impl Supervisor {
    /// Create a supervisor. Nothing is spawned until [`Supervisor::run`].
    pub fn new(config: SupervisorConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            listener: None,
            shared: Arc::new(Shared {
                shutdown,
                restarts: AtomicUsize::new(0),
                pids: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Share a bound listener with every worker.
    ///
    /// The listener must not be close-on-exec; see
    /// [`bind_inheritable`](crate::bind_inheritable).
    pub fn with_listener(mut self, listener: TcpListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Handle for requesting shutdown and observing workers while `run` is awaited.
    pub fn handle(&self) -> SupervisorHandle {
        SupervisorHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Run until [`SupervisorHandle::shutdown`] is called and all workers
    /// have exited.
    pub async fn run(self) -> Result<SupervisorReport> {
        if self.config.workers == 0 {
            return Err(SupervisorError::Config(
                "worker count must be at least 1".to_string(),
            ));
        }

        info!(
            pid = std::process::id(),
            workers = self.config.workers,
            "Master {} is running",
            std::process::id()
        );

        let (exit_tx, mut exit_rx) = mpsc::unbounded_channel();
        let mut shutdown_rx = self.shared.shutdown.subscribe();
        let mut report = SupervisorReport::default();

        for slot in 0..self.config.workers {
            if let Err(e) = self.spawn(slot, &exit_tx) {
                self.terminate(&mut exit_rx, &mut report).await;
                return Err(e);
            }
            report.spawned += 1;
        }

        loop {
            let exit = tokio::select! {
                _ = shutdown_rx.wait_for(|stop| *stop) => break,
                exit = exit_rx.recv() => match exit {
                    Some(exit) => exit,
                    None => break,
                },
            };

            self.forget(&exit);
            error!(
                slot = exit.slot,
                pid = exit.pid,
                status = %exit,
                "Worker {} died. Restarting...",
                exit.pid
            );
            report.exits.push(exit.clone());

            if !self.config.restart_delay.is_zero() {
                tokio::select! {
                    _ = shutdown_rx.wait_for(|stop| *stop) => break,
                    _ = tokio::time::sleep(self.config.restart_delay) => {}
                }
            }
            if *shutdown_rx.borrow() {
                break;
            }

            if let Err(e) = self.spawn(exit.slot, &exit_tx) {
                error!(slot = exit.slot, error = %e, "Failed to restart worker");
                self.terminate(&mut exit_rx, &mut report).await;
                return Err(e);
            }
            report.spawned += 1;
            report.restarts += 1;
            self.shared.restarts.fetch_add(1, Ordering::SeqCst);
        }

        self.terminate(&mut exit_rx, &mut report).await;
        info!(
            spawned = report.spawned,
            restarts = report.restarts,
            "All workers stopped"
        );
        Ok(report)
    }

    fn spawn(&self, slot: usize, exits: &mpsc::UnboundedSender<ChildExit>) -> Result<()> {
        let mut cmd = self.config.command.command();
        cmd.env(WORKER_SLOT_VAR, slot.to_string());
        if let Some(listener) = &self.listener {
            cmd.env(LISTEN_FD_VAR, listener.as_raw_fd().to_string());
        }

        let mut child = cmd.spawn().map_err(|e| {
            SupervisorError::Spawn(format!(
                "{}: {e}",
                self.config.command.binary_path.display()
            ))
        })?;
        let pid = child
            .id()
            .ok_or_else(|| SupervisorError::Spawn("worker exited before reporting a pid".into()))?;

        self.shared.pids.lock().insert(slot, pid);
        debug!(slot, pid, "Worker started");

        let exits = exits.clone();
        tokio::spawn(async move {
            let status = match child.wait().await {
                Ok(status) => Some(status),
                Err(e) => {
                    warn!(pid, error = %e, "Failed to wait on worker");
                    None
                }
            };
            let _ = exits.send(ChildExit::new(slot, pid, status));
        });

        Ok(())
    }

    fn forget(&self, exit: &ChildExit) {
        let mut pids = self.shared.pids.lock();
        if pids.get(&exit.slot) == Some(&exit.pid) {
            pids.remove(&exit.slot);
        }
    }

    fn signal_all(&self, signal: Signal) {
        for pid in self.handle().pids() {
            match kill(Pid::from_raw(pid as i32), signal) {
                Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
                Err(e) => {
                    let err = SupervisorError::Signal {
                        pid,
                        message: e.to_string(),
                    };
                    warn!(error = %err, "Signal not delivered");
                }
            }
        }
    }

    async fn terminate(
        &self,
        exits: &mut mpsc::UnboundedReceiver<ChildExit>,
        report: &mut SupervisorReport,
    ) {
        self.shared.shutdown.send_replace(true);
        if self.shared.pids.lock().is_empty() {
            return;
        }

        info!(
            workers = self.shared.pids.lock().len(),
            "Stopping workers"
        );
        self.signal_all(Signal::SIGTERM);

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        let mut killed = false;
        while !self.shared.pids.lock().is_empty() {
            let next = if killed {
                exits.recv().await
            } else {
                match tokio::time::timeout_at(deadline, exits.recv()).await {
                    Ok(exit) => exit,
                    Err(_) => {
                        warn!(
                            remaining = ?self.handle().pids(),
                            "Workers did not exit in time, sending SIGKILL"
                        );
                        self.signal_all(Signal::SIGKILL);
                        killed = true;
                        continue;
                    }
                }
            };

            let Some(exit) = next else { break };
            self.forget(&exit);
            debug!(slot = exit.slot, pid = exit.pid, status = %exit, "Worker stopped");
            report.exits.push(exit);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = SupervisorConfig::new(4, ProcessConfig::new("/bin/true"));
        assert_eq!(config.workers, 4);
        assert_eq!(config.restart_delay, Duration::ZERO);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(10));

        let config = config
            .with_restart_delay(Duration::from_millis(100))
            .with_shutdown_timeout(Duration::from_secs(2));
        assert_eq!(config.restart_delay, Duration::from_millis(100));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_zero_workers_rejected() {
        let supervisor = Supervisor::new(SupervisorConfig::new(0, ProcessConfig::new("/bin/true")));
        assert!(matches!(
            supervisor.run().await,
            Err(SupervisorError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let supervisor = Supervisor::new(SupervisorConfig::new(
            1,
            ProcessConfig::new("/nonexistent/stevedore-worker"),
        ));
        assert!(matches!(
            supervisor.run().await,
            Err(SupervisorError::Spawn(_))
        ));
    }

    #[test]
    fn test_handle_shutdown_flag() {
        let supervisor = Supervisor::new(SupervisorConfig::new(1, ProcessConfig::new("/bin/true")));
        let handle = supervisor.handle();
        assert!(!handle.is_shutting_down());
        handle.shutdown();
        assert!(handle.is_shutting_down());
        assert_eq!(handle.restarts(), 0);
        assert!(handle.pids().is_empty());
    }
}
