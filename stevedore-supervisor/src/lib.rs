//! Process supervisor for Stevedore.
//!
//! Runs one server instance per worker slot, restarts instances that crash,
//! and hands a single listening socket to every instance so they share the
//! port.
//!
//! ```no_run
//! use stevedore_supervisor::{ProcessConfig, Supervisor, SupervisorConfig, bind_inheritable};
//!
//! # async fn run() -> stevedore_supervisor::Result<()> {
//! let listener = bind_inheritable("0.0.0.0:3000")?;
//! let command = ProcessConfig::current_exe(["serve"])?;
//! let supervisor = Supervisor::new(SupervisorConfig::new(4, command)).with_listener(listener);
//!
//! let handle = supervisor.handle();
//! tokio::spawn(async move {
//!     stevedore_supervisor::shutdown_signal().await;
//!     handle.shutdown();
//! });
//!
//! let report = supervisor.run().await?;
//! println!("{} restarts", report.restarts);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod listener;
pub mod process;
pub mod signal;
pub mod supervisor;

pub use error::{Result, SupervisorError};
pub use listener::{
    LISTEN_FD_VAR, WORKER_SLOT_VAR, bind_inheritable, inherited_listener, parse_listen_fd,
    worker_slot,
};
pub use process::{ChildExit, ProcessConfig};
pub use signal::{ShutdownSignal, shutdown_signal};
pub use supervisor::{Supervisor, SupervisorConfig, SupervisorHandle, SupervisorReport};
