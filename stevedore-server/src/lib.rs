//! HTTP API and instance runtime for Stevedore.
//!
//! One instance serves the job API and runs a [`WorkerPool`] over the same
//! queue. Instances are normally started by the supervisor, which hands each
//! one the shared listening socket.
//!
//! ```no_run
//! use stevedore_config::AppConfig;
//!
//! # async fn start() -> stevedore_server::Result<()> {
//! let config = AppConfig::load(None)?;
//! stevedore_server::serve(&config).await
//! # }
//! ```
//!
//! [`WorkerPool`]: stevedore_queue::WorkerPool

pub mod error;
pub mod handler;
pub mod routes;
pub mod runtime;
pub mod state;

pub use error::{ApiError, Result, ServerError};
pub use handler::DemoJobHandler;
pub use runtime::{connect_broker, run, serve};
pub use state::AppState;
