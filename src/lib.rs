// Stevedore - a multi-core job queue server
//
// HTTP job intake, a worker pool with retries and exponential backoff, a
// dead-letter queue, and a supervisor that keeps one instance per core alive.

// Re-export member crates
pub use stevedore_config as config;
pub use stevedore_log as log;
pub use stevedore_queue as queue;
pub use stevedore_server as server;
pub use stevedore_supervisor as supervisor;

// Prelude for common imports
pub mod prelude {
    pub use stevedore_config::{AppConfig, BrokerKind, ConfigError};
    pub use stevedore_log::{LogConfig, LogFormat, LogLevel};
    pub use stevedore_queue::prelude::*;
    pub use stevedore_server::{AppState, DemoJobHandler, ServerError};
    pub use stevedore_supervisor::{
        ProcessConfig, Supervisor, SupervisorConfig, SupervisorError, SupervisorHandle,
    };
}
