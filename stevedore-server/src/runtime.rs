//! Instance runtime: the HTTP API plus a worker pool in one process.

use crate::error::{Result, ServerError};
use crate::handler::DemoJobHandler;
use crate::routes;
use crate::state::AppState;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use hyper_util::server::graceful::GracefulShutdown;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use stevedore_config::{AppConfig, BrokerKind};
use stevedore_queue::{Broker, JobOutcome, JobQueue, MemoryBroker, RedisBroker, WorkerPool};
use stevedore_supervisor::{inherited_listener, shutdown_signal, worker_slot};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Open the broker selected by `queue.broker`.
pub async fn connect_broker(config: &AppConfig) -> Result<Arc<dyn Broker>> {
    match config.queue.broker {
        BrokerKind::Redis => {
            let broker = RedisBroker::with_config(config.redis_broker_config()).await?;
            Ok(Arc::new(broker))
        }
        BrokerKind::Memory => {
            warn!("Using the in-memory broker; jobs are not shared between instances");
            Ok(Arc::new(MemoryBroker::new().with_retention(
                config.queue.completed_retention,
                config.queue.dead_retention,
            )))
        }
    }
}

/// Run one instance until SIGTERM or SIGINT.
///
/// Accepts on the listener handed down by the supervisor, or binds
/// `server.host:server.port` when started on its own.
pub async fn serve(config: &AppConfig) -> Result<()> {
    let listener = match inherited_listener()? {
        Some(listener) => listener,
        None => std::net::TcpListener::bind(config.server.address())
            .map_err(|e| ServerError::Bind(format!("{}: {e}", config.server.address())))?,
    };
    let broker = connect_broker(config).await?;

    run(config, listener, broker, async {
        shutdown_signal().await;
    })
    .await
}

/// Run one instance on `listener` until `shutdown` resolves.
///
/// On shutdown the listener is closed first. Open connections and in-flight
/// jobs then get `server.drain_timeout` to finish.
pub async fn run<F>(
    config: &AppConfig,
    listener: std::net::TcpListener,
    broker: Arc<dyn Broker>,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()>,
{
    listener.set_nonblocking(true)?;
    let listener = TcpListener::from_std(listener)?;
    let port = listener.local_addr()?.port();

    let queue = JobQueue::new(broker, config.queue_config().require_field("message"));
    let mut pool = WorkerPool::with_config(
        queue.clone(),
        DemoJobHandler::from_settings(&config.handler),
        config.worker.clone(),
    );
    if let Some(outcomes) = pool.outcomes() {
        tokio::spawn(log_outcomes(outcomes));
    }
    pool.start()?;

    let state = AppState::new(queue);
    info!(
        pid = state.pid,
        port,
        slot = ?worker_slot(),
        "Worker {} started on port {}",
        state.pid,
        port
    );

    let graceful = accept(listener, state.clone(), shutdown).await;
    info!(pid = state.pid, "Worker {} shutting down...", state.pid);

    let drain = config.server.drain_timeout();
    let (_, stopped) = tokio::join!(drain_connections(graceful, drain), pool.stop(drain));
    stopped?;

    info!(pid = state.pid, "Instance stopped");
    Ok(())
}

async fn accept<F>(listener: TcpListener, state: AppState, shutdown: F) -> GracefulShutdown
where
    F: Future<Output = ()>,
{
    let graceful = GracefulShutdown::new();
    tokio::pin!(shutdown);

    loop {
        let stream = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            },
            _ = &mut shutdown => break,
        };

        let state = state.clone();
        let service = service_fn(move |req| routes::handle(req, state.clone()));
        let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
        let conn = graceful.watch(conn);

        tokio::spawn(async move {
            if let Err(err) = conn.await {
                debug!(error = %err, "Error serving connection");
            }
        });
    }

    graceful
}

async fn drain_connections(graceful: GracefulShutdown, drain: Duration) {
    if tokio::time::timeout(drain, graceful.shutdown()).await.is_err() {
        warn!(
            drain_ms = drain.as_millis() as u64,
            "Open connections did not close in time"
        );
    }
}

async fn log_outcomes(mut outcomes: mpsc::Receiver<JobOutcome>) {
    while let Some(outcome) = outcomes.recv().await {
        match outcome {
            JobOutcome::Completed { job, result } => {
                info!(job_id = %job.id, result = %result, "Job {} completed with result", job.id);
            }
            JobOutcome::Retrying { job, error, delay } => {
                warn!(
                    job_id = %job.id,
                    attempts = job.attempts_made,
                    retry_in_ms = delay.as_millis() as u64,
                    "Job {} failed after {} attempts: {}",
                    job.id,
                    job.attempts_made,
                    error
                );
            }
            JobOutcome::DeadLettered {
                job,
                error,
                record_id,
            } => {
                error!(
                    job_id = %job.id,
                    attempts = job.attempts_made,
                    record_id = ?record_id,
                    "Job {} failed after {} attempts: {}",
                    job.id,
                    job.attempts_made,
                    error
                );
            }
        }
    }
}
