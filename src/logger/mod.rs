//! Logger module
//!
//! Installs the tracing subscriber and provides the server's lifecycle log
//! records:
//! - Server start and stop
//! - Worker spawn, exit and forced termination
//! - Drain progress
//! - Access logging (on the `access` target)

mod format;

pub use format::AccessLogEntry;

use std::net::SocketAddr;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{Config, LoggingConfig};
use crate::error::{Fault, Result, ServerError, WorkerExit};
use crate::server::WorkerId;

/// Install the global subscriber.
///
/// `RUST_LOG` takes precedence over `logging.level`. Should be called once
/// at application startup.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| ServerError::InvalidConfig(format!("Invalid logging.level: {e}")))?;

    let installed = if config.format == "json" {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .try_init()
    };
    installed.map_err(|e| ServerError::Runtime(format!("Failed to install logger: {e}")))
}

pub fn log_server_start(addr: &SocketAddr, config: &Config) {
    info!("======================================");
    info!("Listening on: http://{addr}");
    info!(
        workers = config.server.workers,
        timeout_secs = config.server.timeout,
        graceful_timeout_secs = config.server.graceful_timeout,
        runtime_threads = config.runtime_threads(),
        "Pool configuration"
    );
    if config.server.max_requests > 0 {
        info!(
            max_requests = config.server.max_requests,
            jitter = config.server.max_requests_jitter,
            "Workers recycle after serving their request quota"
        );
    }
    info!("Process ID: {}", std::process::id());
    info!("======================================");
}

pub fn log_bind_failed(addr: &SocketAddr, err: &std::io::Error) {
    error!("Failed to bind {addr}: {err}");
}

pub fn log_worker_spawned(worker: WorkerId, pool_size: usize) {
    info!(%worker, pool_size, "Worker spawned");
}

pub fn log_worker_exit(worker: WorkerId, exit: WorkerExit) {
    match exit {
        WorkerExit::Stopped => info!(%worker, "Worker exited"),
        WorkerExit::Recycled => info!(%worker, "Worker reached max_requests, recycling"),
        WorkerExit::Fault => log_fault(worker, Fault::HandlerFault),
        WorkerExit::TimedOut => log_fault(worker, Fault::TimeoutExceeded),
    }
}

pub fn log_worker_panicked(worker: WorkerId) {
    error!(%worker, fault = %Fault::HandlerFault, "Worker panicked, respawning");
}

pub fn log_fault(worker: WorkerId, fault: Fault) {
    match fault {
        Fault::HandlerFault => error!(%worker, %fault, "Application handler failed, respawning"),
        Fault::TimeoutExceeded | Fault::DrainTimeout => {
            warn!(%worker, %fault, "Worker killed");
        }
    }
}

pub fn log_timeout_kill(worker: WorkerId, peer: &SocketAddr, age: Duration, timeout: Duration) {
    warn!(
        %worker,
        %peer,
        fault = %Fault::TimeoutExceeded,
        age_ms = u64::try_from(age.as_millis()).unwrap_or(u64::MAX),
        timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        "Request exceeded timeout, killing worker"
    );
}

pub fn log_respawn_delayed(consecutive: u32, delay: Duration) {
    warn!(
        consecutive_crashes = consecutive,
        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
        "Workers crashing repeatedly, delaying respawn"
    );
}

pub fn log_drain_started(in_flight: usize, deadline: Duration) {
    info!(
        in_flight,
        deadline_secs = deadline.as_secs_f64(),
        "Draining: listener closed, waiting for in-flight requests"
    );
}

pub fn log_drain_deadline(remaining: usize) {
    warn!(
        remaining,
        fault = %Fault::DrainTimeout,
        "Graceful shutdown timeout reached, force killing remaining workers"
    );
}

pub fn log_stopped() {
    info!("All workers exited, server stopped");
}

pub fn log_accept_error(worker: WorkerId, err: &std::io::Error) {
    warn!(%worker, "Failed to accept connection: {err}");
}

pub fn log_connection_error(worker: WorkerId, err: &hyper::Error) {
    warn!(%worker, "Failed to serve connection: {err}");
}

/// Log formatted access log entry
pub fn log_access(entry: &AccessLogEntry, format: &str) {
    info!(target: "access", "{}", entry.format(format));
}
