//! Error types
//!
//! Startup errors are fatal and surface as `ServerError`. Per-request and
//! per-worker failures never leave the supervisor; they are described by
//! `WorkerExit` and `Fault` and only ever reach a log record.

use std::fmt;
use std::net::SocketAddr;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ServerError>;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Runtime error: {0}")]
    Runtime(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// How a worker's run loop ended, as reported by the worker itself.
///
/// A worker that is aborted never reports; the supervisor observes that as
/// a cancelled task instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Termination requested or listener closed.
    Stopped,
    /// Served its `max_requests` quota.
    Recycled,
    /// The application handler failed mid-request.
    Fault,
    /// The watchdog claimed the in-flight record before the request finished.
    TimedOut,
}

/// Failure kinds recovered inside the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    HandlerFault,
    TimeoutExceeded,
    DrainTimeout,
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HandlerFault => write!(f, "HandlerFault"),
            Self::TimeoutExceeded => write!(f, "TimeoutExceeded"),
            Self::DrainTimeout => write!(f, "DrainTimeout"),
        }
    }
}
