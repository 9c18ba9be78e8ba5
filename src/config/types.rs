// Configuration types module
// File/environment representation and the runtime parameters derived from it

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub respawn: RespawnConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    /// Listener endpoint, `host:port`
    pub bind: String,
    /// Accept queue depth passed to listen(2)
    pub backlog: u32,
    /// Pool size
    pub workers: usize,
    /// Request timeout in seconds
    pub timeout: u64,
    /// Drain deadline in seconds
    pub graceful_timeout: u64,
    pub watchdog_interval_ms: u64,
    /// Requests served before a worker is recycled (0 = never)
    pub max_requests: u64,
    pub max_requests_jitter: u64,
    /// Tokio worker threads (0 = workers + 1)
    pub runtime_threads: usize,
}

/// Crash-loop policy
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RespawnConfig {
    pub crash_threshold: u32,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
}

/// Logging configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    pub level: String,
    /// Event formatter: compact or json
    pub format: String,
    pub access_log: bool,
    /// Access log format (combined, common, json)
    pub access_log_format: String,
}

/// Parameters consumed by the server core.
///
/// Everything is already parsed and expressed as durations, so tests can
/// build one directly with millisecond timings.
#[derive(Debug, Clone)]
pub struct ServerParams {
    pub bind: SocketAddr,
    pub backlog: u32,
    pub workers: usize,
    pub timeout: Duration,
    pub graceful_timeout: Duration,
    pub watchdog_interval: Duration,
    pub max_requests: u64,
    pub max_requests_jitter: u64,
    pub respawn: RespawnPolicy,
    pub access_log: bool,
    pub access_log_format: String,
}

/// Backoff applied once consecutive crashes pass `crash_threshold`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RespawnPolicy {
    pub crash_threshold: u32,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl RespawnPolicy {
    /// Delay before respawning after `consecutive` crashes in a row.
    pub fn delay_for(&self, consecutive: u32) -> Duration {
        if consecutive <= self.crash_threshold {
            return Duration::ZERO;
        }
        let exponent = (consecutive - self.crash_threshold - 1).min(16);
        self.backoff_initial
            .saturating_mul(1u32 << exponent)
            .min(self.backoff_max)
    }
}

impl Default for RespawnPolicy {
    fn default() -> Self {
        Self {
            crash_threshold: 5,
            backoff_initial: Duration::from_millis(100),
            backoff_max: Duration::from_secs(10),
        }
    }
}

impl ServerParams {
    /// Defaults matching the shipped launch parameters, bound to `bind`.
    pub fn with_bind(bind: SocketAddr) -> Self {
        Self {
            bind,
            backlog: 2048,
            workers: 2,
            timeout: Duration::from_secs(30),
            graceful_timeout: Duration::from_secs(30),
            watchdog_interval: Duration::from_secs(1),
            max_requests: 0,
            max_requests_jitter: 0,
            respawn: RespawnPolicy::default(),
            access_log: false,
            access_log_format: "combined".to_string(),
        }
    }
}
