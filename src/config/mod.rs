// Configuration module entry point
// Loads layered configuration (file, environment, defaults) and validates it

mod types;

use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{Result, ServerError};

pub use types::{Config, LoggingConfig, RespawnConfig, RespawnPolicy, ServerConfig, ServerParams};

/// Default config file stem, looked up as prefork.toml / prefork.yaml / ...
pub const DEFAULT_CONFIG_PATH: &str = "prefork";

impl Config {
    /// Load configuration from specified file path (without extension).
    /// The file is optional; `PREFORK_*` environment variables override it,
    /// e.g. `PREFORK_SERVER__WORKERS=4`.
    pub fn load_from(config_path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(config_path).required(false))
            .add_source(
                config::Environment::with_prefix("PREFORK")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .set_default("server.bind", "0.0.0.0:5000")?
            .set_default("server.backlog", 2048)?
            .set_default("server.workers", 2)?
            .set_default("server.timeout", 30)?
            .set_default("server.graceful_timeout", 30)?
            .set_default("server.watchdog_interval_ms", 1000)?
            .set_default("server.max_requests", 0)?
            .set_default("server.max_requests_jitter", 0)?
            .set_default("server.runtime_threads", 0)?
            .set_default("respawn.crash_threshold", 5)?
            .set_default("respawn.backoff_initial_ms", 100)?
            .set_default("respawn.backoff_max_ms", 10_000)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "compact")?
            .set_default("logging.access_log", true)?
            .set_default("logging.access_log_format", "combined")?
            .build()?;

        let cfg: Self = settings.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject values the server core cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.workers == 0 {
            return Err(invalid("server.workers must be at least 1"));
        }
        if self.server.timeout == 0 {
            return Err(invalid("server.timeout must be greater than 0"));
        }
        if self.server.watchdog_interval_ms == 0 {
            return Err(invalid("server.watchdog_interval_ms must be greater than 0"));
        }
        if self.respawn.backoff_initial_ms > self.respawn.backoff_max_ms {
            return Err(invalid(
                "respawn.backoff_initial_ms must not exceed respawn.backoff_max_ms",
            ));
        }
        if !matches!(self.logging.format.as_str(), "compact" | "json") {
            return Err(invalid(&format!(
                "Unknown logging.format '{}' (expected compact or json)",
                self.logging.format
            )));
        }
        if !matches!(
            self.logging.access_log_format.as_str(),
            "combined" | "common" | "json"
        ) {
            return Err(invalid(&format!(
                "Unknown logging.access_log_format '{}'",
                self.logging.access_log_format
            )));
        }
        self.get_socket_addr()?;
        Ok(())
    }

    pub fn get_socket_addr(&self) -> Result<SocketAddr> {
        self.server
            .bind
            .parse()
            .map_err(|e| invalid(&format!("Invalid bind address '{}': {e}", self.server.bind)))
    }

    /// Tokio worker threads: configured value, or one per pool slot plus one
    /// for the supervisor and watchdog.
    pub const fn runtime_threads(&self) -> usize {
        if self.server.runtime_threads > 0 {
            self.server.runtime_threads
        } else {
            self.server.workers + 1
        }
    }

    pub fn server_params(&self) -> Result<ServerParams> {
        Ok(ServerParams {
            bind: self.get_socket_addr()?,
            backlog: self.server.backlog,
            workers: self.server.workers,
            timeout: Duration::from_secs(self.server.timeout),
            graceful_timeout: Duration::from_secs(self.server.graceful_timeout),
            watchdog_interval: Duration::from_millis(self.server.watchdog_interval_ms),
            max_requests: self.server.max_requests,
            max_requests_jitter: self.server.max_requests_jitter,
            respawn: RespawnPolicy {
                crash_threshold: self.respawn.crash_threshold,
                backoff_initial: Duration::from_millis(self.respawn.backoff_initial_ms),
                backoff_max: Duration::from_millis(self.respawn.backoff_max_ms),
            },
            access_log: self.logging.access_log,
            access_log_format: self.logging.access_log_format.clone(),
        })
    }
}

fn invalid(message: &str) -> ServerError {
    ServerError::InvalidConfig(message.to_string())
}
