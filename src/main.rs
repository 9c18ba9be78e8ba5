use std::process::ExitCode;
use std::sync::Arc;

use prefork::error::{Result, ServerError};
use prefork::{app, config, logger, server};

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            // The logger may not be installed yet
            eprintln!("[ERROR] {e}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| config::DEFAULT_CONFIG_PATH.to_string());
    let cfg = config::Config::load_from(&config_path)?;
    logger::init(&cfg.logging)?;

    // Defaults to one thread per worker plus one for the supervisor
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(cfg.runtime_threads())
        .thread_name("prefork-worker")
        .enable_all()
        .build()?;

    runtime.block_on(async_main(cfg))
}

async fn async_main(cfg: config::Config) -> Result<()> {
    let params = cfg.server_params()?;
    let app = Arc::new(app::StatusApp::new(env!("CARGO_PKG_NAME")));

    let supervisor = match server::Supervisor::bind(params, app) {
        Ok(supervisor) => supervisor,
        Err(e) => {
            if let ServerError::Bind { addr, source } = &e {
                logger::log_bind_failed(addr, source);
            }
            return Err(e);
        }
    };

    logger::log_server_start(&supervisor.local_addr(), &cfg);
    let _signals = server::signal::start_signal_handler(supervisor.handle())?;

    supervisor.run().await
}
