// Signal handling module
//
// Supported signals:
// - SIGTERM: Graceful shutdown (drain)
// - SIGINT:  Graceful shutdown (Ctrl+C); a second one forces it
// - SIGHUP:  Reload workers (each replaced after its current request)
// - SIGTTIN: Increase pool size by one
// - SIGTTOU: Decrease pool size by one

use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::lifecycle::LifecycleEvent;
use super::supervisor::SupervisorHandle;

/// Tracks how many shutdown requests have arrived
#[derive(Debug, Default)]
pub struct ShutdownSignals {
    received: u32,
}

impl ShutdownSignals {
    /// First request drains, any later one forces.
    pub fn next_event(&mut self) -> LifecycleEvent {
        self.received = self.received.saturating_add(1);
        if self.received == 1 {
            LifecycleEvent::Shutdown
        } else {
            LifecycleEvent::ForceShutdown
        }
    }
}

/// Register signal handlers and forward them to the supervisor.
/// Handlers are registered before this returns.
#[cfg(unix)]
pub fn start_signal_handler(handle: SupervisorHandle) -> std::io::Result<JoinHandle<()>> {
    use nix::sys::signal::Signal;
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigttin = signal(SignalKind::from_raw(Signal::SIGTTIN as i32))?;
    let mut sigttou = signal(SignalKind::from_raw(Signal::SIGTTOU as i32))?;

    info!("Signal handlers registered: TERM/INT drain, HUP reload, TTIN/TTOU resize");

    Ok(tokio::spawn(async move {
        let mut shutdowns = ShutdownSignals::default();
        loop {
            let event = tokio::select! {
                _ = sigterm.recv() => {
                    info!("SIGTERM received");
                    shutdowns.next_event()
                }
                _ = sigint.recv() => {
                    info!("SIGINT received");
                    shutdowns.next_event()
                }
                _ = sighup.recv() => {
                    info!("SIGHUP received, reloading workers");
                    LifecycleEvent::Reload
                }
                _ = sigttin.recv() => LifecycleEvent::IncreaseWorkers,
                _ = sigttou.recv() => LifecycleEvent::DecreaseWorkers,
            };
            if event == LifecycleEvent::ForceShutdown {
                warn!("Second shutdown signal, forcing stop");
            }
            if !handle.send(event) {
                break;
            }
        }
    }))
}

/// Non-Unix fallback - only handles Ctrl+C
#[cfg(not(unix))]
pub fn start_signal_handler(handle: SupervisorHandle) -> std::io::Result<JoinHandle<()>> {
    Ok(tokio::spawn(async move {
        let mut shutdowns = ShutdownSignals::default();
        while tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl+C received");
            if !handle.send(shutdowns.next_event()) {
                break;
            }
        }
    }))
}
