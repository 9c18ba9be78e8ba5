use std::fmt;

/// Requests delivered to the supervisor from signals or a [`super::SupervisorHandle`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Stop accepting and drain in-flight requests
    Shutdown,
    /// Kill every worker now
    ForceShutdown,
    /// Replace every worker, one at a time, each after its current request
    Reload,
    IncreaseWorkers,
    DecreaseWorkers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Starting,
    Running,
    Draining,
    Stopped,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Draining => write!(f, "draining"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}
