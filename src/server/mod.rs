// Server module entry point
// Listener, worker pool, timeout watchdog and the supervisor that owns them

pub mod lifecycle;
pub mod listener;
pub mod signal;
pub mod supervisor;
pub mod watchdog;
pub mod worker;

use std::fmt;

pub use lifecycle::{LifecycleEvent, SupervisorState};
pub use supervisor::{PoolStatus, Supervisor, SupervisorHandle};

/// Worker identity. Never reused within one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(u64);

impl WorkerId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
