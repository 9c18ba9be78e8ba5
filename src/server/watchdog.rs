//! Timeout watchdog
//!
//! Workers register an in-flight record when they start on a connection and
//! clear it as soon as the application returns, before any response is
//! written. The watchdog scans the records on a fixed
//! interval and reports every record older than the request timeout to the
//! supervisor, which claims the record and kills the worker.
//!
//! Claiming and finishing both remove the record under the same lock, so
//! exactly one of them wins. A worker whose record was claimed learns so
//! from [`InFlightRegistry::finish`] and must not serve again; a claim that
//! finds the record already gone is skipped, so an idle worker is never
//! killed.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::WorkerId;

/// One request being processed
#[derive(Debug, Clone, Copy)]
pub struct InFlight {
    /// Unique per accepted connection
    pub seq: u64,
    pub started: Instant,
    pub peer: SocketAddr,
}

/// A record found past its deadline by a scan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expired {
    pub worker: WorkerId,
    pub seq: u64,
}

/// In-flight records keyed by worker. At most one record per worker.
#[derive(Debug, Default)]
pub struct InFlightRegistry {
    records: Mutex<HashMap<WorkerId, InFlight>>,
    next_seq: AtomicU64,
    completed: AtomicU64,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `worker` started on a connection; returns its sequence number.
    pub fn begin(&self, worker: WorkerId, peer: SocketAddr) -> u64 {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let record = InFlight {
            seq,
            started: Instant::now(),
            peer,
        };
        let previous = self.records.lock().insert(worker, record);
        debug_assert!(previous.is_none(), "worker {worker} already had a request in flight");
        seq
    }

    /// Clear the record for a finished request; `succeeded` counts it
    /// towards [`InFlightRegistry::completed`].
    ///
    /// Returns `false` if the watchdog already claimed it, in which case the
    /// worker is about to be killed and must stop serving.
    pub fn finish(&self, worker: WorkerId, seq: u64, succeeded: bool) -> bool {
        let mut records = self.records.lock();
        match records.get(&worker) {
            Some(record) if record.seq == seq => {
                records.remove(&worker);
                if succeeded {
                    self.completed.fetch_add(1, Ordering::Relaxed);
                }
                true
            }
            _ => false,
        }
    }

    /// Remove and return the record if it is still the expired one.
    ///
    /// Returns `None` when the request completed between the scan and this
    /// call.
    pub fn claim(&self, expired: Expired) -> Option<InFlight> {
        let mut records = self.records.lock();
        match records.get(&expired.worker) {
            Some(record) if record.seq == expired.seq => records.remove(&expired.worker),
            _ => None,
        }
    }

    /// Drop whatever record a dead worker left behind.
    pub fn forget(&self, worker: WorkerId) -> Option<InFlight> {
        self.records.lock().remove(&worker)
    }

    /// Records whose age exceeds `timeout` as of `now`.
    pub fn expired(&self, now: Instant, timeout: Duration) -> Vec<Expired> {
        self.records
            .lock()
            .iter()
            .filter(|(_, record)| now.saturating_duration_since(record.started) > timeout)
            .map(|(worker, record)| Expired {
                worker: *worker,
                seq: record.seq,
            })
            .collect()
    }

    pub fn get(&self, worker: WorkerId) -> Option<InFlight> {
        self.records.lock().get(&worker).copied()
    }

    pub fn in_flight(&self) -> usize {
        self.records.lock().len()
    }

    /// Requests finished normally since startup
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }
}

/// Periodic scanner over an [`InFlightRegistry`]
pub struct Watchdog {
    registry: Arc<InFlightRegistry>,
    timeout: Duration,
    interval: Duration,
}

impl Watchdog {
    pub const fn new(registry: Arc<InFlightRegistry>, timeout: Duration, interval: Duration) -> Self {
        Self {
            registry,
            timeout,
            interval,
        }
    }

    /// Scan until `stop` is cancelled or the receiving side goes away.
    pub async fn run(self, expired_tx: mpsc::UnboundedSender<Expired>, stop: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = stop.cancelled() => break,
                now = ticker.tick() => {
                    for expired in self.registry.expired(now, self.timeout) {
                        if expired_tx.send(expired).is_err() {
                            return;
                        }
                    }
                }
            }
        }
        debug!("Watchdog stopped");
    }
}
