//! Supervisor
//!
//! Owns the listener and the worker pool, and is the only place the pool is
//! mutated. Everything else talks to it through channels: workers report
//! readiness and exit, the watchdog reports expired requests, and
//! [`SupervisorHandle`]s deliver lifecycle events.
//!
//! States move `starting -> running -> draining -> stopped`. While starting
//! or running the pool is kept at its target size: a crashed, recycled or
//! killed worker is replaced before the next event is handled. Draining
//! closes the listener, asks every worker to exit once idle, and kills what
//! is left when the graceful timeout expires.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;

use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::lifecycle::{LifecycleEvent, SupervisorState};
use super::listener::Listener;
use super::watchdog::{Expired, InFlightRegistry, Watchdog};
use super::worker::Worker;
use super::WorkerId;
use crate::app::Application;
use crate::config::ServerParams;
use crate::error::{Fault, Result, WorkerExit};
use crate::logger;

type ExitReport = (WorkerId, std::result::Result<WorkerExit, JoinError>);

/// Observable state of one worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Busy,
    Terminating,
}

/// Snapshot published after every supervisor event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStatus {
    pub state: SupervisorState,
    pub target: usize,
    /// Live pool members, sorted; killed workers are excluded immediately
    pub workers: Vec<WorkerId>,
    /// Members asked to exit once idle
    pub terminating: Vec<WorkerId>,
    pub spawned_total: u64,
    pub killed_total: u64,
}

impl PoolStatus {
    pub fn pool_size(&self) -> usize {
        self.workers.len()
    }
}

struct WorkerSlot {
    terminate: CancellationToken,
    abort: AbortHandle,
    terminating: bool,
}

/// Counts crashes in a row. Any request completing between two crashes
/// breaks the streak.
#[derive(Debug, Default)]
struct CrashStreak {
    consecutive: u32,
    completed_at_last_crash: u64,
}

impl CrashStreak {
    fn record(&mut self, completed: u64) -> u32 {
        if completed != self.completed_at_last_crash {
            self.consecutive = 0;
        }
        self.completed_at_last_crash = completed;
        self.consecutive = self.consecutive.saturating_add(1);
        self.consecutive
    }
}

pub struct Supervisor {
    params: ServerParams,
    app: Arc<dyn Application>,
    listener: Arc<Listener>,
    registry: Arc<InFlightRegistry>,
    access_log: Option<Arc<str>>,

    state: SupervisorState,
    target: usize,
    pool: HashMap<WorkerId, WorkerSlot>,
    /// Aborted workers whose exit has not been observed yet
    dying: HashSet<WorkerId>,
    ready: HashSet<WorkerId>,
    next_id: u64,
    spawned_total: u64,
    killed_total: u64,

    crashes: CrashStreak,
    /// Workers still to be replaced by a reload, retired one at a time
    reload_queue: VecDeque<WorkerId>,
    delayed_respawns: usize,
    respawn_at: Option<Instant>,
    drain_deadline: Option<Instant>,

    exit_tx: mpsc::UnboundedSender<ExitReport>,
    exit_rx: mpsc::UnboundedReceiver<ExitReport>,
    ready_tx: mpsc::UnboundedSender<WorkerId>,
    ready_rx: mpsc::UnboundedReceiver<WorkerId>,
    commands_tx: mpsc::UnboundedSender<LifecycleEvent>,
    commands_rx: mpsc::UnboundedReceiver<LifecycleEvent>,
    status_tx: watch::Sender<PoolStatus>,
}

impl Supervisor {
    /// Bind the listener. No worker exists until [`Supervisor::run`].
    ///
    /// Must be called from within a Tokio runtime.
    pub fn bind(params: ServerParams, app: Arc<dyn Application>) -> Result<Self> {
        let listener = Arc::new(Listener::bind(params.bind, params.backlog)?);
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let target = params.workers.max(1);
        let (status_tx, _) = watch::channel(PoolStatus {
            state: SupervisorState::Starting,
            target,
            workers: Vec::new(),
            terminating: Vec::new(),
            spawned_total: 0,
            killed_total: 0,
        });
        let access_log = params
            .access_log
            .then(|| Arc::from(params.access_log_format.as_str()));

        Ok(Self {
            params,
            app,
            listener,
            registry: Arc::new(InFlightRegistry::new()),
            access_log,
            state: SupervisorState::Starting,
            target,
            pool: HashMap::new(),
            dying: HashSet::new(),
            ready: HashSet::new(),
            next_id: 1,
            spawned_total: 0,
            killed_total: 0,
            crashes: CrashStreak::default(),
            reload_queue: VecDeque::new(),
            delayed_respawns: 0,
            respawn_at: None,
            drain_deadline: None,
            exit_tx,
            exit_rx,
            ready_tx,
            ready_rx,
            commands_tx,
            commands_rx,
            status_tx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    pub fn handle(&self) -> SupervisorHandle {
        SupervisorHandle {
            commands: self.commands_tx.clone(),
            status: self.status_tx.subscribe(),
            registry: Arc::clone(&self.registry),
            local_addr: self.listener.local_addr(),
        }
    }

    /// Spawn the pool and supervise it until every worker has exited
    /// after a shutdown.
    pub async fn run(mut self) -> Result<()> {
        let (expired_tx, mut expired_rx) = mpsc::unbounded_channel();
        let watchdog_stop = CancellationToken::new();
        let watchdog = Watchdog::new(
            Arc::clone(&self.registry),
            self.params.timeout,
            self.params.watchdog_interval,
        );
        let watchdog_task = tokio::spawn(watchdog.run(expired_tx, watchdog_stop.clone()));

        self.fill_pool();
        self.publish();

        while !self.is_finished() {
            let respawn_at = self.respawn_at.unwrap_or_else(Instant::now);
            let drain_deadline = self.drain_deadline.unwrap_or_else(Instant::now);

            tokio::select! {
                Some((id, result)) = self.exit_rx.recv() => self.on_worker_exit(id, result),
                Some(id) = self.ready_rx.recv() => self.on_worker_ready(id),
                Some(expired) = expired_rx.recv() => self.on_expired(expired),
                Some(event) = self.commands_rx.recv() => self.on_lifecycle_event(event),
                () = tokio::time::sleep_until(respawn_at), if self.respawn_at.is_some() => {
                    self.on_respawn_timer();
                }
                () = tokio::time::sleep_until(drain_deadline), if self.drain_deadline.is_some() => {
                    self.on_drain_deadline();
                }
            }
            if self.accepting() {
                self.advance_reload();
            }
            self.publish();
        }

        watchdog_stop.cancel();
        if let Err(e) = watchdog_task.await {
            warn!("Watchdog task failed: {e}");
        }
        self.listener.close();
        self.state = SupervisorState::Stopped;
        self.publish();
        logger::log_stopped();
        Ok(())
    }

    const fn accepting(&self) -> bool {
        matches!(
            self.state,
            SupervisorState::Starting | SupervisorState::Running
        )
    }

    fn is_finished(&self) -> bool {
        self.state == SupervisorState::Draining && self.pool.is_empty() && self.dying.is_empty()
    }

    fn request_quota(&self) -> Option<u64> {
        if self.params.max_requests == 0 {
            return None;
        }
        let jitter = match self.params.max_requests_jitter {
            0 => 0,
            max => rand::rng().random_range(0..=max),
        };
        Some(self.params.max_requests.saturating_add(jitter))
    }

    fn spawn_worker(&mut self) {
        let id = WorkerId::new(self.next_id);
        self.next_id += 1;

        let terminate = CancellationToken::new();
        let worker = Worker {
            id,
            listener: Arc::clone(&self.listener),
            app: Arc::clone(&self.app),
            registry: Arc::clone(&self.registry),
            terminate: terminate.clone(),
            max_requests: self.request_quota(),
            access_log: self.access_log.clone(),
            ready_tx: self.ready_tx.clone(),
        };

        let handle = tokio::spawn(worker.run());
        let abort = handle.abort_handle();
        let exit_tx = self.exit_tx.clone();
        tokio::spawn(async move {
            let _ = exit_tx.send((id, handle.await));
        });

        self.pool.insert(
            id,
            WorkerSlot {
                terminate,
                abort,
                terminating: false,
            },
        );
        self.spawned_total += 1;
        logger::log_worker_spawned(id, self.pool.len());
    }

    /// Spawn until the pool (plus respawns waiting out a backoff) is at target.
    fn fill_pool(&mut self) {
        while self.pool.len() + self.delayed_respawns < self.target {
            self.spawn_worker();
        }
    }

    /// Abort a worker and take it out of the pool right away.
    fn kill(&mut self, id: WorkerId) {
        if let Some(slot) = self.pool.remove(&id) {
            slot.terminate.cancel();
            slot.abort.abort();
            self.ready.remove(&id);
            self.dying.insert(id);
            self.killed_total += 1;
        }
    }

    fn on_worker_ready(&mut self, id: WorkerId) {
        if self.state != SupervisorState::Starting || !self.pool.contains_key(&id) {
            return;
        }
        self.ready.insert(id);
        let all_ready = self.pool.len() == self.target
            && self.pool.keys().all(|worker| self.ready.contains(worker));
        if all_ready {
            self.state = SupervisorState::Running;
            self.ready.clear();
            info!(workers = self.pool.len(), "All workers ready, running");
        }
    }

    fn on_worker_exit(&mut self, id: WorkerId, result: std::result::Result<WorkerExit, JoinError>) {
        self.registry.forget(id);
        self.ready.remove(&id);

        if self.dying.remove(&id) {
            // Replacement was spawned when it was killed
            debug!(worker = %id, "Killed worker reaped");
            return;
        }
        if self.pool.remove(&id).is_none() {
            return;
        }

        let crashed = match result {
            Ok(exit) => {
                logger::log_worker_exit(id, exit);
                exit == WorkerExit::Fault
            }
            Err(e) if e.is_panic() => {
                logger::log_worker_panicked(id);
                true
            }
            Err(_) => {
                warn!(worker = %id, "Worker task cancelled");
                false
            }
        };

        if !self.accepting() {
            return;
        }
        if crashed {
            let consecutive = self.crashes.record(self.registry.completed());
            let delay = self.params.respawn.delay_for(consecutive);
            if !delay.is_zero() {
                logger::log_respawn_delayed(consecutive, delay);
                self.delayed_respawns += 1;
                let at = Instant::now() + delay;
                self.respawn_at = Some(self.respawn_at.map_or(at, |current| current.max(at)));
                return;
            }
        }
        self.fill_pool();
    }

    fn on_respawn_timer(&mut self) {
        self.respawn_at = None;
        self.delayed_respawns = 0;
        if self.accepting() {
            self.fill_pool();
        }
    }

    fn on_expired(&mut self, expired: Expired) {
        if !self.pool.contains_key(&expired.worker) {
            return;
        }
        let Some(record) = self.registry.claim(expired) else {
            debug!(worker = %expired.worker, "Request finished before timeout kill, skipping");
            return;
        };
        logger::log_timeout_kill(
            expired.worker,
            &record.peer,
            record.started.elapsed(),
            self.params.timeout,
        );
        self.kill(expired.worker);
        if self.accepting() {
            self.fill_pool();
        }
    }

    fn on_lifecycle_event(&mut self, event: LifecycleEvent) {
        info!(?event, state = %self.state, "Lifecycle event");
        match event {
            LifecycleEvent::Shutdown => {
                if self.accepting() {
                    self.begin_drain();
                }
            }
            LifecycleEvent::ForceShutdown => {
                if self.accepting() {
                    self.begin_drain();
                }
                let remaining: Vec<WorkerId> = self.pool.keys().copied().collect();
                for id in remaining {
                    logger::log_fault(id, Fault::DrainTimeout);
                    self.kill(id);
                }
            }
            LifecycleEvent::Reload => {
                if self.accepting() {
                    let mut current: Vec<WorkerId> = self
                        .pool
                        .iter()
                        .filter(|(_, slot)| !slot.terminating)
                        .map(|(id, _)| *id)
                        .collect();
                    current.sort_unstable();
                    self.reload_queue = current.into();
                }
            }
            LifecycleEvent::IncreaseWorkers => {
                if self.accepting() {
                    self.target += 1;
                    self.fill_pool();
                }
            }
            LifecycleEvent::DecreaseWorkers => {
                if self.accepting() && self.target > 1 {
                    self.target -= 1;
                    self.retire_one();
                }
            }
        }
    }

    /// Ask one worker to exit once idle, preferring an idle one.
    fn retire_one(&mut self) {
        let registry = &self.registry;
        let candidate = self
            .pool
            .iter()
            .filter(|(_, slot)| !slot.terminating)
            .min_by_key(|(id, _)| (registry.get(**id).is_some(), std::cmp::Reverse(**id)))
            .map(|(id, _)| *id);
        if let Some(slot) = candidate.and_then(|id| self.pool.get_mut(&id)) {
            slot.terminating = true;
            slot.terminate.cancel();
        }
    }

    /// Retire the next worker queued by a reload, once no other pool member
    /// is on its way out. Its replacement is spawned when it exits.
    fn advance_reload(&mut self) {
        if self.pool.values().any(|slot| slot.terminating) {
            return;
        }
        while let Some(id) = self.reload_queue.pop_front() {
            if let Some(slot) = self.pool.get_mut(&id) {
                debug!(worker = %id, remaining = self.reload_queue.len(), "Reload retiring worker");
                slot.terminating = true;
                slot.terminate.cancel();
                return;
            }
        }
    }

    fn begin_drain(&mut self) {
        self.state = SupervisorState::Draining;
        self.reload_queue.clear();
        self.listener.close();
        for slot in self.pool.values_mut() {
            slot.terminating = true;
            slot.terminate.cancel();
        }
        self.delayed_respawns = 0;
        self.respawn_at = None;
        self.drain_deadline = Some(Instant::now() + self.params.graceful_timeout);
        logger::log_drain_started(self.registry.in_flight(), self.params.graceful_timeout);
    }

    fn on_drain_deadline(&mut self) {
        self.drain_deadline = None;
        let remaining: Vec<WorkerId> = self.pool.keys().copied().collect();
        if remaining.is_empty() {
            return;
        }
        logger::log_drain_deadline(remaining.len());
        for id in remaining {
            logger::log_fault(id, Fault::DrainTimeout);
            self.kill(id);
        }
    }

    fn publish(&self) {
        let mut workers: Vec<WorkerId> = self.pool.keys().copied().collect();
        workers.sort_unstable();
        let mut terminating: Vec<WorkerId> = self
            .pool
            .iter()
            .filter(|(_, slot)| slot.terminating)
            .map(|(id, _)| *id)
            .collect();
        terminating.sort_unstable();

        self.status_tx.send_replace(PoolStatus {
            state: self.state,
            target: self.target,
            workers,
            terminating,
            spawned_total: self.spawned_total,
            killed_total: self.killed_total,
        });
    }
}

/// Cloneable control and observation handle for a [`Supervisor`]
#[derive(Clone)]
pub struct SupervisorHandle {
    commands: mpsc::UnboundedSender<LifecycleEvent>,
    status: watch::Receiver<PoolStatus>,
    registry: Arc<InFlightRegistry>,
    local_addr: SocketAddr,
}

impl SupervisorHandle {
    /// Deliver an event; `false` once the supervisor has finished.
    pub fn send(&self, event: LifecycleEvent) -> bool {
        self.commands.send(event).is_ok()
    }

    pub fn shutdown(&self) -> bool {
        self.send(LifecycleEvent::Shutdown)
    }

    pub fn force_shutdown(&self) -> bool {
        self.send(LifecycleEvent::ForceShutdown)
    }

    pub fn reload(&self) -> bool {
        self.send(LifecycleEvent::Reload)
    }

    pub fn increase_workers(&self) -> bool {
        self.send(LifecycleEvent::IncreaseWorkers)
    }

    pub fn decrease_workers(&self) -> bool {
        self.send(LifecycleEvent::DecreaseWorkers)
    }

    pub fn status(&self) -> PoolStatus {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> SupervisorState {
        self.status.borrow().state
    }

    pub fn pool_size(&self) -> usize {
        self.status.borrow().pool_size()
    }

    pub fn in_flight(&self) -> usize {
        self.registry.in_flight()
    }

    /// Live per-worker state: pool membership from the last snapshot,
    /// busy/idle from the in-flight records.
    pub fn worker_states(&self) -> Vec<(WorkerId, WorkerState)> {
        let status = self.status();
        status
            .workers
            .iter()
            .map(|id| {
                let state = if status.terminating.contains(id) {
                    WorkerState::Terminating
                } else if self.registry.get(*id).is_some() {
                    WorkerState::Busy
                } else {
                    WorkerState::Idle
                };
                (*id, state)
            })
            .collect()
    }

    /// Wait until a published snapshot satisfies `predicate`.
    ///
    /// Returns `None` if the supervisor finished without ever satisfying it.
    pub async fn wait_for(&self, predicate: impl FnMut(&PoolStatus) -> bool) -> Option<PoolStatus> {
        let mut status = self.status.clone();
        let result = status.wait_for(predicate).await;
        result.ok().map(|snapshot| snapshot.clone())
    }

    pub async fn wait_for_state(&self, state: SupervisorState) -> bool {
        self.wait_for(|status| status.state == state).await.is_some()
    }

    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}
