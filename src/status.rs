use std::{
    fmt::Display,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::info;

use crate::{port::PortState, stats::Statistics};

/// Which of the three workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum WorkerRole {
    /// Owns the externally facing port.
    Incoming,

    /// Owns the first outgoing port.
    OutgoingA,

    /// Owns the second outgoing port.
    OutgoingB,
}

impl WorkerRole {
    /// Every role, in index order.
    pub const ALL: [WorkerRole; 3] = [
        WorkerRole::Incoming,
        WorkerRole::OutgoingA,
        WorkerRole::OutgoingB,
    ];

    /// Position in per-worker arrays.
    pub fn index(self) -> usize {
        match self {
            WorkerRole::Incoming => 0,
            WorkerRole::OutgoingA => 1,
            WorkerRole::OutgoingB => 2,
        }
    }

    /// The short name used in logs.
    pub fn name(self) -> &'static str {
        match self {
            WorkerRole::Incoming => "incoming",
            WorkerRole::OutgoingA => "outgoing-a",
            WorkerRole::OutgoingB => "outgoing-b",
        }
    }
}

impl Display for WorkerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug)]
struct Entry {
    port: String,
    state: PortState,
    stats: Statistics,
    consecutive_failures: u32,
    last_error: Option<String>,
    last_error_at: Option<DateTime<Utc>>,
    heartbeat: Instant,
    restarts_in_window: usize,
    total_restarts: u64,
    persistent_failure: bool,
}

impl Entry {
    fn new(port: &str) -> Self {
        Self {
            port: port.to_owned(),
            state: PortState::Disconnected,
            stats: Statistics::default(),
            consecutive_failures: 0,
            last_error: None,
            last_error_at: None,
            heartbeat: Instant::now(),
            restarts_in_window: 0,
            total_restarts: 0,
            persistent_failure: false,
        }
    }
}

fn log_transition(role: WorkerRole, from: PortState, to: PortState) {
    if from != to {
        info!(%role, %from, %to, "State change");
    }
}

#[derive(Debug)]
struct Board {
    running: bool,
    started_at: Option<DateTime<Utc>>,
    entries: [Entry; 3],
    watchdog_restarts: u64,
}

/// Shared per-worker status.
///
/// Workers and the watchdog update their own entries,
/// readers take a [`RouterStatus`] snapshot.
/// Everything sits behind one lock.
#[derive(Debug, Clone)]
pub struct StatusBoard(Arc<Mutex<Board>>);

impl StatusBoard {
    /// A board for the given ports, in [`WorkerRole::ALL`] order.
    pub fn new(ports: [&str; 3]) -> Self {
        Self(Arc::new(Mutex::new(Board {
            running: false,
            started_at: None,
            entries: ports.map(Entry::new),
            watchdog_restarts: 0,
        })))
    }

    fn board(&self) -> MutexGuard<'_, Board> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_entry<R>(&self, role: WorkerRole, f: impl FnOnce(&mut Entry) -> R) -> R {
        f(&mut self.board().entries[role.index()])
    }

    pub(crate) fn set_running(&self, running: bool) {
        let mut board = self.board();
        board.running = running;
        if running {
            board.started_at = Some(Utc::now());
        }
    }

    pub(crate) fn worker_spawned(&self, role: WorkerRole, failures: u32) {
        let previous = self.with_entry(role, |entry| {
            entry.consecutive_failures = failures;
            entry.heartbeat = Instant::now();
            std::mem::replace(&mut entry.state, PortState::Disconnected)
        });

        log_transition(role, previous, PortState::Disconnected);
    }

    pub(crate) fn set_state(&self, role: WorkerRole, state: PortState) {
        let previous = self.with_entry(role, |entry| std::mem::replace(&mut entry.state, state));

        log_transition(role, previous, state);
    }

    pub(crate) fn connected(&self, role: WorkerRole) {
        let previous = self.with_entry(role, |entry| {
            entry.consecutive_failures = 0;
            std::mem::replace(&mut entry.state, PortState::Connected)
        });

        log_transition(role, previous, PortState::Connected);
    }

    pub(crate) fn failed(&self, role: WorkerRole, failures: u32, error: &dyn Display) {
        let message = error.to_string();

        let previous = self.with_entry(role, |entry| {
            entry.consecutive_failures = failures;
            entry.last_error = Some(message);
            entry.last_error_at = Some(Utc::now());
            std::mem::replace(&mut entry.state, PortState::Disconnected)
        });

        log_transition(role, previous, PortState::Disconnected);
    }

    pub(crate) fn heartbeat(&self, role: WorkerRole) {
        self.with_entry(role, |entry| entry.heartbeat = Instant::now())
    }

    pub(crate) fn heartbeat_age(&self, role: WorkerRole, now: Instant) -> Duration {
        self.with_entry(role, |entry| now.saturating_duration_since(entry.heartbeat))
    }

    pub(crate) fn record_from_port(&self, role: WorkerRole, bytes: usize) {
        self.with_entry(role, |entry| entry.stats.from_port.record(bytes))
    }

    pub(crate) fn record_to_port(&self, role: WorkerRole, bytes: usize) {
        self.with_entry(role, |entry| {
            entry.stats.to_port.record(bytes);
            entry.heartbeat = Instant::now();
        })
    }

    pub(crate) fn record_dropped(&self, role: WorkerRole, chunks: u64) {
        self.with_entry(role, |entry| entry.stats.dropped_chunks += chunks)
    }

    pub(crate) fn restarted(&self, role: WorkerRole, restarts_in_window: usize) {
        let mut board = self.board();
        board.watchdog_restarts += 1;

        let entry = &mut board.entries[role.index()];
        entry.total_restarts += 1;
        entry.restarts_in_window = restarts_in_window;
        entry.persistent_failure = false;
    }

    pub(crate) fn persistent_failure(&self, role: WorkerRole, restarts_in_window: usize) {
        self.with_entry(role, |entry| {
            entry.restarts_in_window = restarts_in_window;
            entry.persistent_failure = true;
        })
    }

    /// A consistent view of every worker, taken under a single lock.
    pub fn snapshot(&self) -> RouterStatus {
        let now = Instant::now();
        let board = self.board();

        let workers = WorkerRole::ALL
            .iter()
            .zip(&board.entries)
            .map(|(&role, entry)| WorkerStatus {
                role,
                port: entry.port.clone(),
                state: entry.state,
                to_port_total: entry.stats.to_port.session_total(),
                from_port_total: entry.stats.from_port.session_total(),
                to_port_window: entry.stats.to_port.window(),
                from_port_window: entry.stats.from_port.window(),
                to_port_rate: entry.stats.to_port.rate(now),
                from_port_rate: entry.stats.from_port.rate(now),
                dropped_chunks: entry.stats.dropped_chunks,
                queued: 0,
                consecutive_failures: entry.consecutive_failures,
                last_error: entry.last_error.clone(),
                last_error_at: entry.last_error_at,
                heartbeat_age: now.saturating_duration_since(entry.heartbeat),
                restarts_in_window: entry.restarts_in_window,
                total_restarts: entry.total_restarts,
                persistent_failure: entry.persistent_failure,
            })
            .collect();

        RouterStatus {
            running: board.running,
            started_at: board.started_at,
            workers,
            watchdog_restarts: board.watchdog_restarts,
        }
    }
}

/// One worker as seen at snapshot time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerStatus {
    /// Which worker.
    pub role: WorkerRole,

    /// The port it owns.
    pub port: String,

    /// Connection state.
    pub state: PortState,

    /// Bytes written to the port this session.
    pub to_port_total: u128,

    /// Bytes read from the port this session.
    pub from_port_total: u128,

    /// Bytes written within the current rate window.
    pub to_port_window: u64,

    /// Bytes read within the current rate window.
    pub from_port_window: u64,

    /// Write rate in bytes per second.
    pub to_port_rate: f64,

    /// Read rate in bytes per second.
    pub from_port_rate: f64,

    /// Chunks lost to inbox overflow.
    pub dropped_chunks: u64,

    /// Chunks waiting in the worker's inbox.
    pub queued: usize,

    /// Failed connects or lost connections since the last successful connect.
    pub consecutive_failures: u32,

    /// The most recent problem, if any.
    pub last_error: Option<String>,

    /// When the most recent problem happened.
    pub last_error_at: Option<DateTime<Utc>>,

    /// Time since the worker last showed progress.
    pub heartbeat_age: Duration,

    /// Watchdog restarts within the current restart window.
    pub restarts_in_window: usize,

    /// Watchdog restarts since start.
    pub total_restarts: u64,

    /// The watchdog has given up restarting this worker for now.
    pub persistent_failure: bool,
}

impl Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} [{}] {}: to port {} B ({:.0} B/s), from port {} B ({:.0} B/s)",
            self.role,
            self.port,
            self.state,
            self.to_port_total,
            self.to_port_rate,
            self.from_port_total,
            self.from_port_rate,
        )?;
        write!(
            f,
            ", failures {}, restarts {}",
            self.consecutive_failures, self.total_restarts
        )?;

        if let Some(error) = &self.last_error {
            write!(f, ", last error: {error}")?;
        }

        if self.persistent_failure {
            write!(f, " (PERSISTENT FAILURE)")?;
        }

        Ok(())
    }
}

/// The whole router as seen at snapshot time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouterStatus {
    /// Whether the router has been started and not stopped.
    pub running: bool,

    /// When it was last started.
    pub started_at: Option<DateTime<Utc>>,

    /// One entry per worker, in [`WorkerRole::ALL`] order.
    pub workers: Vec<WorkerStatus>,

    /// Restarts issued by the watchdog, all workers together.
    pub watchdog_restarts: u64,
}

impl RouterStatus {
    /// The entry for one worker.
    pub fn worker(&self, role: WorkerRole) -> &WorkerStatus {
        &self.workers[role.index()]
    }

    /// True if every port is connected.
    pub fn all_connected(&self) -> bool {
        self.workers
            .iter()
            .all(|worker| worker.state == PortState::Connected)
    }

    /// Bytes moved by all workers, both directions.
    pub fn total_bytes(&self) -> u128 {
        self.workers
            .iter()
            .map(|worker| worker.to_port_total + worker.from_port_total)
            .sum()
    }
}
