//! Supervision of the routing workers.
//!
//! A worker reconnecting on its own is normal and not the watchdog's business.
//! The watchdog only steps in when a worker stops showing progress entirely,
//! or when its task has ended without being asked to.

use std::{collections::VecDeque, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::{
    sync::Mutex,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    error::SupervisionError,
    port::PortDriver,
    status::StatusBoard,
    worker::{WorkerHandle, WorkerSpec},
};

/// How often workers are checked.
pub const DEFAULT_PERIOD: Duration = Duration::from_secs(10);

/// A heartbeat older than this means the worker is stuck.
pub const DEFAULT_STALL_THRESHOLD: Duration = Duration::from_secs(30);

/// Most restarts allowed per worker within [`DEFAULT_RESTART_WINDOW`].
pub const DEFAULT_RESTART_LIMIT: usize = 10;

/// The trailing window restarts are counted in.
pub const DEFAULT_RESTART_WINDOW: Duration = Duration::from_secs(60 * 60);

/// How long a worker being restarted gets to stop on its own before it is aborted.
pub const DEFAULT_RESTART_GRACE: Duration = Duration::from_secs(2);

/// A restarted worker starts as if it had failed once.
const RESTART_FAILURE_SEED: u32 = 1;

/// Supervision settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchdogConfig {
    /// How often workers are checked.
    pub period: Duration,

    /// Heartbeat age which counts as a stall.
    ///
    /// Never lower than three times a worker's own cadence.
    pub stall_threshold: Duration,

    /// Most restarts per worker within `restart_window`.
    pub restart_limit: usize,

    /// The trailing window restarts are counted in.
    pub restart_window: Duration,

    /// How long a worker gets to stop before it is aborted.
    pub restart_grace: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            period: DEFAULT_PERIOD,
            stall_threshold: DEFAULT_STALL_THRESHOLD,
            restart_limit: DEFAULT_RESTART_LIMIT,
            restart_window: DEFAULT_RESTART_WINDOW,
            restart_grace: DEFAULT_RESTART_GRACE,
        }
    }
}

/// The outcome of asking for a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Go ahead. Holds the number of restarts within the window, this one included.
    Granted(usize),

    /// The budget is spent. Holds the number of restarts within the window.
    Exhausted(usize),
}

/// When a worker was restarted, within the trailing window.
#[derive(Debug, Clone, Default)]
pub struct RestartRecord {
    restarts: VecDeque<Instant>,
}

impl RestartRecord {
    /// Forget restarts which are no longer within `window` of `now`.
    pub fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.restarts.front() {
            if now.saturating_duration_since(oldest) >= window {
                self.restarts.pop_front();
            } else {
                break;
            }
        }
    }

    /// Ask to restart at `now`, recording it if allowed.
    pub fn admit(&mut self, now: Instant, limit: usize, window: Duration) -> Admission {
        self.prune(now, window);

        if self.restarts.len() >= limit {
            Admission::Exhausted(self.restarts.len())
        } else {
            self.restarts.push_back(now);
            Admission::Granted(self.restarts.len())
        }
    }

    /// Restarts currently recorded.
    pub fn len(&self) -> usize {
        self.restarts.len()
    }

    /// True if none are recorded.
    pub fn is_empty(&self) -> bool {
        self.restarts.is_empty()
    }
}

/// A worker as the watchdog sees it.
#[derive(Debug)]
pub(crate) struct WorkerSlot<D: PortDriver> {
    pub(crate) spec: WorkerSpec<D>,
    pub(crate) handle: Option<WorkerHandle>,
    pub(crate) record: RestartRecord,
}

/// The workers, under the lock which must be held to restart or stop any of them.
pub(crate) type Slots<D> = Arc<Mutex<Vec<WorkerSlot<D>>>>;

pub(crate) struct Watchdog<D: PortDriver> {
    slots: Slots<D>,
    config: WatchdogConfig,
    cancel: CancellationToken,
    status: StatusBoard,
}

impl<D: PortDriver> Watchdog<D> {
    pub(crate) fn new(
        slots: Slots<D>,
        config: WatchdogConfig,
        cancel: CancellationToken,
        status: StatusBoard,
    ) -> Self {
        Self {
            slots,
            config,
            cancel,
            status,
        }
    }

    pub(crate) fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run().instrument(info_span!("watchdog")))
    }

    async fn run(self) {
        let period = self.config.period;
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!(?period, "Watchdog started");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            self.tick().await;
        }

        debug!("Watchdog stopped");
    }

    /// Check every worker once.
    pub(crate) async fn tick(&self) {
        let mut slots = self.slots.lock().await;

        for slot in slots.iter_mut() {
            if self.cancel.is_cancelled() {
                return;
            }

            self.check(slot).await;
        }
    }

    fn diagnose(&self, slot: &WorkerSlot<D>, now: Instant) -> Option<SupervisionError> {
        let worker = slot.spec.role;

        match &slot.handle {
            Some(handle) if !handle.is_finished() => {
                let threshold = self.config.stall_threshold.max(slot.spec.cadence() * 3);
                let since = self.status.heartbeat_age(worker, now);

                (since > threshold).then_some(SupervisionError::Stall { worker, since })
            }
            _ => Some(SupervisionError::Crashed { worker }),
        }
    }

    async fn check(&self, slot: &mut WorkerSlot<D>) {
        let now = Instant::now();
        let worker = slot.spec.role;

        let Some(problem) = self.diagnose(slot, now) else {
            return;
        };

        match slot
            .record
            .admit(now, self.config.restart_limit, self.config.restart_window)
        {
            Admission::Granted(restarts) => {
                error!(%problem, "Restarting worker");

                // Chunks still waiting for the stalled worker go with it.
                // The replacement only sees what is posted from here on.
                let stranded = slot.spec.inbox.len();
                let reader = slot.spec.inbox.reader();

                if let Some(handle) = slot.handle.take() {
                    handle.shutdown(self.config.restart_grace).await;
                }

                slot.handle = Some(slot.spec.spawn(&self.cancel, RESTART_FAILURE_SEED, reader));
                self.status.restarted(worker, restarts);

                if stranded > 0 {
                    warn!(%worker, stranded, "Queued chunks dropped with the stalled worker");
                    self.status.record_dropped(worker, stranded as u64);
                }

                info!(%worker, restarts, "Worker restarted");
            }
            Admission::Exhausted(restarts) => {
                let escalation = SupervisionError::PersistentFailure { worker, restarts };

                error!(%problem, "{escalation}");
                self.status.persistent_failure(worker, restarts);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        backoff::RetryPolicy,
        config::PortConfig,
        inbox::Inbox,
        mock::MockDriver,
        port::PortState,
        status::WorkerRole,
    };

    #[test]
    fn record_limits_within_window() {
        let mut record = RestartRecord::default();
        let start = Instant::now();
        let window = Duration::from_secs(3600);

        for i in 1..=10 {
            let now = start + Duration::from_secs(i * 60);
            assert_eq!(record.admit(now, 10, window), Admission::Granted(i as usize));
        }

        let eleventh = start + Duration::from_secs(11 * 60);
        assert_eq!(record.admit(eleventh, 10, window), Admission::Exhausted(10));
        assert_eq!(record.len(), 10);

        // The first restart leaves the window an hour after it happened.
        let later = start + Duration::from_secs(60 + 3600);
        assert_eq!(record.admit(later, 10, window), Admission::Granted(10));
    }

    #[test]
    fn prune_forgets_old_restarts() {
        let mut record = RestartRecord::default();
        let start = Instant::now();
        let window = Duration::from_secs(10);

        record.admit(start, 5, window);
        record.admit(start + Duration::from_secs(5), 5, window);
        record.prune(start + Duration::from_secs(12), window);

        assert_eq!(record.len(), 1);
    }

    fn hanging_slots(
        driver: &MockDriver,
        cancel: &CancellationToken,
        status: &StatusBoard,
    ) -> Slots<MockDriver> {
        let spec = WorkerSpec {
            role: WorkerRole::OutgoingA,
            port: PortConfig::new("COM131", 115_200, Duration::from_millis(100)),
            driver: driver.clone(),
            inbox: Inbox::default(),
            fan_out: vec![],
            policy: RetryPolicy::new(Duration::from_secs(1)),
            status: status.clone(),
        };
        let handle = spec.spawn(cancel, 0, spec.inbox.reader());

        Arc::new(Mutex::new(vec![WorkerSlot {
            spec,
            handle: Some(handle),
            record: RestartRecord::default(),
        }]))
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_worker_is_restarted_until_budget_spent() {
        let driver = MockDriver::default();
        let device = driver.plug("COM131");
        device.hang_opens(true);

        let cancel = CancellationToken::new();
        let status = StatusBoard::new(["COM3", "COM131", "COM141"]);
        let slots = hanging_slots(&driver, &cancel, &status);

        let config = WatchdogConfig {
            restart_limit: 2,
            ..Default::default()
        };
        let watchdog = Watchdog::new(slots.clone(), config, cancel.clone(), status.clone());

        // Fresh heartbeat, nothing to do.
        watchdog.tick().await;
        assert_eq!(status.snapshot().watchdog_restarts, 0);

        for expected in 1..=2 {
            tokio::time::sleep(Duration::from_secs(40)).await;
            watchdog.tick().await;

            let snapshot = status.snapshot();
            assert_eq!(snapshot.watchdog_restarts, expected);
            assert!(!snapshot.worker(WorkerRole::OutgoingA).persistent_failure);
        }

        tokio::time::sleep(Duration::from_secs(40)).await;
        watchdog.tick().await;

        let snapshot = status.snapshot();
        let worker = snapshot.worker(WorkerRole::OutgoingA);
        assert_eq!(snapshot.watchdog_restarts, 2);
        assert_eq!(worker.restarts_in_window, 2);
        assert!(worker.persistent_failure);
        assert_eq!(worker.state, PortState::Connecting);
        assert_eq!(device.open_attempts(), 3);
        assert_eq!(device.max_concurrent_handles(), 0);

        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_worker_is_left_alone() {
        let driver = MockDriver::default();
        let _device = driver.plug("COM131");

        let cancel = CancellationToken::new();
        let status = StatusBoard::new(["COM3", "COM131", "COM141"]);
        let slots = hanging_slots(&driver, &cancel, &status);
        let watchdog = Watchdog::new(
            slots,
            WatchdogConfig::default(),
            cancel.clone(),
            status.clone(),
        );

        for _ in 0..10 {
            tokio::time::sleep(Duration::from_secs(10)).await;
            watchdog.tick().await;
        }

        let snapshot = status.snapshot();
        assert_eq!(snapshot.watchdog_restarts, 0);
        assert_eq!(snapshot.worker(WorkerRole::OutgoingA).state, PortState::Connected);

        cancel.cancel();
    }
}
