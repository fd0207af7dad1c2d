use std::{sync::Arc, time::Duration};

use futures::future::join_all;
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    backoff::RetryPolicy,
    config::RouterConfig,
    error::Error,
    inbox::Inbox,
    port::PortDriver,
    serial::SerialDriver,
    status::{RouterStatus, StatusBoard, WorkerRole},
    watchdog::{RestartRecord, Slots, Watchdog, WorkerSlot},
    worker::WorkerSpec,
};

struct Running<D: PortDriver> {
    cancel: CancellationToken,
    slots: Slots<D>,
    watchdog: JoinHandle<()>,
    inboxes: [Inbox; 3],
    grace: Duration,
}

/// Routes one incoming port to two outgoing ports.
///
/// Bytes read from the incoming port are written to both outgoing ports.
/// Bytes read from either outgoing port are written to the incoming port.
///
/// Each port is served by its own worker task, and a watchdog task restarts stuck workers.
/// Must be started from within a Tokio runtime.
pub struct Router<D: PortDriver = SerialDriver> {
    driver: D,
    status: StatusBoard,
    running: Option<Running<D>>,
}

impl Router<SerialDriver> {
    /// A router using real serial ports.
    pub fn serial() -> Self {
        Self::new(SerialDriver)
    }
}

impl<D: PortDriver> Router<D> {
    /// A stopped router which opens ports through `driver`.
    pub fn new(driver: D) -> Self {
        Self {
            driver,
            status: StatusBoard::new(["", "", ""]),
            running: None,
        }
    }

    /// Validate `config` and start routing.
    ///
    /// Returns as soon as the workers are spawned, ports are opened in the background.
    /// A bad config is refused before any port is touched.
    pub fn start(&mut self, config: RouterConfig) -> Result<(), Error> {
        if self.running.is_some() {
            return Err(Error::AlreadyRunning);
        }

        config.validate()?;

        let RouterConfig {
            incoming,
            outgoing: [outgoing_a, outgoing_b],
            max_backoff,
            watchdog: supervision,
            ..
        } = config;

        info!(
            incoming = %incoming.name,
            outgoing_a = %outgoing_a.name,
            outgoing_b = %outgoing_b.name,
            ?max_backoff,
            "Starting router"
        );

        let status = StatusBoard::new([
            incoming.name.as_str(),
            outgoing_a.name.as_str(),
            outgoing_b.name.as_str(),
        ]);
        let policy = RetryPolicy::new(max_backoff);

        let inboxes = [Inbox::default(), Inbox::default(), Inbox::default()];
        let [to_incoming, to_a, to_b] = inboxes.clone();

        let spec = |role, port, inbox, fan_out| WorkerSpec {
            role,
            port,
            driver: self.driver.clone(),
            inbox,
            fan_out,
            policy,
            status: status.clone(),
        };

        let specs = [
            spec(
                WorkerRole::Incoming,
                incoming,
                to_incoming.clone(),
                vec![to_a.clone(), to_b.clone()],
            ),
            spec(
                WorkerRole::OutgoingA,
                outgoing_a,
                to_a,
                vec![to_incoming.clone()],
            ),
            spec(WorkerRole::OutgoingB, outgoing_b, to_b, vec![to_incoming]),
        ];

        // Every inbox has its reader before any worker can publish.
        let readers = specs
            .iter()
            .map(|spec| spec.inbox.reader())
            .collect::<Vec<_>>();

        let cancel = CancellationToken::new();
        status.set_running(true);

        let slots = specs
            .into_iter()
            .zip(readers)
            .map(|(spec, reader)| {
                let handle = spec.spawn(&cancel, 0, reader);

                WorkerSlot {
                    spec,
                    handle: Some(handle),
                    record: RestartRecord::default(),
                }
            })
            .collect();
        let slots = Arc::new(Mutex::new(slots));

        let watchdog =
            Watchdog::new(slots.clone(), supervision, cancel.clone(), status.clone()).spawn();

        self.status = status;
        self.running = Some(Running {
            cancel,
            slots,
            watchdog,
            inboxes,
            grace: supervision.restart_grace,
        });

        Ok(())
    }

    /// Stop routing.
    ///
    /// Waits until every worker and the watchdog have exited and every port is closed.
    /// Workers which do not stop within the restart grace period are aborted.
    /// Stopping a stopped router does nothing.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            debug!("Not running");
            return;
        };

        info!("Stopping router");
        running.cancel.cancel();

        if let Err(e) = running.watchdog.await {
            warn!(%e, "Watchdog ended abnormally");
        }

        let handles = running
            .slots
            .lock()
            .await
            .iter_mut()
            .filter_map(|slot| slot.handle.take())
            .collect::<Vec<_>>();

        join_all(
            handles
                .into_iter()
                .map(|handle| handle.shutdown(running.grace)),
        )
        .await;

        self.status.set_running(false);
        info!("Router stopped");
    }

    /// True between a successful [`Router::start`] and [`Router::stop`].
    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// A consistent snapshot of every worker.
    ///
    /// Still available after stopping, showing the final state.
    pub fn status(&self) -> RouterStatus {
        let mut status = self.status.snapshot();

        if let Some(running) = &self.running {
            for (worker, inbox) in status.workers.iter_mut().zip(&running.inboxes) {
                worker.queued = inbox.len();
            }
        }

        status
    }
}

impl<D: PortDriver> Drop for Router<D> {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            debug!("Router dropped while running, cancelling workers");
            running.cancel.cancel();
        }
    }
}

impl<D: PortDriver> std::fmt::Debug for Router<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("driver", &self.driver)
            .field("running", &self.is_running())
            .finish()
    }
}
