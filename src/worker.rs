//! The routing worker.
//!
//! Each worker owns one port exclusively.
//! It reads from the port and publishes what it reads to the other workers' inboxes,
//! and writes whatever arrives in its own inbox to the port.
//! When the port goes away it reconnects on its own, backing off between attempts.

use std::time::Duration;

use bytes::Bytes;
use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    backoff::RetryPolicy,
    config::PortConfig,
    error::PortError,
    inbox::{Inbox, InboxReader},
    port::{PortConnection, PortDriver, PortState},
    status::{StatusBoard, WorkerRole},
};

/// At most this many chunks are written per loop iteration.
pub const DRAIN_BATCH: usize = 64;

/// A waiting worker still shows it is alive this often.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Reads wait at least this long, so a zero timeout does not spin.
pub const READ_WINDOW_FLOOR: Duration = Duration::from_millis(5);

/// Writes are given at least this long to complete.
pub const WRITE_DEADLINE_FLOOR: Duration = Duration::from_secs(1);

/// Connect failures up to this many are logged as warnings.
const LOUD_FAILURES: u32 = 3;

/// Everything needed to spawn a worker, and to spawn it again after a restart.
#[derive(Debug, Clone)]
pub(crate) struct WorkerSpec<D: PortDriver> {
    pub(crate) role: WorkerRole,
    pub(crate) port: PortConfig,
    pub(crate) driver: D,
    pub(crate) inbox: Inbox,
    pub(crate) fan_out: Vec<Inbox>,
    pub(crate) policy: RetryPolicy,
    pub(crate) status: StatusBoard,
}

impl<D: PortDriver> WorkerSpec<D> {
    pub(crate) fn read_window(&self) -> Duration {
        self.port.timeout.max(READ_WINDOW_FLOOR)
    }

    pub(crate) fn write_deadline(&self) -> Duration {
        self.port.timeout.max(WRITE_DEADLINE_FLOOR)
    }

    /// The longest a healthy worker goes without a heartbeat.
    pub(crate) fn cadence(&self) -> Duration {
        self.read_window()
            .max(self.write_deadline())
            .max(HEARTBEAT_INTERVAL)
    }

    /// Start a worker under `parent`, seeded with `failures` consecutive failures.
    ///
    /// `inbox` is a reader of this worker's inbox, taken before any chunk meant for it is posted.
    pub(crate) fn spawn(
        &self,
        parent: &CancellationToken,
        failures: u32,
        inbox: InboxReader,
    ) -> WorkerHandle {
        let cancel = parent.child_token();

        self.status.worker_spawned(self.role, failures);

        let worker = RoutingWorker {
            role: self.role,
            conn: PortConnection::new(self.driver.clone(), self.port.clone()),
            inbox,
            fan_out: self.fan_out.clone(),
            policy: self.policy,
            status: self.status.clone(),
            cancel: cancel.clone(),
            failures,
            read_window: self.read_window(),
            write_deadline: self.write_deadline(),
        };

        let span = info_span!("worker", role = %self.role, port = %self.port.name);
        let join = tokio::spawn(worker.run().instrument(span));

        WorkerHandle { cancel, join }
    }
}

/// A running worker.
#[derive(Debug)]
pub(crate) struct WorkerHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    /// True if the worker's task has ended.
    pub(crate) fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Ask the worker to stop, and force it if it does not within `grace`.
    ///
    /// Once this returns the worker is gone and its port is closed.
    pub(crate) async fn shutdown(self, grace: Duration) {
        self.cancel.cancel();

        let mut join = self.join;

        match tokio::time::timeout(grace, &mut join).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(%e, "Worker ended abnormally"),
            Err(_elapsed) => {
                warn!(?grace, "Worker did not stop in time, aborting it");
                join.abort();
                // Joining makes sure the task, and with it the port, has been dropped.
                let _ = join.await;
            }
        }
    }
}

enum Event {
    Read(Result<Bytes, PortError>),
    Inbox(Bytes),
}

struct RoutingWorker<D: PortDriver> {
    role: WorkerRole,
    conn: PortConnection<D>,
    inbox: InboxReader,
    fan_out: Vec<Inbox>,
    policy: RetryPolicy,
    status: StatusBoard,
    cancel: CancellationToken,
    failures: u32,
    read_window: Duration,
    write_deadline: Duration,
}

impl<D: PortDriver> RoutingWorker<D> {
    async fn run(mut self) {
        info!(failures = self.failures, "Worker started");

        while !self.cancel.is_cancelled() {
            let keep_going = if self.conn.is_open() {
                self.pump().await
            } else {
                self.reconnect().await
            };

            if !keep_going {
                break;
            }

            self.status.heartbeat(self.role);
        }

        self.conn.close();
        self.status.set_state(self.role, PortState::Disconnected);

        info!("Worker stopped");
    }

    /// Sleep for `delay`, heartbeating along the way.
    ///
    /// Returns false if cancelled.
    async fn wait(&mut self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;

        loop {
            let now = Instant::now();
            if now >= deadline {
                return true;
            }

            let slice = (deadline - now).min(HEARTBEAT_INTERVAL);

            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                _ = tokio::time::sleep(slice) => {}
            }

            self.status.heartbeat(self.role);
        }
    }

    async fn reconnect(&mut self) -> bool {
        let delay = self.policy.delay(self.failures);

        if !delay.is_zero() {
            debug!(?delay, failures = self.failures, "Waiting before reconnecting");

            if !self.wait(delay).await {
                return false;
            }
        }

        self.status.set_state(self.role, PortState::Connecting);
        debug!(attempt = self.failures.saturating_add(1), "Connecting");

        let opened = tokio::select! {
            _ = self.cancel.cancelled() => return false,
            opened = self.conn.open() => opened,
        };

        match opened {
            Ok(()) => {
                if self.failures > 0 {
                    info!(failures = self.failures, "Connected after failures");
                } else {
                    info!("Connected");
                }

                self.failures = 0;
                self.status.connected(self.role);
            }
            Err(e) => {
                self.failures = self.failures.saturating_add(1);
                log_connect_failure(self.failures, &e);
                self.status.failed(self.role, self.failures, &e);
            }
        }

        true
    }

    async fn pump(&mut self) -> bool {
        let event = tokio::select! {
            biased;

            _ = self.cancel.cancelled() => return false,
            read = self.conn.read_chunk(self.read_window) => Event::Read(read),
            chunk = self.inbox.recv() => match chunk {
                Some(chunk) => Event::Inbox(chunk),
                None => {
                    info!("Inbox closed");
                    return false;
                }
            },
        };

        let first = match event {
            Event::Read(Ok(chunk)) if chunk.is_empty() => {
                // Idle ports may never fail a read, ask the device instead.
                if !self.conn.probe() {
                    let name = self.conn.name().to_owned();
                    self.lost(PortError::Disconnected(name));
                    return true;
                }
                None
            }
            Event::Read(Ok(chunk)) => {
                self.publish(chunk);
                None
            }
            Event::Read(Err(e)) => {
                self.lost(e);
                return true;
            }
            Event::Inbox(chunk) => Some(chunk),
        };

        self.drain(first).await;

        true
    }

    fn publish(&mut self, chunk: Bytes) {
        for inbox in &self.fan_out {
            inbox.post(chunk.clone());
        }

        self.status.record_from_port(self.role, chunk.len());
    }

    /// Write queued chunks to the port, starting with `first`.
    async fn drain(&mut self, first: Option<Bytes>) {
        let mut next = first;

        for _ in 0..DRAIN_BATCH {
            if self.cancel.is_cancelled() {
                break;
            }

            let Some(chunk) = next.take().or_else(|| self.inbox.try_recv()) else {
                break;
            };

            if let Err(e) = self.conn.write_chunk(&chunk, self.write_deadline).await {
                self.lost(e);
                break;
            }

            self.status.record_to_port(self.role, chunk.len());
        }

        let dropped = self.inbox.take_dropped();
        if dropped > 0 {
            self.status.record_dropped(self.role, dropped);
        }
    }

    fn lost(&mut self, error: PortError) {
        self.conn.close();
        self.failures = self.failures.saturating_add(1);

        warn!(%error, "Connection lost");
        self.status.failed(self.role, self.failures, &error);
    }
}

fn log_connect_failure(failures: u32, error: &PortError) {
    if failures <= LOUD_FAILURES {
        warn!(failures, %error, "Connect failed");
    } else if failures % 10 == 0 {
        error!(failures, %error, "Still unable to connect");
    } else {
        debug!(failures, %error, "Connect failed");
    }
}
