use std::{io, time::Duration};

use thiserror::Error;

use crate::status::WorkerRole;

/// A configuration that must not be started.
///
/// Returned synchronously by [`crate::router::Router::start`] before any port is touched.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// Both outgoing endpoints point at the same port.
    #[error("Both outgoing endpoints resolve to the same port `{0}`")]
    SameOutgoing(String),

    /// An outgoing endpoint is also the incoming endpoint.
    #[error("The outgoing endpoint `{0}` is also the incoming endpoint")]
    OutgoingIsIncoming(String),

    /// The two outgoing endpoints are the two ends of one loopback pair.
    #[error("The outgoing endpoints `{0}` and `{1}` are a loopback pair")]
    OutgoingPaired(String, String),

    /// The incoming endpoint is the far end of an outgoing endpoint's pair.
    #[error("The incoming endpoint `{incoming}` is paired with the outgoing endpoint `{outgoing}`")]
    IncomingPairedWithOutgoing {
        /// The selected incoming port.
        incoming: String,

        /// The outgoing port it is paired with.
        outgoing: String,
    },

    /// A field holds a value which cannot be used.
    #[error("Bad value for `{field}`: {problem}")]
    BadValue {
        /// Which field.
        field: &'static str,

        /// What is wrong with it.
        problem: String,
    },
}

/// Problems talking to a single port.
///
/// These never leave a worker, they drive it back to `Disconnected`.
#[derive(Debug, Error)]
pub enum PortError {
    /// The port could not be acquired.
    #[error("Could not open `{port}`: {source}")]
    Connect {
        /// The port name.
        port: String,

        /// Why.
        source: io::Error,
    },

    /// A read or write on an open port failed.
    #[error("I/O problem on `{port}`: {source}")]
    Io {
        /// The port name.
        port: String,

        /// Why.
        source: io::Error,
    },

    /// The device went away (end of stream).
    #[error("`{0}` disconnected")]
    Disconnected(String),

    /// An operation which needs an open port was attempted without one.
    #[error("`{0}` is not open")]
    NotOpen(String),
}

/// Problems observed by the watchdog.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SupervisionError {
    /// The worker's heartbeat went stale.
    #[error("Worker {worker} stalled, no heartbeat for {since:?}")]
    Stall {
        /// Which worker.
        worker: WorkerRole,

        /// Age of the last heartbeat.
        since: Duration,
    },

    /// The worker's task ended without being asked to.
    #[error("Worker {worker} exited unexpectedly")]
    Crashed {
        /// Which worker.
        worker: WorkerRole,
    },

    /// The restart budget is spent for now.
    #[error("Worker {worker} needs attention: {restarts} restarts in the window, not restarting")]
    PersistentFailure {
        /// Which worker.
        worker: WorkerRole,

        /// Restarts within the window.
        restarts: usize,
    },
}

/// Errors this library may return to a caller.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Port related problems.
    #[error(transparent)]
    Port(#[from] PortError),

    /// Underlying IO problem, e.g. reading a config file.
    #[error("Underlying IO problem: {0}")]
    Io(#[from] io::Error),

    /// A RON config file could not be parsed.
    #[error("Bad RON config: {0}")]
    Ron(#[from] ron::error::SpannedError),

    /// A config could not be written as RON.
    #[error("Could not write RON config: {0}")]
    RonWrite(#[from] ron::Error),

    /// A JSON config file could not be parsed.
    #[error("Bad JSON config: {0}")]
    Json(#[from] serde_json::Error),

    /// `start` was called on a router which is already routing.
    #[error("The router is already running")]
    AlreadyRunning,
}
