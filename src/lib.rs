#![deny(missing_docs)]
#![doc = include_str!("../README.md")]

/// Exponential backoff between reconnect attempts.
pub mod backoff;

/// The command line interface.
pub mod cli;

/// Relates to config files, port settings and port pairing.
pub mod config;

/// Possible errors in this library.
pub mod error;

/// Queues carrying data between workers.
pub mod inbox;

/// Logging/tracing setup.
pub mod logging;

/// Simulated serial devices.
pub mod mock;

/// A single port and the traits drivers implement.
pub mod port;

/// The router, which owns the workers and the watchdog.
pub mod router;

/// Serial port driver.
pub mod serial;

/// Traffic counters.
pub mod stats;

/// Status reporting.
pub mod status;

/// Supervision of the workers.
pub mod watchdog;

/// The worker which serves one port.
pub(crate) mod worker;
