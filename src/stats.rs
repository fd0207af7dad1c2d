use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

/// The rolling window restarts from zero when it reaches this many bytes.
pub const ROLLOVER_THRESHOLD: u64 = 1_000_000;

/// Counts bytes moving in one direction.
///
/// The session total only ever grows.
/// The window is for rate display and starts over every [`ROLLOVER_THRESHOLD`] bytes.
#[derive(Debug, Clone, Serialize)]
pub struct Counter {
    session_total: u128,
    window: u64,

    #[serde(skip)]
    window_started: Instant,
}

impl Default for Counter {
    fn default() -> Self {
        Self {
            session_total: 0,
            window: 0,
            window_started: Instant::now(),
        }
    }
}

impl Counter {
    /// Account for `bytes` transferred.
    pub fn record(&mut self, bytes: usize) {
        let bytes = bytes as u64;

        self.session_total += u128::from(bytes);
        self.window = self.window.saturating_add(bytes);

        if self.window >= ROLLOVER_THRESHOLD {
            debug!(
                window = self.window,
                total = %self.session_total,
                "Rolling window reset"
            );
            self.window = 0;
            self.window_started = Instant::now();
        }
    }

    /// Bytes since the session started.
    pub fn session_total(&self) -> u128 {
        self.session_total
    }

    /// Bytes since the window last rolled over.
    pub fn window(&self) -> u64 {
        self.window
    }

    /// Average bytes per second over the current window.
    pub fn rate(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.window_started).as_secs_f64();

        if elapsed > 0.0 {
            self.window as f64 / elapsed
        } else {
            0.0
        }
    }
}

/// Per worker traffic counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Statistics {
    /// Written to the worker's port.
    pub to_port: Counter,

    /// Read from the worker's port.
    pub from_port: Counter,

    /// Chunks lost because the worker's inbox overflowed.
    pub dropped_chunks: u64,
}
