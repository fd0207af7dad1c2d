use std::{
    path::PathBuf,
    sync::{Mutex, PoisonError},
};

use tokio::sync::RwLock;
use tracing::Level;
use tracing::{debug, info, metadata::LevelFilter, trace};
use tracing_appender::{
    non_blocking::{NonBlocking, WorkerGuard},
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{prelude::*, EnvFilter};

/// Name of the log file, before the date suffix added on rotation.
pub const LOG_FILE_NAME: &str = "serial-router.log";

/// Keeps the file writer's background thread alive until [`shutdown`].
static FILE_GUARD: Mutex<Option<WorkerGuard>> = Mutex::new(None);

fn file_writer(output_dir: PathBuf) -> NonBlocking {
    let file_appender = RollingFileAppender::new(Rotation::DAILY, output_dir, LOG_FILE_NAME);
    let (writer, guard) = tracing_appender::non_blocking(file_appender);

    *FILE_GUARD.lock().unwrap_or_else(PoisonError::into_inner) = Some(guard);

    writer
}

fn do_init(stdout_level: Level, file_level: Option<(Level, PathBuf)>) {
    let mut message = String::from("Logging with:");

    // stdout
    message += " stdout";

    // RUST_LOG takes precedence over the configured level.
    let stdout_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from(stdout_level).into())
        .from_env_lossy();

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_thread_names(true)
        .with_filter(stdout_filter);

    let registry = tracing_subscriber::registry().with(stdout_layer);

    let maybe_file_layer = if let Some((level, output_dir)) = file_level {
        message += &format!(", file (in dir {output_dir:?})");

        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(file_writer(output_dir))
            .with_ansi(false)
            .with_filter(LevelFilter::from(level));
        Some(file_layer)
    } else {
        None
    };

    // A subscriber may already be set, e.g. by a test harness.
    if registry.with(maybe_file_layer).try_init().is_err() {
        message += " (a global subscriber was already set)";
    }

    debug!(message);
}

/// Initialize tracing.
///
/// Will only initialize once, so tests may call this.
pub async fn init(stdout_level: Level, file_logging: Option<(Level, PathBuf)>) {
    static TRACING_IS_INITIALIZED: RwLock<bool> = RwLock::const_new(false);

    let initialized = { *TRACING_IS_INITIALIZED.read().await };

    if !initialized {
        let mut initialized = TRACING_IS_INITIALIZED.write().await;

        // To avoid race condition between the `.read()` and the
        // `.write()`.
        if *initialized {
            return;
        }

        do_init(stdout_level, file_logging);

        *initialized = true;
    }

    info!("Logging initialized");
}

/// Flush what is left before exiting.
///
/// Lines logged to file after this are lost.
pub fn shutdown() {
    trace!("Shutting down");

    let guard = FILE_GUARD
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();

    // Blocks until the file writer has written everything queued.
    drop(guard);
}
