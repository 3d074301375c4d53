//! Logging system setup.
//!
//! Log lines go to stderr so that stdout carries nothing but the startup
//! status line. With `--log-dir`, the same events are also appended to the
//! per-room log file the dashboard reads.

use anyhow::Result;
use std::{
    io::IsTerminal,
    sync::{Arc, Mutex},
};
use tracing::error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::{CliArgs, RoomServerConfig};

/// Keeps the file writer's worker alive until it is flushed or dropped.
#[derive(Clone, Default)]
pub struct LogGuard {
    worker: Arc<Mutex<Option<WorkerGuard>>>,
}

impl LogGuard {
    fn new(worker: Option<WorkerGuard>) -> Self {
        Self {
            worker: Arc::new(Mutex::new(worker)),
        }
    }

    /// Writes out every buffered line and stops the file writer.
    ///
    /// Later log events only reach stderr.
    pub fn flush(&self) {
        if let Ok(mut worker) = self.worker.lock() {
            worker.take();
        }
    }
}

/// Initializes the global tracing subscriber.
///
/// `RUST_LOG` overrides `--log-level`, which defaults to `info`. Colour is only
/// used when stderr is a terminal.
///
/// # Returns
/// The guard of the file writer. It must be held until exit or buffered lines
/// are lost.
pub fn setup_logging(args: &CliArgs, config: &RoomServerConfig) -> Result<LogGuard> {
    let level = args.log_level.as_deref().unwrap_or("info");
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let (file_layer, guard) = match &args.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::never(dir, config.log_file_name());
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    let registry = tracing_subscriber::registry().with(filter).with(file_layer);

    if args.json_logs {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()?;
    } else {
        registry
            .with(
                fmt::layer()
                    .with_ansi(std::io::stderr().is_terminal())
                    .with_writer(std::io::stderr),
            )
            .try_init()?;
    }

    Ok(LogGuard::new(guard))
}

/// Makes any panic fatal: log it, flush the log file, exit with status 1.
pub fn exit_on_panic(guard: LogGuard) {
    std::panic::set_hook(Box::new(move |panic_info| {
        error!("Fatal: {}", panic_info);
        guard.flush();
        std::process::exit(1);
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn flush_writes_out_buffered_lines() {
        let dir = std::env::temp_dir().join(format!("room-broker-log-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();

        let appender = tracing_appender::rolling::never(&dir, "room_r1_3000.log");
        let (mut writer, worker) = tracing_appender::non_blocking(appender);
        let guard = LogGuard::new(Some(worker));

        writer.write_all(b"Fatal: boom\n").unwrap();
        guard.flush();
        // A second flush is a no-op.
        guard.flush();

        let contents = std::fs::read_to_string(dir.join("room_r1_3000.log")).unwrap();
        assert!(contents.contains("Fatal: boom"));
        std::fs::remove_dir_all(&dir).ok();
    }
}
