use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Keeps the non-blocking file writer alive for the process lifetime.
pub struct LoggingGuards {
    _guards: Vec<WorkerGuard>,
}

/// Initializes tracing: stdout always, plus a daily-rolling file when
/// `log_dir` is set. Filter comes from `RUST_LOG`, default `info`.
pub fn init_logging(log_dir: Option<&str>) -> LoggingGuards {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let stdout_layer = tracing_subscriber::fmt::layer().with_target(true);

    let mut guards = Vec::new();
    let file_layer = log_dir.map(|dir| {
        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!("Failed to create log directory {dir}: {e}");
        }
        let appender = RollingFileAppender::new(Rotation::DAILY, dir, "pagecast.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);
        guards.push(guard);
        tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(non_blocking)
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    LoggingGuards { _guards: guards }
}
