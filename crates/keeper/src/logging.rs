//! provides logging helpers

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::{self, LevelFilter};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

use crate::config::LoggingConfig;

/// initiate the global tracing subscriber
///
/// The configured level is the default directive; `RUST_LOG` still overrides
/// it. When a log file is configured, a daily-rotated copy of the stream goes
/// there as well and the returned guard must be held for the process
/// lifetime to flush it.
pub fn init(config: &LoggingConfig) -> Option<WorkerGuard> {
    let default_level = config
        .level
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::INFO);
    let env_filter = filter::EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    let fmt_layer = layer().with_writer(std::io::stderr).with_target(true);

    match &config.file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or(Path::new("."));
            let prefix = path
                .file_name()
                .and_then(|f| f.to_str())
                .unwrap_or("gpu-keeper.log");

            let appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix(prefix)
                .max_log_files(3)
                .build(dir)
                .expect("failed to create rolling file appender");
            let (file_writer, guard) = tracing_appender::non_blocking(appender);

            let file_layer = layer().with_writer(file_writer).with_ansi(false);

            registry()
                .with(env_filter)
                .with(fmt_layer)
                .with(file_layer)
                .init();
            Some(guard)
        }
        None => {
            registry().with(env_filter).with(fmt_layer).init();
            None
        }
    }
}
