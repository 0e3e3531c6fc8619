//! Debug file logging for tagsync
//!
//! Creates a trace log file at `/tmp/tagsync-{session_id}.log`. A sync run
//! against a flaky tag is hard to reproduce, so every session keeps one.

use std::path::PathBuf;

use tracing_subscriber::Layer as _;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

use crate::progress;

const LOG_DIR: &str = "/tmp";

const DEFAULT_FILE_FILTER: &str = "warn,tagsync=trace,tagsync_core=trace,tagsync_transport=trace";

/// Debug log guard - keeps the file logger alive
pub struct DebugLogGuard {
    _guard: tracing_appender::non_blocking::WorkerGuard,
}

/// Session info returned after initializing debug logging
pub struct SessionInfo {
    pub log_path: PathBuf,
    pub guard: DebugLogGuard,
}

fn log_filename(session_id: uuid::Uuid) -> String {
    format!("tagsync-{session_id}.log")
}

/// Initialize combined logging: file (detailed) + console (through MultiProgress).
///
/// The guard must be kept alive for the duration of the program.
pub fn init(verbose: bool) -> SessionInfo {
    let log_filename = log_filename(uuid::Uuid::new_v4());
    let log_path = PathBuf::from(LOG_DIR).join(&log_filename);

    let file_appender = tracing_appender::rolling::never(LOG_DIR, &log_filename);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_FILE_FILTER));
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::ENTER | FmtSpan::EXIT)
        .with_filter(file_filter);

    // Status lines already cover progress; the console only shows log events
    let console_level = if verbose {
        tracing_subscriber::filter::LevelFilter::DEBUG
    } else {
        tracing_subscriber::filter::LevelFilter::INFO
    };
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(progress::ProgressWriter)
        .with_target(false)
        .without_time()
        .with_filter(console_level);

    tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .init();

    SessionInfo {
        log_path,
        guard: DebugLogGuard { _guard: guard },
    }
}
