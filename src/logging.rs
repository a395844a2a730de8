use crate::types::{ChatId, ParleyError, Result, SessionId};
use std::panic;
use std::path::Path;
use std::time::Instant;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{Builder, Rotation};
use tracing_subscriber::prelude::*;

const DEFAULT_FILTER: &str = "parley=info";

/// Installs the global subscriber: env filter, stderr, a daily-rolling file, and span traces
/// for errors. Keep the returned guard alive for the life of the process.
pub fn init_tracing(log_dir: &Path, max_log_files: usize) -> Result<WorkerGuard> {
    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => DEFAULT_FILTER.into(),
    };

    std::fs::create_dir_all(log_dir)?;
    let file_appender = Builder::new()
        .rotation(Rotation::DAILY)
        .filename_prefix("parley")
        .filename_suffix("log")
        .max_log_files(max_log_files.max(1))
        .build(log_dir)
        .map_err(|e| {
            ParleyError::Internal(
                format!("Failed to create log appender: {}", e),
                tracing_error::SpanTrace::capture(),
            )
        })?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .with(tracing_error::ErrorLayer::default())
        .try_init()
        .map_err(|e| {
            ParleyError::Internal(
                format!("Tracing already initialised: {}", e),
                tracing_error::SpanTrace::capture(),
            )
        })?;

    Ok(guard)
}

/// Sets up a global panic hook that logs panics using tracing.
pub fn setup_panic_hook() {
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();

        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic payload"
        };

        let location = match panic_info.location() {
            Some(l) => format!("{}:{}:{}", l.file(), l.line(), l.column()),
            None => "unknown location".to_string(),
        };

        error!(
            target: "panic",
            message = %message,
            location = %location,
            backtrace = %backtrace,
            "FATAL: Application panicked"
        );

        original_hook(panic_info);
    }));
}

/// Per-session frame counters, logged once when the session ends.
pub struct StreamMetric {
    pub session_id: SessionId,
    pub chat_id: ChatId,
    pub frames: usize,
    pub chunks: usize,
    pub suppressed: usize,
    pub injections: usize,
    pub unknown: usize,
    pub last_event_id: Option<String>,
    started: Instant,
}

impl StreamMetric {
    pub fn new(session_id: SessionId, chat_id: ChatId) -> Self {
        Self {
            session_id,
            chat_id,
            frames: 0,
            chunks: 0,
            suppressed: 0,
            injections: 0,
            unknown: 0,
            last_event_id: None,
            started: Instant::now(),
        }
    }

    pub fn record_frame(&mut self, id: Option<&str>) {
        self.frames += 1;
        if let Some(id) = id {
            self.last_event_id = Some(id.to_string());
        }
    }

    pub fn log_summary(&self, outcome: &str) {
        info!(
            target: "stream",
            "[STREAM END] Session: {} | Chat: {} | Outcome: {} | Frames: {} | Chunks: {} | Suppressed: {} | Injections: {} | Unknown: {} | Cursor: {} | {:?}",
            self.session_id,
            self.chat_id.short(),
            outcome,
            self.frames,
            self.chunks,
            self.suppressed,
            self.injections,
            self.unknown,
            self.last_event_id.as_deref().unwrap_or("-"),
            self.started.elapsed()
        );
    }
}
