//! Logging setup
//!
//! Installs the global tracing subscriber and keeps a copy of the most recent
//! event so lifecycle notifications can quote it. Besides stdout, lines go to
//! a size-rotated log file written from a background thread.

use crate::config::UnlockConfig;
use chrono::{FixedOffset, Utc};
use rolling_file::{BasicRollingFileAppender, RollingConditionBasic};
use std::fmt::{self, Write as _};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("Invalid UTC offset: {0} hours")]
    InvalidOffset(i32),

    #[error("Invalid log filter: {0}")]
    Filter(String),

    #[error("Failed to install subscriber: {0}")]
    Init(String),

    #[error("Failed to open log file {}: {source}", path.display())]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub fn utc_offset(hours: i32) -> Result<FixedOffset, LoggingError> {
    FixedOffset::east_opt(hours * 3600).ok_or(LoggingError::InvalidOffset(hours))
}

fn timestamp(offset: &FixedOffset) -> String {
    Utc::now()
        .with_timezone(offset)
        .format(TIMESTAMP_FORMAT)
        .to_string()
}

/// fmt timer printing wall-clock time at a fixed UTC offset
#[derive(Debug, Clone, Copy)]
pub struct OffsetTime {
    offset: FixedOffset,
}

impl OffsetTime {
    pub fn new(offset: FixedOffset) -> Self {
        Self { offset }
    }
}

impl FormatTime for OffsetTime {
    fn format_time(&self, w: &mut Writer<'_>) -> fmt::Result {
        write!(w, "{}", timestamp(&self.offset))
    }
}

/// Layer remembering the last formatted event
///
/// Lines look like `2024-01-01 09:00:00.000 : INFO : acoustic_unlock::detector - message`.
#[derive(Debug, Clone)]
pub struct LastLogLine {
    line: Arc<Mutex<String>>,
    offset: FixedOffset,
}

impl LastLogLine {
    pub fn new(offset: FixedOffset) -> Self {
        Self {
            line: Arc::new(Mutex::new(String::new())),
            offset,
        }
    }

    /// Most recent line, empty before the first event
    pub fn get(&self) -> String {
        self.line
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

impl<S: Subscriber> Layer<S> for LastLogLine {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let metadata = event.metadata();
        let line = format!(
            "{} : {} : {} - {}{}",
            timestamp(&self.offset),
            metadata.level(),
            metadata.target(),
            visitor.message,
            visitor.fields
        );

        *self.line.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = line;
    }
}

/// Size-rotated log file
///
/// Once the active file reaches `max_bytes` it is renamed to `<path>.1`,
/// older files shift up by one and anything past `<path>.<backup_count>`
/// is deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFile {
    pub path: PathBuf,
    pub max_bytes: u64,
    pub backup_count: usize,
}

impl LogFile {
    pub fn from_config(config: &UnlockConfig) -> Option<Self> {
        config.log_file_path.as_ref().map(|path| Self {
            path: path.clone(),
            max_bytes: config.log_file_max_bytes(),
            backup_count: config.log_backup_count,
        })
    }

    /// Open the appender, creating the parent directory first
    pub fn appender(&self) -> Result<BasicRollingFileAppender, LoggingError> {
        if let Some(dir) = self.path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|source| LoggingError::File {
                path: dir.to_path_buf(),
                source,
            })?;
        }

        BasicRollingFileAppender::new(
            &self.path,
            RollingConditionBasic::new().max_size(self.max_bytes),
            self.backup_count,
        )
        .map_err(|source| LoggingError::File {
            path: self.path.clone(),
            source,
        })
    }
}

/// Live logging setup
///
/// Dropping it flushes and stops the log file writer, so keep it alive for
/// the whole run.
pub struct LogHandle {
    last_line: LastLogLine,
    _file_guard: Option<WorkerGuard>,
}

impl LogHandle {
    pub fn last_line(&self) -> LastLogLine {
        self.last_line.clone()
    }
}

/// Install the global subscriber
///
/// `RUST_LOG` takes precedence over `level` when set.
pub fn init(
    level: &str,
    utc_offset_hours: i32,
    log_file: Option<&LogFile>,
) -> Result<LogHandle, LoggingError> {
    let offset = utc_offset(utc_offset_hours)?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| LoggingError::Filter(e.to_string()))?;

    let (file_writer, file_guard) = match log_file {
        Some(file) => {
            let (writer, guard) = tracing_appender::non_blocking(file.appender()?);
            (Some(writer), Some(guard))
        }
        None => (None, None),
    };

    let file_layer = file_writer.map(|writer| {
        tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_timer(OffsetTime::new(offset))
    });

    let last_line = LastLogLine::new(offset);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_timer(OffsetTime::new(offset)))
        .with(file_layer)
        .with(last_line.clone())
        .try_init()
        .map_err(|e| LoggingError::Init(e.to_string()))?;

    if let Some(file) = log_file {
        tracing::info!(
            "Logging to {} (rotating at {} bytes, {} backups)",
            file.path.display(),
            file.max_bytes,
            file.backup_count
        );
    }

    Ok(LogHandle {
        last_line,
        _file_guard: file_guard,
    })
}
