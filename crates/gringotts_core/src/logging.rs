//! Rolling file logs for the storage core.
//!
//! # Responsibility
//! - Start the `flexi_logger` file backend at most once per process.
//! - Record panics as log events without leaking inventory data.
//!
//! # Invariants
//! - Starting again with the same level and directory is a no-op; any other
//!   combination is rejected and the active logger is kept.
//! - Owner names, item names and search text never reach the log. Events
//!   carry counts and durations, and backtick-quoted values in panic payloads
//!   are masked before they are written.

use crate::config::StoreConfig;
use flexi_logger::{
    Cleanup, Criterion, FileSpec, FlexiLoggerError, LogSpecification, Logger, LoggerHandle,
    Naming, WriteMode,
};
use log::{error, info, LevelFilter};
use once_cell::sync::OnceCell;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};

const LOG_FILE_BASENAME: &str = "gringotts";
const ROTATE_AT_BYTES: u64 = 8 * 1024 * 1024;
const KEPT_LOG_FILES: usize = 7;
const PANIC_SUMMARY_CHARS: usize = 200;
const MASK: &str = "`***`";

static ACTIVE: OnceCell<ActiveLogger> = OnceCell::new();
static PANIC_HOOK: OnceCell<()> = OnceCell::new();

struct ActiveLogger {
    level: LevelFilter,
    dir: PathBuf,
    _handle: LoggerHandle,
}

#[derive(Debug)]
pub enum LoggingError {
    UnknownLevel(String),
    EmptyDirectory,
    CreateDirectory {
        dir: PathBuf,
        source: std::io::Error,
    },
    Backend(FlexiLoggerError),
    /// Logging already runs with another level or directory.
    AlreadyActive {
        level: LevelFilter,
        dir: PathBuf,
    },
}

impl Display for LoggingError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownLevel(level) => write!(
                f,
                "unknown log level `{level}`; expected trace, debug, info, warn or error"
            ),
            Self::EmptyDirectory => write!(f, "log directory cannot be empty"),
            Self::CreateDirectory { dir, source } => {
                write!(f, "cannot create log directory `{}`: {source}", dir.display())
            }
            Self::Backend(err) => write!(f, "cannot start file logger: {err}"),
            Self::AlreadyActive { level, dir } => write!(
                f,
                "logging already active at level {level} in `{}`",
                dir.display()
            ),
        }
    }
}

impl Error for LoggingError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::CreateDirectory { source, .. } => Some(source),
            Self::Backend(err) => Some(err),
            _ => None,
        }
    }
}

/// Starts file logging at `level` in `log_dir`.
///
/// A relative `log_dir` is resolved against the current directory.
///
/// # Errors
/// - [`LoggingError::UnknownLevel`] / [`LoggingError::EmptyDirectory`] for
///   bad input.
/// - [`LoggingError::AlreadyActive`] when started before with other settings.
/// - [`LoggingError::CreateDirectory`] / [`LoggingError::Backend`] when the
///   backend cannot start.
pub fn init_logging(level: &str, log_dir: &Path) -> Result<(), LoggingError> {
    let level = parse_level(level)?;
    let dir = resolve_dir(log_dir)?;

    let active = ACTIVE.get_or_try_init(|| start_backend(level, &dir))?;
    if active.level != level || active.dir != dir {
        return Err(LoggingError::AlreadyActive {
            level: active.level,
            dir: active.dir.clone(),
        });
    }
    Ok(())
}

/// Starts logging from `config`. Returns `false` when no log directory is
/// configured and logging stays off.
pub fn init_logging_from_config(config: &StoreConfig) -> Result<bool, LoggingError> {
    match &config.log_dir {
        Some(dir) => init_logging(&config.log_level, dir).map(|()| true),
        None => Ok(false),
    }
}

/// Active level and directory, if logging was started.
pub fn logging_status() -> Option<(LevelFilter, PathBuf)> {
    ACTIVE.get().map(|active| (active.level, active.dir.clone()))
}

/// `debug` for debug builds, `info` for release builds.
pub fn default_log_level() -> &'static str {
    if cfg!(debug_assertions) {
        "debug"
    } else {
        "info"
    }
}

fn start_backend(level: LevelFilter, dir: &Path) -> Result<ActiveLogger, LoggingError> {
    std::fs::create_dir_all(dir).map_err(|source| LoggingError::CreateDirectory {
        dir: dir.to_path_buf(),
        source,
    })?;

    let spec = LogSpecification::builder().default(level).build();
    let handle = Logger::with(spec)
        .log_to_file(FileSpec::default().directory(dir).basename(LOG_FILE_BASENAME))
        .rotate(
            Criterion::Size(ROTATE_AT_BYTES),
            Naming::Numbers,
            Cleanup::KeepLogFiles(KEPT_LOG_FILES),
        )
        .write_mode(WriteMode::BufferAndFlush)
        .append()
        .format_for_files(flexi_logger::detailed_format)
        .start()
        .map_err(LoggingError::Backend)?;

    install_panic_hook();
    info!(
        "event=logging_start module=core status=ok level={} version={} os={}",
        level,
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS
    );

    Ok(ActiveLogger {
        level,
        dir: dir.to_path_buf(),
        _handle: handle,
    })
}

fn parse_level(raw: &str) -> Result<LevelFilter, LoggingError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "trace" => Ok(LevelFilter::Trace),
        "debug" => Ok(LevelFilter::Debug),
        "info" => Ok(LevelFilter::Info),
        "warn" | "warning" => Ok(LevelFilter::Warn),
        "error" => Ok(LevelFilter::Error),
        _ => Err(LoggingError::UnknownLevel(raw.trim().to_string())),
    }
}

fn resolve_dir(log_dir: &Path) -> Result<PathBuf, LoggingError> {
    if log_dir.as_os_str().is_empty() {
        return Err(LoggingError::EmptyDirectory);
    }
    if log_dir.is_absolute() {
        return Ok(log_dir.to_path_buf());
    }
    let cwd = std::env::current_dir().map_err(|source| LoggingError::CreateDirectory {
        dir: log_dir.to_path_buf(),
        source,
    })?;
    Ok(cwd.join(log_dir))
}

fn install_panic_hook() {
    if PANIC_HOOK.set(()).is_err() {
        return;
    }

    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let location = info
            .location()
            .map(|loc| format!("{}:{}", loc.file(), loc.line()))
            .unwrap_or_else(|| "unknown".to_string());
        let payload = info
            .payload()
            .downcast_ref::<&str>()
            .map(|message| (*message).to_string())
            .or_else(|| info.payload().downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string payload".to_string());
        error!(
            "event=panic module=core status=error location={} payload={}",
            location,
            panic_summary(&payload)
        );
        previous(info);
    }));
}

/// Masks backtick-quoted values, flattens line breaks and caps the length.
///
/// Core error messages quote item ids, names and owners in backticks.
fn panic_summary(payload: &str) -> String {
    let mut summary = String::with_capacity(payload.len().min(PANIC_SUMMARY_CHARS));
    let mut quoted = false;
    for ch in payload.chars() {
        match ch {
            '`' if quoted => {
                quoted = false;
                summary.push_str(MASK);
            }
            '`' => quoted = true,
            _ if quoted => {}
            '\n' | '\r' => summary.push(' '),
            _ => summary.push(ch),
        }
    }
    // An unterminated quote still hides everything after it.
    if quoted {
        summary.push_str(MASK);
    }

    if summary.chars().count() > PANIC_SUMMARY_CHARS {
        summary = summary.chars().take(PANIC_SUMMARY_CHARS).collect();
        summary.push_str("...");
    }
    summary
}
