use log::{LevelFilter, warn};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_LEVEL: LevelFilter = LevelFilter::Info;

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("Unknown log level '{0}'. One of: off, error, warn, info, debug, trace")]
    UnknownLevel(String),

    #[error("Logger already initialised: {0}")]
    AlreadyInitialised(#[from] log::SetLoggerError),
}

pub fn parse_level(level: &str) -> Result<LevelFilter, LoggingError> {
    level
        .trim()
        .parse::<LevelFilter>()
        .map_err(|_| LoggingError::UnknownLevel(level.to_string()))
}

/// CLI flag wins over the config file, which wins over [`DEFAULT_LEVEL`].
pub fn resolve_level(
    cli: Option<&str>,
    config: Option<&str>,
) -> Result<LevelFilter, LoggingError> {
    match cli.or(config) {
        Some(level) => parse_level(level),
        None => Ok(DEFAULT_LEVEL),
    }
}

/// `<logs_dir>/fuzzherd-<YYYYmmdd-HHMMSS>.log` for the current local time.
pub fn session_log_path(logs_dir: &Path) -> PathBuf {
    let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    logs_dir.join(format!("fuzzherd-{stamp}.log"))
}

/// Installs the global logger: stderr always, plus `session_log` when it can
/// be opened. Returns the session log path actually in use.
pub fn init_logging(
    level: LevelFilter,
    session_log: Option<&Path>,
) -> Result<Option<PathBuf>, LoggingError> {
    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {:<5} {}] {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stderr());

    let mut open_error = None;
    let mut in_use = None;
    if let Some(path) = session_log {
        let opened = match path.parent() {
            Some(parent) => std::fs::create_dir_all(parent).and_then(|_| fern::log_file(path)),
            None => fern::log_file(path),
        };
        match opened {
            Ok(file) => {
                dispatch = dispatch.chain(file);
                in_use = Some(path.to_path_buf());
            }
            Err(e) => open_error = Some(e),
        }
    }

    dispatch.apply()?;

    if let (Some(path), Some(e)) = (session_log, open_error) {
        warn!("Could not open session log {path:?}, logging to stderr only: {e}");
    }
    Ok(in_use)
}
