//! Tracing setup: human output on stderr plus the append-only log file the
//! log viewer reads.

use std::fs;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::{Error, Result};

/// Shown by the log viewer before anything has been logged.
pub const NO_LOG_YET: &str = "No log available yet.";

/// Install the global subscriber.  The returned guard flushes the file
/// writer on drop and must be held for the lifetime of the process.
pub fn init(log_file: &Path) -> Result<WorkerGuard> {
    let dir = match log_file.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let file_name = log_file
        .file_name()
        .ok_or_else(|| Error::Config(format!("log_file '{}' has no file name", log_file.display())))?;
    fs::create_dir_all(dir)
        .map_err(|e| Error::Config(format!("failed to create log dir {}: {e}", dir.display())))?;

    let file_appender = tracing_appender::rolling::never(dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(non_blocking),
        )
        .try_init()
        .map_err(|e| Error::Config(format!("failed to install tracing subscriber: {e}")))?;

    Ok(guard)
}

/// Contents of the log file for the viewer, or a placeholder when the file
/// does not exist yet.
pub fn read_log(log_file: &Path) -> Result<String> {
    match fs::read_to_string(log_file) {
        Ok(text) if !text.is_empty() => Ok(text),
        Ok(_) => Ok(NO_LOG_YET.to_string()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(NO_LOG_YET.to_string()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_log_reads_as_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_log(&dir.path().join("download.log")).unwrap(), NO_LOG_YET);
    }

    #[test]
    fn existing_log_is_returned_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("download.log");
        fs::write(&path, "2026-01-01T00:00:00Z  INFO fetching manifest\n").unwrap();
        assert!(read_log(&path).unwrap().contains("fetching manifest"));
    }
}
