//! Finished archives in the download directory.
//!
//! Names handed in from outside (CLI, daemon routes) are plain file names;
//! anything that could walk out of the download directory is rejected.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tracing::info;

use crate::{Error, Result};

/// One archive on disk.
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveEntry {
    pub name: String,
    pub size: u64,
    /// Modification time, milliseconds since the epoch.
    pub modified_ms: u64,
}

/// All `*.tar` files in `dir`, newest first.  A missing directory is an
/// empty listing.
pub fn list_archives(dir: &Path) -> Result<Vec<ArchiveEntry>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut out = Vec::new();
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) != Some("tar") {
            continue;
        }
        let meta = entry.metadata()?;
        if !meta.is_file() {
            continue;
        }
        out.push(ArchiveEntry {
            name: entry.file_name().to_string_lossy().to_string(),
            size: meta.len(),
            modified_ms: meta.modified().map(to_ms).unwrap_or(0),
        });
    }

    out.sort_by(|a, b| b.modified_ms.cmp(&a.modified_ms).then_with(|| a.name.cmp(&b.name)));
    Ok(out)
}

/// Resolve `name` to an existing archive inside `dir`.
pub fn archive_path(dir: &Path, name: &str) -> Result<PathBuf> {
    validate_name(name)?;
    let path = dir.join(name);
    if !path.is_file() {
        return Err(Error::NotFound(name.to_string()));
    }
    Ok(path)
}

/// Delete the archive `name` from `dir`.
pub fn delete_archive(dir: &Path, name: &str) -> Result<()> {
    let path = archive_path(dir, name)?;
    fs::remove_file(&path)?;
    info!(archive = %path.display(), "archive deleted");
    Ok(())
}

fn validate_name(name: &str) -> Result<()> {
    let bad = name.is_empty()
        || name == "."
        || name.contains("..")
        || name.contains('/')
        || name.contains('\\')
        || name.contains('"')
        || name.chars().any(char::is_control);
    if bad {
        return Err(Error::InvalidName(name.to_string()));
    }
    Ok(())
}

fn to_ms(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
