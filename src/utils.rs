//! Utility functions shared across the snapvault library
//!
//! Streaming file hashing, atomic writes, path manipulation, byte
//! formatting, and the plain-text timestamp files used to persist
//! verification and report scheduling state.

use crate::error::{Result, VaultError};
use chrono::{DateTime, NaiveDateTime, Utc};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::trace;

/// Timestamp format used for snapshot ids and state files
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d-%H%M%S";

/// Format used inside persisted timestamp state files
const STATE_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Hash a file's content using SHA-256 with buffered reads
///
/// The file is consumed in 64 KiB chunks so memory use is independent of
/// file size. Returns the hash as a 64-character hexadecimal string.
///
/// # Errors
///
/// Returns [`VaultError::Io`] if the file cannot be opened or read.
pub fn hash_file_content(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Hash arbitrary in-memory data using SHA-256
pub fn hash_data(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Atomic file write (write to temp file then rename)
///
/// Either the entire file is visible at `path` or the previous content is;
/// no partial writes are observable by other processes.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, content)?;
    fs::rename(&temp_path, path)?;
    Ok(())
}

/// Make a path relative to a base path
///
/// Tries a lexical strip first so symlinks are preserved; falls back to
/// canonicalizing both paths when the lexical approach fails.
pub fn make_relative(path: &Path, base: &Path) -> Result<PathBuf> {
    if let Ok(relative) = path.strip_prefix(base) {
        return Ok(relative.to_path_buf());
    }

    let path_canon = path.canonicalize()?;
    let base_canon = base.canonicalize()?;

    path_canon
        .strip_prefix(&base_canon)
        .map(|p| p.to_path_buf())
        .map_err(|_| VaultError::PathOutsideRoot {
            path: path.to_path_buf(),
            base: base.to_path_buf(),
        })
}

/// Format bytes in human-readable form
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", size as u64, UNITS[unit_idx])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}

/// Read a persisted timestamp from a one-line state file
///
/// Returns `None` when the file does not exist. A file with unparseable
/// content is removed and treated as absent, so a corrupt state file
/// self-heals on the next write.
pub fn read_timestamp_file(path: &Path) -> Result<Option<DateTime<Utc>>> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    match NaiveDateTime::parse_from_str(content.trim(), STATE_TIMESTAMP_FORMAT) {
        Ok(naive) => Ok(Some(naive.and_utc())),
        Err(_) => {
            trace!("Removing unparseable timestamp file {:?}", path);
            fs::remove_file(path).ok();
            Ok(None)
        }
    }
}

/// Persist a timestamp into a one-line state file
pub fn write_timestamp_file(path: &Path, at: DateTime<Utc>) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    atomic_write(path, format!("{}\n", at.format(STATE_TIMESTAMP_FORMAT)).as_bytes())
}

/// Create a directory and any missing parents, ignoring concurrent creation
///
/// Multiple labels may race to create shared parents; `AlreadyExists` is
/// not an error here.
pub fn create_dir_racy(path: &Path) -> Result<()> {
    match fs::create_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e.into()),
    }
}
