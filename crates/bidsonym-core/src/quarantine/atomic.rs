//! Atomic file writes.
//!
//! Files that end up in the dataset (rewritten sidecars) or in the quarantine
//! (reports, run summary) are written to a temp file in the destination
//! directory, fsynced, and renamed over the target, so a crash never leaves a
//! half-written file at a canonical path.

use crate::{BidsonymError, Result};
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::debug;

/// Atomically replace `path` with `bytes`, creating parent directories.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).map_err(|e| BidsonymError::io("creating directory", parent, e))?;

    let mut temp = NamedTempFile::new_in(parent)
        .map_err(|e| BidsonymError::io("creating temp file", parent, e))?;
    temp.write_all(bytes)
        .map_err(|e| BidsonymError::io("writing temp file", temp.path(), e))?;
    temp.as_file()
        .sync_all()
        .map_err(|e| BidsonymError::io("syncing temp file", temp.path(), e))?;
    temp.persist(path)
        .map_err(|e| BidsonymError::io("renaming temp file", path, e.error))?;

    debug!("Atomically wrote {}", path.display());
    Ok(())
}

/// Serialize `data` as JSON with four-space indentation and write it atomically.
///
/// Key order of `serde_json::Value` maps is preserved.
pub fn atomic_write_json<T: Serialize>(path: &Path, data: &T) -> Result<()> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
    data.serialize(&mut ser).map_err(|e| BidsonymError::Json {
        message: format!("Failed to serialize {}: {e}", path.display()),
        source: Some(e),
    })?;
    atomic_write(path, &buf)
}

/// Read a JSON object from disk, keeping key order.
pub fn read_json_object(path: &Path) -> Result<serde_json::Map<String, serde_json::Value>> {
    let contents = fs::read_to_string(path).map_err(|e| BidsonymError::io_with_path(e, path))?;
    serde_json::from_str(&contents).map_err(|e| BidsonymError::Json {
        message: format!("Failed to parse {}: {e}", path.display()),
        source: Some(e),
    })
}
